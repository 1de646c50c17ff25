//! Message and model reply types.
//!
//! Strategies assemble a list of messages for every model call and
//! receive a [`ModelReply`] back: either a request to call a tool or a
//! piece of text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The role of a message sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The user or host process
    User,
    /// The model
    Assistant,
    /// System instructions
    System,
    /// Tool execution result
    Tool,
}

/// A single message sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Who sent this message
    pub role: Role,

    /// The text content
    pub content: String,

    /// If this is a tool result, the name of the tool that produced it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,

    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_name: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    /// Create a tool result message.
    pub fn tool_result(tool_name: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::with_role(Role::Tool, content);
        msg.tool_name = Some(tool_name.into());
        msg
    }
}

/// What the model answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelReply {
    /// The model wants a tool invoked.
    ToolCall {
        name: String,
        #[serde(default)]
        args: serde_json::Value,
    },
    /// Plain text (a thought, a plan, or a final answer).
    Text { content: String },
}

impl ModelReply {
    pub fn text(content: impl Into<String>) -> Self {
        ModelReply::Text {
            content: content.into(),
        }
    }

    pub fn tool_call(name: impl Into<String>, args: serde_json::Value) -> Self {
        ModelReply::ToolCall {
            name: name.into(),
            args,
        }
    }

    /// Whether this reply asks for a tool invocation.
    pub fn is_tool_call(&self) -> bool {
        matches!(self, ModelReply::ToolCall { .. })
    }

    /// A one-line rendering suitable for traces and logs.
    pub fn describe(&self) -> String {
        match self {
            ModelReply::ToolCall { name, args } => format!("{name}({args})"),
            ModelReply::Text { content } => content.clone(),
        }
    }
}
