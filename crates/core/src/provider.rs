//! LLM provider port.
//!
//! The strategy engine never talks to a model directly. It builds a
//! [`CompletionRequest`] and hands it to whatever implements
//! [`LlmProvider`]. Requests built with [`CompletionRequest::text_only`]
//! carry no tool definitions at all, which is how planning, synthesis
//! and reflection calls forbid spurious tool calls.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::message::{Message, ModelReply};

/// A tool definition sent to the model so it knows what it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// A single model call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// The conversation messages
    pub messages: Vec<Message>,

    /// Whether the model may answer with a tool call
    pub tools_enabled: bool,

    /// Available tools; always empty when `tools_enabled` is false
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
}

impl CompletionRequest {
    /// A request that lets the model call one of `tools`.
    pub fn with_tools(messages: Vec<Message>, tools: Vec<ToolDefinition>) -> Self {
        Self {
            messages,
            tools_enabled: true,
            tools,
        }
    }

    /// A request in tools-disabled mode.
    pub fn text_only(messages: Vec<Message>) -> Self {
        Self {
            messages,
            tools_enabled: false,
            tools: Vec::new(),
        }
    }
}

/// The provider port.
///
/// Every LLM backend implements this trait. Implementations must honour
/// `tools_enabled == false` by never returning [`ModelReply::ToolCall`];
/// the engine treats a violation as a grounding failure.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// A human-readable name for this provider.
    fn name(&self) -> &str;

    /// Send a request and get a complete reply.
    async fn complete(&self, request: CompletionRequest) -> Result<ModelReply, ProviderError>;
}
