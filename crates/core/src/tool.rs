//! Tool invocation port.
//!
//! Strategies reach tools only through [`ToolPort::invoke`]. Every
//! request carries its own deadline and a cancellation token; a timeout
//! or a cancellation comes back as a [`ToolError`] instead of tearing
//! down the caller.
//!
//! [`ToolRegistry`] is the stock port implementation: a name-keyed map of
//! [`Tool`]s with deadline and cancellation enforcement around each call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ToolError;
use crate::provider::ToolDefinition;

/// The result of a successful tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    /// The output content, as shown to the model
    pub content: String,

    /// Optional structured data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            data: None,
        }
    }
}

/// A single invocation handed to the port.
#[derive(Debug, Clone)]
pub struct ToolRequest {
    /// Name of the tool to execute
    pub name: String,

    /// Arguments as a JSON value
    pub args: serde_json::Value,

    /// Point in time after which the call counts as timed out
    pub deadline: Instant,

    /// Tripped when the owning session is cancelled
    pub cancel: CancellationToken,
}

impl ToolRequest {
    /// Build a request whose deadline is `timeout` from now.
    pub fn new(name: impl Into<String>, args: serde_json::Value, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            args,
            deadline: Instant::now() + timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// Attach the session's cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// The port strategies call tools through.
#[async_trait]
pub trait ToolPort: Send + Sync {
    /// Definitions for every tool reachable through this port.
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// Invoke a tool, honouring the request's deadline and cancellation.
    async fn invoke(&self, request: ToolRequest) -> Result<ToolOutput, ToolError>;
}

/// A single tool implementation.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "search", "web_fetch").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given arguments.
    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the model.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// A registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// List all registered tool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolPort for ToolRegistry {
    fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    async fn invoke(&self, request: ToolRequest) -> Result<ToolOutput, ToolError> {
        let tool = self
            .tools
            .get(&request.name)
            .ok_or_else(|| ToolError::NotFound(request.name.clone()))?;

        let budget = request.deadline.saturating_duration_since(Instant::now());
        debug!(tool = %request.name, budget_ms = budget.as_millis() as u64, "Invoking tool");

        tokio::select! {
            biased;
            _ = request.cancel.cancelled() => Err(ToolError::Cancelled(request.name.clone())),
            result = tokio::time::timeout_at(request.deadline, tool.execute(request.args)) => {
                match result {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ToolError::Timeout {
                        tool_name: request.name.clone(),
                        timeout_ms: budget.as_millis() as u64,
                    }),
                }
            }
        }
    }
}
