//! Shared test helpers for strategy and orchestrator tests.

use async_trait::async_trait;
use reasonloop_core::error::{ProviderError, ToolError};
use reasonloop_core::message::ModelReply;
use reasonloop_core::provider::{CompletionRequest, LlmProvider};
use reasonloop_core::tool::{Tool, ToolOutput, ToolRegistry};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Barrier;

use crate::runtime::Ports;

/// A provider that replays a scripted queue of replies and records every
/// request it receives.
///
/// An exhausted script answers with `ProviderError::NotConfigured` so an
/// unexpected extra call shows up as a failed outcome, not a hang.
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<Result<ModelReply, ProviderError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<ModelReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(Ok).collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_results(replies: Vec<Result<ModelReply, ProviderError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<ModelReply, ProviderError> {
        self.requests.lock().unwrap().push(request);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::NotConfigured("script exhausted".into())))
    }
}

pub fn text(content: &str) -> ModelReply {
    ModelReply::text(content)
}

pub fn call(name: &str, args: serde_json::Value) -> ModelReply {
    ModelReply::tool_call(name, args)
}

/// Returns its `text` argument, or the raw arguments.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "Echoes its input"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {"text": {"type": "string"}}})
    }
    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let out = arguments
            .get("text")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| arguments.to_string());
        Ok(ToolOutput::text(out))
    }
}

/// Always reports the same date.
pub struct DateTool;

#[async_trait]
impl Tool for DateTool {
    fn name(&self) -> &str {
        "current_date"
    }
    fn description(&self) -> &str {
        "Returns today's date"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }
    async fn execute(&self, _arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        Ok(ToolOutput::text("2026-10-19"))
    }
}

/// Always fails.
pub struct FailingTool;

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        "broken"
    }
    fn description(&self) -> &str {
        "Always fails"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }
    async fn execute(&self, _arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        Err(ToolError::ExecutionFailed {
            tool_name: "broken".into(),
            reason: "simulated failure".into(),
        })
    }
}

/// Sleeps before answering.
pub struct SlowTool {
    pub delay: Duration,
}

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        "slow"
    }
    fn description(&self) -> &str {
        "Sleeps, then answers"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }
    async fn execute(&self, _arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        tokio::time::sleep(self.delay).await;
        Ok(ToolOutput::text("slow done"))
    }
}

/// Counts invocations.
pub struct CountingTool {
    pub calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for CountingTool {
    fn name(&self) -> &str {
        "count"
    }
    fn description(&self) -> &str {
        "Counts how often it is called"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }
    async fn execute(&self, _arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ToolOutput::text(format!("call {n}")))
    }
}

/// Logs `start:<label>` and `end:<label>` around each call. With
/// `"wait": true` the call also meets the other waiters at a barrier, and
/// fails if nobody arrives within a second.
pub struct GateTool {
    pub log: Arc<Mutex<Vec<String>>>,
    pub barrier: Arc<Barrier>,
}

impl GateTool {
    pub fn new(parties: usize) -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
            barrier: Arc::new(Barrier::new(parties)),
        }
    }
}

#[async_trait]
impl Tool for GateTool {
    fn name(&self) -> &str {
        "gate"
    }
    fn description(&self) -> &str {
        "Records when it runs"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {"label": {"type": "string"}}})
    }
    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let label = arguments["label"].as_str().unwrap_or("?").to_string();
        self.log.lock().unwrap().push(format!("start:{label}"));
        if arguments["wait"].as_bool().unwrap_or(false)
            && tokio::time::timeout(Duration::from_secs(1), self.barrier.wait())
                .await
                .is_err()
        {
            return Err(ToolError::ExecutionFailed {
                tool_name: "gate".into(),
                reason: format!("{label} ran alone"),
            });
        }
        self.log.lock().unwrap().push(format!("end:{label}"));
        Ok(ToolOutput::text(format!("{label} ok")))
    }
}

/// A registry with the echo, date and failing tools.
pub fn basic_tools() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(EchoTool));
    registry.register(Box::new(DateTool));
    registry.register(Box::new(FailingTool));
    registry
}

pub fn ports(provider: Arc<ScriptedProvider>, tools: ToolRegistry) -> Ports {
    Ports::new(provider, Arc::new(tools))
}
