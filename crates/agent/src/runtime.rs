//! The suspension points of a session: model calls and tool batches.
//!
//! Strategies reach the provider and the tool port only through
//! [`Ports`]. Every call is checked against the session's cancellation
//! token, recorded in the execution trace, and published on the event
//! bus.

use chrono::Utc;
use futures::future::join_all;
use reasonloop_core::error::{FailureReason, ToolError};
use reasonloop_core::event::{DomainEvent, EventBus};
use reasonloop_core::message::{ModelReply, Role};
use reasonloop_core::provider::{CompletionRequest, LlmProvider, ToolDefinition};
use reasonloop_core::tool::{ToolOutput, ToolPort, ToolRequest};
use reasonloop_core::trace::TraceKind;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::context::token::estimate_request_tokens;
use crate::session::Session;

/// One tool invocation inside a batch, attributed to a step or node.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Originating step or node id
    pub source: String,
    pub tool: String,
    pub args: serde_json::Value,
}

impl Invocation {
    pub fn new(source: impl Into<String>, tool: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            source: source.into(),
            tool: tool.into(),
            args,
        }
    }
}

/// The result of one invocation.
#[derive(Debug, Clone)]
pub struct Observation {
    pub source: String,
    pub tool: String,
    pub result: Result<ToolOutput, ToolError>,
    pub duration_ms: u64,
}

impl Observation {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// What the model gets to see.
    pub fn text(&self) -> String {
        match &self.result {
            Ok(output) => output.content.clone(),
            Err(e) => format!("Error: {e}"),
        }
    }
}

/// Handles to the outside world shared by every strategy.
#[derive(Clone)]
pub struct Ports {
    pub provider: Arc<dyn LlmProvider>,
    pub tools: Arc<dyn ToolPort>,
    pub events: Arc<EventBus>,
    /// Deadline given to every individual tool invocation
    pub tool_timeout: Duration,
}

impl Ports {
    pub fn new(provider: Arc<dyn LlmProvider>, tools: Arc<dyn ToolPort>) -> Self {
        Self {
            provider,
            tools,
            events: Arc::new(EventBus::default()),
            tool_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools.definitions()
    }

    /// Make one model call on behalf of `source`.
    ///
    /// The call races the session's cancellation token. Provider errors
    /// are recorded in the trace and returned as a failure reason.
    pub async fn ask_model(
        &self,
        session: &mut Session,
        source: &str,
        request: CompletionRequest,
    ) -> Result<ModelReply, FailureReason> {
        let cancel = session.cancel_token();
        if cancel.is_cancelled() {
            return Err(FailureReason::Cancelled);
        }

        let input = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let tools_enabled = request.tools_enabled;
        let prompt_tokens = estimate_request_tokens(&request);
        debug!(session_id = %session.id(), source, tools_enabled, prompt_tokens, "Model call");

        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FailureReason::Cancelled),
            reply = self.provider.complete(request) => reply,
        };

        self.events.publish(DomainEvent::ModelCalled {
            session_id: session.id().to_string(),
            strategy: session.info().strategy.clone(),
            tools_enabled,
            timestamp: Utc::now(),
        });

        match reply {
            Ok(reply) => {
                session
                    .trace
                    .push(source, TraceKind::ModelCall, input, reply.describe());
                Ok(reply)
            }
            Err(e) => {
                warn!(session_id = %session.id(), source, "Model call failed: {e}");
                session
                    .trace
                    .push(source, TraceKind::ModelCall, input, format!("Error: {e}"));
                Err(e.into())
            }
        }
    }

    /// Dispatch a batch of tool invocations concurrently and wait for all
    /// of them.
    ///
    /// Results come back in batch order, each attributed to its source id
    /// regardless of which finished first. Tool failures stay inside their
    /// observation. If the session is cancelled before or during the batch
    /// the whole call fails with `Cancelled` once the batch has drained.
    pub async fn dispatch(
        &self,
        session: &mut Session,
        batch: Vec<Invocation>,
    ) -> Result<Vec<Observation>, FailureReason> {
        let cancel = session.cancel_token();
        if cancel.is_cancelled() {
            return Err(FailureReason::Cancelled);
        }
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        for inv in &batch {
            session.trace.push(
                inv.source.as_str(),
                TraceKind::ToolCall,
                format!("{}({})", inv.tool, inv.args),
                "",
            );
        }
        info!(session_id = %session.id(), size = batch.len(), "Dispatching tool batch");

        let tasks = batch.iter().map(|inv| {
            let request = ToolRequest::new(inv.tool.clone(), inv.args.clone(), self.tool_timeout)
                .with_cancel(cancel.clone());
            let tools = &self.tools;
            async move {
                let start = Instant::now();
                let result = tools.invoke(request).await;
                (result, start.elapsed().as_millis() as u64)
            }
        });
        let results = join_all(tasks).await;

        let mut observations = Vec::with_capacity(batch.len());
        for (inv, (result, duration_ms)) in batch.into_iter().zip(results) {
            let observation = Observation {
                source: inv.source,
                tool: inv.tool,
                result,
                duration_ms,
            };
            self.events.publish(DomainEvent::ToolExecuted {
                session_id: session.id().to_string(),
                tool_name: observation.tool.clone(),
                success: observation.is_success(),
                duration_ms,
                timestamp: Utc::now(),
            });
            session.trace.push(
                observation.source.as_str(),
                TraceKind::ToolResult,
                observation.tool.as_str(),
                observation.text(),
            );
            observations.push(observation);
        }

        if cancel.is_cancelled() {
            warn!(session_id = %session.id(), "Session cancelled during tool batch");
            return Err(FailureReason::Cancelled);
        }
        Ok(observations)
    }
}
