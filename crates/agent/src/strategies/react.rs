//! Iterative strategy: Thought, Action, Observation.
//!
//! Each call to [`ReactStrategy::run`] is one cycle: the model sees the
//! current context view and either calls a tool or answers. A tool call
//! is dispatched through the tool port and the observation appended to
//! working memory; the cycle then returns `NeedsMoreSteps`. Cycles are
//! strictly sequential because each depends on the previous observation.
//!
//! # Trace Format
//!
//! Each cycle `n` records under source `react:<n>`:
//! - **ModelCall**: the prompt objective and the model's reply
//! - **ToolCall** / **ToolResult**: the action and its observation

use reasonloop_config::ReactConfig;
use reasonloop_core::error::FailureReason;
use reasonloop_core::message::ModelReply;
use reasonloop_core::provider::CompletionRequest;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::Outcome;
use crate::context::RecordKind;
use crate::prompts::{REACT_SYSTEM, with_context};
use crate::runtime::{Invocation, Ports};
use crate::session::Session;

/// Progress of the iterative loop, kept on the session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactProgress {
    pub iterations: u32,
    pub tool_calls: u32,
}

#[derive(Debug, Clone)]
pub struct ReactStrategy {
    config: ReactConfig,
    budget: usize,
}

impl ReactStrategy {
    pub fn new(config: ReactConfig, budget: usize) -> Self {
        Self { config, budget }
    }

    pub fn config(&self) -> &ReactConfig {
        &self.config
    }

    pub async fn run(&self, ports: &Ports, session: &mut Session) -> Result<Outcome, FailureReason> {
        let progress = session.progress.react.get_or_insert_with(ReactProgress::default);
        if progress.iterations >= self.config.max_iterations {
            return Err(FailureReason::IterationLimitExceeded {
                limit: self.config.max_iterations,
            });
        }
        progress.iterations += 1;
        let iteration = progress.iterations;
        let source = format!("react:{iteration}");
        debug!(session_id = %session.id(), iteration, "ReAct iteration");

        // Think
        let view = session.context.view(self.budget).await;
        let messages = with_context(
            REACT_SYSTEM,
            &view,
            format!("Objective: {}", session.objective()),
        );
        let request = CompletionRequest::with_tools(messages, ports.tool_definitions());
        let reply = ports.ask_model(session, &source, request).await?;

        match reply {
            ModelReply::Text { content } => {
                info!(session_id = %session.id(), iteration, "ReAct produced an answer");
                session
                    .context
                    .record(RecordKind::Thought, source.as_str(), content.as_str())
                    .await;
                Ok(Outcome::Answer(content))
            }
            ModelReply::ToolCall { name, args } => {
                // Act
                session
                    .context
                    .record(RecordKind::Action, source.as_str(), format!("{name}({args})"))
                    .await;
                let mut observations = ports
                    .dispatch(session, vec![Invocation::new(source.as_str(), name.as_str(), args)])
                    .await?;

                // Observe
                let observation = observations.pop().map(|o| o.text()).unwrap_or_default();
                session
                    .context
                    .record(RecordKind::Observation, source.as_str(), observation)
                    .await;
                if let Some(progress) = session.progress.react.as_mut() {
                    progress.tool_calls += 1;
                }
                Ok(Outcome::NeedsMoreSteps {
                    progress: format!("iteration {iteration}: called {name}"),
                })
            }
        }
    }
}
