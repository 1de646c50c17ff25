//! Reasoning strategies.
//!
//! A strategy maps a session's objective and context to an [`Outcome`].
//! The set of strategies is closed: each [`StrategyKind`] tag has exactly
//! one implementation, and the registry resolves names to tags.
//!
//! | Kind | Name | Shape | Cycles per `run` |
//! |------|------|-------|------------------|
//! | Iterative | `react` | think → act → observe | one |
//! | Upfront-parallel | `rewoo` | plan DAG, parallel waves, synthesize | whole pipeline |
//! | Adaptive | `plan-execute` | plan, step, check, replan | one step |
//! | Tree search | `lats` | select, expand, simulate, reflect, backpropagate | whole search |

pub mod lats;
pub mod plan_execute;
pub mod react;
pub mod registry;
pub mod rewoo;
pub mod search_tree;

use reasonloop_config::AppConfig;
use reasonloop_core::error::FailureReason;
use reasonloop_core::trace::TraceKind;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::runtime::Ports;
use crate::session::Session;

pub use lats::LatsStrategy;
pub use plan_execute::AdaptiveStrategy;
pub use react::ReactStrategy;
pub use registry::{StrategyDescription, StrategyRegistry};
pub use rewoo::RewooStrategy;

/// What one strategy run produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The objective is answered.
    Answer(String),
    /// The session was advanced and should be run again.
    NeedsMoreSteps { progress: String },
    /// The strategy gave up; terminal for the session.
    Failed(FailureReason),
}

impl Outcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Outcome::NeedsMoreSteps { .. })
    }
}

/// Tag of a strategy implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    React,
    Rewoo,
    PlanExecute,
    Lats,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 4] = [
        StrategyKind::React,
        StrategyKind::Rewoo,
        StrategyKind::PlanExecute,
        StrategyKind::Lats,
    ];

    /// The name this kind is registered under by default.
    pub fn canonical_name(self) -> &'static str {
        match self {
            StrategyKind::React => "react",
            StrategyKind::Rewoo => "rewoo",
            StrategyKind::PlanExecute => "plan-execute",
            StrategyKind::Lats => "lats",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            StrategyKind::React => {
                "Iterative reasoning: think, call one tool, observe, repeat until an answer"
            }
            StrategyKind::Rewoo => {
                "Plan every tool call upfront, run independent steps in parallel, then synthesize"
            }
            StrategyKind::PlanExecute => {
                "Execute a plan one step at a time and replan when progress stalls"
            }
            StrategyKind::Lats => {
                "Tree search over candidate actions scored by self-reflection"
            }
        }
    }

    /// Build the implementation for this kind from configuration.
    pub fn build(self, config: &AppConfig) -> Strategy {
        let budget = config.context.max_tokens;
        match self {
            StrategyKind::React => Strategy::React(ReactStrategy::new(config.react.clone(), budget)),
            StrategyKind::Rewoo => Strategy::Rewoo(RewooStrategy::new(config.rewoo.clone(), budget)),
            StrategyKind::PlanExecute => {
                Strategy::PlanExecute(AdaptiveStrategy::new(config.plan_execute.clone(), budget))
            }
            StrategyKind::Lats => Strategy::Lats(LatsStrategy::new(config.lats.clone(), budget)),
        }
    }
}

/// A resolved strategy, ready to run.
#[derive(Debug, Clone)]
pub enum Strategy {
    React(ReactStrategy),
    Rewoo(RewooStrategy),
    PlanExecute(AdaptiveStrategy),
    Lats(LatsStrategy),
}

impl Strategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::React(_) => StrategyKind::React,
            Strategy::Rewoo(_) => StrategyKind::Rewoo,
            Strategy::PlanExecute(_) => StrategyKind::PlanExecute,
            Strategy::Lats(_) => StrategyKind::Lats,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().canonical_name()
    }

    pub fn description(&self) -> &'static str {
        self.kind().description()
    }

    /// The configuration this instance runs with.
    pub fn config_json(&self) -> serde_json::Value {
        let value = match self {
            Strategy::React(s) => serde_json::to_value(s.config()),
            Strategy::Rewoo(s) => serde_json::to_value(s.config()),
            Strategy::PlanExecute(s) => serde_json::to_value(s.config()),
            Strategy::Lats(s) => serde_json::to_value(s.config()),
        };
        value.unwrap_or(serde_json::Value::Null)
    }

    /// Run one cycle (or the whole pipeline, for single-shot strategies)
    /// against `session`. Failures are recorded in the trace before they
    /// are returned.
    pub async fn run(&self, ports: &Ports, session: &mut Session) -> Outcome {
        let result = match self {
            Strategy::React(s) => s.run(ports, session).await,
            Strategy::Rewoo(s) => s.run(ports, session).await,
            Strategy::PlanExecute(s) => s.run(ports, session).await,
            Strategy::Lats(s) => s.run(ports, session).await,
        };
        match result {
            Ok(outcome) => outcome,
            Err(reason) => {
                warn!(session_id = %session.id(), strategy = self.name(), "Strategy failed: {reason}");
                let objective = session.objective().to_string();
                session
                    .trace
                    .push(self.name(), TraceKind::Failure, objective, reason.to_string());
                Outcome::Failed(reason)
            }
        }
    }
}
