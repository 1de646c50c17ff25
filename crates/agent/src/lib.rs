//! Reasoning strategy orchestration.
//!
//! A [`Session`] holds one objective, its [`ContextManager`] and an
//! append-only trace. The [`Orchestrator`] drives it through cycles of
//! whichever strategy the registry currently resolves:
//!
//! 1. **Iterative** (`react`): think, call one tool, observe
//! 2. **Upfront-parallel** (`rewoo`): plan a step DAG, run ready steps in
//!    concurrent waves, synthesize from their outputs
//! 3. **Adaptive** (`plan-execute`): one step per cycle with bounded replanning
//! 4. **Tree search** (`lats`): UCB selection over reflected candidates
//!
//! Switching strategies mid-session never resets the context or trace.

pub mod context;
pub mod orchestrator;
pub mod prompts;
pub mod runtime;
pub mod selector;
pub mod session;
pub mod strategies;
pub mod synthesis;

#[cfg(test)]
mod test_helpers;

pub use context::{ContextManager, ContextView, RecordKind};
pub use orchestrator::Orchestrator;
pub use runtime::{Invocation, Observation, Ports};
pub use selector::{PatternSelector, Recommendation};
pub use session::{CheckpointStore, InMemoryCheckpointStore, Session, SessionCheckpoint, SessionInfo};
pub use strategies::{Outcome, Strategy, StrategyDescription, StrategyKind, StrategyRegistry};
pub use synthesis::Evidence;
