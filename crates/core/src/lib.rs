//! # reasonloop core
//!
//! Domain types, ports, and error definitions for the reasonloop
//! strategy engine. This crate holds no strategy logic; it defines the
//! model every other crate builds on.
//!
//! ## Ports
//!
//! The engine reaches the outside world through two traits:
//! - [`LlmProvider`]: one model call, optionally with tools disabled
//! - [`ToolPort`]: one tool invocation with its own deadline
//!
//! Hosts plug in real implementations; tests plug in scripted ones.

pub mod error;
pub mod event;
pub mod message;
pub mod plan;
pub mod provider;
pub mod session;
pub mod tool;
pub mod trace;

// Re-export key types at crate root for ergonomics
pub use error::{
    CheckpointError, Error, FailureReason, PlanError, ProviderError, RegistryError, Result,
    ToolError, UnknownStrategy,
};
pub use event::{DomainEvent, EventBus};
pub use message::{Message, ModelReply, Role};
pub use plan::{Plan, Step, StepState};
pub use provider::{CompletionRequest, LlmProvider, ToolDefinition};
pub use session::{SessionId, SessionStatus};
pub use tool::{Tool, ToolOutput, ToolPort, ToolRegistry, ToolRequest};
pub use trace::{ExecutionTrace, TraceEntry, TraceKind};

// Cancellation tokens cross every port boundary.
pub use tokio_util::sync::CancellationToken;
