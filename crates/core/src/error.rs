//! Error types for the reasonloop domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The top-level error type for all reasonloop operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Plan errors ---
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    // --- Strategy selection ---
    #[error(transparent)]
    UnknownStrategy(#[from] UnknownStrategy),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    // --- Persistence ---
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Malformed reply: {0}")]
    MalformedReply(String),
}

/// Failure of a single tool invocation.
///
/// A tool error is always local to the step or search node that issued
/// the call; it never aborts the session on its own.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool timed out: {tool_name} after {timeout_ms}ms")]
    Timeout { tool_name: String, timeout_ms: u64 },

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool call cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),
}

/// Structural problems with a plan produced by a planner model call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("Duplicate step id: {0}")]
    DuplicateStep(String),

    #[error("Step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: String, dependency: String },

    #[error("Dependency cycle through step {0}")]
    Cycle(String),

    #[error("Unknown step: {0}")]
    UnknownStep(String),

    #[error("Step {step} cannot move from {from} to {to}")]
    InvalidTransition {
        step: String,
        from: String,
        to: String,
    },
}

/// Raised when a switch names a strategy the registry does not hold.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Unknown strategy '{name}'. Available strategies: {available}")]
pub struct UnknownStrategy {
    pub name: String,
    pub available: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Strategy '{0}' is already registered")]
    Duplicate(String),

    #[error("Cannot unregister '{0}' because it is the current strategy")]
    InUse(String),

    #[error(transparent)]
    Unknown(#[from] UnknownStrategy),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CheckpointError {
    #[error("No checkpoint stored for session {0}")]
    NotFound(String),

    #[error("Checkpoint storage failed: {0}")]
    Storage(String),
}

/// Why a strategy gave up on a session.
///
/// This is the payload of a failed outcome and is recorded verbatim in
/// the execution trace, so it must stay serializable.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("Iteration limit exceeded ({limit} cycles)")]
    IterationLimitExceeded { limit: u32 },

    #[error("Replan limit exceeded ({limit} replans)")]
    ReplanLimitExceeded { limit: u32 },

    #[error("Session cancelled")]
    Cancelled,

    #[error("Synthesis grounding violation: {detail}")]
    SynthesisGroundingViolation { detail: String },

    #[error("Invalid plan: {detail}")]
    InvalidPlan { detail: String },

    #[error("Provider failure: {detail}")]
    Provider { detail: String },

    #[error("Unknown strategy: {name}")]
    UnknownStrategy { name: String },
}

impl From<ProviderError> for FailureReason {
    fn from(err: ProviderError) -> Self {
        FailureReason::Provider {
            detail: err.to_string(),
        }
    }
}

impl From<PlanError> for FailureReason {
    fn from(err: PlanError) -> Self {
        FailureReason::InvalidPlan {
            detail: err.to_string(),
        }
    }
}

impl From<UnknownStrategy> for FailureReason {
    fn from(err: UnknownStrategy) -> Self {
        FailureReason::UnknownStrategy { name: err.name }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_displays_correctly() {
        let err = Error::Provider(ProviderError::ApiError {
            status_code: 429,
            message: "Too many requests".into(),
        });
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("Too many requests"));
    }

    #[test]
    fn tool_timeout_displays_deadline() {
        let err = Error::Tool(ToolError::Timeout {
            tool_name: "web_fetch".into(),
            timeout_ms: 1500,
        });
        assert!(err.to_string().contains("web_fetch"));
        assert!(err.to_string().contains("1500ms"));
    }

    #[test]
    fn unknown_strategy_lists_available() {
        let err = UnknownStrategy {
            name: "tot".into(),
            available: "react, rewoo".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("tot"));
        assert!(msg.contains("react, rewoo"));
    }

    #[test]
    fn failure_reason_serializes_with_kind_tag() {
        let reason = FailureReason::ReplanLimitExceeded { limit: 1 };
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["kind"], "replan_limit_exceeded");
        assert_eq!(json["limit"], 1);

        let back: FailureReason = serde_json::from_value(json).unwrap();
        assert_eq!(back, reason);
    }

    #[test]
    fn provider_error_converts_to_failure() {
        let reason: FailureReason = ProviderError::Timeout("30s".into()).into();
        assert!(matches!(reason, FailureReason::Provider { ref detail } if detail.contains("30s")));
    }
}
