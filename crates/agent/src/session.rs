//! Sessions and their checkpoints.
//!
//! A [`Session`] is one objective in flight: its lifecycle info, the
//! context manager that owns its files and working memory, the execution
//! trace, per-strategy progress, and a cancellation token.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reasonloop_config::ContextConfig;
use reasonloop_core::error::{CheckpointError, FailureReason};
use reasonloop_core::session::{SessionId, SessionStatus};
use reasonloop_core::trace::ExecutionTrace;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::{ContextManager, ContextSnapshot};
use crate::strategies::plan_execute::AdaptiveProgress;
use crate::strategies::react::ReactProgress;

/// Lifecycle information for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub objective: String,
    pub status: SessionStatus,
    /// Strategy that ran the most recent cycle
    pub strategy: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    /// Strategy cycles run so far
    pub cycles: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
}

/// Progress of the multi-cycle strategies, kept on the session so a
/// switch away and back resumes where it left off.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyProgress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub react: Option<ReactProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_execute: Option<AdaptiveProgress>,
}

pub struct Session {
    info: SessionInfo,
    pub context: ContextManager,
    pub trace: ExecutionTrace,
    pub progress: StrategyProgress,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(objective: impl Into<String>, strategy: impl Into<String>, config: ContextConfig) -> Self {
        let now = Utc::now();
        Self {
            info: SessionInfo {
                id: SessionId::new(),
                objective: objective.into(),
                status: SessionStatus::Active,
                strategy: strategy.into(),
                created_at: now,
                last_active: now,
                cycles: 0,
                answer: None,
                failure: None,
            },
            context: ContextManager::new(config),
            trace: ExecutionTrace::new(),
            progress: StrategyProgress::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.info.id
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn objective(&self) -> &str {
        &self.info.objective
    }

    pub fn status(&self) -> SessionStatus {
        self.info.status
    }

    /// A handle that cancels this session when tripped. Clones share the
    /// same token.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Move to `next` if the lifecycle allows it.
    pub(crate) fn set_status(&mut self, next: SessionStatus) -> bool {
        if !self.info.status.can_transition_to(next) {
            warn!(session_id = %self.info.id, from = ?self.info.status, to = ?next, "Rejected status change");
            return false;
        }
        debug!(session_id = %self.info.id, from = ?self.info.status, to = ?next, "Session status change");
        self.info.status = next;
        self.info.last_active = Utc::now();
        true
    }

    pub(crate) fn begin_cycle(&mut self, strategy: &str) -> u32 {
        self.info.strategy = strategy.to_string();
        self.info.cycles += 1;
        self.info.last_active = Utc::now();
        self.info.cycles
    }

    pub(crate) fn complete(&mut self, answer: String) -> bool {
        if self.set_status(SessionStatus::Completed) {
            self.info.answer = Some(answer);
            return true;
        }
        false
    }

    pub(crate) fn fail(&mut self, reason: FailureReason) -> bool {
        if self.set_status(SessionStatus::Failed) {
            self.info.failure = Some(reason);
            return true;
        }
        false
    }

    /// Capture everything needed to rebuild this session.
    pub async fn checkpoint(&self) -> SessionCheckpoint {
        SessionCheckpoint {
            info: self.info.clone(),
            progress: self.progress.clone(),
            context: self.context.snapshot().await,
            trace: self.trace.clone(),
        }
    }

    /// Rebuild a session from a checkpoint. The restored session gets a
    /// fresh cancellation token.
    pub fn restore(checkpoint: SessionCheckpoint, config: ContextConfig) -> Self {
        Self {
            info: checkpoint.info,
            context: ContextManager::restore(checkpoint.context, config),
            trace: checkpoint.trace,
            progress: checkpoint.progress,
            cancel: CancellationToken::new(),
        }
    }
}

/// Serializable state of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCheckpoint {
    pub info: SessionInfo,
    pub progress: StrategyProgress,
    pub context: ContextSnapshot,
    pub trace: ExecutionTrace,
}

/// Where checkpoints are kept, keyed by session id.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: &SessionCheckpoint) -> Result<(), CheckpointError>;

    async fn load(&self, id: &SessionId) -> Result<SessionCheckpoint, CheckpointError>;

    /// Returns whether a checkpoint existed.
    async fn delete(&self, id: &SessionId) -> Result<bool, CheckpointError>;
}

/// Keeps checkpoints as JSON in memory. Useful for tests and ephemeral
/// hosts.
pub struct InMemoryCheckpointStore {
    entries: Arc<RwLock<HashMap<String, String>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for InMemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: &SessionCheckpoint) -> Result<(), CheckpointError> {
        let json = serde_json::to_string(checkpoint).map_err(|e| CheckpointError::Storage(e.to_string()))?;
        self.entries
            .write()
            .await
            .insert(checkpoint.info.id.to_string(), json);
        Ok(())
    }

    async fn load(&self, id: &SessionId) -> Result<SessionCheckpoint, CheckpointError> {
        let entries = self.entries.read().await;
        let json = entries
            .get(&id.0)
            .ok_or_else(|| CheckpointError::NotFound(id.to_string()))?;
        serde_json::from_str(json).map_err(|e| CheckpointError::Storage(e.to_string()))
    }

    async fn delete(&self, id: &SessionId) -> Result<bool, CheckpointError> {
        Ok(self.entries.write().await.remove(&id.0).is_some())
    }
}
