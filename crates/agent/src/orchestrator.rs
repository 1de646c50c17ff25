//! The orchestrator: drives sessions through strategy cycles.
//!
//! Before every cycle the registry's current strategy is resolved, so a
//! switch takes effect on the next cycle of every session. The session,
//! its context and its trace are carried across switches untouched.

use chrono::Utc;
use reasonloop_config::AppConfig;
use reasonloop_core::error::{CheckpointError, Error, FailureReason, RegistryError, UnknownStrategy};
use reasonloop_core::event::DomainEvent;
use reasonloop_core::session::{SessionId, SessionStatus};
use reasonloop_core::trace::TraceKind;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use crate::context::RecordKind;
use crate::runtime::Ports;
use crate::selector::PatternSelector;
use crate::session::{CheckpointStore, InMemoryCheckpointStore, Session};
use crate::strategies::{Outcome, StrategyDescription, StrategyKind, StrategyRegistry};

const SOURCE: &str = "orchestrator";

pub struct Orchestrator {
    ports: Ports,
    config: AppConfig,
    registry: RwLock<StrategyRegistry>,
    selector: PatternSelector,
    store: Arc<dyn CheckpointStore>,
}

impl Orchestrator {
    /// Build an orchestrator. Tool invocations get the configured
    /// deadline; checkpoints go to an in-memory store until
    /// [`with_store`](Self::with_store) replaces it.
    pub fn new(config: AppConfig, ports: Ports) -> Result<Self, Error> {
        let registry = StrategyRegistry::new(&config)?;
        Ok(Self {
            ports: ports.with_tool_timeout(config.tool_timeout()),
            selector: PatternSelector::new(config.selector.clone()),
            registry: RwLock::new(registry),
            store: Arc::new(InMemoryCheckpointStore::new()),
            config,
        })
    }

    pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = store;
        self
    }

    pub fn ports(&self) -> &Ports {
        &self.ports
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.ports.events.subscribe()
    }

    // --- Strategy selection surface ---

    pub async fn list(&self) -> Vec<String> {
        self.registry.read().await.list()
    }

    pub async fn current(&self) -> String {
        self.registry.read().await.current().to_string()
    }

    pub async fn switch(&self, name: &str) -> Result<(), UnknownStrategy> {
        let mut registry = self.registry.write().await;
        let from = registry.current().to_string();
        registry.switch(name)?;
        if from != name {
            self.ports.events.publish(DomainEvent::StrategySwitched {
                from,
                to: name.to_string(),
                timestamp: Utc::now(),
            });
        }
        Ok(())
    }

    pub async fn register(&self, name: &str, kind: StrategyKind) -> Result<(), RegistryError> {
        self.registry.write().await.register(name, kind)
    }

    pub async fn unregister(&self, name: &str) -> Result<StrategyKind, RegistryError> {
        self.registry.write().await.unregister(name)
    }

    pub async fn describe(&self, name: &str) -> Result<StrategyDescription, UnknownStrategy> {
        self.registry.read().await.describe(name)
    }

    // --- Session lifecycle ---

    /// Create an active session for `objective`. With auto-selection on,
    /// a confident recommendation becomes the current strategy first.
    pub async fn start(&self, objective: &str) -> Session {
        let current = self.current().await;
        let mut session = Session::new(objective, current.as_str(), self.config.context.clone());
        session
            .context
            .record(RecordKind::Objective, SOURCE, objective)
            .await;

        if self.config.selector.auto_select {
            let available = self.list().await;
            let recommendation = self.selector.select(&self.ports, &mut session, &available).await;
            session
                .context
                .record(RecordKind::Note, "selector", recommendation.explain())
                .await;
            if self.selector.accepts(&recommendation) {
                if let Err(e) = self.switch(&recommendation.pattern_name).await {
                    warn!(session_id = %session.id(), "Ignoring recommendation: {e}");
                }
            } else {
                debug!(
                    session_id = %session.id(),
                    pattern = %recommendation.pattern_name,
                    confidence = recommendation.confidence,
                    "Recommendation below confidence threshold"
                );
            }
        }

        let strategy = self.current().await;
        info!(session_id = %session.id(), strategy = %strategy, "Session started");
        self.ports.events.publish(DomainEvent::SessionStarted {
            session_id: session.id().to_string(),
            strategy,
            timestamp: Utc::now(),
        });
        session
    }

    /// Run a single cycle of the current strategy.
    ///
    /// Terminal sessions return their recorded result. A suspended
    /// session is left alone and reported as needing more steps.
    pub async fn step(&self, session: &mut Session) -> Outcome {
        match session.status() {
            SessionStatus::Completed | SessionStatus::Failed => return Self::settled(session),
            SessionStatus::Suspended => {
                return Outcome::NeedsMoreSteps {
                    progress: "session is suspended".into(),
                };
            }
            SessionStatus::Active => {}
        }
        if session.is_cancelled() {
            return self.abort(session, FailureReason::Cancelled);
        }
        let limit = self.config.max_session_cycles;
        if session.info().cycles >= limit {
            return self.abort(session, FailureReason::IterationLimitExceeded { limit });
        }

        let (name, resolved) = {
            let registry = self.registry.read().await;
            (registry.current().to_string(), registry.resolve_current())
        };
        let strategy = match resolved {
            Ok(strategy) => strategy,
            Err(e) => return self.abort(session, e.into()),
        };

        if session.info().strategy != name {
            let from = session.info().strategy.clone();
            info!(session_id = %session.id(), from = %from, to = %name, "Session continues on new strategy");
            session
                .trace
                .push(SOURCE, TraceKind::StrategySwitch, from, name.as_str());
        }
        let cycle = session.begin_cycle(&name);
        debug!(session_id = %session.id(), strategy = %name, cycle, "Running cycle");

        let outcome = strategy.run(&self.ports, session).await;
        self.settle(session, outcome)
    }

    /// Drive `session` until it completes, fails or is suspended.
    pub async fn run(&self, session: &mut Session) -> Outcome {
        loop {
            let outcome = self.step(session).await;
            if outcome.is_terminal() || session.status() == SessionStatus::Suspended {
                return outcome;
            }
        }
    }

    pub fn suspend(&self, session: &mut Session) -> bool {
        session.set_status(SessionStatus::Suspended)
    }

    pub fn resume(&self, session: &mut Session) -> bool {
        session.set_status(SessionStatus::Active)
    }

    /// Trip the session's cancellation token and fail it. A cycle running
    /// elsewhere with a clone of the token stops at its next suspension
    /// point.
    pub fn cancel(&self, session: &mut Session) -> Outcome {
        session.cancel_token().cancel();
        if session.status().is_terminal() {
            return Self::settled(session);
        }
        self.abort(session, FailureReason::Cancelled)
    }

    // --- Persistence ---

    pub async fn save(&self, session: &Session) -> Result<(), CheckpointError> {
        let checkpoint = session.checkpoint().await;
        self.store.save(&checkpoint).await?;
        debug!(session_id = %session.id(), cycles = checkpoint.info.cycles, "Checkpoint saved");
        Ok(())
    }

    pub async fn restore(&self, id: &SessionId) -> Result<Session, CheckpointError> {
        let checkpoint = self.store.load(id).await?;
        info!(session_id = %id, "Session restored");
        Ok(Session::restore(checkpoint, self.config.context.clone()))
    }

    pub async fn forget(&self, id: &SessionId) -> Result<bool, CheckpointError> {
        self.store.delete(id).await
    }

    // --- Internals ---

    /// The result a terminal session already holds.
    fn settled(session: &Session) -> Outcome {
        let info = session.info();
        match (info.status, &info.answer, &info.failure) {
            (SessionStatus::Completed, Some(answer), _) => Outcome::Answer(answer.clone()),
            (SessionStatus::Failed, _, Some(reason)) => Outcome::Failed(reason.clone()),
            _ => Outcome::NeedsMoreSteps {
                progress: format!("session is {:?}", info.status),
            },
        }
    }

    /// Fail the session for a reason raised outside any strategy.
    fn abort(&self, session: &mut Session, reason: FailureReason) -> Outcome {
        let objective = session.objective().to_string();
        session
            .trace
            .push(SOURCE, TraceKind::Failure, objective, reason.to_string());
        self.settle(session, Outcome::Failed(reason))
    }

    fn settle(&self, session: &mut Session, outcome: Outcome) -> Outcome {
        match &outcome {
            Outcome::Answer(answer) => {
                let objective = session.objective().to_string();
                session
                    .trace
                    .push(SOURCE, TraceKind::Answer, objective, answer.as_str());
                if session.complete(answer.clone()) {
                    info!(session_id = %session.id(), cycles = session.info().cycles, "Session completed");
                    self.publish_finished(session, true, answer.clone());
                }
            }
            Outcome::Failed(reason) => {
                if session.fail(reason.clone()) {
                    warn!(session_id = %session.id(), "Session failed: {reason}");
                    self.publish_finished(session, false, reason.to_string());
                }
            }
            Outcome::NeedsMoreSteps { progress } => {
                debug!(session_id = %session.id(), progress = %progress, "Cycle finished");
            }
        }
        outcome
    }

    fn publish_finished(&self, session: &Session, success: bool, detail: String) {
        self.ports.events.publish(DomainEvent::SessionFinished {
            session_id: session.id().to_string(),
            success,
            detail,
            timestamp: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;
    use reasonloop_core::tool::ToolRegistry;
    use serde_json::json;
    use std::time::Duration;

    fn orchestrator(provider: Arc<ScriptedProvider>, config: AppConfig) -> Orchestrator {
        Orchestrator::new(config, ports(provider, basic_tools())).unwrap()
    }

    fn drain(rx: &mut broadcast::Receiver<Arc<DomainEvent>>) -> Vec<Arc<DomainEvent>> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn current_date_calls_tool_before_answering() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            call("current_date", json!({})),
            text("Today is 2026-10-19."),
        ]));
        let orch = orchestrator(provider, AppConfig::default());
        let mut rx = orch.subscribe();
        let mut session = orch.start("get the current date").await;

        let outcome = orch.run(&mut session).await;
        assert_eq!(outcome, Outcome::Answer("Today is 2026-10-19.".into()));
        assert_eq!(session.status(), SessionStatus::Completed);
        assert_eq!(session.info().cycles, 2);

        let tool_call = session.trace.first(TraceKind::ToolCall).unwrap();
        let answer = session.trace.first(TraceKind::Answer).unwrap();
        assert!(tool_call < answer);

        let events = drain(&mut rx);
        assert!(matches!(events.first().map(|e| &**e), Some(DomainEvent::SessionStarted { .. })));
        assert!(matches!(
            events.last().map(|e| &**e),
            Some(DomainEvent::SessionFinished { success: true, .. })
        ));
        assert!(events.iter().any(|e| matches!(&**e, DomainEvent::ToolExecuted { success: true, .. })));

        // A finished session keeps its answer.
        assert_eq!(orch.step(&mut session).await, outcome);
    }

    #[tokio::test]
    async fn cancelled_before_run_fails() {
        let provider = Arc::new(ScriptedProvider::new(vec![text("never asked")]));
        let orch = orchestrator(provider.clone(), AppConfig::default());
        let mut session = orch.start("anything").await;
        session.cancel_token().cancel();

        assert_eq!(orch.run(&mut session).await, Outcome::Failed(FailureReason::Cancelled));
        assert_eq!(session.status(), SessionStatus::Failed);
        assert_eq!(provider.call_count(), 0);
        assert!(session.trace.first(TraceKind::Failure).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_tool_batch() {
        let provider = Arc::new(ScriptedProvider::new(vec![call("slow", json!({})), text("done")]));
        let mut tools = ToolRegistry::new();
        tools.register(Box::new(SlowTool {
            delay: Duration::from_secs(10),
        }));
        let orch = Orchestrator::new(AppConfig::default(), ports(provider.clone(), tools)).unwrap();
        let mut session = orch.start("wait for it").await;
        let token = session.cancel_token();

        let (outcome, _) = tokio::join!(orch.run(&mut session), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });
        assert_eq!(outcome, Outcome::Failed(FailureReason::Cancelled));
        assert_eq!(session.status(), SessionStatus::Failed);
        assert_eq!(provider.call_count(), 1);
        assert_eq!(session.trace.of_kind(TraceKind::ModelCall).count(), 1);
    }

    #[tokio::test]
    async fn explicit_cancel_fails_suspended_session() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let orch = orchestrator(provider, AppConfig::default());
        let mut session = orch.start("anything").await;

        assert!(orch.suspend(&mut session));
        assert!(matches!(orch.run(&mut session).await, Outcome::NeedsMoreSteps { .. }));
        assert_eq!(orch.cancel(&mut session), Outcome::Failed(FailureReason::Cancelled));
        assert!(!orch.resume(&mut session));
    }

    #[tokio::test]
    async fn switching_mid_session_keeps_context() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            call("echo", json!({"text": "first look"})),
            text(r#"{"steps": [{"tool": "echo", "args": {"text": "second look"}}]}"#),
            text("Both looks agree (#E1)."),
        ]));
        let orch = orchestrator(provider.clone(), AppConfig::default());
        let mut rx = orch.subscribe();
        let mut session = orch.start("look twice").await;

        let first = orch.step(&mut session).await;
        assert!(matches!(first, Outcome::NeedsMoreSteps { .. }));
        orch.switch("rewoo").await.unwrap();
        assert!(orch.switch("tot").await.is_err());

        let outcome = orch.run(&mut session).await;
        assert_eq!(outcome, Outcome::Answer("Both looks agree (#E1).".into()));
        assert_eq!(session.info().strategy, "rewoo");
        assert!(session.trace.first(TraceKind::StrategySwitch).is_some());

        // The planner saw what the iterative cycle observed.
        let planner = &provider.requests()[1];
        assert!(planner.messages[1].content.contains("first look"));
        assert!(
            drain(&mut rx)
                .iter()
                .any(|e| matches!(&**e, DomainEvent::StrategySwitched { to, .. } if to == "rewoo"))
        );
    }

    #[tokio::test]
    async fn session_cycle_limit() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            call("echo", json!({"text": "a"})),
            call("echo", json!({"text": "b"})),
            call("echo", json!({"text": "c"})),
        ]));
        let mut config = AppConfig::default();
        config.max_session_cycles = 2;
        let orch = orchestrator(provider.clone(), config);
        let mut session = orch.start("loop forever").await;

        let outcome = orch.run(&mut session).await;
        assert_eq!(
            outcome,
            Outcome::Failed(FailureReason::IterationLimitExceeded { limit: 2 })
        );
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn checkpoint_round_trip() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            call("current_date", json!({})),
            text("It is 2026-10-19."),
        ]));
        let orch = orchestrator(provider, AppConfig::default());
        let mut session = orch.start("what day is it").await;
        orch.step(&mut session).await;
        orch.save(&session).await.unwrap();

        let mut restored = orch.restore(session.id()).await.unwrap();
        assert_eq!(restored.info().cycles, 1);
        assert_eq!(restored.trace.len(), session.trace.len());
        assert_eq!(restored.progress.react.as_ref().unwrap().iterations, 1);

        let outcome = orch.run(&mut restored).await;
        assert_eq!(outcome, Outcome::Answer("It is 2026-10-19.".into()));
        assert!(orch.forget(restored.id()).await.unwrap());
        assert!(matches!(
            orch.restore(restored.id()).await,
            Err(CheckpointError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn auto_select_switches_strategy() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            text(r#"{"pattern_name": "rewoo", "confidence": 0.9, "reasoning": "parallel lookups"}"#),
            text(r#"{"steps": [{"tool": "echo", "args": {"text": "fact"}}]}"#),
            text("fact (#E1)"),
        ]));
        let mut config = AppConfig::default();
        config.selector.auto_select = true;
        let orch = orchestrator(provider, config);

        let mut session = orch.start("gather facts").await;
        assert_eq!(orch.current().await, "rewoo");
        assert_eq!(orch.run(&mut session).await, Outcome::Answer("fact (#E1)".into()));
        assert_eq!(session.info().strategy, "rewoo");
    }

    #[tokio::test]
    async fn registry_surface() {
        let orch = orchestrator(Arc::new(ScriptedProvider::new(vec![])), AppConfig::default());
        orch.register("deep", StrategyKind::Lats).await.unwrap();
        assert!(orch.list().await.contains(&"deep".to_string()));
        assert_eq!(orch.describe("deep").await.unwrap().kind, StrategyKind::Lats);
        assert_eq!(
            orch.unregister("react").await,
            Err(RegistryError::InUse("react".into()))
        );
        assert_eq!(orch.unregister("deep").await, Ok(StrategyKind::Lats));
    }
}
