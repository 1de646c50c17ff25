//! Upfront-parallel strategy (ReWOO): plan, execute in waves, synthesize.
//!
//! 1. **Plan**: one tools-disabled model call produces a step DAG.
//! 2. **Execute**: every `ready` step is dispatched concurrently; the
//!    wave is joined, results are attributed by step id, and dependents
//!    unblock. Repeats until nothing is ready. Failed steps stay failed
//!    and their dependents stay pending.
//! 3. **Synthesize**: a tools-disabled call that sees only the recorded
//!    step outputs.
//!
//! Routing after planning depends only on whether the planner produced a
//! dispatchable step. If it did not, the planner's text is the answer.

use reasonloop_config::RewooConfig;
use reasonloop_core::error::FailureReason;
use reasonloop_core::message::ModelReply;
use reasonloop_core::plan::Plan;
use reasonloop_core::provider::CompletionRequest;
use tracing::{debug, info};

use super::Outcome;
use crate::context::RecordKind;
use crate::prompts::{PLANNER_SYSTEM, parse_plan, substitute, with_context};
use crate::runtime::{Invocation, Ports};
use crate::session::Session;
use crate::synthesis::{Evidence, synthesize};

#[derive(Debug, Clone)]
pub struct RewooStrategy {
    config: RewooConfig,
    budget: usize,
}

impl RewooStrategy {
    pub fn new(config: RewooConfig, budget: usize) -> Self {
        Self { config, budget }
    }

    pub fn config(&self) -> &RewooConfig {
        &self.config
    }

    pub async fn run(&self, ports: &Ports, session: &mut Session) -> Result<Outcome, FailureReason> {
        let planned = self.plan(ports, session).await?;
        let mut plan = match planned {
            Planned::Direct(answer) => {
                info!(session_id = %session.id(), "ReWOO planner answered directly");
                return Ok(Outcome::Answer(answer));
            }
            Planned::Steps(plan) => plan,
        };

        let evidence = execute(ports, session, &mut plan).await?;
        let evidence = evidence.resolve(self.config.conflict_policy);
        let answer = synthesize(ports, session, "rewoo:synthesize", &evidence).await?;
        Ok(Outcome::Answer(answer))
    }

    async fn plan(&self, ports: &Ports, session: &mut Session) -> Result<Planned, FailureReason> {
        let view = session.context.view(self.budget).await;
        let tools: Vec<String> = ports
            .tool_definitions()
            .into_iter()
            .map(|d| format!("- {}: {}", d.name, d.description))
            .collect();
        let messages = with_context(
            PLANNER_SYSTEM,
            &view,
            format!(
                "Available tools:\n{}\n\nObjective: {}",
                tools.join("\n"),
                session.objective()
            ),
        );
        let reply = ports
            .ask_model(session, "rewoo:plan", CompletionRequest::text_only(messages))
            .await?;
        let text = match reply {
            ModelReply::Text { content } => content,
            ModelReply::ToolCall { name, .. } => {
                return Err(FailureReason::InvalidPlan {
                    detail: format!("planner called tool '{name}' instead of planning"),
                });
            }
        };

        match parse_plan(&text)? {
            Some(plan) => {
                session
                    .context
                    .record(RecordKind::Plan, "rewoo:plan", text.as_str())
                    .await;
                info!(session_id = %session.id(), steps = plan.len(), "ReWOO plan ready");
                Ok(Planned::Steps(plan))
            }
            None => Ok(Planned::Direct(text)),
        }
    }
}

enum Planned {
    Direct(String),
    Steps(Plan),
}

/// Run `plan` in waves of ready steps until no step is ready.
///
/// Returns the outputs in completion order. Within a wave, order follows
/// the plan, not arrival.
pub(crate) async fn execute(
    ports: &Ports,
    session: &mut Session,
    plan: &mut Plan,
) -> Result<Evidence, FailureReason> {
    let mut evidence = Evidence::new();
    let mut wave = 0usize;

    loop {
        let ready = plan.ready();
        if ready.is_empty() {
            break;
        }
        wave += 1;

        let mut batch = Vec::with_capacity(ready.len());
        {
            let outputs = plan.outputs();
            for id in &ready {
                if let Some(step) = plan.get(id) {
                    batch.push(Invocation::new(
                        id.as_str(),
                        step.tool.as_str(),
                        substitute(&step.args, &outputs),
                    ));
                }
            }
        }
        for id in &ready {
            plan.start(id)?;
        }
        debug!(session_id = %session.id(), wave, steps = ?ready, "ReWOO wave");

        let observations = ports.dispatch(session, batch).await?;
        for observation in observations {
            let id = observation.source.as_str();
            let key = plan.get(id).and_then(|s| s.key.clone());
            match &observation.result {
                Ok(output) => {
                    plan.complete(id, output.content.as_str())?;
                    evidence.push(id, observation.tool.as_str(), key, output.content.as_str());
                }
                Err(e) => {
                    plan.fail(id, e.to_string())?;
                    evidence.push_failure(id, observation.tool.as_str(), e.to_string());
                }
            }
            session
                .context
                .record(RecordKind::Observation, id, observation.text())
                .await;
        }
    }

    let (done, failed, total) = plan.progress();
    info!(
        session_id = %session.id(),
        waves = wave,
        done,
        failed,
        blocked = plan.blocked().len(),
        total,
        "ReWOO execution settled"
    );
    Ok(evidence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::Strategy;
    use crate::test_helpers::*;
    use reasonloop_config::{ConflictPolicy, ContextConfig};
    use reasonloop_core::plan::StepState;
    use reasonloop_core::trace::TraceKind;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn strategy() -> RewooStrategy {
        RewooStrategy::new(RewooConfig::default(), 10_000)
    }

    fn session() -> Session {
        Session::new("compare A and B", "rewoo", ContextConfig::default())
    }

    #[tokio::test]
    async fn independent_steps_run_concurrently_before_dependent() {
        let plan = r#"{"steps": [
            {"id": "A", "tool": "gate", "args": {"label": "A", "wait": true}},
            {"id": "B", "tool": "gate", "args": {"label": "B", "wait": true}},
            {"id": "C", "tool": "gate", "args": {"label": "C"}, "depends_on": ["A", "B"]}
        ]}"#;
        let provider = Arc::new(ScriptedProvider::new(vec![text(plan), text("A and B both ok")]));
        let gate = GateTool::new(2);
        let log = gate.log.clone();
        let mut tools = basic_tools();
        tools.register(Box::new(gate));
        let ports = ports(provider, tools);
        let mut session = session();

        let outcome = strategy().run(&ports, &mut session).await.unwrap();
        assert_eq!(outcome, Outcome::Answer("A and B both ok".into()));

        // A and B met at the barrier, so neither ran alone.
        let log = log.lock().unwrap().clone();
        let pos = |entry: &str| log.iter().position(|e| e == entry).unwrap();
        assert!(pos("start:C") > pos("end:A"));
        assert!(pos("start:C") > pos("end:B"));
        assert_eq!(log.len(), 6);

        let results: Vec<&str> = session
            .trace
            .of_kind(TraceKind::ToolResult)
            .map(|e| e.output.as_str())
            .collect();
        assert_eq!(results, vec!["A ok", "B ok", "C ok"]);
    }

    #[tokio::test]
    async fn failed_step_blocks_dependents_and_plan_settles() {
        let plan = r##"{"steps": [
            {"tool": "broken"},
            {"tool": "echo", "args": {"text": "after #E1"}},
            {"tool": "echo", "args": {"text": "independent"}}
        ]}"##;
        let provider = Arc::new(ScriptedProvider::new(vec![text(plan), text("only #E3 is known")]));
        let ports = ports(provider.clone(), basic_tools());
        let mut session = session();

        let mut parsed = parse_plan(plan).unwrap().unwrap();
        let evidence = execute(&ports, &mut session, &mut parsed).await.unwrap();
        assert_eq!(parsed.get("E1").unwrap().state, StepState::Failed);
        assert_eq!(parsed.get("E2").unwrap().state, StepState::Pending);
        assert_eq!(parsed.get("E3").unwrap().state, StepState::Done);
        assert!(parsed.is_settled());
        assert_eq!(parsed.blocked(), vec!["E2"]);
        assert_eq!(evidence.items().len(), 1);

        // The same plan through the strategy still reaches synthesis.
        let mut session = Session::new("q", "rewoo", ContextConfig::default());
        let outcome = strategy().run(&ports, &mut session).await.unwrap();
        assert_eq!(outcome, Outcome::Answer("only #E3 is known".into()));
        let synthesis = provider.requests().last().unwrap().clone();
        assert!(synthesis.messages[1].content.contains("#E1 [broken] FAILED"));
    }

    #[tokio::test]
    async fn evidence_flows_into_dependent_arguments() {
        let plan = r##"[
            {"tool": "echo", "args": {"text": "Paris"}},
            {"tool": "echo", "args": {"text": "capital is #E1"}}
        ]"##;
        let provider = Arc::new(ScriptedProvider::new(vec![text(plan), text("#E2")]));
        let ports = ports(provider, basic_tools());
        let mut session = session();

        strategy().run(&ports, &mut session).await.unwrap();
        let last = session.trace.of_kind(TraceKind::ToolResult).last().unwrap();
        assert_eq!(last.output, "capital is Paris");
    }

    #[tokio::test]
    async fn direct_answer_when_nothing_to_dispatch() {
        let provider = Arc::new(ScriptedProvider::new(vec![text("2 + 2 = 4")]));
        let ports = ports(provider.clone(), basic_tools());
        let mut session = session();

        let outcome = strategy().run(&ports, &mut session).await.unwrap();
        assert_eq!(outcome, Outcome::Answer("2 + 2 = 4".into()));
        assert_eq!(provider.call_count(), 1);
        assert!(!provider.requests()[0].tools_enabled);
    }

    #[tokio::test]
    async fn invalid_plan_fails() {
        let plan = r#"[{"id": "E1", "tool": "echo", "depends_on": ["E9"]}]"#;
        let provider = Arc::new(ScriptedProvider::new(vec![text(plan)]));
        let ports = ports(provider, basic_tools());
        let mut session = session();

        let outcome = Strategy::Rewoo(strategy()).run(&ports, &mut session).await;
        assert!(matches!(outcome, Outcome::Failed(FailureReason::InvalidPlan { .. })));
        assert!(session.trace.first(TraceKind::Failure).is_some());
    }

    #[tokio::test]
    async fn conflict_policy_shapes_synthesis_input() {
        let plan = r#"[
            {"tool": "echo", "args": {"text": "Paris"}, "key": "capital"},
            {"tool": "echo", "args": {"text": "Lyon"}, "key": "capital"}
        ]"#;
        let provider = Arc::new(ScriptedProvider::new(vec![text(plan), text("unclear")]));
        let ports = ports(provider.clone(), basic_tools());
        let mut session = session();
        let rewoo = RewooStrategy::new(
            RewooConfig {
                conflict_policy: ConflictPolicy::FlagAmbiguous,
            },
            10_000,
        );

        rewoo.run(&ports, &mut session).await.unwrap();
        let synthesis = provider.requests().last().unwrap().clone();
        assert_eq!(synthesis.messages[1].content.matches("AMBIGUOUS").count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_mid_batch_stops_dispatch() {
        let plan = r##"[
            {"tool": "slow"},
            {"tool": "count", "args": {"after": "#E1"}}
        ]"##;
        let provider = Arc::new(ScriptedProvider::new(vec![text(plan), text("never")]));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut tools = basic_tools();
        tools.register(Box::new(SlowTool {
            delay: Duration::from_secs(10),
        }));
        tools.register(Box::new(CountingTool { calls: calls.clone() }));
        let ports = ports(provider.clone(), tools);
        let mut session = session();

        let token = session.cancel_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        let outcome = Strategy::Rewoo(strategy()).run(&ports, &mut session).await;
        assert_eq!(outcome, Outcome::Failed(FailureReason::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(session.trace.of_kind(TraceKind::ToolCall).count(), 1);
        assert_eq!(provider.call_count(), 1);
    }
}
