//! Adaptive strategy: plan, execute one step, check progress, replan.
//!
//! The loop is an explicit state machine over [`Phase`] driven by
//! [`Signal`]s through [`transition`]:
//!
//! | From | Signal | To |
//! |------|--------|----|
//! | Plan | Planned | ExecuteNext |
//! | ExecuteNext | StepExecuted | CheckProgress |
//! | CheckProgress | Verdict(Continue) | ExecuteNext |
//! | CheckProgress | Verdict(Replan) | Plan |
//! | CheckProgress | Verdict(Done) | Done |
//!
//! One `run` call executes at most one step. A failed step, a plan that
//! can no longer progress, or a REPLAN verdict from the progress check
//! counts as a stall; more than `max_replans` stalls fail the session.

use reasonloop_config::PlanExecuteConfig;
use reasonloop_core::error::FailureReason;
use reasonloop_core::message::{Message, ModelReply};
use reasonloop_core::plan::Plan;
use reasonloop_core::provider::CompletionRequest;
use reasonloop_core::trace::TraceKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::Outcome;
use crate::context::RecordKind;
use crate::prompts::{PLANNER_SYSTEM, PROGRESS_SYSTEM, parse_plan_after, substitute, with_context};
use crate::runtime::{Invocation, Ports};
use crate::session::Session;
use crate::synthesis::{Evidence, synthesize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Plan,
    ExecuteNext,
    CheckProgress,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Continue,
    Replan,
    Done,
}

impl Verdict {
    /// Read a verdict from a progress-check reply. The earliest keyword
    /// wins; a reply with none of them means carry on.
    pub fn parse(text: &str) -> Verdict {
        let upper = text.to_uppercase();
        [
            ("CONTINUE", Verdict::Continue),
            ("REPLAN", Verdict::Replan),
            ("DONE", Verdict::Done),
        ]
        .into_iter()
        .filter_map(|(word, verdict)| upper.find(word).map(|pos| (pos, verdict)))
        .min_by_key(|(pos, _)| *pos)
        .map(|(_, verdict)| verdict)
        .unwrap_or(Verdict::Continue)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Planned,
    StepExecuted,
    Verdict(Verdict),
}

/// The transition table. `None` means the signal is not valid in that
/// phase.
pub fn transition(phase: Phase, signal: Signal) -> Option<Phase> {
    match (phase, signal) {
        (Phase::Plan, Signal::Planned) => Some(Phase::ExecuteNext),
        (Phase::ExecuteNext, Signal::StepExecuted) => Some(Phase::CheckProgress),
        (Phase::CheckProgress, Signal::Verdict(Verdict::Continue)) => Some(Phase::ExecuteNext),
        (Phase::CheckProgress, Signal::Verdict(Verdict::Replan)) => Some(Phase::Plan),
        (Phase::CheckProgress, Signal::Verdict(Verdict::Done)) => Some(Phase::Done),
        _ => None,
    }
}

/// A step result kept across replans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedOutput {
    pub id: String,
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub output: String,
    pub failed: bool,
}

/// State of the adaptive loop, kept on the session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdaptiveProgress {
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    pub replans: u32,
    pub steps_executed: u32,
    /// Results of every executed step, in execution order, numbered
    /// `E1..` across plans
    pub outputs: Vec<RecordedOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stall_reason: Option<String>,
}

impl AdaptiveProgress {
    fn advance(&mut self, signal: Signal) -> Result<(), FailureReason> {
        match transition(self.phase, signal) {
            Some(next) => {
                debug!(from = ?self.phase, to = ?next, ?signal, "Adaptive transition");
                self.phase = next;
                Ok(())
            }
            None => Err(FailureReason::InvalidPlan {
                detail: format!("signal {signal:?} is not valid in phase {:?}", self.phase),
            }),
        }
    }

    fn last_failed(&self) -> bool {
        self.outputs.last().is_some_and(|o| o.failed)
    }

    fn evidence(&self) -> Evidence {
        let mut evidence = Evidence::new();
        for o in &self.outputs {
            if o.failed {
                evidence.push_failure(o.id.as_str(), o.tool.as_str(), o.output.as_str());
            } else {
                evidence.push(o.id.as_str(), o.tool.as_str(), o.key.clone(), o.output.as_str());
            }
        }
        evidence
    }
}

enum PlannerReply {
    Steps(Plan),
    Text(String),
}

#[derive(Debug, Clone)]
pub struct AdaptiveStrategy {
    config: PlanExecuteConfig,
    budget: usize,
}

impl AdaptiveStrategy {
    pub fn new(config: PlanExecuteConfig, budget: usize) -> Self {
        Self { config, budget }
    }

    pub fn config(&self) -> &PlanExecuteConfig {
        &self.config
    }

    pub async fn run(&self, ports: &Ports, session: &mut Session) -> Result<Outcome, FailureReason> {
        let mut progress = session.progress.plan_execute.take().unwrap_or_default();
        let result = self.cycle(ports, session, &mut progress).await;
        session.progress.plan_execute = Some(progress);
        result
    }

    async fn cycle(
        &self,
        ports: &Ports,
        session: &mut Session,
        progress: &mut AdaptiveProgress,
    ) -> Result<Outcome, FailureReason> {
        loop {
            match progress.phase {
                Phase::Plan => match self.plan(ports, session, progress).await? {
                    PlannerReply::Steps(plan) => {
                        progress.plan = Some(plan);
                        progress.advance(Signal::Planned)?;
                    }
                    PlannerReply::Text(text) if progress.outputs.is_empty() => {
                        info!(session_id = %session.id(), "Planner answered directly");
                        progress.phase = Phase::Done;
                        return Ok(Outcome::Answer(text));
                    }
                    PlannerReply::Text(_) => {
                        // A replan with nothing left to do: answer from what we have.
                        progress.phase = Phase::Done;
                    }
                },
                Phase::ExecuteNext => {
                    if progress.steps_executed >= self.config.max_steps {
                        return Err(FailureReason::IterationLimitExceeded {
                            limit: self.config.max_steps,
                        });
                    }
                    self.execute_next(ports, session, progress).await?;
                    progress.advance(Signal::StepExecuted)?;
                }
                Phase::CheckProgress => {
                    let verdict = self.check_progress(ports, session, progress).await?;
                    progress.advance(Signal::Verdict(verdict))?;
                    match verdict {
                        Verdict::Continue => {
                            return Ok(Outcome::NeedsMoreSteps {
                                progress: format!("{} steps executed", progress.steps_executed),
                            });
                        }
                        Verdict::Replan => {
                            progress.replans += 1;
                            let reason = progress
                                .stall_reason
                                .clone()
                                .unwrap_or_else(|| "progress check asked for a new plan".into());
                            session.trace.push(
                                format!("plan-execute:replan:{}", progress.replans),
                                TraceKind::Replan,
                                reason.as_str(),
                                format!("{}/{}", progress.replans, self.config.max_replans),
                            );
                            if progress.replans > self.config.max_replans {
                                warn!(session_id = %session.id(), replans = progress.replans, "Replan limit exceeded");
                                return Err(FailureReason::ReplanLimitExceeded {
                                    limit: self.config.max_replans,
                                });
                            }
                            info!(session_id = %session.id(), replans = progress.replans, %reason, "Replanning");
                            return Ok(Outcome::NeedsMoreSteps {
                                progress: format!("replan {} requested: {reason}", progress.replans),
                            });
                        }
                        Verdict::Done => {}
                    }
                }
                Phase::Done => {
                    let evidence = progress.evidence().resolve(self.config.conflict_policy);
                    let answer =
                        synthesize(ports, session, "plan-execute:synthesize", &evidence).await?;
                    return Ok(Outcome::Answer(answer));
                }
            }
        }
    }

    async fn plan(
        &self,
        ports: &Ports,
        session: &mut Session,
        progress: &AdaptiveProgress,
    ) -> Result<PlannerReply, FailureReason> {
        let view = session.context.view(self.budget).await;
        let mut body = format!("Objective: {}", session.objective());
        if !progress.outputs.is_empty() {
            body.push_str("\n\nResults so far:\n");
            body.push_str(&progress.evidence().render());
            body.push_str("\nReference these results by id; new steps are numbered after them.\n");
            if let Some(reason) = &progress.stall_reason {
                body.push_str(&format!("\nThe previous plan stalled: {reason}\nPlan the remaining work."));
            }
        }
        let source = format!("plan-execute:plan:{}", progress.replans);
        let reply = ports
            .ask_model(session, &source, CompletionRequest::text_only(with_context(PLANNER_SYSTEM, &view, body)))
            .await?;
        let text = match reply {
            ModelReply::Text { content } => content,
            ModelReply::ToolCall { name, .. } => {
                return Err(FailureReason::InvalidPlan {
                    detail: format!("planner called tool '{name}' instead of planning"),
                });
            }
        };
        let prior: Vec<&str> = progress.outputs.iter().map(|o| o.id.as_str()).collect();
        match parse_plan_after(&text, &prior)? {
            Some(plan) => {
                session
                    .context
                    .record(RecordKind::Plan, source.as_str(), text.as_str())
                    .await;
                info!(session_id = %session.id(), steps = plan.len(), replans = progress.replans, "Adaptive plan ready");
                Ok(PlannerReply::Steps(plan))
            }
            None => Ok(PlannerReply::Text(text)),
        }
    }

    async fn execute_next(
        &self,
        ports: &Ports,
        session: &mut Session,
        progress: &mut AdaptiveProgress,
    ) -> Result<(), FailureReason> {
        let Some(plan) = progress.plan.as_mut() else {
            return Ok(());
        };
        let Some(step) = plan.next_ready().cloned() else {
            return Ok(());
        };
        // Earlier plans' results resolve by their recorded ids.
        let mut known: HashMap<&str, &str> = progress
            .outputs
            .iter()
            .filter(|o| !o.failed)
            .map(|o| (o.id.as_str(), o.output.as_str()))
            .collect();
        known.extend(plan.outputs());
        let args = substitute(&step.args, &known);
        plan.start(&step.id)?;

        let evidence_id = step.id.clone();
        let mut observations = ports
            .dispatch(session, vec![Invocation::new(evidence_id.as_str(), step.tool.as_str(), args)])
            .await?;
        let Some(observation) = observations.pop() else {
            return Ok(());
        };

        let text = observation.text();
        match &observation.result {
            Ok(output) => plan.complete(&step.id, output.content.as_str())?,
            Err(e) => plan.fail(&step.id, e.to_string())?,
        }
        session
            .context
            .record(RecordKind::Observation, evidence_id.as_str(), text.as_str())
            .await;
        progress.steps_executed += 1;
        progress.outputs.push(RecordedOutput {
            id: evidence_id,
            tool: step.tool.clone(),
            key: step.key.clone(),
            output: text,
            failed: !observation.is_success(),
        });
        Ok(())
    }

    async fn check_progress(
        &self,
        ports: &Ports,
        session: &mut Session,
        progress: &mut AdaptiveProgress,
    ) -> Result<Verdict, FailureReason> {
        progress.stall_reason = None;
        if progress.last_failed() {
            progress.stall_reason = progress
                .outputs
                .last()
                .map(|o| format!("step {} failed: {}", o.id, o.output));
            return Ok(Verdict::Replan);
        }
        let Some(plan) = progress.plan.as_ref() else {
            return Ok(Verdict::Done);
        };

        let remaining: Vec<String> = plan
            .steps()
            .iter()
            .filter(|s| s.output.is_none() && s.error.is_none())
            .map(|s| format!("- {}: {}", s.tool, s.description.as_deref().unwrap_or("")))
            .collect();
        let exhausted = plan.next_ready().is_none();
        let resolved = plan.is_resolved();
        let blocked = plan.blocked();
        let latest = progress
            .outputs
            .last()
            .map(|o| o.output.clone())
            .unwrap_or_else(|| "(none)".into());
        let messages = vec![
            Message::system(PROGRESS_SYSTEM),
            Message::user(format!(
                "Objective: {}\n\nRemaining steps:\n{}\n\nLatest observation: {}",
                session.objective(),
                if remaining.is_empty() { "(none)".to_string() } else { remaining.join("\n") },
                latest
            )),
        ];
        let source = format!("plan-execute:check:{}", progress.steps_executed);
        let reply = ports
            .ask_model(session, &source, CompletionRequest::text_only(messages))
            .await?;
        let mut verdict = match &reply {
            ModelReply::Text { content } => Verdict::parse(content),
            ModelReply::ToolCall { .. } => Verdict::Continue,
        };

        // A plan with nothing left to run cannot continue.
        if verdict == Verdict::Continue && exhausted {
            verdict = if resolved {
                Verdict::Done
            } else {
                progress.stall_reason = Some(format!("steps blocked: {}", blocked.join(", ")));
                Verdict::Replan
            };
        }
        if verdict == Verdict::Replan && progress.stall_reason.is_none() {
            progress.stall_reason = Some(format!("progress check replied: {}", reply.describe()));
        }
        debug!(session_id = %session.id(), ?verdict, "Progress check");
        Ok(verdict)
    }
}
