//! Grounded synthesis.
//!
//! The final answer of the plan-based strategies is produced from
//! recorded tool outputs alone: the synthesis request carries no tools,
//! no planner transcript and no context view, only the objective and the
//! evidence. Replies that still reach outside that evidence (a tool call,
//! or a citation of a step with no recorded output) are rejected as
//! grounding violations.

use reasonloop_config::ConflictPolicy;
use reasonloop_core::error::FailureReason;
use reasonloop_core::message::{Message, ModelReply};
use reasonloop_core::provider::CompletionRequest;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use crate::prompts::{SYNTHESIS_SYSTEM, evidence_refs};
use crate::runtime::Ports;
use crate::session::Session;

/// One successful tool output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceItem {
    pub id: String,
    pub tool: String,
    pub key: Option<String>,
    pub output: String,
}

/// Tool outputs in completion order, plus the steps that failed.
#[derive(Debug, Clone, Default)]
pub struct Evidence {
    items: Vec<EvidenceItem>,
    failures: Vec<(String, String, String)>,
    ambiguous: BTreeSet<String>,
}

impl Evidence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful output. Call in completion order.
    pub fn push(&mut self, id: impl Into<String>, tool: impl Into<String>, key: Option<String>, output: impl Into<String>) {
        self.items.push(EvidenceItem {
            id: id.into(),
            tool: tool.into(),
            key,
            output: output.into(),
        });
    }

    pub fn push_failure(&mut self, id: impl Into<String>, tool: impl Into<String>, error: impl Into<String>) {
        self.failures.push((id.into(), tool.into(), error.into()));
    }

    pub fn items(&self) -> &[EvidenceItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.failures.is_empty()
    }

    pub fn is_ambiguous(&self, id: &str) -> bool {
        self.ambiguous.contains(id)
    }

    /// Apply `policy` to outputs that share a key but disagree.
    pub fn resolve(mut self, policy: ConflictPolicy) -> Self {
        let mut by_key: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (i, item) in self.items.iter().enumerate() {
            if let Some(key) = item.key.as_deref() {
                by_key.entry(key).or_default().push(i);
            }
        }

        let mut dropped = BTreeSet::new();
        let mut ambiguous = BTreeSet::new();
        for (key, positions) in by_key {
            let distinct: BTreeSet<&str> = positions.iter().map(|&i| self.items[i].output.as_str()).collect();
            if distinct.len() < 2 {
                continue;
            }
            debug!(key, candidates = positions.len(), ?policy, "Conflicting evidence");
            match policy {
                ConflictPolicy::MostRecent => {
                    let keep = positions[positions.len() - 1];
                    dropped.extend(positions.into_iter().filter(|&i| i != keep));
                }
                ConflictPolicy::MostSpecific => {
                    // Ties go to the later output.
                    let keep = positions
                        .iter()
                        .copied()
                        .max_by_key(|&i| (self.items[i].output.len(), i))
                        .unwrap_or(positions[0]);
                    dropped.extend(positions.into_iter().filter(|&i| i != keep));
                }
                ConflictPolicy::FlagAmbiguous => {
                    ambiguous.extend(positions.iter().map(|&i| self.items[i].id.clone()));
                }
            }
        }

        self.items = self
            .items
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !dropped.contains(i))
            .map(|(_, item)| item)
            .collect();
        self.ambiguous = ambiguous;
        self
    }

    pub fn render(&self) -> String {
        if self.is_empty() {
            return "(no tool produced output)\n".into();
        }
        let mut out = String::new();
        for item in &self.items {
            out.push_str(&format!("#{} [{}]", item.id, item.tool));
            if let Some(key) = &item.key {
                out.push_str(&format!(" key={key}"));
            }
            if self.ambiguous.contains(&item.id) {
                out.push_str(" AMBIGUOUS");
            }
            out.push_str(&format!(": {}\n", item.output));
        }
        for (id, tool, error) in &self.failures {
            out.push_str(&format!("#{id} [{tool}] FAILED: {error}\n"));
        }
        out
    }

    /// Citations in `answer` that point at no recorded output.
    pub fn ungrounded_citations(&self, answer: &str) -> Vec<String> {
        evidence_refs(answer)
            .into_iter()
            .filter(|id| !self.items.iter().any(|item| &item.id == id))
            .collect()
    }
}

/// Ask the model for a final answer built from `evidence` only.
pub async fn synthesize(
    ports: &Ports,
    session: &mut Session,
    source: &str,
    evidence: &Evidence,
) -> Result<String, FailureReason> {
    let messages = vec![
        Message::system(SYNTHESIS_SYSTEM),
        Message::user(format!(
            "Objective: {}\n\nEvidence:\n{}",
            session.objective(),
            evidence.render()
        )),
    ];
    let reply = ports
        .ask_model(session, source, CompletionRequest::text_only(messages))
        .await?;

    match reply {
        ModelReply::Text { content } => {
            let ungrounded = evidence.ungrounded_citations(&content);
            if !ungrounded.is_empty() {
                warn!(session_id = %session.id(), ?ungrounded, "Synthesis cited missing evidence");
                return Err(FailureReason::SynthesisGroundingViolation {
                    detail: format!("cites {} with no recorded output", ungrounded.join(", ")),
                });
            }
            Ok(content)
        }
        ModelReply::ToolCall { name, .. } => Err(FailureReason::SynthesisGroundingViolation {
            detail: format!("synthesis attempted to call tool '{name}'"),
        }),
    }
}
