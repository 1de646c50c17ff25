//! Tree-search strategy (LATS).
//!
//! Each round of the search:
//! 1. **Selection**: descend the tree by UCB to an expandable leaf.
//! 2. **Expansion**: a tools-disabled model call proposes up to
//!    `num_candidates` next actions, added as children.
//! 3. **Simulation**: the children's tool actions run concurrently as one
//!    batch; answers need no tool.
//! 4. **Reflection**: one tools-disabled call per child scores it.
//!    `reward = w * score + (1 - w) * success`, where success is 0 for a
//!    failed tool call, 1 when the reflection judges the task solved and
//!    0.5 otherwise.
//! 5. **Backpropagation**: the best child's reward flows up the ancestors.
//!
//! Only one level runs at a time: selection for the next round depends on
//! the rewards this round backpropagates.

use reasonloop_config::LatsConfig;
use reasonloop_core::error::FailureReason;
use reasonloop_core::message::{Message, ModelReply};
use reasonloop_core::provider::CompletionRequest;
use reasonloop_core::trace::TraceKind;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::Outcome;
use super::search_tree::{Candidate, SearchTree};
use crate::context::RecordKind;
use crate::prompts::{EXPANSION_SYSTEM, REFLECTION_SYSTEM, extract_json, with_context};
use crate::runtime::{Invocation, Ports};
use crate::session::Session;
use crate::synthesis::{Evidence, synthesize};

#[derive(Debug, Clone)]
pub struct LatsStrategy {
    config: LatsConfig,
    budget: usize,
}

/// A parsed reflection reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Reflection {
    pub score: f64,
    pub solved: bool,
    pub critique: String,
}

impl Reflection {
    /// Parse `{"score", "solved", "critique"}`. Whole scores up to 10 are
    /// read as a 0-10 scale; other values clamp to `[0, 1]` and anything
    /// unreadable scores zero.
    pub fn parse(text: &str) -> Reflection {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(default)]
            score: f64,
            #[serde(default)]
            solved: bool,
            #[serde(default)]
            critique: String,
        }
        match extract_json(text).and_then(|v| serde_json::from_value::<Raw>(v).ok()) {
            Some(raw) => {
                let ten_point = raw.score > 1.0 && raw.score <= 10.0 && raw.score.fract() == 0.0;
                let score = if ten_point { raw.score / 10.0 } else { raw.score };
                Reflection {
                    score: score.clamp(0.0, 1.0),
                    solved: raw.solved,
                    critique: raw.critique,
                }
            }
            None => Reflection {
                score: 0.0,
                solved: false,
                critique: format!("unreadable reflection: {text}"),
            },
        }
    }
}

impl LatsStrategy {
    pub fn new(config: LatsConfig, budget: usize) -> Self {
        Self { config, budget }
    }

    pub fn config(&self) -> &LatsConfig {
        &self.config
    }

    pub async fn run(&self, ports: &Ports, session: &mut Session) -> Result<Outcome, FailureReason> {
        let tree = self.search(ports, session).await?;
        self.conclude(ports, session, &tree).await
    }

    /// Run the search loop and return the finished tree.
    pub(crate) async fn search(
        &self,
        ports: &Ports,
        session: &mut Session,
    ) -> Result<SearchTree, FailureReason> {
        let mut tree = SearchTree::new(self.config.exploration_weight);
        let mut expansions = 0usize;

        while expansions < self.config.max_expansions {
            if session.is_cancelled() {
                return Err(FailureReason::Cancelled);
            }
            let Some(leaf) = tree.select(self.config.max_depth) else {
                debug!(session_id = %session.id(), "Search tree exhausted");
                break;
            };
            expansions += 1;

            let candidates = self.expand(ports, session, &tree, leaf).await?;
            if candidates.is_empty() {
                if let Some(node) = tree.get_mut(leaf) {
                    node.terminal = true;
                }
                continue;
            }
            let children: Vec<usize> = candidates
                .into_iter()
                .map(|c| tree.add_child(leaf, c))
                .collect();

            self.simulate(ports, session, &mut tree, &children).await?;
            for &child in &children {
                self.reflect(ports, session, &mut tree, child).await?;
            }
            tree.backpropagate(leaf, &children);

            let best = children
                .iter()
                .filter_map(|&c| tree.get(c))
                .max_by(|a, b| a.reward.total_cmp(&b.reward));
            if let Some(best) = best {
                debug!(
                    session_id = %session.id(),
                    expansion = expansions,
                    node = leaf,
                    best = best.id,
                    reward = best.reward,
                    "Expansion scored"
                );
                if best.reward > self.config.success_threshold {
                    info!(session_id = %session.id(), node = best.id, reward = best.reward, "Search reached success threshold");
                    break;
                }
            }
        }

        info!(session_id = %session.id(), nodes = tree.len(), expansions, "Tree search finished");
        Ok(tree)
    }

    /// Turn the finished tree into an answer: the best node's own answer
    /// if it is one, otherwise a grounded synthesis of its path.
    async fn conclude(
        &self,
        ports: &Ports,
        session: &mut Session,
        tree: &SearchTree,
    ) -> Result<Outcome, FailureReason> {
        let best = tree.best_leaf();
        if let Some(Candidate::Answer { text }) = best.and_then(|b| tree.get(b)).and_then(|n| n.action.as_ref()) {
            return Ok(Outcome::Answer(text.clone()));
        }

        let mut evidence = Evidence::new();
        if let Some(best) = best {
            for (k, id) in tree.path(best).into_iter().skip(1).enumerate() {
                let Some(node) = tree.get(id) else { continue };
                let (Some(Candidate::Tool { name, .. }), Some(observation)) = (&node.action, &node.observation) else {
                    continue;
                };
                let eid = format!("E{}", k + 1);
                if node.failed {
                    evidence.push_failure(eid, name.as_str(), observation.as_str());
                } else {
                    evidence.push(eid, name.as_str(), None, observation.as_str());
                }
            }
        }
        let answer = synthesize(ports, session, "lats:synthesize", &evidence).await?;
        Ok(Outcome::Answer(answer))
    }

    /// Actions and observations from the root to `id`, for prompts.
    fn history(tree: &SearchTree, id: usize) -> String {
        let mut out = String::new();
        for step in tree.path(id).into_iter().skip(1) {
            let Some(node) = tree.get(step) else { continue };
            if let Some(action) = &node.action {
                out.push_str(&format!("Action: {}\n", action.describe()));
            }
            if let Some(observation) = &node.observation {
                out.push_str(&format!("Observation: {observation}\n"));
            }
        }
        if out.is_empty() {
            out.push_str("(no actions yet)\n");
        }
        out
    }

    async fn expand(
        &self,
        ports: &Ports,
        session: &mut Session,
        tree: &SearchTree,
        leaf: usize,
    ) -> Result<Vec<Candidate>, FailureReason> {
        let view = session.context.view(self.budget).await;
        let tools: Vec<String> = ports
            .tool_definitions()
            .into_iter()
            .map(|d| format!("- {}: {}", d.name, d.description))
            .collect();
        let body = format!(
            "Objective: {}\n\nAvailable tools:\n{}\n\nPath so far:\n{}\nPropose up to {} candidates.",
            session.objective(),
            tools.join("\n"),
            Self::history(tree, leaf),
            self.config.num_candidates
        );
        let source = format!("node:{leaf}");
        let reply = ports
            .ask_model(session, &source, CompletionRequest::text_only(with_context(EXPANSION_SYSTEM, &view, body)))
            .await?;
        let ModelReply::Text { content } = reply else {
            warn!(session_id = %session.id(), node = leaf, "Expansion replied with a tool call");
            return Ok(Vec::new());
        };

        let items = match extract_json(&content) {
            Some(serde_json::Value::Array(items)) => items,
            Some(serde_json::Value::Object(mut map)) => match map.remove("candidates") {
                Some(serde_json::Value::Array(items)) => items,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };
        let mut candidates: Vec<Candidate> = Vec::new();
        for item in items {
            match serde_json::from_value::<Candidate>(item) {
                Ok(c) if !candidates.contains(&c) => candidates.push(c),
                Ok(_) => {}
                Err(e) => debug!(node = leaf, "Skipping malformed candidate: {e}"),
            }
            if candidates.len() == self.config.num_candidates {
                break;
            }
        }
        Ok(candidates)
    }

    async fn simulate(
        &self,
        ports: &Ports,
        session: &mut Session,
        tree: &mut SearchTree,
        children: &[usize],
    ) -> Result<(), FailureReason> {
        let mut batch = Vec::new();
        let mut owners = Vec::new();
        for &child in children {
            if let Some(Candidate::Tool { name, args }) = tree.get(child).and_then(|n| n.action.as_ref()) {
                batch.push(Invocation::new(format!("node:{child}"), name.as_str(), args.clone()));
                owners.push(child);
            }
        }

        let observations = ports.dispatch(session, batch).await?;
        for (child, observation) in owners.into_iter().zip(observations) {
            let text = observation.text();
            session
                .context
                .record(RecordKind::Observation, observation.source.as_str(), text.as_str())
                .await;
            if let Some(node) = tree.get_mut(child) {
                node.failed = !observation.is_success();
                node.observation = Some(text);
            }
        }
        Ok(())
    }

    async fn reflect(
        &self,
        ports: &Ports,
        session: &mut Session,
        tree: &mut SearchTree,
        child: usize,
    ) -> Result<(), FailureReason> {
        let source = format!("node:{child}");
        let messages = vec![
            Message::system(REFLECTION_SYSTEM),
            Message::user(format!(
                "Objective: {}\n\nAttempt:\n{}",
                session.objective(),
                Self::history(tree, child)
            )),
        ];
        let reply = ports
            .ask_model(session, &source, CompletionRequest::text_only(messages))
            .await?;
        let reflection = match &reply {
            ModelReply::Text { content } => Reflection::parse(content),
            ModelReply::ToolCall { name, .. } => Reflection {
                score: 0.0,
                solved: false,
                critique: format!("reflection attempted to call tool '{name}'"),
            },
        };

        let w = self.config.reflection_weight;
        let max_depth = self.config.max_depth;
        let Some(node) = tree.get_mut(child) else {
            return Ok(());
        };
        let success = if node.failed {
            0.0
        } else if reflection.solved {
            1.0
        } else {
            0.5
        };
        node.reward = w * reflection.score + (1.0 - w) * success;
        node.solved = reflection.solved && !node.failed;
        node.terminal = node.solved
            || matches!(node.action, Some(Candidate::Answer { .. }))
            || node.depth >= max_depth;
        let summary = format!(
            "score {:.2}, reward {:.2}: {}",
            reflection.score, node.reward, reflection.critique
        );

        session
            .trace
            .push(source.as_str(), TraceKind::Reflection, reply.describe(), summary.as_str());
        session
            .context
            .record(RecordKind::Reflection, source, summary)
            .await;
        Ok(())
    }
}
