//! Plans: DAG-structured decompositions of an objective into tool calls.
//!
//! A [`Plan`] is an ordered list of [`Step`]s. A step becomes `Ready`
//! exactly when every step it depends on is `Done`; a failed step leaves
//! its dependents `Pending` for good. Transitions go through the plan so
//! the readiness invariant cannot be bypassed.
//!
//! ```text
//! Pending ──(all deps Done)──▶ Ready ──▶ Running ──▶ Done
//!                                │          │
//!                                └──────────┴──────▶ Failed
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::error::PlanError;

/// Lifecycle state of a plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Ready,
    Running,
    Done,
    Failed,
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            StepState::Pending => "pending",
            StepState::Ready => "ready",
            StepState::Running => "running",
            StepState::Done => "done",
            StepState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// A single tool invocation inside a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Step id (e.g. "E1")
    pub id: String,

    /// Tool to invoke
    pub tool: String,

    /// Tool arguments
    #[serde(default)]
    pub args: serde_json::Value,

    /// Ids of steps that must be `Done` before this one may run
    #[serde(default)]
    pub depends_on: BTreeSet<String>,

    /// What the planner meant this step to achieve
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Optional fact key; two outputs with the same key may conflict
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    #[serde(default = "default_state")]
    pub state: StepState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn default_state() -> StepState {
    StepState::Pending
}

impl Step {
    pub fn new(id: impl Into<String>, tool: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            tool: tool.into(),
            args,
            depends_on: BTreeSet::new(),
            description: None,
            key: None,
            state: StepState::Pending,
            output: None,
            error: None,
        }
    }

    /// Add dependencies on other steps.
    pub fn after<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// An ordered, validated DAG of steps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    steps: Vec<Step>,
}

impl Plan {
    /// Build a plan, rejecting duplicate ids, dangling dependencies and
    /// cycles. Step states are reset so readiness is recomputed from
    /// scratch.
    pub fn new(mut steps: Vec<Step>) -> Result<Self, PlanError> {
        let mut seen = BTreeSet::new();
        for step in &steps {
            if !seen.insert(step.id.clone()) {
                return Err(PlanError::DuplicateStep(step.id.clone()));
            }
        }
        for step in &steps {
            if let Some(dep) = step.depends_on.iter().find(|d| !seen.contains(*d)) {
                return Err(PlanError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
        detect_cycle(&steps)?;

        for step in &mut steps {
            step.state = StepState::Pending;
            step.output = None;
            step.error = None;
        }
        let mut plan = Self { steps };
        plan.refresh_readiness();
        Ok(plan)
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Ids of every `Ready` step, in plan order.
    pub fn ready(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| s.state == StepState::Ready)
            .map(|s| s.id.clone())
            .collect()
    }

    /// The first `Ready` step in plan order.
    pub fn next_ready(&self) -> Option<&Step> {
        self.steps.iter().find(|s| s.state == StepState::Ready)
    }

    /// Move a ready step to `Running`.
    pub fn start(&mut self, id: &str) -> Result<(), PlanError> {
        self.transition(id, &[StepState::Ready], StepState::Running)
    }

    /// Record a step's output and unblock its dependents.
    pub fn complete(&mut self, id: &str, output: impl Into<String>) -> Result<(), PlanError> {
        self.transition(id, &[StepState::Running], StepState::Done)?;
        if let Some(step) = self.step_mut(id) {
            step.output = Some(output.into());
        }
        self.refresh_readiness();
        Ok(())
    }

    /// Mark a step failed. Its dependents never become ready.
    pub fn fail(&mut self, id: &str, error: impl Into<String>) -> Result<(), PlanError> {
        self.transition(id, &[StepState::Ready, StepState::Running], StepState::Failed)?;
        if let Some(step) = self.step_mut(id) {
            step.error = Some(error.into());
        }
        Ok(())
    }

    /// Every step is `Done` or `Failed`.
    pub fn is_resolved(&self) -> bool {
        self.steps
            .iter()
            .all(|s| matches!(s.state, StepState::Done | StepState::Failed))
    }

    /// Nothing is ready or running, so execution can make no further
    /// progress. Steps still pending at this point are blocked behind a
    /// failure.
    pub fn is_settled(&self) -> bool {
        !self
            .steps
            .iter()
            .any(|s| matches!(s.state, StepState::Ready | StepState::Running))
    }

    /// Pending steps that can never run because an ancestor failed.
    pub fn blocked(&self) -> Vec<String> {
        let failed: BTreeSet<&str> = self
            .steps
            .iter()
            .filter(|s| s.state == StepState::Failed)
            .map(|s| s.id.as_str())
            .collect();
        let mut blocked: BTreeSet<String> = BTreeSet::new();
        // Plans are small; iterate to a fixed point instead of building a reverse index.
        loop {
            let before = blocked.len();
            for step in &self.steps {
                if step.state == StepState::Pending
                    && step
                        .depends_on
                        .iter()
                        .any(|d| failed.contains(d.as_str()) || blocked.contains(d))
                {
                    blocked.insert(step.id.clone());
                }
            }
            if blocked.len() == before {
                break;
            }
        }
        self.steps
            .iter()
            .filter(|s| blocked.contains(&s.id))
            .map(|s| s.id.clone())
            .collect()
    }

    /// Outputs of completed steps keyed by id.
    pub fn outputs(&self) -> HashMap<&str, &str> {
        self.steps
            .iter()
            .filter_map(|s| s.output.as_deref().map(|o| (s.id.as_str(), o)))
            .collect()
    }

    /// Counts of steps per state, for logging.
    pub fn progress(&self) -> (usize, usize, usize) {
        let done = self.count(StepState::Done);
        let failed = self.count(StepState::Failed);
        (done, failed, self.steps.len())
    }

    fn count(&self, state: StepState) -> usize {
        self.steps.iter().filter(|s| s.state == state).count()
    }

    fn step_mut(&mut self, id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    fn transition(&mut self, id: &str, from: &[StepState], to: StepState) -> Result<(), PlanError> {
        let step = self
            .step_mut(id)
            .ok_or_else(|| PlanError::UnknownStep(id.to_string()))?;
        if !from.contains(&step.state) {
            return Err(PlanError::InvalidTransition {
                step: id.to_string(),
                from: step.state.to_string(),
                to: to.to_string(),
            });
        }
        step.state = to;
        Ok(())
    }

    fn refresh_readiness(&mut self) {
        let done: BTreeSet<String> = self
            .steps
            .iter()
            .filter(|s| s.state == StepState::Done)
            .map(|s| s.id.clone())
            .collect();
        for step in &mut self.steps {
            if step.state == StepState::Pending && step.depends_on.iter().all(|d| done.contains(d)) {
                step.state = StepState::Ready;
            }
        }
    }
}

/// Kahn's algorithm; any step left unvisited sits on a cycle.
fn detect_cycle(steps: &[Step]) -> Result<(), PlanError> {
    let mut indegree: HashMap<&str, usize> = steps
        .iter()
        .map(|s| (s.id.as_str(), s.depends_on.len()))
        .collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in steps {
        for dep in &step.depends_on {
            dependents.entry(dep.as_str()).or_default().push(step.id.as_str());
        }
    }

    let mut queue: VecDeque<&str> = steps
        .iter()
        .filter(|s| s.depends_on.is_empty())
        .map(|s| s.id.as_str())
        .collect();
    let mut visited = 0usize;
    while let Some(id) = queue.pop_front() {
        visited += 1;
        for &next in dependents.get(id).into_iter().flatten() {
            if let Some(deg) = indegree.get_mut(next) {
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(next);
                }
            }
        }
    }

    if visited == steps.len() {
        return Ok(());
    }
    let stuck = steps
        .iter()
        .find(|s| indegree.get(s.id.as_str()).is_some_and(|d| *d > 0))
        .map(|s| s.id.clone())
        .unwrap_or_default();
    Err(PlanError::Cycle(stuck))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn diamond() -> Plan {
        Plan::new(vec![
            Step::new("A", "search", json!({"q": "a"})),
            Step::new("B", "search", json!({"q": "b"})),
            Step::new("C", "merge", json!({})).after(["A", "B"]),
        ])
        .unwrap()
    }

    #[test]
    fn independent_steps_start_ready() {
        let plan = diamond();
        assert_eq!(plan.ready(), vec!["A", "B"]);
        assert_eq!(plan.get("C").unwrap().state, StepState::Pending);
    }

    #[test]
    fn dependent_waits_for_all_dependencies() {
        let mut plan = diamond();
        plan.start("A").unwrap();
        plan.start("B").unwrap();
        plan.complete("A", "a-out").unwrap();
        assert_eq!(plan.get("C").unwrap().state, StepState::Pending);
        plan.complete("B", "b-out").unwrap();
        assert_eq!(plan.ready(), vec!["C"]);
    }

    #[test]
    fn failure_blocks_dependents_and_settles() {
        let mut plan = diamond();
        plan.start("A").unwrap();
        plan.start("B").unwrap();
        plan.fail("A", "boom").unwrap();
        plan.complete("B", "b-out").unwrap();

        assert_eq!(plan.get("C").unwrap().state, StepState::Pending);
        assert!(plan.ready().is_empty());
        assert!(plan.is_settled());
        assert!(!plan.is_resolved());
        assert_eq!(plan.blocked(), vec!["C"]);
    }

    #[test]
    fn blocked_is_transitive() {
        let mut plan = Plan::new(vec![
            Step::new("E1", "t", json!({})),
            Step::new("E2", "t", json!({})).after(["E1"]),
            Step::new("E3", "t", json!({})).after(["E2"]),
        ])
        .unwrap();
        plan.start("E1").unwrap();
        plan.fail("E1", "x").unwrap();
        assert_eq!(plan.blocked(), vec!["E2", "E3"]);
    }

    #[test]
    fn rejects_duplicate_ids() {
        let err = Plan::new(vec![
            Step::new("E1", "t", json!({})),
            Step::new("E1", "t", json!({})),
        ])
        .unwrap_err();
        assert_eq!(err, PlanError::DuplicateStep("E1".into()));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let err = Plan::new(vec![Step::new("E1", "t", json!({})).after(["E9"])]).unwrap_err();
        assert!(matches!(err, PlanError::UnknownDependency { ref dependency, .. } if dependency == "E9"));
    }

    #[test]
    fn rejects_cycles() {
        let err = Plan::new(vec![
            Step::new("E1", "t", json!({})).after(["E2"]),
            Step::new("E2", "t", json!({})).after(["E1"]),
        ])
        .unwrap_err();
        assert!(matches!(err, PlanError::Cycle(_)));
    }

    #[test]
    fn cannot_complete_without_starting() {
        let mut plan = diamond();
        let err = plan.complete("A", "early").unwrap_err();
        assert!(matches!(err, PlanError::InvalidTransition { .. }));
        assert!(matches!(plan.start("C"), Err(PlanError::InvalidTransition { .. })));
    }

    #[test]
    fn fully_resolved_when_all_done() {
        let mut plan = diamond();
        for id in ["A", "B"] {
            plan.start(id).unwrap();
            plan.complete(id, "ok").unwrap();
        }
        plan.start("C").unwrap();
        plan.complete("C", "merged").unwrap();
        assert!(plan.is_resolved());
        assert_eq!(plan.outputs().get("C"), Some(&"merged"));
        assert_eq!(plan.progress(), (3, 0, 3));
    }
}
