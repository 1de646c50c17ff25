//! Prompt text and the parsers for what models send back.
//!
//! Planner, verdict, candidate and reflection replies are all free text
//! that should contain JSON. Models like to wrap JSON in prose or code
//! fences, so extraction looks for the first balanced object or array.

use reasonloop_core::error::FailureReason;
use reasonloop_core::message::Message;
use reasonloop_core::plan::{Plan, Step};
use serde::Deserialize;
use std::collections::HashMap;

use crate::context::ContextView;

pub const REACT_SYSTEM: &str = "You are a careful problem solver. Think step by step. \
When you need information, call exactly one of the available tools. \
When you can answer the objective, reply with the final answer as plain text.";

pub const PLANNER_SYSTEM: &str = "You plan tool calls for an objective. Reply with JSON of the form \
{\"steps\": [{\"id\": \"E1\", \"tool\": \"<tool>\", \"args\": {...}, \"depends_on\": [], \
\"description\": \"<why>\", \"key\": \"<optional fact name>\"}]}. \
A string argument may reference an earlier step's output as #E<k>. \
If no tool is needed, reply with the answer as plain text instead.";

pub const PROGRESS_SYSTEM: &str = "You monitor the execution of a plan. Given the objective, the plan \
and the latest observation, reply with exactly one word: CONTINUE if the plan is on track, \
REPLAN if progress has stalled or the observation contradicts the plan, \
DONE if the objective can now be answered.";

pub const SYNTHESIS_SYSTEM: &str = "Answer the objective using only the evidence listed below. \
Do not rely on outside knowledge and do not call tools. Cite evidence as #E<k>. \
Where evidence is marked ambiguous, say so instead of choosing.";

pub const EXPANSION_SYSTEM: &str = "You propose candidate next actions for a search over solutions. \
Reply with a JSON array. Each element is either \
{\"type\": \"tool\", \"name\": \"<tool>\", \"args\": {...}} or \
{\"type\": \"answer\", \"text\": \"<final answer>\"}. Propose distinct alternatives.";

pub const REFLECTION_SYSTEM: &str = "You critique one attempted step toward an objective. Reply with JSON \
{\"score\": <0.0-1.0>, \"solved\": <true|false>, \"critique\": \"<one sentence>\"}.";

pub const SELECTOR_SYSTEM: &str = "You choose a reasoning pattern for a task.\n\
- react: open-ended or exploratory tasks where each step depends on the last\n\
- rewoo: research and data gathering with independent lookups that can run in parallel\n\
- plan-execute: complex multi-step projects that need planning and course correction\n\
- lats: very hard open-ended problems worth a slower search over alternatives\n\
Detect these characteristics: open_ended, parallel_tasks, needs_planning, exploratory, very_complex.\n\
Reply with ONLY a JSON object: {\"pattern_name\": \"<name>\", \"confidence\": <0.0-1.0>, \
\"reasoning\": \"<why>\", \"characteristics\": {\"open_ended\": true, ...}}.";

/// System prompt plus one user turn holding the rendered context and the
/// objective.
pub fn with_context(system: &str, view: &ContextView, body: String) -> Vec<Message> {
    let rendered = view.render();
    let user = if rendered.is_empty() {
        body
    } else {
        format!("{rendered}\n{body}")
    };
    vec![Message::system(system), Message::user(user)]
}

/// Find the first JSON object or array in `text`.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    let bytes = trimmed.as_bytes();
    let mut start = 0;
    while let Some(offset) = trimmed[start..].find(['{', '[']) {
        let open = start + offset;
        if let Some(end) = balanced_end(bytes, open)
            && let Ok(value) = serde_json::from_str(&trimmed[open..=end])
        {
            return Some(value);
        }
        start = open + 1;
    }
    None
}

/// Index of the bracket closing the one at `open`, skipping string
/// literals.
fn balanced_end(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Debug, Deserialize)]
struct PlannedStep {
    #[serde(default)]
    id: Option<String>,
    tool: String,
    #[serde(default)]
    args: serde_json::Value,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    key: Option<String>,
}

/// Parse a planner reply.
///
/// `Ok(None)` means the reply holds no dispatchable step, so the planner
/// text itself is the answer. Steps without an id are numbered `E1..En`
/// by position; `#E<k>` references in arguments become dependencies.
pub fn parse_plan(text: &str) -> Result<Option<Plan>, FailureReason> {
    parse_plan_after(text, &[])
}

/// Parse a replan that follows already recorded evidence.
///
/// Unnamed steps are numbered after the highest `E<k>` in `prior`, and
/// references to `prior` ids are left for substitution rather than
/// becoming dependencies.
pub fn parse_plan_after(text: &str, prior: &[&str]) -> Result<Option<Plan>, FailureReason> {
    let offset = prior
        .iter()
        .filter_map(|id| id.strip_prefix('E')?.parse::<usize>().ok())
        .max()
        .unwrap_or(0)
        .max(prior.len());
    let Some(value) = extract_json(text) else {
        return Ok(None);
    };
    let raw = match value {
        serde_json::Value::Object(mut map) => match map.remove("steps") {
            Some(steps) => steps,
            None => return Ok(None),
        },
        array @ serde_json::Value::Array(_) => array,
        _ => return Ok(None),
    };
    let planned: Vec<PlannedStep> =
        serde_json::from_value(raw).map_err(|e| FailureReason::InvalidPlan {
            detail: format!("malformed step list: {e}"),
        })?;
    if planned.is_empty() {
        return Ok(None);
    }

    let steps = planned
        .into_iter()
        .enumerate()
        .map(|(i, p)| {
            let id = p.id.unwrap_or_else(|| format!("E{}", offset + i + 1));
            let mut refs = Vec::new();
            collect_refs(&p.args, &mut refs);
            refs.retain(|r| *r != id && !prior.contains(&r.as_str()));
            let mut deps = p.depends_on;
            deps.retain(|d| !prior.contains(&d.as_str()));
            let mut step = Step::new(id, p.tool, p.args).after(deps).after(refs);
            if let Some(d) = p.description {
                step = step.with_description(d);
            }
            if let Some(k) = p.key {
                step = step.with_key(k);
            }
            step
        })
        .collect();
    Ok(Some(Plan::new(steps)?))
}

/// Every `#E<k>` reference in `text`, as step ids (`E<k>`).
pub fn evidence_refs(text: &str) -> Vec<String> {
    let mut refs = Vec::new();
    scan_refs(text, |id| {
        if !refs.iter().any(|r| r == id) {
            refs.push(id.to_string());
        }
        None
    });
    refs
}

fn collect_refs(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) => {
            for id in evidence_refs(s) {
                if !out.contains(&id) {
                    out.push(id);
                }
            }
        }
        serde_json::Value::Array(items) => items.iter().for_each(|v| collect_refs(v, out)),
        serde_json::Value::Object(map) => map.values().for_each(|v| collect_refs(v, out)),
        _ => {}
    }
}

/// Replace `#E<k>` references in every string of `args` with the matching
/// output. Unknown references are left as written.
pub fn substitute(args: &serde_json::Value, outputs: &HashMap<&str, &str>) -> serde_json::Value {
    match args {
        serde_json::Value::String(s) => {
            serde_json::Value::String(scan_refs(s, |id| outputs.get(id).map(|o| o.to_string())))
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(|v| substitute(v, outputs)).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, outputs)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Walk `text`, calling `on_ref` with each full `E<digits>` id. A `Some`
/// return replaces the whole `#E<digits>` token in the returned string.
fn scan_refs(text: &str, mut on_ref: impl FnMut(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find("#E") {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 2..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 {
            out.push_str("#E");
            rest = after;
            continue;
        }
        let token = &rest[pos..pos + 2 + digits];
        match on_ref(&token[1..]) {
            Some(replacement) => out.push_str(&replacement),
            None => out.push_str(token),
        }
        rest = &after[digits..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extract_json_from_fenced_prose() {
        let text = "Here is the plan:\n```json\n{\"steps\": [{\"tool\": \"echo\"}]}\n```\nThanks";
        let value = extract_json(text).unwrap();
        assert_eq!(value["steps"][0]["tool"], "echo");
    }

    #[test]
    fn extract_json_skips_braces_in_strings() {
        let text = "noise {\"a\": \"}{\", \"b\": [1, 2]} tail";
        assert_eq!(extract_json(text).unwrap()["b"][1], 2);
        assert!(extract_json("no json here").is_none());
    }

    #[test]
    fn parse_plan_numbers_steps_and_links_refs() {
        let text = r##"{"steps": [
            {"tool": "search", "args": {"q": "capital of France"}},
            {"tool": "search", "args": {"q": "population of #E1"}},
            {"tool": "echo", "args": {"text": "#E1 and #E2"}, "depends_on": ["E1"]}
        ]}"##;
        let plan = parse_plan(text).unwrap().unwrap();
        assert_eq!(plan.len(), 3);
        assert!(plan.get("E2").unwrap().depends_on.contains("E1"));
        assert_eq!(plan.get("E3").unwrap().depends_on.len(), 2);
        assert_eq!(plan.ready(), vec!["E1"]);
    }

    #[test]
    fn replan_numbers_after_prior_evidence() {
        let text = r##"[
            {"tool": "echo", "args": {"text": "Lyon"}},
            {"tool": "echo", "args": {"text": "compare #E1 and #E3"}, "depends_on": ["E2"]}
        ]"##;
        let plan = parse_plan_after(text, &["E1", "E2"]).unwrap().unwrap();
        assert!(plan.get("E1").is_none());
        assert_eq!(plan.ready(), vec!["E3"]);
        let deps = &plan.get("E4").unwrap().depends_on;
        assert_eq!(deps.len(), 1);
        assert!(deps.contains("E3"));
    }

    #[test]
    fn parse_plan_without_steps_is_direct() {
        assert!(parse_plan("The answer is 4.").unwrap().is_none());
        assert!(parse_plan("{\"steps\": []}").unwrap().is_none());
    }

    #[test]
    fn parse_plan_rejects_bad_structure() {
        let cyclic = r#"[{"id": "E1", "tool": "a", "depends_on": ["E2"]},
                         {"id": "E2", "tool": "b", "depends_on": ["E1"]}]"#;
        assert!(matches!(parse_plan(cyclic), Err(FailureReason::InvalidPlan { .. })));

        let dangling = r##"[{"tool": "a", "args": {"x": "#E7"}}]"##;
        assert!(matches!(parse_plan(dangling), Err(FailureReason::InvalidPlan { .. })));

        let malformed = r#"{"steps": [{"args": {}}]}"#;
        assert!(matches!(parse_plan(malformed), Err(FailureReason::InvalidPlan { .. })));
    }

    #[test]
    fn substitute_replaces_whole_ids() {
        let outputs: HashMap<&str, &str> = [("E1", "Paris"), ("E10", "ten")].into_iter().collect();
        let args = json!({"q": "#E1 vs #E10 vs #E2", "n": 3, "list": ["#E1"]});
        let out = substitute(&args, &outputs);
        assert_eq!(out["q"], "Paris vs ten vs #E2");
        assert_eq!(out["n"], 3);
        assert_eq!(out["list"][0], "Paris");
    }

    #[test]
    fn evidence_refs_are_unique_and_ordered() {
        assert_eq!(evidence_refs("see #E2, #E1 and #E2 (#Ex)"), vec!["E2", "E1"]);
    }
}
