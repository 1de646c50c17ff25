//! Working memory: the append-only scratchpad of a session.
//!
//! Stores the objective, thoughts, actions, observations, plans and
//! reflections strategies produce. Working memory is:
//!
//! - **Append-only**: records are never rewritten or removed
//! - **Serializable**: part of every session checkpoint
//! - **Renderable**: produces a text section for model prompts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::token::estimate_tokens;

/// The kind of working memory record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Objective,
    Thought,
    Action,
    Observation,
    Plan,
    Reflection,
    Note,
}

impl RecordKind {
    fn label(self) -> &'static str {
        match self {
            RecordKind::Objective => "Objective",
            RecordKind::Thought => "Thought",
            RecordKind::Action => "Action",
            RecordKind::Observation => "Observation",
            RecordKind::Plan => "Plan",
            RecordKind::Reflection => "Reflection",
            RecordKind::Note => "Note",
        }
    }
}

/// A single entry in working memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub seq: usize,
    pub kind: RecordKind,
    /// Step, node or cycle the record came from
    pub source: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl MemoryRecord {
    /// Render as a single prompt line.
    pub fn render(&self) -> String {
        format!("[{}] ({}) {}", self.kind.label(), self.source, self.content)
    }

    pub fn tokens(&self) -> usize {
        estimate_tokens(&self.render())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkingMemoryLog {
    records: Vec<MemoryRecord>,
}

impl WorkingMemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record and return its sequence number.
    pub fn append(
        &mut self,
        kind: RecordKind,
        source: impl Into<String>,
        content: impl Into<String>,
    ) -> usize {
        let seq = self.records.len();
        self.records.push(MemoryRecord {
            seq,
            kind,
            source: source.into(),
            content: content.into(),
            timestamp: Utc::now(),
        });
        seq
    }

    pub fn records(&self) -> &[MemoryRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The newest records whose rendered size fits in `budget` tokens,
    /// returned oldest first.
    pub fn tail_within(&self, budget: usize) -> Vec<MemoryRecord> {
        let mut used = 0usize;
        let mut kept: Vec<MemoryRecord> = Vec::new();
        for record in self.records.iter().rev() {
            let cost = record.tokens();
            if used + cost > budget {
                break;
            }
            used += cost;
            kept.push(record.clone());
        }
        kept.reverse();
        kept
    }

    pub fn total_tokens(&self) -> usize {
        self.records.iter().map(MemoryRecord::tokens).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_is_sequential() {
        let mut log = WorkingMemoryLog::new();
        assert_eq!(log.append(RecordKind::Objective, "session", "find the date"), 0);
        assert_eq!(log.append(RecordKind::Thought, "react:1", "call date tool"), 1);
        assert_eq!(log.len(), 2);
        assert_eq!(log.records()[1].kind, RecordKind::Thought);
    }

    #[test]
    fn render_includes_label_and_source() {
        let mut log = WorkingMemoryLog::new();
        log.append(RecordKind::Observation, "E2", "42 results");
        assert_eq!(log.records()[0].render(), "[Observation] (E2) 42 results");
    }

    #[test]
    fn tail_within_keeps_newest() {
        let mut log = WorkingMemoryLog::new();
        for i in 0..10 {
            log.append(RecordKind::Note, "n", format!("note number {i}"));
        }
        let one = log.records()[0].tokens();
        let tail = log.tail_within(one * 3);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].content, "note number 7");
        assert_eq!(tail[2].content, "note number 9");
        assert_eq!(log.len(), 10);
    }
}
