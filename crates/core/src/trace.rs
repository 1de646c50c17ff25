//! Execution trace: the append-only record of everything a session did.
//!
//! Every model call, tool call, tool result, failure and answer lands
//! here in order. Entries are never edited or removed; the only
//! mutation is [`ExecutionTrace::push`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of event an entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    ModelCall,
    ToolCall,
    ToolResult,
    Replan,
    Reflection,
    StrategySwitch,
    Failure,
    Answer,
}

/// One trace entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    /// Position in the trace, starting at 0
    pub seq: usize,

    /// Originating step or node id (e.g. "react:2", "E3", "node:7")
    pub source: String,

    pub kind: TraceKind,

    pub input: String,

    pub output: String,

    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionTrace {
    entries: Vec<TraceEntry>,
}

impl ExecutionTrace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry and return its sequence number.
    pub fn push(
        &mut self,
        source: impl Into<String>,
        kind: TraceKind,
        input: impl Into<String>,
        output: impl Into<String>,
    ) -> usize {
        let seq = self.entries.len();
        self.entries.push(TraceEntry {
            seq,
            source: source.into(),
            kind,
            input: input.into(),
            output: output.into(),
            timestamp: Utc::now(),
        });
        seq
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries of one kind, in order.
    pub fn of_kind(&self, kind: TraceKind) -> impl Iterator<Item = &TraceEntry> {
        self.entries.iter().filter(move |e| e.kind == kind)
    }

    /// Position of the first entry of `kind`, if any.
    pub fn first(&self, kind: TraceKind) -> Option<usize> {
        self.entries.iter().position(|e| e.kind == kind)
    }
}
