//! Context manager: the single writer of a session's shared context.
//!
//! Owns the deduplicated file registry, the content store behind it, and
//! the append-only working memory log. Strategies and in-flight tool
//! tasks hold cheap clones of [`ContextManager`]; every mutation takes
//! the write lock, so writes are serialized while reads run
//! concurrently.
//!
//! Invariants:
//! - at most one live [`FileEntry`] per path
//! - re-attaching identical content never changes version or hash
//! - demotion only changes what [`ContextManager::view`] surfaces; the
//!   content store keeps the full text until the entry is removed

use chrono::{DateTime, Utc};
use reasonloop_config::ContextConfig;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::summary::{short_summary, summarize};
use super::token::estimate_tokens;
use super::working_memory::{MemoryRecord, RecordKind, WorkingMemoryLog};

/// Registry entry for one file path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    /// SHA-256 of the current content, hex encoded
    pub content_hash: String,
    pub version: u32,
    pub last_updated: DateTime<Utc>,
    pub reference_count: u32,
    /// Insertion rank; never changes for the life of the entry
    pub rank: u64,
    /// Estimated tokens of the full current content
    pub token_count: usize,
    /// Whether views surface only the summary
    pub demoted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Short summary of the content this version superseded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_summary: Option<String>,
    /// Logical clock value of the last attach or expand
    last_touch: u64,
}

/// What `attach` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    Added { version: u32 },
    Superseded { version: u32 },
    Unchanged { version: u32, reference_count: u32 },
}

/// Body of a file as surfaced to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "form", content = "text", rename_all = "snake_case")]
pub enum FileBody {
    Full(String),
    Summary(String),
}

impl FileBody {
    pub fn text(&self) -> &str {
        match self {
            FileBody::Full(t) | FileBody::Summary(t) => t,
        }
    }

    pub fn is_summary(&self) -> bool {
        matches!(self, FileBody::Summary(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileView {
    pub path: String,
    pub version: u32,
    pub body: FileBody,
    pub tokens: usize,
}

/// A budgeted, ordered projection of the context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextView {
    pub files: Vec<FileView>,
    pub memory: Vec<MemoryRecord>,
    pub budget: usize,
    pub used_tokens: usize,
    /// Paths demoted by this call's compression pass
    pub demoted: Vec<String>,
    /// True when even full compression could not fit the budget
    pub over_budget: bool,
}

impl ContextView {
    /// Render the view as a prompt section.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.files.is_empty() {
            out.push_str("## Files\n");
            for file in &self.files {
                let form = if file.body.is_summary() { "summary" } else { "full" };
                out.push_str(&format!("### {} (v{}, {})\n", file.path, file.version, form));
                out.push_str(file.body.text());
                if !file.body.text().ends_with('\n') {
                    out.push('\n');
                }
            }
            out.push('\n');
        }
        if !self.memory.is_empty() {
            out.push_str("## Working Memory\n");
            for record in &self.memory {
                out.push_str(&record.render());
                out.push('\n');
            }
        }
        out
    }

    pub fn paths(&self) -> Vec<&str> {
        self.files.iter().map(|f| f.path.as_str()).collect()
    }
}

/// Usage statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextStats {
    pub total_files: usize,
    pub total_tokens: usize,
    pub max_tokens: usize,
    pub files_summarized: usize,
    pub utilization: f32,
}

impl ContextStats {
    pub fn is_near_limit(&self) -> bool {
        self.utilization > 0.7
    }

    pub fn is_critical(&self) -> bool {
        self.utilization > 0.9
    }
}

/// Serializable state of a context manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextSnapshot {
    entries: BTreeMap<String, FileEntry>,
    contents: BTreeMap<String, String>,
    next_rank: u64,
    clock: u64,
    log: WorkingMemoryLog,
}

impl ContextSnapshot {
    pub fn entries(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.values()
    }

    pub fn log(&self) -> &WorkingMemoryLog {
        &self.log
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn surfaced_tokens(&self, entry: &FileEntry) -> usize {
        if entry.demoted {
            entry.summary.as_deref().map(estimate_tokens).unwrap_or(0)
        } else {
            entry.token_count
        }
    }

    /// Stable entries (never superseded) in insertion order, then changed
    /// entries from least to most recently touched.
    fn ordered(&self) -> Vec<&FileEntry> {
        let mut stable: Vec<&FileEntry> = self.entries.values().filter(|e| e.version == 1).collect();
        stable.sort_by_key(|e| e.rank);
        let mut changed: Vec<&FileEntry> = self.entries.values().filter(|e| e.version > 1).collect();
        changed.sort_by_key(|e| (e.last_touch, e.rank));
        stable.extend(changed);
        stable
    }
}

/// Handle to a session's context. Clones share the same state.
#[derive(Debug, Clone)]
pub struct ContextManager {
    state: Arc<RwLock<ContextSnapshot>>,
    config: ContextConfig,
}

fn content_hash(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

impl ContextManager {
    pub fn new(config: ContextConfig) -> Self {
        Self::restore(ContextSnapshot::default(), config)
    }

    /// Rebuild a manager from a checkpointed snapshot.
    pub fn restore(snapshot: ContextSnapshot, config: ContextConfig) -> Self {
        Self {
            state: Arc::new(RwLock::new(snapshot)),
            config,
        }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Attach a file, superseding any prior entry for the same path.
    pub async fn attach(&self, path: &str, content: &str) -> AttachOutcome {
        let hash = content_hash(content);
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let touch = state.tick();

        if let Some(entry) = state.entries.get_mut(path) {
            entry.reference_count += 1;
            entry.last_touch = touch;
            if entry.content_hash == hash {
                debug!(path, version = entry.version, "Context attach: content unchanged");
                return AttachOutcome::Unchanged {
                    version: entry.version,
                    reference_count: entry.reference_count,
                };
            }

            let old_content = state
                .contents
                .insert(path.to_string(), content.to_string())
                .unwrap_or_default();
            entry.previous_summary = Some(short_summary(
                path,
                entry.version,
                &old_content,
                self.config.short_summary_lines,
            ));
            entry.version += 1;
            entry.content_hash = hash;
            entry.last_updated = Utc::now();
            entry.token_count = estimate_tokens(content);
            entry.demoted = false;
            entry.summary = None;
            info!(path, version = entry.version, "Context attach: superseded");
            return AttachOutcome::Superseded {
                version: entry.version,
            };
        }

        let rank = state.next_rank;
        state.next_rank += 1;
        state.entries.insert(
            path.to_string(),
            FileEntry {
                path: path.to_string(),
                content_hash: hash,
                version: 1,
                last_updated: Utc::now(),
                reference_count: 1,
                rank,
                token_count: estimate_tokens(content),
                demoted: false,
                summary: None,
                previous_summary: None,
                last_touch: touch,
            },
        );
        state.contents.insert(path.to_string(), content.to_string());
        debug!(path, rank, "Context attach: added");
        AttachOutcome::Added { version: 1 }
    }

    /// Produce the ordered context within `budget` tokens.
    ///
    /// When the projected size exceeds the compression threshold of the
    /// budget, least-recently-used entries are demoted to summaries until
    /// the projection is back under the threshold.
    pub async fn view(&self, budget: usize) -> ContextView {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let limit = (budget as f64 * self.config.compression_threshold as f64) as usize;

        let mut projected: usize = state
            .entries
            .values()
            .map(|e| state.surfaced_tokens(e))
            .sum::<usize>()
            + state.log.total_tokens();

        let mut demoted = Vec::new();
        if projected > limit {
            let mut lru: Vec<(u64, String)> = state
                .entries
                .values()
                .filter(|e| !e.demoted)
                .map(|e| (e.last_touch, e.path.clone()))
                .collect();
            lru.sort();

            let head = self.config.summary_head_lines;
            let tail = self.config.summary_tail_lines;
            for (_, path) in lru {
                if projected <= limit {
                    break;
                }
                let content = state.contents.get(&path).cloned().unwrap_or_default();
                let summary = summarize(&path, &content, head, tail);
                let summary_tokens = estimate_tokens(&summary);
                if let Some(entry) = state.entries.get_mut(&path) {
                    // Nothing to free: short files summarize to themselves.
                    if summary_tokens >= entry.token_count {
                        continue;
                    }
                    projected -= entry.token_count - summary_tokens;
                    entry.demoted = true;
                    entry.summary = Some(summary);
                    demoted.push(path);
                }
            }
            if !demoted.is_empty() {
                info!(count = demoted.len(), budget, projected, "Context compression demoted entries");
            }
        }

        let mut files = Vec::new();
        let mut file_tokens = 0usize;
        for entry in state.ordered() {
            let body = if entry.demoted {
                FileBody::Summary(entry.summary.clone().unwrap_or_default())
            } else {
                FileBody::Full(state.contents.get(&entry.path).cloned().unwrap_or_default())
            };
            let tokens = state.surfaced_tokens(entry);
            file_tokens += tokens;
            files.push(FileView {
                path: entry.path.clone(),
                version: entry.version,
                body,
                tokens,
            });
        }

        let memory = state.log.tail_within(budget.saturating_sub(file_tokens));
        let used_tokens = file_tokens + memory.iter().map(MemoryRecord::tokens).sum::<usize>();

        ContextView {
            files,
            memory,
            budget,
            used_tokens,
            demoted,
            over_budget: file_tokens > budget,
        }
    }

    /// Append to the working memory log.
    pub async fn record(
        &self,
        kind: RecordKind,
        source: impl Into<String>,
        content: impl Into<String>,
    ) -> usize {
        self.state.write().await.log.append(kind, source, content)
    }

    /// Current entry and full content for a path.
    pub async fn get(&self, path: &str) -> Option<(FileEntry, String)> {
        let state = self.state.read().await;
        let entry = state.entries.get(path)?.clone();
        let content = state.contents.get(path).cloned().unwrap_or_default();
        Some((entry, content))
    }

    /// Drop a path and its stored content. Returns whether it existed.
    pub async fn remove(&self, path: &str) -> bool {
        let mut state = self.state.write().await;
        state.contents.remove(path);
        state.entries.remove(path).is_some()
    }

    /// Restore a demoted entry to full content. Returns whether the entry
    /// was demoted.
    pub async fn expand(&self, path: &str) -> bool {
        let mut state = self.state.write().await;
        let touch = state.tick();
        match state.entries.get_mut(path) {
            Some(entry) if entry.demoted => {
                entry.demoted = false;
                entry.summary = None;
                entry.last_touch = touch;
                true
            }
            _ => false,
        }
    }

    /// Drop every file. The working memory log is kept.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.entries.clear();
        state.contents.clear();
        state.next_rank = 0;
    }

    pub async fn stats(&self) -> ContextStats {
        let state = self.state.read().await;
        let total_tokens: usize = state.entries.values().map(|e| state.surfaced_tokens(e)).sum();
        let max_tokens = self.config.max_tokens;
        let utilization = if max_tokens > 0 {
            (total_tokens as f32 / max_tokens as f32).min(1.0)
        } else {
            0.0
        };
        ContextStats {
            total_files: state.entries.len(),
            total_tokens,
            max_tokens,
            files_summarized: state.entries.values().filter(|e| e.demoted).count(),
            utilization,
        }
    }

    /// Working memory records, oldest first.
    pub async fn memory(&self) -> Vec<MemoryRecord> {
        self.state.read().await.log.records().to_vec()
    }

    /// A point-in-time copy for checkpointing or read-only inspection.
    pub async fn snapshot(&self) -> ContextSnapshot {
        self.state.read().await.clone()
    }
}
