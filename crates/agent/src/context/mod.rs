//! Session context: a deduplicated file registry plus working memory.
//!
//! The [`ContextManager`] is the only writer. Strategies read budgeted
//! [`ContextView`]s from it and append observations to its log.
//!
//! # View order
//!
//! | Position | Entries | Sorted by |
//! |----------|---------|-----------|
//! | 1 | Never superseded | Insertion rank |
//! | 2 | Superseded at least once | Last touch, then rank |
//! | 3 | Working memory | Sequence, newest that fit |

pub mod manager;
pub mod summary;
pub mod token;
pub mod working_memory;

pub use manager::{
    AttachOutcome, ContextManager, ContextSnapshot, ContextStats, ContextView, FileBody, FileEntry,
    FileView,
};
pub use working_memory::{MemoryRecord, RecordKind, WorkingMemoryLog};
