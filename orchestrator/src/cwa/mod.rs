//! Context Window Array: a bounded, searchable store of typed context entries.
//!
//! Orchestration code reads the [`WorkingContext`] (every entry, summaries only).
//! Execution code reads an [`ImplementationContext`] (full content for an explicit,
//! bounded id list). Entries expire by ttl and can be compressed to their summary.

mod batch;
mod entry;
mod search;
mod store;
mod views;

pub use batch::{Batch, BatchTask, create_batches};
pub use entry::{ContextEntry, EntryId, EntryType, NewEntry};
pub use store::{ContextStore, DEFAULT_MAX_IMPLEMENTATION_ENTRIES, ScoredEntry};
pub use views::{EntrySummary, ImplementationContext, ImplementationEntry, WorkingContext};
