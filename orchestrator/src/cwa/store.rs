use std::collections::BTreeMap;

use tracing::{debug, instrument};

use super::batch::{self, Batch, BatchTask};
use super::entry::{ContextEntry, EntryId, EntryType, NewEntry, derive_summary};
use super::search;
use super::views::{EntrySummary, ImplementationContext, ImplementationEntry, WorkingContext};
use crate::core::error::ContextError;

/// Upper bound on entries in one implementation context.
pub const DEFAULT_MAX_IMPLEMENTATION_ENTRIES: usize = 200;

/// A search hit with its similarity score in `(0, 1]`.
#[derive(Debug, Clone, Copy)]
pub struct ScoredEntry<'a> {
    pub entry: &'a ContextEntry,
    pub score: f64,
}

/// Bounded, searchable store of context entries.
///
/// Single owner, single writer. Ids are assigned from a counter owned by the
/// instance and never reused.
#[derive(Debug, Clone)]
pub struct ContextStore {
    entries: BTreeMap<EntryId, ContextEntry>,
    next_id: u64,
    next_seq: u64,
    max_implementation_entries: usize,
}

impl Default for ContextStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextStore {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_IMPLEMENTATION_ENTRIES)
    }

    pub fn with_limit(max_implementation_entries: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            next_id: 1,
            next_seq: 0,
            max_implementation_entries,
        }
    }

    /// Store whose first assigned id is `last + 1`, so ids recorded in an
    /// earlier run stay unambiguous after resume.
    pub fn starting_after(last: Option<EntryId>, max_implementation_entries: usize) -> Self {
        let mut store = Self::with_limit(max_implementation_entries);
        if let Some(last) = last {
            store.next_id = last.get() + 1;
        }
        store
    }

    pub fn max_implementation_entries(&self) -> usize {
        self.max_implementation_entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[instrument(level = "debug", skip_all, fields(entry_type = %entry.entry_type, source = %entry.source))]
    pub fn add(&mut self, entry: NewEntry) -> Result<EntryId, ContextError> {
        let summary = if entry.summary.trim().is_empty() {
            entry.content.as_deref().and_then(derive_summary)
        } else {
            Some(entry.summary.trim().to_string())
        };
        let Some(summary) = summary else {
            return Err(ContextError::EmptySummary {
                source_name: entry.source,
            });
        };

        let id = match entry.id {
            Some(id) => {
                if self.entries.contains_key(&id) {
                    return Err(ContextError::DuplicateId(id));
                }
                self.next_id = self.next_id.max(id.get() + 1);
                id
            }
            None => {
                let id = EntryId::new(self.next_id);
                self.next_id += 1;
                id
            }
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            id,
            ContextEntry {
                id,
                entry_type: entry.entry_type,
                source: entry.source,
                content: entry.content,
                summary,
                ttl: entry.ttl,
                seq,
            },
        );
        debug!(%id, "context entry added");
        Ok(id)
    }

    pub fn get(&self, id: EntryId) -> Option<&ContextEntry> {
        self.entries.get(&id)
    }

    pub fn require(&self, id: EntryId) -> Result<&ContextEntry, ContextError> {
        self.get(id).ok_or(ContextError::NotFound(id))
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &ContextEntry> {
        let mut entries: Vec<&ContextEntry> = self.entries.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.into_iter()
    }

    pub fn find_by_source(&self, source: &str) -> Vec<&ContextEntry> {
        self.iter().filter(|entry| entry.source == source).collect()
    }

    pub fn latest_of_type(&self, entry_type: EntryType) -> Option<&ContextEntry> {
        self.iter().filter(|entry| entry.entry_type == entry_type).last()
    }

    /// Rank entries by TF-IDF similarity of `summary + content` to `query`.
    ///
    /// Zero scores and scores below `min_score` are excluded. Equal scores keep
    /// insertion order.
    pub fn search(&self, query: &str, max_results: usize, min_score: f64) -> Vec<ScoredEntry<'_>> {
        let entries: Vec<&ContextEntry> = self.iter().collect();
        let documents: Vec<String> = entries.iter().map(|e| e.searchable_text()).collect();
        let scores = search::score_documents(query, &documents);

        let mut hits: Vec<ScoredEntry<'_>> = entries
            .into_iter()
            .zip(scores)
            .filter(|(_, score)| *score > 0.0 && *score >= min_score)
            .map(|(entry, score)| ScoredEntry { entry, score })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.entry.seq.cmp(&b.entry.seq))
        });
        hits.truncate(max_results);
        hits
    }

    pub fn build_working_context(&self) -> WorkingContext {
        WorkingContext::new(self.iter().map(EntrySummary::from).collect())
    }

    /// Full content for exactly `entry_ids`, in the order given.
    ///
    /// Requests longer than the configured maximum fail; nothing is truncated.
    pub fn build_implementation_context(
        &self,
        entry_ids: &[EntryId],
    ) -> Result<ImplementationContext, ContextError> {
        self.check_bounds(entry_ids)?;
        let entries = entry_ids
            .iter()
            .map(|id| self.require(*id).map(ImplementationEntry::from))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ImplementationContext::new(entries))
    }

    pub fn validate_bounds(&self, entry_ids: &[EntryId]) -> bool {
        self.check_bounds(entry_ids).is_ok()
    }

    fn check_bounds(&self, entry_ids: &[EntryId]) -> Result<(), ContextError> {
        if entry_ids.len() > self.max_implementation_entries {
            return Err(ContextError::Bounds {
                requested: entry_ids.len(),
                max: self.max_implementation_entries,
            });
        }
        Ok(())
    }

    /// Advance one turn: decrement every ttl and drop entries that reach zero.
    ///
    /// Returns the removed ids in insertion order.
    pub fn process_turn(&mut self) -> Vec<EntryId> {
        let mut expired: Vec<(u64, EntryId)> = Vec::new();
        for entry in self.entries.values_mut() {
            if let Some(ttl) = entry.ttl.as_mut() {
                *ttl = ttl.saturating_sub(1);
                if *ttl == 0 {
                    expired.push((entry.seq, entry.id));
                }
            }
        }
        expired.sort_unstable();
        let removed: Vec<EntryId> = expired.into_iter().map(|(_, id)| id).collect();
        for id in &removed {
            self.entries.remove(id);
        }
        if !removed.is_empty() {
            debug!(count = removed.len(), "context entries expired");
        }
        removed
    }

    /// Drop the content of the given entries, keeping their summaries.
    ///
    /// Returns how many entries changed; compressing twice is a no-op.
    pub fn compress(&mut self, entry_ids: &[EntryId]) -> Result<usize, ContextError> {
        for id in entry_ids {
            self.require(*id)?;
        }
        let mut changed = 0;
        for id in entry_ids {
            if let Some(entry) = self.entries.get_mut(id)
                && entry.content.take().is_some()
            {
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Entries whose ttl is at most `threshold`, in insertion order.
    pub fn get_expiring_soon(&self, threshold: u32) -> Vec<&ContextEntry> {
        self.iter()
            .filter(|entry| entry.ttl.is_some_and(|ttl| ttl <= threshold))
            .collect()
    }

    /// Partition tasks into batches of at most `max_entries_per_batch` required
    /// entries. Every referenced entry must exist.
    pub fn create_batches(
        &self,
        tasks: Vec<BatchTask>,
        max_entries_per_batch: usize,
    ) -> Result<Vec<Batch>, ContextError> {
        for task in &tasks {
            for id in &task.entry_ids {
                self.require(*id)?;
            }
        }
        batch::create_batches(tasks, max_entries_per_batch)
    }
}
