//! Read-only context views handed to orchestration and execution.

use serde::Serialize;

use super::entry::{ContextEntry, EntryId, EntryType};

/// Summary-only projection of one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntrySummary {
    pub id: EntryId,
    pub entry_type: EntryType,
    pub source: String,
    pub summary: String,
    pub ttl: Option<u32>,
}

impl From<&ContextEntry> for EntrySummary {
    fn from(entry: &ContextEntry) -> Self {
        Self {
            id: entry.id(),
            entry_type: entry.entry_type(),
            source: entry.source().to_string(),
            summary: entry.summary().to_string(),
            ttl: entry.ttl(),
        }
    }
}

/// Every retained entry, summaries only, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkingContext {
    entries: Vec<EntrySummary>,
}

impl WorkingContext {
    pub(super) fn new(entries: Vec<EntrySummary>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[EntrySummary] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One bullet per entry: `- [ctx-3] PLAN plans/01-setup.md: Set up the workspace`.
    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|entry| {
                format!(
                    "- [{}] {} {}: {}",
                    entry.id, entry.entry_type, entry.source, entry.summary
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Full-content projection of one requested entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImplementationEntry {
    pub id: EntryId,
    pub entry_type: EntryType,
    pub source: String,
    pub summary: String,
    /// `None` when the entry was compressed before it was requested.
    pub content: Option<String>,
}

impl From<&ContextEntry> for ImplementationEntry {
    fn from(entry: &ContextEntry) -> Self {
        Self {
            id: entry.id(),
            entry_type: entry.entry_type(),
            source: entry.source().to_string(),
            summary: entry.summary().to_string(),
            content: entry.content().map(str::to_string),
        }
    }
}

/// Full content for exactly the requested entries, in request order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImplementationContext {
    entries: Vec<ImplementationEntry>,
}

impl ImplementationContext {
    pub(super) fn new(entries: Vec<ImplementationEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[ImplementationEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove the entry with `id` so it can be rendered on its own.
    pub fn take(&mut self, id: EntryId) -> Option<ImplementationEntry> {
        let position = self.entries.iter().position(|entry| entry.id == id)?;
        Some(self.entries.remove(position))
    }

    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|entry| {
                let body = entry.content.as_deref().unwrap_or(&entry.summary);
                format!(
                    "### [{}] {} {}\n\n{}",
                    entry.id,
                    entry.entry_type,
                    entry.source,
                    body.trim()
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}
