//! Context entries and their identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier assigned by a [`ContextStore`](super::ContextStore), unique per store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(u64);

impl EntryId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryType {
    File,
    Task,
    CommandResult,
    Tracking,
    Plan,
}

impl EntryType {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryType::File => "FILE",
            EntryType::Task => "TASK",
            EntryType::CommandResult => "COMMAND_RESULT",
            EntryType::Tracking => "TRACKING",
            EntryType::Plan => "PLAN",
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input to [`ContextStore::add`](super::ContextStore::add).
///
/// `id` is normally left empty so the store assigns the next one. An empty
/// `summary` is derived from the first non-blank line of `content`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub id: Option<EntryId>,
    pub entry_type: EntryType,
    pub source: String,
    pub content: Option<String>,
    pub summary: String,
    pub ttl: Option<u32>,
}

impl NewEntry {
    pub fn new(entry_type: EntryType, source: impl Into<String>) -> Self {
        Self {
            id: None,
            entry_type,
            source: source.into(),
            content: None,
            summary: String::new(),
            ttl: None,
        }
    }

    pub fn with_id(mut self, id: EntryId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn ttl(mut self, turns: u32) -> Self {
        self.ttl = Some(turns);
        self
    }
}

/// A stored unit of retained knowledge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextEntry {
    pub(super) id: EntryId,
    pub(super) entry_type: EntryType,
    pub(super) source: String,
    pub(super) content: Option<String>,
    pub(super) summary: String,
    pub(super) ttl: Option<u32>,
    /// Insertion sequence, used for deterministic tie-breaking.
    pub(super) seq: u64,
}

impl ContextEntry {
    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn entry_type(&self) -> EntryType {
        self.entry_type
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Full text, or `None` once compressed.
    pub fn content(&self) -> Option<&str> {
        self.content.as_deref()
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    /// Remaining turns; `None` means the entry never expires.
    pub fn ttl(&self) -> Option<u32> {
        self.ttl
    }

    pub fn is_compressed(&self) -> bool {
        self.content.is_none()
    }

    /// Text used for lexical search.
    pub(super) fn searchable_text(&self) -> String {
        match &self.content {
            Some(content) => format!("{}\n{}", self.summary, content),
            None => self.summary.clone(),
        }
    }
}

const SUMMARY_MAX_CHARS: usize = 160;

/// Derive a one-line summary from content.
pub(super) fn derive_summary(content: &str) -> Option<String> {
    let line = content.lines().map(str::trim).find(|line| !line.is_empty())?;
    let line = line.trim_start_matches('#').trim();
    if line.is_empty() {
        return None;
    }
    if line.chars().count() <= SUMMARY_MAX_CHARS {
        return Some(line.to_string());
    }
    let mut short: String = line.chars().take(SUMMARY_MAX_CHARS).collect();
    short.push_str("...");
    Some(short)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_summary_uses_first_meaningful_line() {
        assert_eq!(
            derive_summary("\n\n# Research notes\nbody").as_deref(),
            Some("Research notes")
        );
        assert_eq!(derive_summary("   \n"), None);
    }

    #[test]
    fn derive_summary_truncates_long_lines() {
        let long = "x".repeat(400);
        let summary = derive_summary(&long).expect("summary");
        assert_eq!(summary.chars().count(), SUMMARY_MAX_CHARS + 3);
        assert!(summary.ends_with("..."));
    }

    #[test]
    fn entry_type_serializes_screaming_case() {
        let json = serde_json::to_string(&EntryType::CommandResult).expect("serialize");
        assert_eq!(json, "\"COMMAND_RESULT\"");
    }
}
