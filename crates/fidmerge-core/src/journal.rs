//! Journal of saved writes
//!
//! Every write that actually saved a target can be appended to a JSON
//! journal, grouped by target, so a run can be traced afterwards.

use crate::error::{Error, Result};
use crate::writer::{Change, WriteOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// One saved write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub timestamp: DateTime<Utc>,
    pub target: String,
    /// Patcher that produced the write
    pub patcher: String,
    /// Changed records per group
    pub counts: BTreeMap<String, usize>,
    pub changes: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub added_masters: Vec<String>,
    /// `group key attribute: old -> new`, one line per change
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

impl JournalEntry {
    pub fn from_outcome(patcher: &str, outcome: &WriteOutcome) -> Self {
        Self {
            timestamp: Utc::now(),
            target: outcome.target.clone(),
            patcher: patcher.to_string(),
            counts: outcome.counts.clone(),
            changes: outcome.changes.len(),
            added_masters: outcome.added_masters.clone(),
            details: outcome.changes.iter().map(describe).collect(),
        }
    }
}

fn describe(change: &Change) -> String {
    let old = change.old.as_ref().map(|v| v.to_string()).unwrap_or_else(|| "-".to_string());
    format!("{} {} {}: {} -> {}", change.group, change.key, change.attribute, old, change.new)
}

/// The journal file: entries grouped by target
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Journal {
    pub entries: BTreeMap<String, Vec<JournalEntry>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a journal, or start an empty one if the file does not exist
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = fs::read_to_string(path).map_err(|e| Error::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_str(&content).map_err(Error::Json)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn add_entry(&mut self, entry: JournalEntry) {
        self.entries.entry(entry.target.clone()).or_default().push(entry);
    }

    pub fn target_history(&self, target: &str) -> &[JournalEntry] {
        self.entries.get(target).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn last_entry(&self, target: &str) -> Option<&JournalEntry> {
        self.target_history(target).last()
    }

    pub fn total_entries(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }
}

/// Append `outcome` to the journal at `path`
pub fn record<P: AsRef<Path>>(
    path: P,
    patcher: &str,
    outcome: &WriteOutcome,
) -> Result<JournalEntry> {
    let path = path.as_ref();
    let mut journal = Journal::load(path)?;
    let entry = JournalEntry::from_outcome(patcher, outcome);
    journal.add_entry(entry.clone());
    journal.save(path)?;
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formid::FormKey;
    use crate::value::Value;
    use crate::writer::WriteState;

    fn outcome() -> WriteOutcome {
        let mut counts = BTreeMap::new();
        counts.insert("FACT".to_string(), 1);
        WriteOutcome {
            target: "Patch.esp".to_string(),
            changes: vec![Change {
                group: "FACT".to_string(),
                key: FormKey::new("A.esm", 1),
                attribute: "rank".to_string(),
                old: Some(Value::Int(1)),
                new: Value::Int(3),
            }],
            counts,
            added_masters: Vec::new(),
            state: WriteState::Saved,
        }
    }

    #[test]
    fn test_entry_from_outcome() {
        let entry = JournalEntry::from_outcome("relations", &outcome());
        assert_eq!(entry.changes, 1);
        assert_eq!(entry.details, vec!["FACT A.esm:0x000001 rank: 1 -> 3".to_string()]);
    }

    #[test]
    fn test_missing_journal_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::load(dir.path().join("none.json")).unwrap();
        assert_eq!(journal.total_entries(), 0);
    }

    #[test]
    fn test_record_appends_per_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.json");
        record(&path, "relations", &outcome()).unwrap();
        record(&path, "relations", &outcome()).unwrap();

        let journal = Journal::load(&path).unwrap();
        assert_eq!(journal.target_history("Patch.esp").len(), 2);
        assert_eq!(journal.last_entry("Patch.esp").unwrap().counts["FACT"], 1);
        assert!(journal.last_entry("Other.esp").is_none());
    }
}
