//! The merge store: `group → FormKey → attributes`, with provenance
//!
//! Every attribute remembers which source supplied its current value, so a
//! merged result can always be explained.

use crate::formid::FormKey;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label used for keys that never had one
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Which side wins when two sources supply the same attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Policy {
    /// Keep the value from the earliest source that supplied one
    FirstWins,
    /// Overwrite with every later source
    LastWins,
}

/// A merged attribute with the source it came from
#[derive(Debug, Clone, PartialEq)]
pub struct MergedValue {
    pub value: Value,
    pub origin: String,
}

/// Merged view of one entity
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeEntry {
    attributes: BTreeMap<String, MergedValue>,
}

impl MergeEntry {
    pub fn get(&self, attribute: &str) -> Option<&Value> {
        self.attributes.get(attribute).map(|m| &m.value)
    }

    /// Source that supplied the current value of `attribute`
    pub fn origin(&self, attribute: &str) -> Option<&str> {
        self.attributes.get(attribute).map(|m| m.origin.as_str())
    }

    pub fn contains(&self, attribute: &str) -> bool {
        self.attributes.contains_key(attribute)
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.attributes.iter().map(|(k, m)| (k.as_str(), &m.value))
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    fn set(&mut self, attribute: String, value: Value, origin: &str, policy: Policy) -> bool {
        if policy == Policy::FirstWins && self.attributes.contains_key(&attribute) {
            return false;
        }
        self.attributes.insert(
            attribute,
            MergedValue {
                value,
                origin: origin.to_string(),
            },
        );
        true
    }
}

/// One entry in export order
#[derive(Debug, Clone, Copy)]
pub struct SortedEntry<'a> {
    pub group: &'a str,
    pub key: &'a FormKey,
    pub label: &'a str,
    pub entry: &'a MergeEntry,
}

/// The central merged state of a run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeStore {
    groups: BTreeMap<String, BTreeMap<FormKey, MergeEntry>>,
    labels: BTreeMap<FormKey, String>,
}

impl MergeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `attributes` into the entry for `key`. Only the named attributes
    /// are touched. Returns how many were written.
    pub fn put<I>(
        &mut self,
        group: &str,
        key: &FormKey,
        attributes: I,
        origin: &str,
        policy: Policy,
    ) -> usize
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let entry = self
            .groups
            .entry(group.to_string())
            .or_default()
            .entry(key.clone())
            .or_default();
        let mut written = 0;
        for (attribute, value) in attributes {
            if entry.set(attribute, value, origin, policy) {
                written += 1;
            }
        }
        written
    }

    /// Add or update one member of a links attribute, leaving other members
    /// alone. A non-links value already stored under the name is replaced.
    pub fn merge_link(
        &mut self,
        group: &str,
        key: &FormKey,
        attribute: &str,
        target: FormKey,
        rank: i64,
        origin: &str,
    ) {
        let entry = self
            .groups
            .entry(group.to_string())
            .or_default()
            .entry(key.clone())
            .or_default();
        let merged = entry
            .attributes
            .entry(attribute.to_string())
            .or_insert_with(|| MergedValue {
                value: Value::Links(BTreeMap::new()),
                origin: origin.to_string(),
            });
        if !matches!(merged.value, Value::Links(_)) {
            merged.value = Value::Links(BTreeMap::new());
        }
        if let Value::Links(links) = &mut merged.value {
            links.insert(target, rank);
        }
        merged.origin = origin.to_string();
    }

    /// Record a label for `key`; empty labels are ignored
    pub fn set_label(&mut self, key: &FormKey, label: &str, policy: Policy) {
        if label.is_empty() || (policy == Policy::FirstWins && self.labels.contains_key(key)) {
            return;
        }
        self.labels.insert(key.clone(), label.to_string());
    }

    pub fn label(&self, key: &FormKey) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// Label or [`UNKNOWN_LABEL`]
    pub fn display_label(&self, key: &FormKey) -> &str {
        self.label(key).unwrap_or(UNKNOWN_LABEL)
    }

    pub fn get(&self, group: &str, key: &FormKey) -> Option<&MergeEntry> {
        self.groups.get(group).and_then(|g| g.get(key))
    }

    pub fn group(&self, group: &str) -> Option<&BTreeMap<FormKey, MergeEntry>> {
        self.groups.get(group)
    }

    /// Group tags that hold at least one entry
    pub fn group_tags(&self) -> impl Iterator<Item = &str> {
        self.groups
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(tag, _)| tag.as_str())
    }

    pub fn entry_count(&self) -> usize {
        self.groups.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }

    /// Entries of one group ordered by `(label.lowercase(), key)`
    pub fn sorted_group(&self, group: &str) -> Vec<SortedEntry<'_>> {
        let Some((tag, entries)) = self.groups.get_key_value(group) else {
            return Vec::new();
        };
        let mut sorted: Vec<(String, SortedEntry<'_>)> = entries
            .iter()
            .map(|(key, entry)| {
                let label = self.display_label(key);
                (
                    label.to_lowercase(),
                    SortedEntry {
                        group: tag,
                        key,
                        label,
                        entry,
                    },
                )
            })
            .collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.key.cmp(b.1.key)));
        sorted.into_iter().map(|(_, e)| e).collect()
    }

    /// Every entry ordered by `(group, label.lowercase(), key)`
    pub fn sorted_entries(&self) -> Vec<SortedEntry<'_>> {
        self.groups
            .keys()
            .flat_map(|group| self.sorted_group(group))
            .collect()
    }

    /// Links of one attribute ordered by `(target label.lowercase(), target)`
    pub fn sorted_links<'a>(
        &'a self,
        links: &'a BTreeMap<FormKey, i64>,
    ) -> Vec<(&'a FormKey, &'a str, i64)> {
        let mut sorted: Vec<(String, (&FormKey, &str, i64))> = links
            .iter()
            .map(|(target, rank)| {
                let label = self.display_label(target);
                (label.to_lowercase(), (target, label, *rank))
            })
            .collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1 .0.cmp(b.1 .0)));
        sorted.into_iter().map(|(_, l)| l).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(source: &str, object: u32) -> FormKey {
        FormKey::new(source, object)
    }

    fn attrs(pairs: &[(&str, Value)]) -> Vec<(String, Value)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_put_last_wins_overwrites() {
        let mut store = MergeStore::new();
        let k = key("A.esm", 1);
        store.put("FACT", &k, attrs(&[("rank", Value::Int(1))]), "A.esm", Policy::LastWins);
        store.put("FACT", &k, attrs(&[("rank", Value::Int(3))]), "B.esp", Policy::LastWins);

        let entry = store.get("FACT", &k).unwrap();
        assert_eq!(entry.get("rank"), Some(&Value::Int(3)));
        assert_eq!(entry.origin("rank"), Some("B.esp"));
    }

    #[test]
    fn test_put_first_wins_keeps() {
        let mut store = MergeStore::new();
        let k = key("A.esm", 1);
        store.put("FACT", &k, attrs(&[("eid", "Original".into())]), "A.esm", Policy::FirstWins);
        let written = store.put(
            "FACT",
            &k,
            attrs(&[("eid", "Override".into()), ("full", "Name".into())]),
            "B.esp",
            Policy::FirstWins,
        );
        assert_eq!(written, 1);
        let entry = store.get("FACT", &k).unwrap();
        assert_eq!(entry.get("eid"), Some(&Value::from("Original")));
        assert_eq!(entry.get("full"), Some(&Value::from("Name")));
    }

    #[test]
    fn test_put_touches_only_named_attributes() {
        let mut store = MergeStore::new();
        let k = key("A.esm", 1);
        let first = attrs(&[("value", Value::Int(5)), ("weight", Value::Float(1.0))]);
        store.put("WEAP", &k, first, "A.esm", Policy::LastWins);
        store.put("WEAP", &k, attrs(&[("value", Value::Int(9))]), "B.esp", Policy::LastWins);

        let entry = store.get("WEAP", &k).unwrap();
        assert_eq!(entry.get("value"), Some(&Value::Int(9)));
        assert_eq!(entry.get("weight"), Some(&Value::Float(1.0)));
        assert_eq!(entry.origin("weight"), Some("A.esm"));
    }

    #[test]
    fn test_absent_differs_from_none() {
        let mut store = MergeStore::new();
        let k = key("A.esm", 1);
        store.put("WEAP", &k, attrs(&[("weight", Value::None)]), "A.esm", Policy::LastWins);
        let entry = store.get("WEAP", &k).unwrap();
        assert!(entry.contains("weight"));
        assert!(!entry.contains("value"));
    }

    #[test]
    fn test_merge_link_updates_member() {
        let mut store = MergeStore::new();
        let actor = key("A.esm", 1);
        store.merge_link("NPC_", &actor, "factions", key("A.esm", 10), 1, "text");
        store.merge_link("NPC_", &actor, "factions", key("A.esm", 11), 0, "text");
        store.merge_link("NPC_", &actor, "factions", key("A.esm", 10), 2, "text");

        let links = store.get("NPC_", &actor).unwrap().get("factions").unwrap().as_links().unwrap();
        assert_eq!(links.len(), 2);
        assert_eq!(links[&key("A.esm", 10)], 2);
    }

    #[test]
    fn test_sorted_by_label_then_key() {
        let mut store = MergeStore::new();
        let a = key("Z.esp", 1);
        let b = key("A.esm", 2);
        let c = key("A.esm", 3);
        for k in [&a, &b, &c] {
            store.put("FACT", k, attrs(&[("rank", Value::Int(0))]), "x", Policy::LastWins);
        }
        store.set_label(&a, "alpha", Policy::LastWins);
        store.set_label(&b, "Beta", Policy::LastWins);
        store.set_label(&c, "beta", Policy::LastWins);

        let order: Vec<&FormKey> = store.sorted_entries().iter().map(|e| e.key).collect();
        assert_eq!(order, vec![&a, &b, &c]);
    }

    #[test]
    fn test_label_policy() {
        let mut store = MergeStore::new();
        let k = key("A.esm", 1);
        store.set_label(&k, "First", Policy::FirstWins);
        store.set_label(&k, "Second", Policy::FirstWins);
        assert_eq!(store.label(&k), Some("First"));
        store.set_label(&k, "Third", Policy::LastWins);
        assert_eq!(store.label(&k), Some("Third"));
        store.set_label(&k, "", Policy::LastWins);
        assert_eq!(store.label(&k), Some("Third"));
        assert_eq!(store.display_label(&key("A.esm", 2)), UNKNOWN_LABEL);
    }
}
