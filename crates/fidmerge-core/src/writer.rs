//! Write the merged state into a target source as a minimal set of changes
//!
//! A write runs in three steps. First every change is planned in global form
//! by comparing the target's records with the store. Then every reference the
//! changes need is made addressable in the target, which may add masters.
//! Finally the target's records are listed again and the changes applied by
//! key, so ids renumbered by a new master are never used stale.

use crate::alias::AliasTable;
use crate::backend::{Backend, RecordView, SourceHandle};
use crate::error::{Error, Result};
use crate::formid::{AddressResolver, FormId, FormKey, MasterList, MasterPolicy};
use crate::schema::{GroupSchema, Schema};
use crate::script::{rename_tokens, RenameMap};
use crate::store::{MergeEntry, MergeStore};
use crate::value::{LocalValue, Value};
use serde::Serialize;
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};

/// Script groups and fields rewritten when editor ids are renamed
pub const SCRIPT_GROUP: &str = "SCPT";
pub const SCRIPT_FIELD: &str = "script_text";
pub const QUEST_GROUP: &str = "QUST";
pub const QUEST_FIELD: &str = "stage_scripts";

/// One attribute changed in the target
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub group: String,
    pub key: FormKey,
    pub attribute: String,
    /// Value before the write; `None` when the record did not have the attribute
    pub old: Option<Value>,
    pub new: Value,
}

/// Final state of a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteState {
    /// Nothing differed; the target was not written
    Unchanged,
    Saved,
}

/// Result of [`DiffWriter::write`]
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    pub target: String,
    pub changes: Vec<Change>,
    /// Changed records per group
    pub counts: BTreeMap<String, usize>,
    /// Masters added to the target
    pub added_masters: Vec<String>,
    pub state: WriteState,
}

impl WriteOutcome {
    pub fn changed_records(&self) -> usize {
        self.counts.values().sum()
    }
}

/// Computes and applies changesets
#[derive(Debug, Clone)]
pub struct DiffWriter<'a> {
    schema: &'a Schema,
    resolver: AddressResolver<'a>,
    master_policy: MasterPolicy,
    renames: RenameMap,
    propagate_renames: bool,
}

impl<'a> DiffWriter<'a> {
    pub fn new(schema: &'a Schema, aliases: &'a AliasTable) -> Self {
        Self {
            schema,
            resolver: AddressResolver::new(aliases),
            master_policy: MasterPolicy::default(),
            renames: RenameMap::new(),
            propagate_renames: false,
        }
    }

    pub fn with_master_policy(mut self, policy: MasterPolicy) -> Self {
        self.master_policy = policy;
        self
    }

    /// Rewrite scripts for changed labels and for `explicit` renames
    pub fn with_rename_propagation(mut self, explicit: RenameMap) -> Self {
        self.renames = explicit;
        self.propagate_renames = true;
        self
    }

    /// Bring `groups` of `target` in line with `store`
    pub fn write<B: Backend>(
        &self,
        backend: &mut B,
        target: &str,
        store: &MergeStore,
        groups: &[String],
    ) -> Result<WriteOutcome> {
        let schemas = groups
            .iter()
            .map(|g| self.schema.require(g))
            .collect::<Result<Vec<_>>>()?;
        let mut handle = backend.open_source(target, true, true)?;

        let mut changes = Vec::new();
        for group in &schemas {
            for record in handle.records(&group.tag).iter().filter(|r| r.is_active()) {
                let key = match self.resolver.to_global(&handle, record.id) {
                    Ok(key) => key,
                    Err(e) => {
                        tracing::debug!("skipping {} record in '{}': {}", group.tag, target, e);
                        continue;
                    }
                };
                if let Some(entry) = store.get(&group.tag, &key) {
                    self.diff_record(&handle, group, &key, record, entry, &mut changes);
                }
            }
        }
        if self.propagate_renames {
            let renames = self.collect_renames(&schemas, &changes);
            if !renames.is_empty() {
                self.plan_script_renames(&handle, &renames, &mut changes);
            }
        }

        let masters_before = handle.masters().len();
        for change in &changes {
            if let Value::Links(links) = &change.new {
                for linked in links.keys() {
                    self.resolver.to_local(&mut handle, linked, self.master_policy)?;
                }
            }
        }
        let added_masters = handle.masters()[masters_before..].to_vec();

        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        let mut ids: BTreeMap<(String, FormKey), FormId> = BTreeMap::new();
        let mut indexed = BTreeSet::new();
        for change in &changes {
            if !indexed.insert(change.group.as_str()) {
                continue;
            }
            for record in handle.records(&change.group).iter().filter(|r| r.is_active()) {
                if let Ok(key) = self.resolver.to_global(&handle, record.id) {
                    ids.entry((change.group.clone(), key)).or_insert(record.id);
                }
            }
        }
        let mut touched = BTreeSet::new();
        for change in &changes {
            let id = ids
                .get(&(change.group.clone(), change.key.clone()))
                .copied()
                .ok_or_else(|| Error::NoRecord {
                    source_name: target.to_string(),
                    group: change.group.clone(),
                    id: FormId::new(0, change.key.object),
                })?;
            let local: LocalValue = change.new.map_refs(|k| {
                self.resolver.lookup_local(&handle, k).ok_or_else(|| Error::MissingMaster {
                    target: target.to_string(),
                    master: k.source.clone(),
                    key: k.clone(),
                })
            })?;
            handle.set(&change.group, id, &change.attribute, local)?;
            if touched.insert((change.group.clone(), change.key.clone())) {
                *counts.entry(change.group.clone()).or_default() += 1;
            }
        }

        let state = if changes.is_empty() && added_masters.is_empty() {
            WriteState::Unchanged
        } else {
            handle.save()?;
            WriteState::Saved
        };
        drop(handle);

        match state {
            WriteState::Saved => tracing::info!(
                "{}: {} change(s) in {} record(s) via {}",
                target,
                changes.len(),
                counts.values().sum::<usize>(),
                backend.name()
            ),
            WriteState::Unchanged => tracing::info!("{}: no changes", target),
        }
        Ok(WriteOutcome {
            target: target.to_string(),
            changes,
            counts,
            added_masters,
            state,
        })
    }

    /// Plan changes for one record
    fn diff_record<H: SourceHandle>(
        &self,
        handle: &H,
        group: &GroupSchema,
        key: &FormKey,
        record: &RecordView,
        entry: &MergeEntry,
        changes: &mut Vec<Change>,
    ) {
        for spec in &group.attributes {
            let Some(desired) = entry.get(&spec.name) else {
                continue;
            };
            let current = match record
                .get(&spec.name)
                .map(|v| v.map_refs(|id| self.resolver.to_global(handle, *id)))
                .transpose()
            {
                Ok(current) => current.map(|v| spec.conform(v)),
                Err(e) => {
                    tracing::debug!("skipping {}.{} of {}: {}", group.tag, spec.name, key, e);
                    continue;
                }
            };
            let new = match (desired, &current) {
                (Value::Links(wanted), current) => {
                    let mut merged = match current {
                        Some(Value::Links(have)) => have.clone(),
                        _ => BTreeMap::new(),
                    };
                    let mut delta = false;
                    for (linked, rank) in wanted {
                        if merged.get(linked) != Some(rank) {
                            merged.insert(linked.clone(), *rank);
                            delta = true;
                        }
                    }
                    if !delta {
                        continue;
                    }
                    Value::Links(merged)
                }
                (Value::None, None) => continue,
                (desired, Some(current)) if desired == current => continue,
                (desired, _) => desired.clone(),
            };
            changes.push(Change {
                group: group.tag.clone(),
                key: key.clone(),
                attribute: spec.name.clone(),
                old: current,
                new,
            });
        }
    }

    /// Explicit renames plus every label attribute the plan changes
    fn collect_renames(&self, schemas: &[&GroupSchema], changes: &[Change]) -> RenameMap {
        let mut renames = self.renames.clone();
        for change in changes {
            let is_label = schemas
                .iter()
                .any(|g| {
                    g.tag == change.group && g.label.as_deref() == Some(change.attribute.as_str())
                });
            if let (true, Some(Value::String(old)), Value::String(new)) =
                (is_label, &change.old, &change.new)
            {
                renames.insert(old, new);
            }
        }
        let cycles = renames.cycles().join(", ");
        if !cycles.is_empty() {
            tracing::warn!("editor id renames form a cycle, left alone: {}", cycles);
        }
        renames
    }

    fn plan_script_renames<H: SourceHandle>(
        &self,
        handle: &H,
        renames: &RenameMap,
        changes: &mut Vec<Change>,
    ) {
        for (group, field) in [(SCRIPT_GROUP, SCRIPT_FIELD), (QUEST_GROUP, QUEST_FIELD)] {
            for record in handle.records(group).iter().filter(|r| r.is_active()) {
                let new = match record.get(field) {
                    Some(Value::String(text)) => match rename_tokens(text, renames) {
                        Cow::Owned(renamed) => Value::String(renamed),
                        Cow::Borrowed(_) => continue,
                    },
                    Some(Value::Texts(texts)) => {
                        let renamed: Vec<String> = texts
                            .iter()
                            .map(|t| rename_tokens(t, renames).into_owned())
                            .collect();
                        if renamed == *texts {
                            continue;
                        }
                        Value::Texts(renamed)
                    }
                    _ => continue,
                };
                let Ok(key) = self.resolver.to_global(handle, record.id) else {
                    continue;
                };
                let old = record
                    .get(field)
                    .and_then(|v| v.map_refs(|id| self.resolver.to_global(handle, *id)).ok());
                tracing::debug!("renaming editor ids in {} {}", group, key);
                changes.push(Change {
                    group: group.to_string(),
                    key,
                    attribute: field.to_string(),
                    old,
                    new,
                });
            }
        }
    }
}
