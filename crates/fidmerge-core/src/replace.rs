//! Swap every reference to one record for a reference to another
//!
//! Replacement lists are CSV rows of the form
//! `<any>, Old Mod, Old Object, Old Eid, New Eid, New Mod, New Object`; rows
//! shorter than that or without `0x` object ids are ignored. A pair is only
//! applied when the target can address both records without new masters.

use crate::alias::AliasTable;
use crate::backend::{Backend, SourceHandle};
use crate::error::{Error, Result};
use crate::formid::{parse_object_id, AddressResolver, FormId, FormKey};
use crate::value::Value;
use crate::writer::WriteState;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Old record to new record, with the editor ids the list gave for them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdReplacements {
    map: BTreeMap<FormKey, FormKey>,
    eids: BTreeMap<FormKey, String>,
}

impl IdReplacements {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a swap; a later swap for the same old record wins
    pub fn insert(&mut self, old: FormKey, new: FormKey) {
        self.map.insert(old, new);
    }

    /// Editor id shown for `key` in reports
    pub fn set_eid(&mut self, key: &FormKey, eid: &str) {
        if !eid.is_empty() {
            self.eids.insert(key.clone(), eid.to_string());
        }
    }

    pub fn eid(&self, key: &FormKey) -> Option<&str> {
        self.eids.get(key).map(String::as_str)
    }

    pub fn get(&self, old: &FormKey) -> Option<&FormKey> {
        self.map.get(old)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FormKey, &FormKey)> {
        self.map.iter()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Parse a replacement list, resolving source names through `aliases`
    pub fn decode(bytes: &[u8], aliases: &AliasTable) -> Self {
        let body = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(body);
        let mut replacements = Self::new();
        for (line, result) in reader.records().enumerate() {
            let record = match result {
                Ok(record) => record,
                Err(e) => {
                    tracing::debug!("row {}: {}", line + 1, e);
                    continue;
                }
            };
            if record.len() < 7 {
                continue;
            }
            let key = |source: usize, object: usize| {
                let object = parse_object_id(&record[object])?;
                let source = &record[source];
                (!source.is_empty()).then(|| FormKey::new(aliases.resolve(source), object))
            };
            let (Some(old), Some(new)) = (key(1, 2), key(5, 6)) else {
                continue;
            };
            replacements.set_eid(&old, &record[3]);
            replacements.set_eid(&new, &record[4]);
            replacements.insert(old, new);
        }
        replacements
    }

    pub fn decode_str(text: &str, aliases: &AliasTable) -> Self {
        Self::decode(text.as_bytes(), aliases)
    }

    pub fn read_file<P: AsRef<Path>>(path: P, aliases: &AliasTable) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|e| Error::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let replacements = Self::decode(&bytes, aliases);
        tracing::info!("read {} replacement(s) from {}", replacements.len(), path.display());
        Ok(replacements)
    }
}

/// Result of [`IdReplacer::replace`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaceOutcome {
    pub target: String,
    /// References swapped, per old record
    pub counts: BTreeMap<FormKey, usize>,
    pub state: WriteState,
}

impl ReplaceOutcome {
    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    /// One `count old >> new` line per swapped record, by old editor id
    pub fn report_lines(&self, replacements: &IdReplacements) -> Vec<String> {
        let mut entries: Vec<(&str, &str, usize)> = self
            .counts
            .iter()
            .map(|(old, count)| {
                let new = replacements
                    .get(old)
                    .and_then(|new| replacements.eid(new))
                    .unwrap_or("?");
                (replacements.eid(old).unwrap_or("?"), new, *count)
            })
            .collect();
        entries.sort();
        entries
            .into_iter()
            .map(|(old, new, count)| format!("{:3} {} >> {}", count, old, new))
            .collect()
    }
}

/// Rewrites references inside a target source
#[derive(Debug, Clone, Copy)]
pub struct IdReplacer<'a> {
    resolver: AddressResolver<'a>,
}

impl<'a> IdReplacer<'a> {
    pub fn new(aliases: &'a AliasTable) -> Self {
        Self {
            resolver: AddressResolver::new(aliases),
        }
    }

    /// Swap references in the links values of `groups` of `target` (every
    /// group it holds when `groups` is empty). Saves only when something was
    /// swapped.
    pub fn replace<B: Backend>(
        &self,
        backend: &mut B,
        target: &str,
        replacements: &IdReplacements,
        groups: &[String],
    ) -> Result<ReplaceOutcome> {
        let mut handle = backend.open_source(target, true, true)?;

        let mut swaps: BTreeMap<FormId, (FormId, &FormKey)> = BTreeMap::new();
        for (old, new) in replacements.iter() {
            match (
                self.resolver.lookup_local(&handle, old),
                self.resolver.lookup_local(&handle, new),
            ) {
                (Some(from), Some(to)) => {
                    swaps.insert(from, (to, old));
                }
                _ => tracing::debug!("'{}' cannot address both {} and {}", target, old, new),
            }
        }

        let tags = if groups.is_empty() {
            handle.groups()
        } else {
            groups.to_vec()
        };
        let mut counts: BTreeMap<FormKey, usize> = BTreeMap::new();
        if !swaps.is_empty() {
            for tag in &tags {
                for record in handle.records(tag).iter().filter(|r| r.is_active()) {
                    for (field, value) in &record.fields {
                        let Value::Links(links) = value else {
                            continue;
                        };
                        let mut kept = BTreeMap::new();
                        let mut swapped = Vec::new();
                        for (id, rank) in links {
                            match swaps.get(id) {
                                Some((to, old)) => {
                                    *counts.entry((*old).clone()).or_default() += 1;
                                    swapped.push((*to, *rank));
                                }
                                None => {
                                    kept.insert(*id, *rank);
                                }
                            }
                        }
                        if swapped.is_empty() {
                            continue;
                        }
                        // a member already linking the new record keeps its rank
                        for (to, rank) in swapped {
                            kept.entry(to).or_insert(rank);
                        }
                        handle.set(tag, record.id, field, Value::Links(kept))?;
                    }
                }
            }
        }

        let state = if counts.is_empty() {
            WriteState::Unchanged
        } else {
            handle.save()?;
            WriteState::Saved
        };
        drop(handle);

        tracing::info!(
            "{}: {} reference(s) replaced via {}",
            target,
            counts.values().sum::<usize>(),
            backend.name()
        );
        Ok(ReplaceOutcome {
            target: target.to_string(),
            counts,
            state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use crate::model::{PluginFile, StoredRecord};

    const LIST: &str = "\
        \"Type\",\"Old Mod\",\"Old Object\",\"Old Eid\",\"New Eid\",\"New Mod\",\"New Object\"\n\
        \"FACT\",\"A.esm\",\"0x000010\",\"OldGuild\",\"NewGuild\",\"B.esp\",\"0x000020\"\n\
        \"FACT\",\"A.esm\",\"0x000011\",\"Short\"\n\
        \"FACT\",\"Legacy.esm\",\"0x000012\",\"Rogues\",\"Thieves\",\"A.esm\",\"0x000013\"\n";

    #[test]
    fn test_decode_list() {
        let mut aliases = AliasTable::new();
        aliases.insert("Legacy.esm", "A.esm");
        let replacements = IdReplacements::decode_str(LIST, &aliases);
        assert_eq!(replacements.len(), 2);
        assert_eq!(
            replacements.get(&FormKey::new("A.esm", 0x10)),
            Some(&FormKey::new("B.esp", 0x20))
        );
        assert_eq!(
            replacements.get(&FormKey::new("A.esm", 0x12)),
            Some(&FormKey::new("A.esm", 0x13))
        );
        assert_eq!(replacements.eid(&FormKey::new("B.esp", 0x20)), Some("NewGuild"));
    }

    fn fixture(dir: &Path) {
        PluginFile::new(vec![]).save_atomic(dir.join("A.esm")).unwrap();
        PluginFile::new(vec!["A.esm".into()]).save_atomic(dir.join("B.esp")).unwrap();
        let mut links = BTreeMap::new();
        links.insert(FormId::new(0, 0x10), 2);
        links.insert(FormId::new(0, 0x30), 1);
        let mut both = BTreeMap::new();
        both.insert(FormId::new(0, 0x10), 4);
        both.insert(FormId::new(1, 0x20), 7);
        let mut patch = PluginFile::new(vec!["A.esm".into(), "B.esp".into()]);
        patch.add_record(
            "NPC_",
            StoredRecord::new(FormId::new(0, 1)).with("factions", Value::Links(links)),
        );
        patch.add_record(
            "CREA",
            StoredRecord::new(FormId::new(0, 2)).with("factions", Value::Links(both)),
        );
        patch.save_atomic(dir.join("Patch.esp")).unwrap();
    }

    #[test]
    fn test_replace_counts_and_keeps_other_members() {
        let dir = tempfile::tempdir().unwrap();
        fixture(dir.path());
        let aliases = AliasTable::new();
        let replacements = IdReplacements::decode_str(LIST, &aliases);

        let mut backend = LocalBackend::new(dir.path());
        let replacer = IdReplacer::new(&aliases);
        let outcome = replacer.replace(&mut backend, "Patch.esp", &replacements, &[]).unwrap();
        assert_eq!(outcome.state, WriteState::Saved);
        assert_eq!(outcome.counts[&FormKey::new("A.esm", 0x10)], 2);
        assert_eq!(outcome.report_lines(&replacements), vec!["  2 OldGuild >> NewGuild"]);

        let saved = PluginFile::load(dir.path().join("Patch.esp")).unwrap();
        let npc = saved.records("NPC_")[0].fields["factions"].as_links().unwrap();
        assert_eq!(npc.get(&FormId::new(0, 0x10)), None);
        assert_eq!(npc[&FormId::new(1, 0x20)], 2);
        assert_eq!(npc[&FormId::new(0, 0x30)], 1);
        let crea = saved.records("CREA")[0].fields["factions"].as_links().unwrap();
        assert_eq!(crea.len(), 1);
        assert_eq!(crea[&FormId::new(1, 0x20)], 7);

        let again = replacer.replace(&mut backend, "Patch.esp", &replacements, &[]).unwrap();
        assert_eq!(again.state, WriteState::Unchanged);
    }

    #[test]
    fn test_unaddressable_pairs_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fixture(dir.path());
        let aliases = AliasTable::new();
        let mut replacements = IdReplacements::new();
        replacements.insert(FormKey::new("A.esm", 0x10), FormKey::new("C.esp", 0x1));

        let outcome = IdReplacer::new(&aliases)
            .replace(&mut LocalBackend::new(dir.path()), "Patch.esp", &replacements, &[])
            .unwrap();
        assert_eq!(outcome.state, WriteState::Unchanged);
        assert_eq!(outcome.total(), 0);
    }
}
