//! Backend delegating to an in-process collection engine
//!
//! The [`Collection`] loads sources into one shared store where every record
//! and reference is held in long (global) form, the way full editing engines
//! work. Handles convert to and from the source's local form at the boundary,
//! so callers see exactly what [`LocalBackend`](super::LocalBackend) shows.

use super::{Backend, RecordView, SourceHandle};
use crate::error::{Error, Result};
use crate::formid::{FormId, FormKey, MasterList, MAX_MASTERS};
use crate::model::{PluginFile, RecordFlags, StoredRecord};
use crate::value::{LocalValue, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A reference as the engine holds it
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum EngineRef {
    Key(FormKey),
    /// An id whose master index was out of range when the source was loaded;
    /// kept verbatim so it can be reported and written back unchanged
    Dangling(FormId),
}

#[derive(Debug, Clone)]
struct EngineRecord {
    target: EngineRef,
    flags: RecordFlags,
    fields: BTreeMap<String, Value<EngineRef>>,
}

impl EngineRecord {
    fn is_active(&self) -> bool {
        self.flags.is_active()
    }
}

#[derive(Debug)]
struct LoadedMod {
    masters: Vec<String>,
    groups: BTreeMap<String, Vec<EngineRecord>>,
    users: usize,
}

impl LoadedMod {
    fn to_engine(&self, name: &str, id: FormId) -> EngineRef {
        let index = id.master_index();
        match index.cmp(&self.masters.len()) {
            std::cmp::Ordering::Less => {
                EngineRef::Key(FormKey::new(self.masters[index].clone(), id.object()))
            }
            std::cmp::Ordering::Equal => EngineRef::Key(FormKey::new(name, id.object())),
            std::cmp::Ordering::Greater => EngineRef::Dangling(id),
        }
    }

    fn to_local(&self, name: &str, target: &EngineRef) -> FormId {
        match target {
            EngineRef::Dangling(id) => *id,
            EngineRef::Key(key) => {
                let index = if key.source == name {
                    Some(self.masters.len())
                } else {
                    self.masters.iter().position(|m| *m == key.source)
                };
                // Keys only ever come from this mod's own masters.
                FormId::new(index.unwrap_or(usize::from(u8::MAX)) as u8, key.object)
            }
        }
    }

    fn value_to_engine(&self, name: &str, value: &LocalValue) -> Value<EngineRef> {
        match value.map_refs(|id| Ok(self.to_engine(name, *id))) {
            Ok(v) => v,
            Err(_) => Value::None,
        }
    }

    fn value_to_local(&self, name: &str, value: &Value<EngineRef>) -> LocalValue {
        match value.map_refs(|r| Ok(self.to_local(name, r))) {
            Ok(v) => v,
            Err(_) => Value::None,
        }
    }
}

/// An editing engine holding loaded sources in global form
#[derive(Debug)]
pub struct Collection {
    data_dir: PathBuf,
    mods: BTreeMap<String, LoadedMod>,
}

impl Collection {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            mods: BTreeMap::new(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Names of the sources currently loaded
    pub fn loaded(&self) -> impl Iterator<Item = &str> {
        self.mods.keys().map(String::as_str)
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.mods.contains_key(name)
    }

    /// Load `name` (or take another reference to it if already loaded)
    pub fn add_mod(&mut self, name: &str) -> Result<()> {
        if let Some(loaded) = self.mods.get_mut(name) {
            loaded.users += 1;
            return Ok(());
        }
        let file = PluginFile::load(self.data_dir.join(name)).map_err(|e| Error::load(name, e))?;
        let mut loaded = LoadedMod {
            masters: file.masters,
            groups: BTreeMap::new(),
            users: 1,
        };
        for (group, records) in file.groups {
            let converted = records
                .iter()
                .map(|r| EngineRecord {
                    target: loaded.to_engine(name, r.id),
                    flags: r.flags,
                    fields: r
                        .fields
                        .iter()
                        .map(|(k, v)| (k.clone(), loaded.value_to_engine(name, v)))
                        .collect(),
                })
                .collect();
            loaded.groups.insert(group, converted);
        }
        self.mods.insert(name.to_string(), loaded);
        Ok(())
    }

    /// Load `name` and its whole master chain; returns every source this call
    /// took a reference to
    pub fn add_with_masters(&mut self, name: &str) -> Result<Vec<String>> {
        let mut taken = Vec::new();
        let result = self.add_mod(name).and_then(|()| {
            taken.push(name.to_string());
            self.add_masters_of(name, &mut vec![name.to_string()], &mut taken)
        });
        if let Err(e) = result {
            for loaded in taken.iter().rev() {
                self.unload(loaded);
            }
            return Err(e);
        }
        Ok(taken)
    }

    fn add_masters_of(
        &mut self,
        name: &str,
        stack: &mut Vec<String>,
        taken: &mut Vec<String>,
    ) -> Result<()> {
        let masters = self.get(name)?.masters.clone();
        for master in &masters {
            if stack.contains(master) {
                return Err(Error::load(name, format!("master cycle through '{}'", master)));
            }
            if taken.contains(master) {
                continue;
            }
            self.add_mod(master)
                .map_err(|e| Error::load(name, format!("master unavailable: {}", e)))?;
            taken.push(master.clone());
            stack.push(master.clone());
            self.add_masters_of(master, stack, taken)?;
            stack.pop();
        }
        Ok(())
    }

    /// Drop one reference to `name`, unloading it when none are left
    pub fn unload(&mut self, name: &str) {
        let remove = match self.mods.get_mut(name) {
            Some(loaded) => {
                loaded.users = loaded.users.saturating_sub(1);
                loaded.users == 0
            }
            None => false,
        };
        if remove {
            self.mods.remove(name);
        }
    }

    fn get(&self, name: &str) -> Result<&LoadedMod> {
        self.mods.get(name).ok_or_else(|| Error::load(name, "not loaded"))
    }

    fn get_mut(&mut self, name: &str) -> Result<&mut LoadedMod> {
        self.mods.get_mut(name).ok_or_else(|| Error::load(name, "not loaded"))
    }

    /// Write a loaded source back to disk in local form
    pub fn save_mod(&self, name: &str) -> Result<()> {
        let loaded = self.get(name).map_err(|e| Error::save(name, e))?;
        let mut file = PluginFile::new(loaded.masters.clone());
        for (group, records) in &loaded.groups {
            for record in records {
                file.add_record(
                    group,
                    StoredRecord {
                        id: loaded.to_local(name, &record.target),
                        flags: record.flags,
                        fields: record
                            .fields
                            .iter()
                            .map(|(k, v)| (k.clone(), loaded.value_to_local(name, v)))
                            .collect(),
                    },
                );
            }
        }
        file.save_atomic(self.data_dir.join(name))
            .map_err(|e| Error::save(name, e))
    }
}

/// Backend running every operation through a [`Collection`]
#[derive(Debug)]
pub struct CollectionBackend {
    engine: Collection,
}

impl CollectionBackend {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: Collection::new(data_dir),
        }
    }

    pub fn engine(&self) -> &Collection {
        &self.engine
    }
}

impl Backend for CollectionBackend {
    type Handle<'a> = CollectionHandle<'a>;

    fn name(&self) -> &'static str {
        "collection"
    }

    fn open_source(
        &mut self,
        name: &str,
        load_masters: bool,
        writable: bool,
    ) -> Result<CollectionHandle<'_>> {
        let taken = if load_masters {
            self.engine.add_with_masters(name)?
        } else {
            self.engine.add_mod(name)?;
            vec![name.to_string()]
        };
        tracing::debug!("collection opened '{}' ({} source(s) referenced)", name, taken.len());
        Ok(CollectionHandle {
            engine: &mut self.engine,
            name: name.to_string(),
            taken,
            writable,
            dirty: false,
        })
    }
}

/// A source opened through the collection engine
#[derive(Debug)]
pub struct CollectionHandle<'a> {
    engine: &'a mut Collection,
    name: String,
    taken: Vec<String>,
    writable: bool,
    dirty: bool,
}

impl CollectionHandle<'_> {
    fn loaded(&self) -> Option<&LoadedMod> {
        self.engine.mods.get(&self.name)
    }

    fn check_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(Error::ReadOnly(self.name.clone()))
        }
    }
}

impl Drop for CollectionHandle<'_> {
    fn drop(&mut self) {
        for name in self.taken.iter().rev() {
            self.engine.unload(name);
        }
    }
}

impl MasterList for CollectionHandle<'_> {
    fn source_name(&self) -> &str {
        &self.name
    }

    fn masters(&self) -> &[String] {
        self.loaded().map(|m| m.masters.as_slice()).unwrap_or(&[])
    }

    fn push_master(&mut self, name: String) -> Result<()> {
        self.check_writable()?;
        let loaded = self.engine.get_mut(&self.name)?;
        if loaded.masters.len() >= MAX_MASTERS {
            return Err(Error::MasterLimit {
                target: self.name.clone(),
                limit: MAX_MASTERS,
            });
        }
        loaded.masters.push(name);
        self.dirty = true;
        Ok(())
    }
}

impl SourceHandle for CollectionHandle<'_> {
    fn groups(&self) -> Vec<String> {
        self.loaded()
            .map(|m| m.groups.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn records(&self, group: &str) -> Vec<RecordView> {
        let Some(loaded) = self.loaded() else {
            return Vec::new();
        };
        loaded
            .groups
            .get(group)
            .map(|records| {
                records
                    .iter()
                    .map(|r| RecordView {
                        id: loaded.to_local(&self.name, &r.target),
                        flags: r.flags,
                        fields: r
                            .fields
                            .iter()
                            .map(|(k, v)| (k.clone(), loaded.value_to_local(&self.name, v)))
                            .collect(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn set(&mut self, group: &str, id: FormId, attribute: &str, value: LocalValue) -> Result<()> {
        self.check_writable()?;
        let name = self.name.clone();
        let loaded = self.engine.get_mut(&name)?;
        let target = loaded.to_engine(&name, id);
        let value = loaded.value_to_engine(&name, &value);
        let record = loaded
            .groups
            .get_mut(group)
            .and_then(|records| {
                let index = records
                    .iter()
                    .position(|r| r.target == target && r.is_active())
                    .or_else(|| records.iter().position(|r| r.target == target))?;
                records.get_mut(index)
            })
            .ok_or_else(|| Error::NoRecord {
                source_name: name.clone(),
                group: group.to_string(),
                id,
            })?;
        if record.fields.get(attribute) != Some(&value) {
            record.fields.insert(attribute.to_string(), value);
            self.dirty = true;
        }
        Ok(())
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn save(&mut self) -> Result<()> {
        self.check_writable()?;
        self.engine.save_mod(&self.name)?;
        self.dirty = false;
        tracing::info!("collection saved '{}'", self.name);
        Ok(())
    }
}
