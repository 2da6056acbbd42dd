//! Backend that parses each source file on demand

use super::{Backend, RecordView, SourceHandle};
use crate::error::{Error, Result};
use crate::formid::{FormId, MasterList};
use crate::model::PluginFile;
use crate::value::LocalValue;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Reads and writes source files in a data directory, one file at a time
#[derive(Debug, Clone)]
pub struct LocalBackend {
    data_dir: PathBuf,
}

impl LocalBackend {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn load(&self, name: &str) -> Result<PluginFile> {
        PluginFile::load(self.data_dir.join(name)).map_err(|e| Error::load(name, e))
    }

    /// Load every master of `file` (transitively) into `loaded`
    fn load_chain(
        &self,
        name: &str,
        file: &PluginFile,
        stack: &mut Vec<String>,
        loaded: &mut BTreeMap<String, PluginFile>,
    ) -> Result<()> {
        stack.push(name.to_string());
        for master in &file.masters {
            if stack.contains(master) {
                return Err(Error::load(name, format!("master cycle through '{}'", master)));
            }
            if loaded.contains_key(master) {
                continue;
            }
            let master_file = self
                .load(master)
                .map_err(|e| Error::load(name, format!("master unavailable: {}", e)))?;
            self.load_chain(master, &master_file, stack, loaded)?;
            loaded.insert(master.clone(), master_file);
        }
        stack.pop();
        Ok(())
    }
}

impl Backend for LocalBackend {
    type Handle<'a> = LocalHandle;

    fn name(&self) -> &'static str {
        "local"
    }

    fn open_source(
        &mut self,
        name: &str,
        load_masters: bool,
        writable: bool,
    ) -> Result<LocalHandle> {
        let file = self.load(name)?;
        let mut masters = BTreeMap::new();
        if load_masters {
            self.load_chain(name, &file, &mut Vec::new(), &mut masters)?;
        }
        tracing::debug!("opened '{}' ({} master(s) loaded)", name, masters.len());
        Ok(LocalHandle {
            name: name.to_string(),
            path: self.data_dir.join(name),
            file,
            masters,
            writable,
            dirty: false,
        })
    }
}

/// A source parsed into memory
#[derive(Debug)]
pub struct LocalHandle {
    name: String,
    path: PathBuf,
    file: PluginFile,
    masters: BTreeMap<String, PluginFile>,
    writable: bool,
    dirty: bool,
}

impl LocalHandle {
    /// Names of the masters loaded alongside this source
    pub fn loaded_masters(&self) -> impl Iterator<Item = &str> {
        self.masters.keys().map(String::as_str)
    }

    fn check_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(Error::ReadOnly(self.name.clone()))
        }
    }
}

impl MasterList for LocalHandle {
    fn source_name(&self) -> &str {
        &self.name
    }

    fn masters(&self) -> &[String] {
        &self.file.masters
    }

    fn push_master(&mut self, name: String) -> Result<()> {
        self.check_writable()?;
        self.file.push_master(name)?;
        self.dirty = true;
        Ok(())
    }
}

impl SourceHandle for LocalHandle {
    fn groups(&self) -> Vec<String> {
        self.file.groups.keys().cloned().collect()
    }

    fn records(&self, group: &str) -> Vec<RecordView> {
        self.file
            .records(group)
            .iter()
            .map(|r| RecordView {
                id: r.id,
                flags: r.flags,
                fields: r.fields.clone(),
            })
            .collect()
    }

    fn set(&mut self, group: &str, id: FormId, attribute: &str, value: LocalValue) -> Result<()> {
        self.check_writable()?;
        let record = self.file.record_mut(group, id).ok_or_else(|| Error::NoRecord {
            source_name: self.name.clone(),
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
        self.file
            .save_atomic(&self.path)
            .map_err(|e| Error::save(&self.name, e))?;
        self.dirty = false;
        tracing::info!("saved '{}'", self.name);
        Ok(())
    }
}
