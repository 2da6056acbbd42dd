//! The on-disk record model of a source
//!
//! A source file is the magic bytes `FMRG`, a format version byte, then a
//! postcard-encoded [`PluginFile`]: the ordered master list and, per record
//! group, the records in file order. Records reference each other through
//! local [`FormId`]s only.

use crate::error::{Error, Result};
use crate::formid::{FormId, MAX_MASTERS};
use crate::value::{LocalValue, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Leading bytes of every source container
pub const MAGIC: &[u8; 4] = b"FMRG";

/// Current container version
pub const FORMAT_VERSION: u8 = 1;

/// Record state flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFlags {
    pub deleted: bool,
    pub ignored: bool,
}

impl RecordFlags {
    /// Neither deleted nor ignored
    pub fn is_active(self) -> bool {
        !self.deleted && !self.ignored
    }
}

/// One record as stored in a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: FormId,
    pub flags: RecordFlags,
    pub fields: BTreeMap<String, LocalValue>,
}

impl StoredRecord {
    pub fn new(id: FormId) -> Self {
        Self {
            id,
            flags: RecordFlags::default(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter
    pub fn with(mut self, field: impl Into<String>, value: impl Into<LocalValue>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn deleted(mut self) -> Self {
        self.flags.deleted = true;
        self
    }

    /// Neither deleted nor ignored
    pub fn is_active(&self) -> bool {
        self.flags.is_active()
    }
}

/// A whole source file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginFile {
    pub masters: Vec<String>,
    pub groups: BTreeMap<String, Vec<StoredRecord>>,
}

impl PluginFile {
    pub fn new(masters: Vec<String>) -> Self {
        Self {
            masters,
            groups: BTreeMap::new(),
        }
    }

    /// Append a record to `group`
    pub fn add_record(&mut self, group: &str, record: StoredRecord) {
        self.groups.entry(group.to_string()).or_default().push(record);
    }

    pub fn records(&self, group: &str) -> &[StoredRecord] {
        self.groups.get(group).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The record `id` of `group`; an active one is preferred when a deleted
    /// or ignored duplicate shares the id
    pub fn record_mut(&mut self, group: &str, id: FormId) -> Option<&mut StoredRecord> {
        let records = self.groups.get_mut(group)?;
        let index = records
            .iter()
            .position(|r| r.id == id && r.is_active())
            .or_else(|| records.iter().position(|r| r.id == id))?;
        records.get_mut(index)
    }

    /// Index the file uses for its own records
    pub fn own_index(&self) -> usize {
        self.masters.len()
    }

    /// Append a master and move the file's own records (and references to
    /// them) to the new own index
    pub fn push_master(&mut self, name: String) -> Result<()> {
        if self.masters.len() >= MAX_MASTERS {
            return Err(Error::MasterLimit {
                target: format!("source gaining '{}'", name),
                limit: MAX_MASTERS,
            });
        }
        let from = self.own_index();
        self.masters.push(name);
        let to = self.own_index() as u8;
        let remap = |id: FormId| {
            if id.master_index() == from {
                id.with_master_index(to)
            } else {
                id
            }
        };

        for record in self.groups.values_mut().flat_map(|records| records.iter_mut()) {
            record.id = remap(record.id);
            for value in record.fields.values_mut() {
                if let Value::Links(links) = value {
                    *links = links.iter().map(|(id, rank)| (remap(*id), *rank)).collect();
                }
            }
        }
        Ok(())
    }

    /// Serialize to container bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(MAGIC);
        bytes.push(FORMAT_VERSION);
        bytes.extend(postcard::to_allocvec(self)?);
        Ok(bytes)
    }

    /// Parse container bytes; `path` is only used for messages
    pub fn from_bytes(path: &Path, bytes: &[u8]) -> Result<Self> {
        let bad = |message: String| Error::BadContainer {
            path: path.to_path_buf(),
            message,
        };
        let body = bytes
            .strip_prefix(MAGIC.as_slice())
            .ok_or_else(|| bad("missing magic".to_string()))?;
        match body.split_first() {
            Some((&FORMAT_VERSION, rest)) => {
                postcard::from_bytes(rest).map_err(|e| bad(e.to_string()))
            }
            Some((version, _)) => Err(bad(format!("unsupported version {}", version))),
            None => Err(bad("truncated header".to_string())),
        }
    }

    /// Load a source file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|e| Error::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_bytes(path, &bytes)
    }

    /// Write to `path` through a temporary file in the same directory, so the
    /// previous file survives any failure before the final rename
    pub fn save_atomic<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let bytes = self.to_bytes()?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}
