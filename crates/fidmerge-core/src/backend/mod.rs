//! Backend abstraction over source storage
//!
//! Everything above this module (collector, writer) talks to sources only
//! through [`Backend`] and [`SourceHandle`]. Two engines implement them:
//!
//! - [`LocalBackend`]: parses each source file on demand and works on its
//!   local-form records directly.
//! - [`CollectionBackend`]: delegates to a [`Collection`], an editing engine
//!   that keeps every loaded source in global form and converts at the edges.
//!
//! Both must give identical results for every operation; the tests in
//! `tests/backends.rs` run the same scenarios against each.

pub mod collection;
pub mod local;

pub use collection::{Collection, CollectionBackend, CollectionHandle};
pub use local::{LocalBackend, LocalHandle};

use crate::error::Result;
use crate::formid::{FormId, MasterList};
use crate::model::RecordFlags;
use crate::value::LocalValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Snapshot of one record, in the local form of the source it was read from
#[derive(Debug, Clone, PartialEq)]
pub struct RecordView {
    pub id: FormId,
    pub flags: RecordFlags,
    pub fields: BTreeMap<String, LocalValue>,
}

impl RecordView {
    pub fn get(&self, attribute: &str) -> Option<&LocalValue> {
        self.fields.get(attribute)
    }

    /// The record's editor id, if it has a non-empty one
    pub fn eid(&self) -> Option<&str> {
        self.get("eid").and_then(LocalValue::as_str).filter(|s| !s.is_empty())
    }

    pub fn is_active(&self) -> bool {
        self.flags.is_active()
    }
}

/// An open source
///
/// Dropping the handle releases the source and any masters opened with it.
pub trait SourceHandle: MasterList {
    /// Tags of the groups the source holds records in, sorted
    fn groups(&self) -> Vec<String>;

    /// Records of `group` in file order, inactive ones included
    fn records(&self, group: &str) -> Vec<RecordView>;

    /// Set one attribute of the record `id` in `group`
    fn set(&mut self, group: &str, id: FormId, attribute: &str, value: LocalValue) -> Result<()>;

    fn is_writable(&self) -> bool;

    /// Whether anything was set since the source was opened or last saved
    fn is_dirty(&self) -> bool;

    /// Persist atomically. Fails with `SourceSave`.
    fn save(&mut self) -> Result<()>;

    /// Release the source; equivalent to dropping the handle
    fn close(self)
    where
        Self: Sized,
    {
    }
}

/// A source storage engine
pub trait Backend {
    type Handle<'a>: SourceHandle
    where
        Self: 'a;

    /// Short engine name for logs
    fn name(&self) -> &'static str;

    /// Open `name`. With `load_masters` the whole master chain is loaded
    /// (read-only) alongside it and a missing or cyclic master is a load
    /// error. Fails with `SourceLoad`.
    fn open_source(
        &mut self,
        name: &str,
        load_masters: bool,
        writable: bool,
    ) -> Result<Self::Handle<'_>>;
}

/// Which engine a run uses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    Collection,
}
