//! fidmerge-core: load-order-aware merging of plugin records
//!
//! This library provides functionality to:
//! - Resolve source-local record ids into stable cross-source keys
//! - Collect record attributes from an ordered load list into a merge store
//! - Exchange the merged state as CSV interchange text
//! - Write the merged state back into a target source as a minimal changeset
//! - Carry editor id renames into script text
//! - Swap references from one record to another across a source

pub mod alias;
pub mod backend;
pub mod codec;
pub mod collector;
pub mod config;
pub mod error;
pub mod formid;
pub mod journal;
pub mod model;
pub mod patchers;
pub mod replace;
pub mod schema;
pub mod script;
pub mod store;
pub mod value;
pub mod writer;

pub use alias::AliasTable;
pub use backend::{Backend, BackendKind, CollectionBackend, LocalBackend, RecordView, SourceHandle};
pub use codec::{DecodeReport, TextCodec};
pub use collector::{CollectReport, CollectSession, SourceCollector};
pub use config::RunConfig;
pub use error::{Error, Result};
pub use formid::{AddressResolver, FormId, FormKey, MasterList, MasterPolicy};
pub use journal::{Journal, JournalEntry};
pub use model::{PluginFile, RecordFlags, StoredRecord};
pub use patchers::Patcher;
pub use replace::{IdReplacements, IdReplacer, ReplaceOutcome};
pub use schema::{AttrKind, AttrSpec, GroupSchema, Layout, Schema, NONE_FIELD};
pub use script::{rename_tokens, RenameMap};
pub use store::{MergeEntry, MergeStore, Policy};
pub use value::{LocalValue, Value};
pub use writer::{Change, DiffWriter, WriteOutcome, WriteState};
