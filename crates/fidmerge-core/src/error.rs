//! Error types for fidmerge-core

use crate::formid::{FormId, FormKey};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in fidmerge-core
#[derive(Debug, Error)]
pub enum Error {
    /// A local address names a master index the source does not have
    #[error("{id} in '{source_name}' points past its {masters} master(s)")]
    UnresolvedMaster {
        source_name: String,
        id: FormId,
        masters: usize,
    },

    /// The target does not list the key's source as a master (strict policy)
    #[error("'{target}' has no master '{master}' (needed for {key})")]
    MissingMaster {
        target: String,
        master: String,
        key: FormKey,
    },

    /// Adding another master would overflow the 8-bit master index
    #[error("'{target}' cannot take more than {limit} masters")]
    MasterLimit { target: String, limit: usize },

    /// A source could not be opened or parsed
    #[error("failed to load source '{name}': {message}")]
    SourceLoad { name: String, message: String },

    /// A source could not be persisted
    #[error("failed to save source '{name}': {message}")]
    SourceSave { name: String, message: String },

    /// A record the caller asked for is not in the source
    #[error("no {group} record {id} in '{source_name}'")]
    NoRecord {
        source_name: String,
        group: String,
        id: FormId,
    },

    /// A write was attempted through a read-only handle
    #[error("source '{0}' was opened read-only")]
    ReadOnly(String),

    /// No patcher preset has this name
    #[error("unknown patcher '{0}'")]
    UnknownPatcher(String),

    /// The schema has no definition for a record group
    #[error("unknown record group '{0}'")]
    UnknownGroup(String),

    /// A schema definition is inconsistent
    #[error("invalid schema for group '{group}': {message}")]
    Schema { group: String, message: String },

    /// A text field could not be coerced to its attribute type
    #[error("cannot read '{raw}' as {expected}")]
    Coercion { raw: String, expected: &'static str },

    /// A value has no text representation in its column
    #[error("attribute '{attribute}' of {key} cannot be written as text")]
    Encode { attribute: String, key: FormKey },

    /// The container bytes are not a source file we understand
    #[error("'{path}' is not a source container: {message}")]
    BadContainer { path: PathBuf, message: String },

    /// Failed to read a file
    #[error("failed to read file '{path}': {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// CSV error from the csv crate
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Binary container encoding error
    #[error("container encoding error: {0}")]
    Postcard(#[from] postcard::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Wrap any displayable failure as a load error for `name`.
    pub(crate) fn load(name: &str, err: impl std::fmt::Display) -> Self {
        Error::SourceLoad {
            name: name.to_string(),
            message: err.to_string(),
        }
    }

    /// Wrap any displayable failure as a save error for `name`.
    pub(crate) fn save(name: &str, err: impl std::fmt::Display) -> Self {
        Error::SourceSave {
            name: name.to_string(),
            message: err.to_string(),
        }
    }
}
