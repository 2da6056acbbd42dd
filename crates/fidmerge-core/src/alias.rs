//! Source name aliasing
//!
//! Plugins get renamed or merged into others over time. Text exports and
//! master lists written before the rename still carry the old name, so every
//! place that turns a name into a [`FormKey`](crate::FormKey) goes through
//! [`AliasTable::resolve`] first.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maps historical source names to their canonical replacement
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AliasTable {
    aliases: BTreeMap<String, String>,
}

impl AliasTable {
    /// Create an empty table (every name resolves to itself)
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `old` as another name for `canonical`
    pub fn insert(&mut self, old: impl Into<String>, canonical: impl Into<String>) {
        self.aliases.insert(old.into(), canonical.into());
    }

    /// Canonical name for `name`. A single hop: aliases are not chained.
    pub fn resolve<'a>(&'a self, name: &'a str) -> &'a str {
        self.aliases.get(name).map(String::as_str).unwrap_or(name)
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}

impl FromIterator<(String, String)> for AliasTable {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            aliases: iter.into_iter().collect(),
        }
    }
}

impl From<BTreeMap<String, String>> for AliasTable {
    fn from(aliases: BTreeMap<String, String>) -> Self {
        Self { aliases }
    }
}
