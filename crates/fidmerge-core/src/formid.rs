//! Record identities and the mapping between their local and global forms
//!
//! Inside a source a record is addressed by a [`FormId`]: the top byte indexes
//! the source's ordered master list (an index equal to the list length means
//! the source itself) and the low 24 bits are the object id. Across sources the
//! same record is a [`FormKey`]: the canonical name of the defining source plus
//! the object id.

use crate::alias::AliasTable;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Mask for the object id part of a [`FormId`]
pub const OBJECT_MASK: u32 = 0x00FF_FFFF;

/// Highest number of masters a source can declare. Index 255 is then the
/// source's own index.
pub const MAX_MASTERS: usize = 255;

/// A record address local to one source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FormId(u32);

impl FormId {
    /// Build from a master index and an object id (extra high bits are dropped)
    pub const fn new(master_index: u8, object: u32) -> Self {
        Self(((master_index as u32) << 24) | (object & OBJECT_MASK))
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn master_index(self) -> usize {
        (self.0 >> 24) as usize
    }

    pub const fn object(self) -> u32 {
        self.0 & OBJECT_MASK
    }

    /// Same object, different master index
    pub const fn with_master_index(self, master_index: u8) -> Self {
        Self::new(master_index, self.object())
    }
}

impl fmt::Display for FormId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

/// A cross-source stable record identity
///
/// Ordering is by source name, then object id, which makes it a usable final
/// tie-break for every sorted output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FormKey {
    pub source: String,
    pub object: u32,
}

impl FormKey {
    pub fn new(source: impl Into<String>, object: u32) -> Self {
        Self {
            source: source.into(),
            object: object & OBJECT_MASK,
        }
    }

    /// Parse `Source.esp:0x00ABCD` (the form `Display` produces)
    pub fn parse(text: &str) -> Option<Self> {
        let (source, object) = text.rsplit_once(':')?;
        let object = parse_object_id(object)?;
        if source.is_empty() {
            return None;
        }
        Some(Self::new(source, object))
    }
}

/// Parse a `0x`-prefixed object id no wider than 24 bits
pub fn parse_object_id(text: &str) -> Option<u32> {
    let hex = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X"))?;
    u32::from_str_radix(hex, 16)
        .ok()
        .filter(|object| *object <= OBJECT_MASK)
}

impl fmt::Display for FormKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:0x{:06X}", self.source, self.object)
    }
}

/// The ordered master list of a source, plus its own name
pub trait MasterList {
    /// File name of the source itself
    fn source_name(&self) -> &str;

    /// Masters in declaration order
    fn masters(&self) -> &[String];

    /// Append a master. Implementations must keep the source's own records
    /// resolving to the source after its index moves up by one.
    fn push_master(&mut self, name: String) -> Result<()>;
}

/// How `to_local` treats a key whose source the target does not list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MasterPolicy {
    /// Fail with [`Error::MissingMaster`]
    #[default]
    Strict,
    /// Append the source to the target's masters
    Extend,
}

/// Converts addresses between local and global form, applying aliases
#[derive(Debug, Clone, Copy)]
pub struct AddressResolver<'a> {
    aliases: &'a AliasTable,
}

impl<'a> AddressResolver<'a> {
    pub fn new(aliases: &'a AliasTable) -> Self {
        Self { aliases }
    }

    pub fn aliases(&self) -> &'a AliasTable {
        self.aliases
    }

    /// Resolve a local address read from `source`
    pub fn to_global<S: MasterList + ?Sized>(&self, source: &S, id: FormId) -> Result<FormKey> {
        let masters = source.masters();
        let index = id.master_index();
        let name = match index.cmp(&masters.len()) {
            std::cmp::Ordering::Less => masters[index].as_str(),
            std::cmp::Ordering::Equal => source.source_name(),
            std::cmp::Ordering::Greater => {
                return Err(Error::UnresolvedMaster {
                    source_name: source.source_name().to_string(),
                    id,
                    masters: masters.len(),
                })
            }
        };
        Ok(FormKey::new(self.aliases.resolve(name), id.object()))
    }

    /// Local address of `key` inside `target`, extending its masters when the
    /// policy allows it
    pub fn to_local<S: MasterList + ?Sized>(
        &self,
        target: &mut S,
        key: &FormKey,
        policy: MasterPolicy,
    ) -> Result<FormId> {
        if let Some(index) = self.find_index(target, &key.source) {
            return Ok(FormId::new(index as u8, key.object));
        }
        match policy {
            MasterPolicy::Strict => Err(Error::MissingMaster {
                target: target.source_name().to_string(),
                master: key.source.clone(),
                key: key.clone(),
            }),
            MasterPolicy::Extend => {
                if target.masters().len() >= MAX_MASTERS {
                    return Err(Error::MasterLimit {
                        target: target.source_name().to_string(),
                        limit: MAX_MASTERS,
                    });
                }
                let index = target.masters().len();
                tracing::info!(
                    "adding master '{}' to '{}'",
                    key.source,
                    target.source_name()
                );
                target.push_master(key.source.clone())?;
                Ok(FormId::new(index as u8, key.object))
            }
        }
    }

    /// Like [`to_local`](Self::to_local) but never mutates the target
    pub fn lookup_local<S: MasterList + ?Sized>(
        &self,
        target: &S,
        key: &FormKey,
    ) -> Option<FormId> {
        self.find_index(target, &key.source)
            .map(|index| FormId::new(index as u8, key.object))
    }

    fn find_index<S: MasterList + ?Sized>(&self, target: &S, source: &str) -> Option<usize> {
        let masters = target.masters();
        if self.aliases.resolve(target.source_name()) == source {
            return Some(masters.len());
        }
        masters
            .iter()
            .position(|m| self.aliases.resolve(m) == source)
    }
}

/// A bare name plus master list, for callers that only need resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceHeader {
    pub name: String,
    pub masters: Vec<String>,
}

impl SourceHeader {
    pub fn new(name: impl Into<String>, masters: Vec<String>) -> Self {
        Self {
            name: name.into(),
            masters,
        }
    }
}

impl MasterList for SourceHeader {
    fn source_name(&self) -> &str {
        &self.name
    }

    fn masters(&self) -> &[String] {
        &self.masters
    }

    fn push_master(&mut self, name: String) -> Result<()> {
        self.masters.push(name);
        Ok(())
    }
}
