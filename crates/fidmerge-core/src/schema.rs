//! Record group schemas and per-attribute coercion
//!
//! A [`Schema`] is built once at startup (usually from a patcher preset) and
//! then only read. It tells the collector which attributes to pull out of each
//! record group, the writer which attributes to diff, and the text codec how
//! to lay out and coerce columns.
//!
//! A text field has three shapes besides a plain value. An empty field means
//! the attribute is not set. [`NONE_FIELD`] stands for [`Value::None`]. A
//! string that is empty or starts with a backslash gets one extra leading
//! backslash, so neither can be mistaken for the other two.

use crate::error::{Error, Result};
use crate::value::{format_float, Value};
use std::collections::BTreeMap;

/// Text form of [`Value::None`]
pub const NONE_FIELD: &str = "\\N";

fn escape_string(text: &str) -> String {
    if text.is_empty() || text.starts_with('\\') {
        format!("\\{}", text)
    } else {
        text.to_string()
    }
}

/// The type of an attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrKind {
    String,
    Int,
    Float,
    /// Set of `(reference, rank)` pairs
    Links,
    /// Ordered text bodies; never exchanged as text rows
    Texts,
}

impl AttrKind {
    /// Coerce a raw text field
    pub fn coerce(self, raw: &str) -> Result<Value> {
        let fail = |expected| Error::Coercion {
            raw: raw.to_string(),
            expected,
        };
        match self {
            AttrKind::String => Ok(Value::String(raw.to_string())),
            AttrKind::Int => raw
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| fail("an integer")),
            AttrKind::Float => match raw.trim().parse::<f64>() {
                Ok(x) if x.is_finite() => Ok(Value::Float(x)),
                _ => Err(fail("a number")),
            },
            AttrKind::Links | AttrKind::Texts => Err(fail("a single field")),
        }
    }

    pub fn is_scalar(self) -> bool {
        matches!(self, AttrKind::String | AttrKind::Int | AttrKind::Float)
    }
}

/// One attribute of a group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrSpec {
    /// Field name on the record
    pub name: String,
    /// Column header in text exports
    pub header: String,
    pub kind: AttrKind,
    /// Required attributes discard the whole row when they fail to coerce;
    /// optional ones fall back to [`Value::None`]
    pub required: bool,
}

impl AttrSpec {
    pub fn new(name: impl Into<String>, header: impl Into<String>, kind: AttrKind) -> Self {
        Self {
            name: name.into(),
            header: header.into(),
            kind,
            required: true,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Read a text field under this attribute's rules. `Ok(None)` means the
    /// field is empty and the attribute is not set.
    pub fn read(&self, raw: &str) -> Result<Option<Value>> {
        if raw.is_empty() {
            return Ok(None);
        }
        if raw == NONE_FIELD {
            return Ok(Some(Value::None));
        }
        if self.kind == AttrKind::String {
            let text = raw.strip_prefix('\\').unwrap_or(raw);
            return Ok(Some(Value::String(text.to_string())));
        }
        match self.kind.coerce(raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) if self.required => Err(e),
            Err(e) => {
                tracing::debug!("optional '{}' set to none: {}", self.name, e);
                Ok(Some(Value::None))
            }
        }
    }

    /// Text form of a scalar value under this attribute's kind; `None` when
    /// the value has no single-field representation
    pub fn render(&self, value: &Value) -> Option<String> {
        match (self.kind, self.conform(value.clone())) {
            (_, Value::None) => Some(NONE_FIELD.to_string()),
            (AttrKind::String, Value::String(s)) => Some(escape_string(&s)),
            (AttrKind::Int, Value::Int(i)) => Some(i.to_string()),
            (AttrKind::Float, Value::Float(x)) if x.is_finite() => Some(format_float(x)),
            _ => None,
        }
    }

    /// Bring a value read from a record in line with this attribute's kind.
    /// Integers stored under a float attribute become floats; anything else
    /// is returned as is.
    pub fn conform(&self, value: Value) -> Value {
        match (self.kind, value) {
            (AttrKind::Float, Value::Int(i)) => Value::Float(i as f64),
            (_, value) => value,
        }
    }
}

/// How a group is laid out in interchange text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layout {
    /// `Type, Mod Name, ObjectIndex, <attributes...>`; one row per record
    Columns,
    /// `Type, <S> Eid, <S> Mod, <S> Object, <T> Eid, <T> Mod, <T> Object, <rank>`;
    /// one row per link of the group's single links attribute
    Links {
        subject: String,
        target: String,
        rank: String,
    },
}

impl Layout {
    /// Index of the column that must carry a `0x` object id
    pub fn object_column(&self) -> usize {
        match self {
            Layout::Columns => 2,
            Layout::Links { .. } => 3,
        }
    }
}

/// Schema of one record group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSchema {
    /// Four-character group tag (e.g. `NPC_`)
    pub tag: String,
    pub layout: Layout,
    pub attributes: Vec<AttrSpec>,
    /// Attribute that doubles as the record's label (usually `eid`)
    pub label: Option<String>,
    /// Reject labels that are not plain alphanumerics when decoding
    pub strict_labels: bool,
    /// Header of an optional trailing column naming the label's previous
    /// value, used to propagate renames into scripts
    pub rename_column: Option<String>,
    /// Prefix of the read-only comparison columns written after the
    /// attributes (e.g. `Old`), holding a baseline's values
    pub comparison_prefix: Option<String>,
}

impl GroupSchema {
    /// A column-per-attribute group
    pub fn columns(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            layout: Layout::Columns,
            attributes: Vec::new(),
            label: None,
            strict_labels: false,
            rename_column: None,
            comparison_prefix: None,
        }
    }

    /// A row-per-link group around a single links attribute
    pub fn links(tag: impl Into<String>, attribute: AttrSpec, subject: &str, target: &str) -> Self {
        let rank = attribute.header.clone();
        Self {
            tag: tag.into(),
            layout: Layout::Links {
                subject: subject.to_string(),
                target: target.to_string(),
                rank,
            },
            attributes: vec![attribute],
            label: None,
            strict_labels: false,
            rename_column: None,
            comparison_prefix: None,
        }
    }

    pub fn attr(mut self, spec: AttrSpec) -> Self {
        self.attributes.push(spec);
        self
    }

    pub fn with_label(mut self, attribute: impl Into<String>) -> Self {
        self.label = Some(attribute.into());
        self
    }

    pub fn with_strict_labels(mut self) -> Self {
        self.strict_labels = true;
        self
    }

    pub fn with_rename_column(mut self, header: impl Into<String>) -> Self {
        self.rename_column = Some(header.into());
        self
    }

    /// Add one `<prefix> <header>` column per non-label attribute, filled
    /// from a baseline store on export and ignored on import
    pub fn with_comparison(mut self, prefix: impl Into<String>) -> Self {
        self.comparison_prefix = Some(prefix.into());
        self
    }

    /// Attributes mirrored in comparison columns, in column order
    pub fn compared_attributes(&self) -> impl Iterator<Item = &AttrSpec> {
        let enabled = self.comparison_prefix.is_some();
        self.attributes
            .iter()
            .filter(move |a| enabled && self.label.as_deref() != Some(a.name.as_str()))
    }

    pub fn attribute(&self, name: &str) -> Option<&AttrSpec> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// The links attribute of a [`Layout::Links`] group
    pub fn links_attribute(&self) -> Option<&AttrSpec> {
        match self.layout {
            Layout::Links { .. } => self.attributes.first(),
            Layout::Columns => None,
        }
    }

    /// Column headers for text export
    pub fn headers(&self) -> Vec<String> {
        match &self.layout {
            Layout::Columns => {
                let mut headers = vec![
                    "Type".to_string(),
                    "Mod Name".to_string(),
                    "ObjectIndex".to_string(),
                ];
                headers.extend(self.attributes.iter().map(|a| a.header.clone()));
                if let Some(prefix) = &self.comparison_prefix {
                    headers.extend(
                        self.compared_attributes()
                            .map(|a| format!("{} {}", prefix, a.header)),
                    );
                }
                if let Some(rename) = &self.rename_column {
                    headers.push(rename.clone());
                }
                headers
            }
            Layout::Links { subject, target, rank } => vec![
                "Type".to_string(),
                format!("{} Eid", subject),
                format!("{} Mod", subject),
                format!("{} Object", subject),
                format!("{} Eid", target),
                format!("{} Mod", target),
                format!("{} Object", target),
                rank.clone(),
            ],
        }
    }

    fn validate(&self) -> Result<()> {
        let invalid = |message: &str| Error::Schema {
            group: self.tag.clone(),
            message: message.to_string(),
        };
        match self.layout {
            Layout::Columns => {
                if self.attributes.iter().any(|a| a.kind == AttrKind::Links) {
                    return Err(invalid("links attributes need the links layout"));
                }
                if self.comparison_prefix.is_some() && self.rename_column.is_some() {
                    return Err(invalid("comparison columns and a rename column do not mix"));
                }
            }
            Layout::Links { .. } => {
                if self.comparison_prefix.is_some() {
                    return Err(invalid("the links layout has no comparison columns"));
                }
                if self.attributes.len() != 1 || self.attributes[0].kind != AttrKind::Links {
                    return Err(invalid("the links layout takes exactly one links attribute"));
                }
            }
        }
        if let Some(label) = &self.label {
            match self.attribute(label) {
                Some(spec) if spec.kind == AttrKind::String => {}
                _ => return Err(invalid("label must name a string attribute")),
            }
        }
        let mut names: Vec<&str> = self.attributes.iter().map(|a| a.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.attributes.len() {
            return Err(invalid("duplicate attribute name"));
        }
        Ok(())
    }
}

/// Registry of group schemas
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    groups: BTreeMap<String, GroupSchema>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a group, replacing any previous definition for its tag
    pub fn register(&mut self, group: GroupSchema) -> Result<()> {
        group.validate()?;
        self.groups.insert(group.tag.clone(), group);
        Ok(())
    }

    pub fn group(&self, tag: &str) -> Option<&GroupSchema> {
        self.groups.get(tag)
    }

    /// Like [`group`](Self::group) but failing with [`Error::UnknownGroup`]
    pub fn require(&self, tag: &str) -> Result<&GroupSchema> {
        self.group(tag).ok_or_else(|| Error::UnknownGroup(tag.to_string()))
    }

    /// Group tags in sorted order
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    pub fn groups(&self) -> impl Iterator<Item = &GroupSchema> {
        self.groups.values()
    }
}
