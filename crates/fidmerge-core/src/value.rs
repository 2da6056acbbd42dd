//! Typed attribute values
//!
//! A [`Value`] is generic over the reference type it carries in link sets:
//! records inside a source hold [`FormId`]s, the merge store holds
//! [`FormKey`]s. [`Value::map_refs`] converts between the two.

use crate::error::Result;
use crate::formid::{FormId, FormKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// An attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value<R: Ord = FormKey> {
    /// Explicitly empty (distinct from an attribute that is not set at all)
    None,
    /// Integer value
    Int(i64),
    /// Floating-point value
    Float(f64),
    /// String value
    String(String),
    /// A set of references, each with an integer rank or modifier
    Links(BTreeMap<R, i64>),
    /// Ordered free-form text bodies (e.g. script snippets of quest stages)
    Texts(Vec<String>),
}

/// A value as stored inside one source
pub type LocalValue = Value<FormId>;

impl<R: Ord> Value<R> {
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_links(&self) -> Option<&BTreeMap<R, i64>> {
        match self {
            Value::Links(links) => Some(links),
            _ => None,
        }
    }

    /// Short name of the variant, for messages
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Links(_) => "links",
            Value::Texts(_) => "texts",
        }
    }

    /// Convert every reference with `f`, keeping everything else as is.
    /// Two references mapping to the same target collapse into one entry
    /// (the later one wins).
    pub fn map_refs<S: Ord, F>(&self, mut f: F) -> Result<Value<S>>
    where
        F: FnMut(&R) -> Result<S>,
    {
        Ok(match self {
            Value::None => Value::None,
            Value::Int(i) => Value::Int(*i),
            Value::Float(x) => Value::Float(*x),
            Value::String(s) => Value::String(s.clone()),
            Value::Texts(t) => Value::Texts(t.clone()),
            Value::Links(links) => {
                let mut mapped = BTreeMap::new();
                for (target, rank) in links {
                    mapped.insert(f(target)?, *rank);
                }
                Value::Links(mapped)
            }
        })
    }
}

impl<R: Ord> From<i64> for Value<R> {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl<R: Ord> From<f64> for Value<R> {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl<R: Ord> From<&str> for Value<R> {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl<R: Ord> From<String> for Value<R> {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl<R: Ord + fmt::Display> fmt::Display for Value<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "none"),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", format_float(*x)),
            Value::String(s) => write!(f, "{}", s),
            Value::Links(links) => {
                write!(f, "[")?;
                for (i, (target, rank)) in links.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}={}", target, rank)?;
                }
                write!(f, "]")
            }
            Value::Texts(texts) => write!(f, "<{} text(s)>", texts.len()),
        }
    }
}

/// Render a float so that it always carries a decimal point and parses back
/// to the same value.
pub fn format_float(x: f64) -> String {
    let s = x.to_string();
    if !x.is_finite() || s.contains('.') {
        s
    } else {
        format!("{}.0", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_format_float_always_has_point() {
        assert_eq!(format_float(2.0), "2.0");
        assert_eq!(format_float(-0.5), "-0.5");
        assert_eq!(format_float(1e20), "100000000000000000000.0");
        assert_eq!(format_float(0.1).parse::<f64>().unwrap(), 0.1);
    }

    #[test]
    fn test_map_refs_converts_links_only() {
        let mut links = BTreeMap::new();
        links.insert(FormId::new(0, 1), 2);
        links.insert(FormId::new(1, 3), -1);
        let local: LocalValue = Value::Links(links);

        let global: Value = local
            .map_refs(|id| Ok(FormKey::new(format!("M{}", id.master_index()), id.object())))
            .unwrap();
        let links = global.as_links().unwrap();
        assert_eq!(links.get(&FormKey::new("M0", 1)), Some(&2));
        assert_eq!(links.get(&FormKey::new("M1", 3)), Some(&-1));

        let scalar: LocalValue = Value::Int(4);
        assert_eq!(
            scalar.map_refs(|_| Ok(FormKey::new("x", 0))).unwrap(),
            Value::<FormKey>::Int(4)
        );
    }

    #[test]
    fn test_map_refs_propagates_errors() {
        let mut links = BTreeMap::new();
        links.insert(FormId::new(3, 1), 2);
        let local: LocalValue = Value::Links(links);
        let result: Result<Value> = local.map_refs(|_| Err(Error::UnknownGroup("x".into())));
        assert!(result.is_err());
    }

    #[test]
    fn test_none_is_not_empty_string() {
        let none: Value = Value::None;
        assert!(none.is_none());
        assert_ne!(none, Value::from(""));
    }
}
