//! Editor id renames inside script text
//!
//! Scripts refer to records by editor id. When an id changes, every script
//! token equal to the old id (ignoring case) is replaced by the new one.
//! Tokens are maximal runs of word characters; anything else is copied
//! through untouched.
//!
//! Renames chain: with `a -> b` and `b -> c` registered, `a` becomes `c`
//! directly, so a second pass over renamed text finds nothing left to do.
//! Ids caught in a cycle are left alone.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};

/// Old editor id (lowercased) to new editor id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenameMap {
    renames: BTreeMap<String, String>,
}

impl RenameMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rename. Identity renames (same id, any case) are ignored.
    pub fn insert(&mut self, old: &str, new: &str) {
        if old.is_empty() || new.is_empty() || old.eq_ignore_ascii_case(new) {
            return;
        }
        self.renames.insert(old.to_lowercase(), new.to_string());
    }

    /// New id for `token`, if it was renamed
    pub fn get(&self, token: &str) -> Option<&str> {
        self.renames.get(&token.to_lowercase()).map(String::as_str)
    }

    /// Final id for `token` after following every chained rename. `None`
    /// when `token` is not renamed or its chain runs into a cycle.
    pub fn resolve(&self, token: &str) -> Option<&str> {
        let mut current = self.get(token)?;
        let mut seen = BTreeSet::from([token.to_lowercase()]);
        while let Some(next) = self.get(current) {
            if !seen.insert(current.to_lowercase()) {
                return None;
            }
            current = next;
        }
        Some(current)
    }

    /// Old ids whose chain never settles
    pub fn cycles(&self) -> Vec<&str> {
        self.renames
            .keys()
            .filter(|old| self.resolve(old).is_none())
            .map(String::as_str)
            .collect()
    }

    pub fn extend(&mut self, other: &RenameMap) {
        for (old, new) in &other.renames {
            self.renames.insert(old.clone(), new.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.renames.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.renames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.renames.is_empty()
    }
}

fn is_word(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Replace every renamed whole token in `text` with the end of its rename
/// chain. Borrows when nothing changes.
pub fn rename_tokens<'t>(text: &'t str, renames: &RenameMap) -> Cow<'t, str> {
    if renames.is_empty() {
        return Cow::Borrowed(text);
    }
    let mut out = String::new();
    let mut copied = 0;
    let mut changed = false;
    let mut start = None;

    let ends = text.char_indices().map(Some).chain(std::iter::once(None));
    for item in ends {
        match (item, start) {
            (Some((i, c)), None) if is_word(c) => start = Some(i),
            (Some((_, c)), Some(_)) if is_word(c) => {}
            (item, Some(s)) => {
                let end = item.map(|(i, _)| i).unwrap_or(text.len());
                if let Some(new) = renames.resolve(&text[s..end]) {
                    out.push_str(&text[copied..s]);
                    out.push_str(new);
                    copied = end;
                    changed = true;
                }
                start = None;
            }
            _ => {}
        }
    }

    if !changed {
        return Cow::Borrowed(text);
    }
    out.push_str(&text[copied..]);
    Cow::Owned(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn renames(pairs: &[(&str, &str)]) -> RenameMap {
        let mut map = RenameMap::new();
        for (old, new) in pairs {
            map.insert(old, new);
        }
        map
    }

    #[test]
    fn test_whole_tokens_only() {
        let map = renames(&[("Guard01", "CityGuard")]);
        let text = "if Guard01.GetDead == 0\n  Guard01Ref.Enable\nendif";
        assert_eq!(
            rename_tokens(text, &map),
            "if CityGuard.GetDead == 0\n  Guard01Ref.Enable\nendif"
        );
    }

    #[test]
    fn test_case_insensitive_match() {
        let map = renames(&[("Guard01", "CityGuard")]);
        assert_eq!(rename_tokens("set GUARD01 to 1", &map), "set CityGuard to 1");
    }

    #[test]
    fn test_token_at_end_and_unicode_neighbours() {
        let map = renames(&[("ring", "Band")]);
        assert_eq!(rename_tokens("é ring", &map), "é Band");
        assert_eq!(rename_tokens("éring", &map), "éring");
    }

    #[test]
    fn test_unchanged_text_is_borrowed() {
        let map = renames(&[("Guard01", "CityGuard")]);
        assert!(matches!(rename_tokens("nothing here", &map), Cow::Borrowed(_)));
    }

    #[test]
    fn test_idempotent() {
        let map = renames(&[("Guard01", "CityGuard")]);
        let once = rename_tokens("Guard01 guard01", &map).into_owned();
        let twice = rename_tokens(&once, &map).into_owned();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_chains_resolve_to_final_id() {
        let map = renames(&[("OldGuild", "MidGuild"), ("MidGuild", "NewGuild")]);
        let once = rename_tokens("OldGuild.Enable MidGuild.Disable", &map).into_owned();
        assert_eq!(once, "NewGuild.Enable NewGuild.Disable");
        assert_eq!(rename_tokens(&once, &map), once);
    }

    #[test]
    fn test_cycles_are_left_alone() {
        let map = renames(&[("Alpha", "Beta"), ("Beta", "Alpha"), ("Gamma", "Delta")]);
        assert_eq!(map.resolve("alpha"), None);
        assert_eq!(map.cycles(), vec!["alpha", "beta"]);
        let once = rename_tokens("Alpha Beta Gamma", &map).into_owned();
        assert_eq!(once, "Alpha Beta Delta");
        assert_eq!(rename_tokens(&once, &map), once);
    }

    #[test]
    fn test_identity_rename_ignored() {
        let map = renames(&[("Guard", "GUARD")]);
        assert!(map.is_empty());
    }
}
