//! Defines the canonical cache key for share-relative paths --- [`PathKey`].

use std::fmt;

use crate::error::{Error, Result};

/// Canonical path separator used by every cache key.
pub const SEPARATOR: char = '\\';

/// Canonical share-relative path used to key the state cache.
///
/// Two raw paths normalize to the same key iff they name the same file
/// under the cache's case-sensitivity policy.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct PathKey(String);

impl PathKey {
    /// Normalizes a raw share-relative path into a cache key.
    ///
    /// # Parameters
    ///
    /// * `raw` --- path as received from the dispatcher, `\` or `/` separated.
    /// * `case_sensitive` --- when false, the key folds to lowercase.
    ///
    /// Empty paths and paths containing NUL bytes are rejected.
    pub fn normalize(raw: &str, case_sensitive: bool) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::InvalidPath("empty path".to_owned()));
        }
        if raw.contains('\0') {
            return Err(Error::InvalidPath("path contains NUL byte".to_owned()));
        }

        let mut key = String::with_capacity(raw.len() + 1);
        key.push(SEPARATOR);

        let mut pending_separator = false;
        for ch in raw.chars() {
            if ch == '/' || ch == SEPARATOR {
                pending_separator = !key.ends_with(SEPARATOR);
                continue;
            }
            if pending_separator {
                key.push(SEPARATOR);
                pending_separator = false;
            }
            if case_sensitive {
                key.push(ch);
            } else {
                key.extend(ch.to_lowercase());
            }
        }

        Ok(Self(key))
    }

    /// Returns the canonical textual form of the key.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Tells whether the key names the share root.
    pub fn is_root(&self) -> bool {
        self.0.len() == 1
    }

    /// Tells whether this key names an entry inside the `ancestor` directory,
    /// at any depth. A key is not its own descendant.
    pub fn is_descendant_of(&self, ancestor: &PathKey) -> bool {
        if self.0.len() <= ancestor.0.len() {
            return false;
        }
        if ancestor.is_root() {
            return true;
        }
        self.0.starts_with(ancestor.0.as_str())
            && self.0[ancestor.0.len()..].starts_with(SEPARATOR)
    }

    /// Rewrites the `old_prefix` directory portion of the key to `new_prefix`,
    /// keeping the remaining suffix. Returns `None` when the key is not a
    /// descendant of `old_prefix`.
    pub fn rebase(&self, old_prefix: &PathKey, new_prefix: &PathKey) -> Option<PathKey> {
        if !self.is_descendant_of(old_prefix) {
            return None;
        }
        let suffix = &self.0[old_prefix.0.len()..];
        Some(PathKey(format!("{}{}", new_prefix.0, suffix)))
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests;
