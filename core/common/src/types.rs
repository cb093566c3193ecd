//! Common types used throughout offsync.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Extra request headers attached to a write (e.g. `If-Match`).
pub type Headers = BTreeMap<String, String>;

/// Optimistic-concurrency precondition header.
pub const IF_MATCH: &str = "If-Match";

/// A key inside a blob store, independent of the underlying backend.
///
/// Keys are slash-separated and never contain empty components, so
/// `"dbs/AAAA/"` and `"/dbs/AAAA"` name the same entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorePath {
    components: Vec<String>,
}

fn check_component(component: &str) -> crate::Result<()> {
    let problem = if component.is_empty() {
        "is empty"
    } else if component.contains(['/', '\\']) {
        "contains a separator"
    } else if component == "." || component == ".." {
        "is a relative reference"
    } else {
        return Ok(());
    };
    Err(crate::Error::InvalidInput(format!(
        "Store key component '{}' {}",
        component, problem
    )))
}

fn split_key(path: &str) -> impl Iterator<Item = String> + '_ {
    path.split('/').filter(|c| !c.is_empty()).map(String::from)
}

impl StorePath {
    /// The empty key, naming the store itself.
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Build a key from individual components.
    ///
    /// # Errors
    /// - `InvalidInput` if a component is empty, contains a separator,
    ///   or is `.` / `..`
    pub fn from_components(components: Vec<String>) -> crate::Result<Self> {
        components.iter().try_for_each(|c| check_component(c))?;
        Ok(Self { components })
    }

    /// Parse a slash-separated key, ignoring leading, trailing and repeated slashes.
    pub fn parse(path: &str) -> crate::Result<Self> {
        Self::from_components(split_key(path).collect())
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Key one level up; `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        let (_, rest) = self.components.split_last()?;
        Some(Self {
            components: rest.to_vec(),
        })
    }

    /// Last component.
    pub fn name(&self) -> Option<&str> {
        self.components.last().map(String::as_str)
    }

    /// Key of a direct child.
    pub fn join(&self, child: &str) -> crate::Result<Self> {
        check_component(child)?;
        let mut key = self.clone();
        key.components.push(child.to_string());
        Ok(key)
    }

    /// Key below this one, given as a slash-separated relative path.
    pub fn join_path(&self, relative: &str) -> crate::Result<Self> {
        let mut key = self.clone();
        for component in split_key(relative) {
            check_component(&component)?;
            key.components.push(component);
        }
        Ok(key)
    }

    /// Whether `self` equals `ancestor` or lies below it.
    pub fn starts_with(&self, ancestor: &StorePath) -> bool {
        self.components.starts_with(&ancestor.components)
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Render without a leading slash (`dbs/AAAA`).
    pub fn as_key(&self) -> String {
        self.components.join("/")
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, out: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(out, "/{}", self.as_key())
    }
}
