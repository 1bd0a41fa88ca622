//! Key-paths: sequences of names addressing entries in nested records.

use std::fmt;
use std::ops::Deref;

use smallvec::SmallVec;

/// A path of names into a nested [`Record`](crate::Record).
///
/// A single-element path addresses a root entry. Paths are built from
/// `&str`, `String`, arrays and tuples of `&str`, or parsed from dotted
/// notation with [`KeyPath::parse`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyPath(SmallVec<[String; 4]>);

impl KeyPath {
    /// Build a path from its components.
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// Parse dotted notation: `"data.states"` becomes `("data", "states")`.
    pub fn parse(dotted: &str) -> Self {
        Self::new(dotted.split('.').filter(|part| !part.is_empty()))
    }

    /// The components as a slice.
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// The path of the containing record (empty for root entries).
    pub fn parent(&self) -> &[String] {
        match self.0.split_last() {
            Some((_, parent)) => parent,
            None => &[],
        }
    }

    /// A path naming `name` next to this entry, inside the same parent.
    pub fn sibling(&self, name: &str) -> Self {
        let mut parts: SmallVec<[String; 4]> = self.parent().iter().cloned().collect();
        parts.push(name.to_string());
        Self(parts)
    }

    /// This path extended by one component.
    pub fn join(&self, name: &str) -> Self {
        let mut parts = self.0.clone();
        parts.push(name.to_string());
        Self(parts)
    }

    /// This path nested under `head`.
    pub fn prefixed(&self, head: &str) -> Self {
        let mut parts: SmallVec<[String; 4]> = SmallVec::with_capacity(self.0.len() + 1);
        parts.push(head.to_string());
        parts.extend(self.0.iter().cloned());
        Self(parts)
    }
}

impl Deref for KeyPath {
    type Target = [String];

    fn deref(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

impl From<&str> for KeyPath {
    fn from(name: &str) -> Self {
        Self::new([name])
    }
}

impl From<String> for KeyPath {
    fn from(name: String) -> Self {
        Self::new([name])
    }
}

impl From<&String> for KeyPath {
    fn from(name: &String) -> Self {
        Self::new([name.as_str()])
    }
}

impl<const N: usize> From<[&str; N]> for KeyPath {
    fn from(parts: [&str; N]) -> Self {
        Self::new(parts)
    }
}

impl From<(&str, &str)> for KeyPath {
    fn from((a, b): (&str, &str)) -> Self {
        Self::new([a, b])
    }
}

impl From<(&str, &str, &str)> for KeyPath {
    fn from((a, b, c): (&str, &str, &str)) -> Self {
        Self::new([a, b, c])
    }
}

impl From<&[String]> for KeyPath {
    fn from(parts: &[String]) -> Self {
        Self::new(parts.iter().cloned())
    }
}

impl From<&KeyPath> for KeyPath {
    fn from(path: &KeyPath) -> Self {
        path.clone()
    }
}

pub(crate) fn dotted(path: &[String]) -> String {
    path.join(".")
}
