//! Hierarchical key namespacing (component C1)
//!
//! A [`Key`] is a slash-joined sequence of UTF-8 segments originating from a
//! root [`Namespace`] plus zero or more group segments. Two keys are equal
//! iff their joined form is byte-identical. Namespaces are side-effect-free
//! to stringify: `to_string()` never touches storage, it only joins
//! in-memory segments.
//!
//! All adapters receive already-resolved storage keys (the output of
//! [`Key::storage_key`]) — they never perform path composition themselves.

use std::fmt;

/// A hierarchical namespace: a root segment plus any number of group
/// segments appended by [`Namespace::group`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    segments: Vec<String>,
}

impl Namespace {
    /// Create a root namespace from a single segment.
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            segments: vec![root.into()],
        }
    }

    /// Extend this namespace with an additional group segment, returning a
    /// fresh namespace. The receiver is left unmodified.
    pub fn group(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// Compose a [`Key`] scoped to this namespace from the given segments.
    pub fn create(&self, key_segments: impl IntoIterator<Item = impl Into<String>>) -> Key {
        let mut segments = self.segments.clone();
        segments.extend(key_segments.into_iter().map(Into::into));
        Key { segments }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

/// A fully-resolved key: `{root}/{segments joined by '/'}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    segments: Vec<String>,
}

impl Key {
    /// Reconstruct a [`Key`] from an already-resolved storage key (the
    /// inverse of [`Key::storage_key`]), used by the serde transformer to
    /// rebuild a handle from a record that only carries the joined form.
    pub fn from_storage_key(storage_key: &str) -> Self {
        Self {
            segments: storage_key.split('/').map(str::to_string).collect(),
        }
    }

    /// The storage representation handed to adapters.
    pub fn storage_key(&self) -> String {
        self.segments.join("/")
    }

    /// True if `self` falls under the given namespace prefix, used by
    /// `clear()`/`remove_by_key_prefix` scoping.
    pub fn starts_with(&self, namespace: &Namespace) -> bool {
        self.segments.len() >= namespace.segments.len()
            && self.segments[..namespace.segments.len()] == namespace.segments[..]
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.storage_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_joins_root_and_segments() {
        let ns = Namespace::new("app");
        let key = ns.create(["users", "42"]);
        assert_eq!(key.storage_key(), "app/users/42");
    }

    #[test]
    fn group_extends_without_mutating_parent() {
        let root = Namespace::new("app");
        let nested = root.group("cache");
        assert_eq!(root.to_string(), "app");
        assert_eq!(nested.to_string(), "app/cache");

        let key = nested.create(["a"]);
        assert_eq!(key.storage_key(), "app/cache/a");
    }

    #[test]
    fn equality_is_byte_identical_join() {
        let ns = Namespace::new("app");
        let a = ns.create(["x", "y"]);
        let b = ns.create(["x", "y"]);
        assert_eq!(a, b);
        assert_eq!(a.storage_key(), b.storage_key());
    }

    #[test]
    fn from_storage_key_round_trips_through_storage_key() {
        let key = Namespace::new("app").group("cache").create(["a", "b"]);
        let rebuilt = Key::from_storage_key(&key.storage_key());
        assert_eq!(rebuilt.storage_key(), key.storage_key());
    }

    #[test]
    fn starts_with_checks_namespace_prefix() {
        let root = Namespace::new("app");
        let nested = root.group("sessions");
        let key = nested.create(["abc"]);

        assert!(key.starts_with(&root));
        assert!(key.starts_with(&nested));
        assert!(!key.starts_with(&Namespace::new("other")));
    }
}
