//! In-memory binding registry
//!
//! Holds every interpreter binding registered through `/register`. Bindings
//! are immutable once inserted; the only mutations are insert and remove.

use rustc_hash::FxHashMap;

use crate::error::{BinfmtError, Result};

/// How a binding recognizes the files it handles
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingKind {
    /// Byte pattern at an offset (`M`)
    Magic,
    /// File name extension (`E`)
    Extension,
}

impl BindingKind {
    /// Parse the single-character kind tag of a register record.
    pub fn from_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            b"M" => Some(BindingKind::Magic),
            b"E" => Some(BindingKind::Extension),
            _ => None,
        }
    }

    pub fn tag(self) -> char {
        match self {
            BindingKind::Magic => 'M',
            BindingKind::Extension => 'E',
        }
    }
}

/// Matching rule of a binding
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Matcher {
    /// Magic bytes at `offset`, optionally masked.
    /// A non-empty `mask` always has the same length as `magic`.
    Magic {
        offset: i64,
        magic: Vec<u8>,
        mask: Vec<u8>,
    },
    /// Extension without the leading dot; never contains `/`.
    Extension(Vec<u8>),
}

/// One registered name to interpreter association
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    /// Entry name, also the file name under the mount root
    pub name: String,
    /// Matching rule
    pub matcher: Matcher,
    /// Interpreter path, stored verbatim
    pub interpreter: Vec<u8>,
    /// Raw flags field; kept but not interpreted
    pub flags: Vec<u8>,
}

impl Binding {
    pub fn kind(&self) -> BindingKind {
        match self.matcher {
            Matcher::Magic { .. } => BindingKind::Magic,
            Matcher::Extension(_) => BindingKind::Extension,
        }
    }
}

/// Name to binding map
#[derive(Debug, Default)]
pub struct Registry {
    bindings: FxHashMap<String, Binding>,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new binding; an existing name is never overwritten.
    pub fn insert(&mut self, binding: Binding) -> Result<()> {
        if self.bindings.contains_key(&binding.name) {
            return Err(BinfmtError::AlreadyExists(binding.name));
        }
        self.bindings.insert(binding.name.clone(), binding);
        Ok(())
    }

    /// Remove a binding, returning it
    pub fn remove(&mut self, name: &str) -> Result<Binding> {
        self.bindings.remove(name).ok_or(BinfmtError::NotFound)
    }

    /// Look up a binding by name
    pub fn lookup(&self, name: &str) -> Result<&Binding> {
        self.bindings.get(name).ok_or(BinfmtError::NotFound)
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    /// Snapshot of registered names, sorted so repeated listings agree.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.bindings.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = &Binding> {
        self.bindings.values()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ext_binding(name: &str, ext: &str) -> Binding {
        Binding {
            name: name.to_string(),
            matcher: Matcher::Extension(ext.as_bytes().to_vec()),
            interpreter: b"/usr/bin/run".to_vec(),
            flags: Vec::new(),
        }
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut reg = Registry::new();
        reg.insert(ext_binding("jar", "jar")).unwrap();

        let b = reg.lookup("jar").unwrap();
        assert_eq!(b.kind(), BindingKind::Extension);
        assert_eq!(b.interpreter, b"/usr/bin/run");
        assert!(reg.contains("jar"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_duplicate_insert_keeps_original() {
        let mut reg = Registry::new();
        reg.insert(ext_binding("jar", "jar")).unwrap();

        let err = reg.insert(ext_binding("jar", "zip")).unwrap_err();
        assert_eq!(err, BinfmtError::AlreadyExists("jar".to_string()));
        assert_eq!(
            reg.lookup("jar").unwrap().matcher,
            Matcher::Extension(b"jar".to_vec())
        );
    }

    #[test]
    fn test_remove() {
        let mut reg = Registry::new();
        reg.insert(ext_binding("jar", "jar")).unwrap();

        let removed = reg.remove("jar").unwrap();
        assert_eq!(removed.name, "jar");
        assert!(reg.is_empty());
        assert_eq!(reg.remove("jar").unwrap_err(), BinfmtError::NotFound);
        assert_eq!(reg.lookup("jar").unwrap_err(), BinfmtError::NotFound);
    }

    #[test]
    fn test_names_sorted_snapshot() {
        let mut reg = Registry::new();
        reg.insert(ext_binding("zeta", "z")).unwrap();
        reg.insert(ext_binding("alpha", "a")).unwrap();
        reg.insert(ext_binding("mid", "m")).unwrap();

        assert_eq!(reg.names(), vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_kind_tags() {
        assert_eq!(BindingKind::from_tag(b"M"), Some(BindingKind::Magic));
        assert_eq!(BindingKind::from_tag(b"E"), Some(BindingKind::Extension));
        assert_eq!(BindingKind::from_tag(b"m"), None);
        assert_eq!(BindingKind::from_tag(b"ME"), None);
        assert_eq!(BindingKind::Magic.tag(), 'M');
    }
}
