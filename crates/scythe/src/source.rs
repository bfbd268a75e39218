//! Module resource sources
//!
//! Where a loader finds the raw bytes of a module.

use crate::bytecode::MODULE_EXTENSION;
use crate::naming::CanonicalName;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::warn;

/// Supplies raw module bytes by canonical name
pub trait ResourceSource: Send + Sync {
    /// Fetch the bytes of `name`; `Ok(None)` when no resource backs it
    fn fetch(&self, name: &CanonicalName) -> io::Result<Option<Vec<u8>>>;

    /// Extend the source with another root; false if it has no roots
    fn add_root(&self, _root: &Path) -> bool {
        false
    }
}

/// Relative resource path of a module: `<canonical>.smod`
///
/// `None` unless the name [is confined](CanonicalName::is_confined), so the
/// path never leaves the directory it is joined to.
#[must_use]
pub fn resource_path(name: &CanonicalName) -> Option<PathBuf> {
    name.is_confined()
        .then(|| PathBuf::from(format!("{}.{MODULE_EXTENSION}", name.as_str())))
}

/// Ordered list of root directories searched for module files
///
/// Roots can be appended while loads are running.
#[derive(Debug, Default)]
pub struct SearchPath {
    roots: RwLock<Vec<PathBuf>>,
}

impl SearchPath {
    /// Create a search path over `roots`
    #[must_use]
    pub fn new<I, P>(roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            roots: RwLock::new(roots.into_iter().map(Into::into).collect()),
        }
    }

    /// Append a root directory
    pub fn add_root(&self, root: impl Into<PathBuf>) {
        self.roots
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(root.into());
    }

    /// Current roots, in search order
    #[must_use]
    pub fn roots(&self) -> Vec<PathBuf> {
        self.roots
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn locate(&self, relative: &Path) -> Option<PathBuf> {
        self.roots()
            .into_iter()
            .map(|root| root.join(relative))
            .find(|candidate| candidate.is_file())
    }
}

impl ResourceSource for SearchPath {
    fn fetch(&self, name: &CanonicalName) -> io::Result<Option<Vec<u8>>> {
        let Some(relative) = resource_path(name) else {
            if !name.is_empty() {
                warn!(module = %name, "name does not map to a path below the search roots");
            }
            return Ok(None);
        };
        match self.locate(&relative) {
            Some(path) => fs::read(path).map(Some),
            None => Ok(None),
        }
    }

    fn add_root(&self, root: &Path) -> bool {
        self.roots
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(root.to_path_buf());
        true
    }
}

/// In-memory module store
#[derive(Debug, Default)]
pub struct MemorySource {
    modules: RwLock<HashMap<CanonicalName, Vec<u8>>>,
}

impl MemorySource {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a module
    pub fn insert(&self, name: impl Into<CanonicalName>, bytes: Vec<u8>) {
        self.modules
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(name.into(), bytes);
    }

    /// Builder-style [`insert`](Self::insert)
    #[must_use]
    pub fn with(self, name: impl Into<CanonicalName>, bytes: Vec<u8>) -> Self {
        self.insert(name, bytes);
        self
    }
}

impl ResourceSource for MemorySource {
    fn fetch(&self, name: &CanonicalName) -> io::Result<Option<Vec<u8>>> {
        Ok(self
            .modules
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
            .cloned())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_module(root: &Path, name: &str, bytes: &[u8]) {
        let path = root.join(resource_path(&CanonicalName::new(name)).unwrap());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_resource_path() {
        assert_eq!(
            resource_path(&CanonicalName::new("app.model.Order")),
            Some(PathBuf::from("app/model/Order.smod"))
        );
        assert_eq!(resource_path(&CanonicalName::new(".etc.passwd")), None);
    }

    #[test]
    fn test_fetch_never_leaves_the_roots() {
        let outer = TempDir::new().unwrap();
        let root = outer.path().join("root");
        fs::create_dir_all(&root).unwrap();
        fs::write(outer.path().join("Secret.smod"), b"secret").unwrap();

        let source = SearchPath::new([root.as_path()]);
        let escaping = format!("{}/Secret", outer.path().display());
        assert!(source.fetch(&CanonicalName::new(&escaping)).unwrap().is_none());
        assert!(source.fetch(&CanonicalName::new("../Secret")).unwrap().is_none());
    }

    #[test]
    fn test_search_path_fetch() {
        let dir = TempDir::new().unwrap();
        write_module(dir.path(), "app/Bar", b"bytes");

        let source = SearchPath::new([dir.path()]);
        let found = source.fetch(&CanonicalName::new("app.Bar")).unwrap();
        assert_eq!(found.as_deref(), Some(&b"bytes"[..]));
        assert!(source.fetch(&CanonicalName::new("app/Missing")).unwrap().is_none());
    }

    #[test]
    fn test_search_path_order_and_add_root() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        write_module(first.path(), "a/X", b"first");
        write_module(second.path(), "a/X", b"second");
        write_module(second.path(), "a/Y", b"only-second");

        let source = SearchPath::new([first.path()]);
        let y = CanonicalName::new("a/Y");
        assert!(source.fetch(&y).unwrap().is_none());

        source.add_root(second.path());
        assert_eq!(source.roots().len(), 2);
        assert_eq!(source.fetch(&y).unwrap().unwrap(), b"only-second");
        assert_eq!(
            source.fetch(&CanonicalName::new("a/X")).unwrap().unwrap(),
            b"first"
        );
    }

    #[test]
    fn test_empty_name_not_found() {
        let source = SearchPath::new(Vec::<PathBuf>::new());
        assert!(source.fetch(&CanonicalName::new("")).unwrap().is_none());
    }

    #[test]
    fn test_add_root_through_trait() {
        let dir = TempDir::new().unwrap();
        write_module(dir.path(), "a/Z", b"z");
        let source: &dyn ResourceSource = &SearchPath::default();
        assert!(source.add_root(dir.path()));
        assert!(source.fetch(&CanonicalName::new("a/Z")).unwrap().is_some());
        assert!(!MemorySource::new().add_root(dir.path()));
    }

    #[test]
    fn test_memory_source() {
        let source = MemorySource::new().with("a.B", vec![1, 2, 3]);
        assert_eq!(
            source.fetch(&CanonicalName::new("a/B")).unwrap(),
            Some(vec![1, 2, 3])
        );
        assert!(source.fetch(&CanonicalName::new("a/C")).unwrap().is_none());
    }
}
