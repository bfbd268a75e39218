//! Host runtime seam
//!
//! The loaders never realize modules themselves: they hand bytes to a
//! [`ModuleRuntime`] (their own namespace) or to a [`ParentLoader`] (the
//! enclosing loader). [`InMemoryRuntime`] implements both for tests and the
//! CLI.

use crate::bytecode::ModuleImage;
use crate::naming::CanonicalName;
use crate::result::LoadError;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Which loader a module was defined by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// The instrumenting loader
    Instrumenting,
    /// The original-module loader
    Original,
    /// The enclosing (parent) loader
    Parent,
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instrumenting => f.write_str("instrumenting"),
            Self::Original => f.write_str("original"),
            Self::Parent => f.write_str("parent"),
        }
    }
}

#[derive(Debug)]
struct LoadedModule {
    id: u64,
    name: CanonicalName,
    namespace: Namespace,
    bytes: Vec<u8>,
    linked: AtomicBool,
}

/// Shared reference to a realized module
///
/// Equality is identity: two handles are equal only if they refer to the
/// same realized module.
#[derive(Debug, Clone)]
pub struct ModuleHandle(Arc<LoadedModule>);

impl ModuleHandle {
    /// Realize a module
    #[must_use]
    pub fn new(id: u64, name: CanonicalName, namespace: Namespace, bytes: Vec<u8>) -> Self {
        Self(Arc::new(LoadedModule {
            id,
            name,
            namespace,
            bytes,
            linked: AtomicBool::new(false),
        }))
    }

    /// Runtime-assigned identifier
    #[must_use]
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// Canonical module name
    #[must_use]
    pub fn name(&self) -> &CanonicalName {
        &self.0.name
    }

    /// Defining loader
    #[must_use]
    pub fn namespace(&self) -> Namespace {
        self.0.namespace
    }

    /// Bytes the module was defined from
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.0.bytes
    }

    /// Whether the link step has run
    #[must_use]
    pub fn is_linked(&self) -> bool {
        self.0.linked.load(Ordering::Acquire)
    }

    /// Record that the link step has run
    pub fn mark_linked(&self) {
        self.0.linked.store(true, Ordering::Release);
    }
}

impl PartialEq for ModuleHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for ModuleHandle {}

/// Realizes module bytes inside the host runtime
pub trait ModuleRuntime: Send + Sync {
    /// Define `bytes` as module `name` owned by `namespace`
    fn define(
        &self,
        namespace: Namespace,
        name: &CanonicalName,
        bytes: &[u8],
    ) -> Result<ModuleHandle, LoadError>;

    /// Run the link/resolve step for a defined module
    fn link(&self, module: &ModuleHandle) -> Result<(), LoadError>;
}

/// The enclosing loader that requests are delegated to
pub trait ParentLoader: Send + Sync {
    /// Load `name`, defining `original` when supplied
    fn load(
        &self,
        name: &CanonicalName,
        original: Option<&[u8]>,
        resolve: bool,
    ) -> Result<ModuleHandle, LoadError>;
}

/// Runtime keeping realized modules in memory
///
/// Validates bytes by decoding them, refuses a second definition of a name
/// in the same namespace, and acts as the parent loader over a set of
/// bootstrap modules.
#[derive(Debug, Default)]
pub struct InMemoryRuntime {
    defined: Mutex<HashMap<(Namespace, CanonicalName), ModuleHandle>>,
    bootstrap: RwLock<HashMap<CanonicalName, Vec<u8>>>,
    next_id: AtomicU64,
}

impl InMemoryRuntime {
    /// Create an empty runtime
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `name` available through the parent loader only
    #[must_use]
    pub fn with_bootstrap(self, name: impl Into<CanonicalName>, bytes: Vec<u8>) -> Self {
        self.bootstrap
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(name.into(), bytes);
        self
    }

    /// Module defined for `name` in `namespace`, if any
    #[must_use]
    pub fn defined(&self, namespace: Namespace, name: &CanonicalName) -> Option<ModuleHandle> {
        self.defined
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&(namespace, name.clone()))
            .cloned()
    }

    /// Number of modules defined in `namespace`
    #[must_use]
    pub fn defined_count(&self, namespace: Namespace) -> usize {
        self.defined
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .filter(|(ns, _)| *ns == namespace)
            .count()
    }

    fn bootstrap_bytes(&self, name: &CanonicalName) -> Option<Vec<u8>> {
        self.bootstrap
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

impl ModuleRuntime for InMemoryRuntime {
    fn define(
        &self,
        namespace: Namespace,
        name: &CanonicalName,
        bytes: &[u8],
    ) -> Result<ModuleHandle, LoadError> {
        let image =
            ModuleImage::from_bytes(bytes).map_err(|e| LoadError::define(name.as_str(), e.to_string()))?;
        if CanonicalName::new(&image.name) != *name {
            return Err(LoadError::define(
                name.as_str(),
                format!("image declares module {}", image.name),
            ));
        }

        let mut defined = self
            .defined
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let key = (namespace, name.clone());
        if defined.contains_key(&key) {
            return Err(LoadError::define(
                name.as_str(),
                format!("already defined by the {namespace} loader"),
            ));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = ModuleHandle::new(id, name.clone(), namespace, bytes.to_vec());
        defined.insert(key, handle.clone());
        Ok(handle)
    }

    fn link(&self, module: &ModuleHandle) -> Result<(), LoadError> {
        module.mark_linked();
        Ok(())
    }
}

impl ParentLoader for InMemoryRuntime {
    fn load(
        &self,
        name: &CanonicalName,
        original: Option<&[u8]>,
        resolve: bool,
    ) -> Result<ModuleHandle, LoadError> {
        let handle = match self.defined(Namespace::Parent, name) {
            Some(existing) => existing,
            None => {
                let bytes = match original {
                    Some(bytes) => bytes.to_vec(),
                    None => self
                        .bootstrap_bytes(name)
                        .ok_or_else(|| LoadError::not_found(name.as_str()))?,
                };
                self.define(Namespace::Parent, name, &bytes)?
            }
        };
        if resolve {
            self.link(&handle)?;
        }
        Ok(handle)
    }
}
