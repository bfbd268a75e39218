//! Loader for pristine, never-instrumented modules
//!
//! Shares the resource source and runtime with the instrumenting loader but
//! defines into the [`Namespace::Original`] namespace and keeps its own cache,
//! so a test can compare a module against its instrumented twin.

use super::cache::IdentityCache;
use crate::naming::CanonicalName;
use crate::result::LoadError;
use crate::runtime::{ModuleHandle, ModuleRuntime, Namespace};
use crate::source::ResourceSource;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

/// Loads modules without passing them through any pipeline
pub struct OriginalLoader {
    source: Arc<dyn ResourceSource>,
    runtime: Arc<dyn ModuleRuntime>,
    cache: IdentityCache,
}

impl fmt::Debug for OriginalLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OriginalLoader")
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl OriginalLoader {
    /// Loader over `source`, defining into `runtime`
    #[must_use]
    pub fn new(source: Arc<dyn ResourceSource>, runtime: Arc<dyn ModuleRuntime>) -> Self {
        Self {
            source,
            runtime,
            cache: IdentityCache::new(),
        }
    }

    /// Load `name` exactly as stored
    ///
    /// # Errors
    ///
    /// [`LoadError::NameEmpty`], [`LoadError::ResourceNotFound`] when no
    /// resource backs the name, and [`LoadError::ModuleLoadFailed`] when the
    /// resource cannot be read or defined.
    pub fn load_original(&self, name: &str) -> Result<ModuleHandle, LoadError> {
        let name = CanonicalName::new(name);
        if name.is_empty() {
            error!("empty module name given to the original loader");
            return Err(LoadError::NameEmpty);
        }
        self.cache.get_or_load(&name, || self.define(&name))
    }

    /// Cached original handle for `name`
    #[must_use]
    pub fn cached(&self, name: &CanonicalName) -> Option<ModuleHandle> {
        self.cache.get(name)
    }

    fn define(&self, name: &CanonicalName) -> Result<ModuleHandle, LoadError> {
        let bytes = self
            .source
            .fetch(name)
            .map_err(|e| LoadError::load_failed(name.as_str(), e.to_string()))?
            .ok_or_else(|| LoadError::not_found(name.as_str()))?;
        debug!(module = %name, "defining original module");
        self.runtime
            .define(Namespace::Original, name, &bytes)
            .map_err(|e| LoadError::load_failed(name.as_str(), e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::bytecode::ModuleImage;
    use crate::runtime::InMemoryRuntime;
    use crate::source::MemorySource;

    fn loader() -> OriginalLoader {
        let source =
            MemorySource::new().with("app/Bar", ModuleImage::new("app/Bar").to_bytes().unwrap());
        OriginalLoader::new(Arc::new(source), Arc::new(InMemoryRuntime::new()))
    }

    #[test]
    fn test_load_original_keeps_bytes() {
        let loader = loader();
        let handle = loader.load_original("app.Bar").unwrap();
        assert_eq!(handle.namespace(), Namespace::Original);
        assert_eq!(
            handle.bytes(),
            &ModuleImage::new("app/Bar").to_bytes().unwrap()[..]
        );
        assert_eq!(loader.load_original("app/Bar").unwrap(), handle);
        assert_eq!(loader.cached(&CanonicalName::new("app/Bar")), Some(handle));
    }

    #[test]
    fn test_missing_original() {
        assert_eq!(
            loader().load_original("app/Missing").unwrap_err(),
            LoadError::not_found("app/Missing")
        );
    }

    #[test]
    fn test_empty_name() {
        assert_eq!(loader().load_original("").unwrap_err(), LoadError::NameEmpty);
    }
}
