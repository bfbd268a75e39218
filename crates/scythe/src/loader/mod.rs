//! Module Loaders
//!
//! [`InstrumentingLoader`] is the runtime-facing entry point:
//!
//! ```text
//! load(name) -> cache hit? -> fetch -> gate + pipeline -> define (or delegate) -> cache
//! ```
//!
//! Anything the loader cannot or should not own (missing resources,
//! deny-listed modules, bytes the runtime refuses) is delegated to the parent
//! loader with the original bytes, so an instrumentation problem degrades to
//! an uninstrumented module rather than a failed load.
//!
//! [`OriginalLoader`] loads the same resources untouched.

mod cache;
mod original;

pub use cache::IdentityCache;
pub use original::OriginalLoader;

use crate::gate::Transformed;
use crate::naming::CanonicalName;
use crate::result::LoadError;
use crate::runtime::{ModuleHandle, ModuleRuntime, Namespace, ParentLoader};
use crate::session::Session;
use crate::source::ResourceSource;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, trace, warn};

/// Loader that instruments modules as they are loaded
pub struct InstrumentingLoader {
    session: Arc<Session>,
    source: Arc<dyn ResourceSource>,
    runtime: Arc<dyn ModuleRuntime>,
    parent: Arc<dyn ParentLoader>,
    cache: IdentityCache,
    staged: Mutex<HashMap<CanonicalName, Staged>>,
}

impl fmt::Debug for InstrumentingLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentingLoader")
            .field("session", &self.session)
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl InstrumentingLoader {
    /// Create a loader
    #[must_use]
    pub fn new(
        session: Arc<Session>,
        source: Arc<dyn ResourceSource>,
        runtime: Arc<dyn ModuleRuntime>,
        parent: Arc<dyn ParentLoader>,
    ) -> Self {
        Self {
            session,
            source,
            runtime,
            parent,
            cache: IdentityCache::new(),
            staged: Mutex::new(HashMap::new()),
        }
    }

    /// Session this loader transforms through
    #[must_use]
    pub const fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Loader for untouched modules over the same source and runtime
    #[must_use]
    pub fn original_loader(&self) -> OriginalLoader {
        OriginalLoader::new(Arc::clone(&self.source), Arc::clone(&self.runtime))
    }

    /// Extend the resource search path; false if the source has no roots
    pub fn add_root(&self, root: &Path) -> bool {
        let added = self.source.add_root(root);
        if added {
            debug!(root = %root.display(), "added search root");
        }
        added
    }

    /// Cached handle for `name`
    #[must_use]
    pub fn cached(&self, name: &str) -> Option<ModuleHandle> {
        self.cache.get(&CanonicalName::new(name))
    }

    /// Number of cached modules
    #[must_use]
    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    /// Transform `original` without defining it
    ///
    /// # Errors
    ///
    /// See [`Session::modify_bytes`].
    pub fn modify_bytes(&self, name: &str, original: &[u8]) -> Result<Transformed, LoadError> {
        self.session.modify_bytes(name, original)
    }

    /// Load `name`, instrumenting it if eligible
    ///
    /// Concurrent calls for one name run the pipeline once and return the
    /// same handle. With `resolve`, freshly loaded modules are linked.
    ///
    /// # Errors
    ///
    /// - [`LoadError::NameEmpty`] for an empty name
    /// - [`LoadError::ResourceNotFound`] when neither the source nor the
    ///   parent loader can supply the module
    /// - [`LoadError::DuplicateTransform`] when the module was transformed
    ///   through another path before
    /// - [`LoadError::ModuleLoadFailed`] for every other failure
    pub fn load(&self, name: &str, resolve: bool) -> Result<ModuleHandle, LoadError> {
        let name = CanonicalName::new(name);
        if let Some(handle) = self.cache.get(&name) {
            trace!(module = %name, "cache hit");
            return Ok(handle);
        }
        if name.is_empty() {
            error!("empty module name given to the loader");
            return Err(LoadError::NameEmpty);
        }
        self.cache
            .get_or_load(&name, || self.load_uncached(&name, resolve))
    }

    fn load_uncached(&self, name: &CanonicalName, resolve: bool) -> Result<ModuleHandle, LoadError> {
        let staged = self.take_staged(name);
        let (handle, needs_link) = match staged {
            Some(Staged::Defined(handle)) => {
                debug!(module = %name, "retrying link of a module defined earlier");
                (handle, true)
            }
            Some(Staged::Transformed { original, transformed }) => {
                debug!(module = %name, "retrying define with bytes transformed earlier");
                self.define(name, original, transformed, resolve)?
            }
            None => {
                let original = match self.source.fetch(name) {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => return self.delegate_missing(name, resolve),
                    Err(err) => {
                        error!(module = %name, error = %err, "could not read module resource");
                        return Err(LoadError::load_failed(name.as_str(), err.to_string()));
                    }
                };
                let transformed = self.session.modify_bytes(name.as_str(), &original)?;
                self.define(name, original, transformed, resolve)?
            }
        };

        if resolve && needs_link && !handle.is_linked() {
            if let Err(err) = self.runtime.link(&handle) {
                warn!(module = %name, error = %err, "link failed, keeping the defined module for a retry");
                self.stage(name, Staged::Defined(handle));
                return Err(LoadError::load_failed(name.as_str(), err.to_string()));
            }
        }
        Ok(handle)
    }

    /// Define transformed bytes, or delegate the original ones
    ///
    /// Returns the handle and whether it still needs linking here; parent
    /// handles are resolved by the parent. On failure the bytes are staged so
    /// a retry does not transform the module a second time.
    fn define(
        &self,
        name: &CanonicalName,
        original: Vec<u8>,
        transformed: Transformed,
        resolve: bool,
    ) -> Result<(ModuleHandle, bool), LoadError> {
        if self.session.gate().is_denied(name) {
            debug!(module = %name, "deny-listed, delegating to parent");
            return self
                .delegate_staging(name, original, transformed, resolve)
                .map(|handle| (handle, false));
        }

        match self
            .runtime
            .define(Namespace::Instrumenting, name, &transformed.bytes)
        {
            Ok(handle) => {
                debug!(module = %name, outcome = %transformed.outcome, "defined module");
                Ok((handle, true))
            }
            Err(err) => {
                warn!(module = %name, error = %err, "define failed, delegating original bytes to parent");
                self.delegate_staging(name, original, transformed, resolve)
                    .map(|handle| (handle, false))
            }
        }
    }

    fn delegate_staging(
        &self,
        name: &CanonicalName,
        original: Vec<u8>,
        transformed: Transformed,
        resolve: bool,
    ) -> Result<ModuleHandle, LoadError> {
        match self.parent.load(name, Some(&original), resolve) {
            Ok(handle) => Ok(handle),
            Err(err) => {
                warn!(module = %name, error = %err, "parent refused the module");
                self.stage(name, Staged::Transformed { original, transformed });
                Err(LoadError::load_failed(name.as_str(), err.to_string()))
            }
        }
    }

    fn delegate_missing(&self, name: &CanonicalName, resolve: bool) -> Result<ModuleHandle, LoadError> {
        debug!(module = %name, "no resource, delegating to parent");
        self.parent.load(name, None, resolve).map_err(|e| match e {
            LoadError::ResourceNotFound { .. } => LoadError::not_found(name.as_str()),
            other => LoadError::load_failed(name.as_str(), other.to_string()),
        })
    }

    fn stage(&self, name: &CanonicalName, staged: Staged) {
        self.staged
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(name.clone(), staged);
    }

    fn take_staged(&self, name: &CanonicalName) -> Option<Staged> {
        self.staged
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(name)
    }
}

/// Work kept from a load that failed after the module was transformed
#[derive(Debug)]
enum Staged {
    /// Defined in the runtime but not linked
    Defined(ModuleHandle),
    /// Transformed but neither defined nor delegated
    Transformed {
        original: Vec<u8>,
        transformed: Transformed,
    },
}

#[cfg(test)]
mod tests;
