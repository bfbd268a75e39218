//! Identity cache with per-name load convergence
//!
//! Every successful load is cached forever under its canonical name. While a
//! name is loading, concurrent requests for it wait on the same in-flight
//! cell instead of starting a second load; other names are unaffected.

use crate::naming::CanonicalName;
use crate::result::LoadError;
use crate::runtime::ModuleHandle;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

type InFlight = Arc<OnceLock<Result<ModuleHandle, LoadError>>>;

/// Canonical name to realized module
#[derive(Debug, Default)]
pub struct IdentityCache {
    entries: RwLock<HashMap<CanonicalName, ModuleHandle>>,
    in_flight: Mutex<HashMap<CanonicalName, InFlight>>,
}

impl IdentityCache {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached handle for `name`
    #[must_use]
    pub fn get(&self, name: &CanonicalName) -> Option<ModuleHandle> {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Number of cached modules
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether nothing is cached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached handle for `name`, or the result of running `load` once
    ///
    /// Callers arriving while `load` runs receive its result, error included.
    /// Failures are not cached: a later call starts a new load.
    pub fn get_or_load<F>(&self, name: &CanonicalName, load: F) -> Result<ModuleHandle, LoadError>
    where
        F: FnOnce() -> Result<ModuleHandle, LoadError>,
    {
        if let Some(handle) = self.get(name) {
            return Ok(handle);
        }

        let cell = {
            let mut in_flight = self
                .in_flight
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            // a load may have completed between the lookup and the lock
            if let Some(handle) = self.get(name) {
                return Ok(handle);
            }
            Arc::clone(in_flight.entry(name.clone()).or_default())
        };

        let result = cell
            .get_or_init(|| {
                let result = load();
                if let Ok(handle) = &result {
                    self.entries
                        .write()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .insert(name.clone(), handle.clone());
                }
                result
            })
            .clone();

        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if in_flight
            .get(name)
            .is_some_and(|current| Arc::ptr_eq(current, &cell))
        {
            in_flight.remove(name);
        }
        result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::runtime::Namespace;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;

    fn handle(name: &str) -> ModuleHandle {
        ModuleHandle::new(0, CanonicalName::new(name), Namespace::Instrumenting, Vec::new())
    }

    #[test]
    fn test_caches_success() {
        let cache = IdentityCache::new();
        let name = CanonicalName::new("a/B");
        let first = cache.get_or_load(&name, || Ok(handle("a/B"))).unwrap();
        let second = cache
            .get_or_load(&name, || panic!("must not reload"))
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_failure_not_cached() {
        let cache = IdentityCache::new();
        let name = CanonicalName::new("a/B");
        let err = cache
            .get_or_load(&name, || Err(LoadError::not_found("a/B")))
            .unwrap_err();
        assert_eq!(err, LoadError::not_found("a/B"));
        assert!(cache.is_empty());
        assert!(cache.get_or_load(&name, || Ok(handle("a/B"))).is_ok());
    }

    #[test]
    fn test_concurrent_loads_converge() {
        let cache = Arc::new(IdentityCache::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));
        let name = CanonicalName::new("a/B");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let runs = Arc::clone(&runs);
                let barrier = Arc::clone(&barrier);
                let name = name.clone();
                thread::spawn(move || {
                    barrier.wait();
                    cache
                        .get_or_load(&name, || {
                            runs.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(std::time::Duration::from_millis(20));
                            Ok(handle("a/B"))
                        })
                        .unwrap()
                })
            })
            .collect();

        let results: Vec<ModuleHandle> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|h| *h == results[0]));
    }

    #[test]
    fn test_distinct_names_independent() {
        let cache = IdentityCache::new();
        let a = cache
            .get_or_load(&CanonicalName::new("a/A"), || Ok(handle("a/A")))
            .unwrap();
        let b = cache
            .get_or_load(&CanonicalName::new("b/B"), || Ok(handle("b/B")))
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(cache.len(), 2);
    }
}
