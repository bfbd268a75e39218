//! Eligibility Gate
//!
//! Decides which modules are rewritten and guards the transformer against
//! seeing a module twice. Rewrite failures never escape: the gate degrades to
//! the original bytes and logs a warning.

use crate::bytecode::{decode, subroutine::inline_module};
use crate::config::{InstrumentationApproach, InstrumentationConfig};
use crate::naming::CanonicalName;
use crate::pipeline::{Pipeline, PipelineReport};
use crate::result::LoadError;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tracing::{debug, error, warn};

/// Namespaces never instrumented: host runtime, standard library, and the
/// instrumentation machinery itself
pub const DEFAULT_DENY_LIST: &[&str] = &["std/", "core/", "alloc/", "runtime/", "scythe/"];

/// Predicate consulted by [`EligibilityGate::should_instrument`]
pub type Predicate = dyn Fn(&CanonicalName) -> bool + Send + Sync;

/// Handle returned when registering a predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PredicateId(u64);

/// Namespace prefixes excluded from instrumentation
#[derive(Debug)]
pub struct DenyList {
    prefixes: RwLock<Vec<CanonicalName>>,
}

impl Default for DenyList {
    fn default() -> Self {
        Self {
            prefixes: RwLock::new(DEFAULT_DENY_LIST.iter().copied().map(CanonicalName::new).collect()),
        }
    }
}

impl DenyList {
    /// List seeded with [`DEFAULT_DENY_LIST`]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// List with no prefix at all
    #[must_use]
    pub fn empty() -> Self {
        Self {
            prefixes: RwLock::new(Vec::new()),
        }
    }

    /// Add a prefix; returns false if already present
    pub fn add(&self, prefix: impl Into<CanonicalName>) -> bool {
        let prefix = prefix.into();
        let mut prefixes = self
            .prefixes
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if prefix.is_empty() || prefixes.contains(&prefix) {
            return false;
        }
        prefixes.push(prefix);
        true
    }

    /// Remove a prefix; returns whether it was present
    pub fn remove(&self, prefix: impl Into<CanonicalName>) -> bool {
        let prefix = prefix.into();
        let mut prefixes = self
            .prefixes
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = prefixes.len();
        prefixes.retain(|p| *p != prefix);
        prefixes.len() != before
    }

    /// Whether `name` falls under any prefix
    #[must_use]
    pub fn denies(&self, name: &CanonicalName) -> bool {
        self.prefixes
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .any(|prefix| name.starts_with(prefix))
    }

    /// Current prefixes
    #[must_use]
    pub fn prefixes(&self) -> Vec<CanonicalName> {
        self.prefixes
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

/// Names already handed to the transformer; grows monotonically
#[derive(Debug, Default)]
pub struct SeenSet {
    names: Mutex<HashSet<CanonicalName>>,
}

impl SeenSet {
    /// Insert `name`; false if it was already present
    pub fn insert(&self, name: CanonicalName) -> bool {
        self.names
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(name)
    }

    /// Whether `name` has been seen
    #[must_use]
    pub fn contains(&self, name: &CanonicalName) -> bool {
        self.names
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(name)
    }

    /// Number of names seen
    #[must_use]
    pub fn len(&self) -> usize {
        self.names
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether nothing has been seen
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result category of [`EligibilityGate::transform`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformOutcome {
    /// Not eligible; bytes returned unchanged
    PassThrough,
    /// Rewritten by the pipeline
    Instrumented,
    /// Eligible but the rewrite failed; bytes returned unchanged
    Degraded(LoadError),
}

impl TransformOutcome {
    /// Whether the bytes differ from the input by construction
    #[must_use]
    pub const fn is_instrumented(&self) -> bool {
        matches!(self, Self::Instrumented)
    }
}

impl fmt::Display for TransformOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PassThrough => f.write_str("pass-through"),
            Self::Instrumented => f.write_str("instrumented"),
            Self::Degraded(_) => f.write_str("degraded"),
        }
    }
}

/// Bytes produced by the gate
#[derive(Debug, Clone)]
pub struct Transformed {
    /// Bytes to define
    pub bytes: Vec<u8>,
    /// How they were produced
    pub outcome: TransformOutcome,
    /// Pipeline side results, for instrumented modules only
    pub report: Option<PipelineReport>,
}

impl Transformed {
    fn unchanged(raw: &[u8], outcome: TransformOutcome) -> Self {
        Self {
            bytes: raw.to_vec(),
            outcome,
            report: None,
        }
    }
}

/// Eligibility rules plus the transform entry point
pub struct EligibilityGate {
    approach: InstrumentationApproach,
    log_timings: bool,
    deny: DenyList,
    seen: SeenSet,
    predicates: RwLock<Vec<(PredicateId, Arc<Predicate>)>>,
    next_predicate: AtomicU64,
}

impl fmt::Debug for EligibilityGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EligibilityGate")
            .field("approach", &self.approach)
            .field("deny", &self.deny)
            .field("seen", &self.seen.len())
            .finish_non_exhaustive()
    }
}

impl EligibilityGate {
    /// Gate with the default deny list
    #[must_use]
    pub fn new(config: &InstrumentationConfig) -> Self {
        Self::with_deny_list(config, DenyList::new())
    }

    /// Gate with an explicit deny list
    #[must_use]
    pub fn with_deny_list(config: &InstrumentationConfig, deny: DenyList) -> Self {
        Self {
            approach: config.approach,
            log_timings: config.log_timings,
            deny,
            seen: SeenSet::default(),
            predicates: RwLock::new(Vec::new()),
            next_predicate: AtomicU64::new(0),
        }
    }

    /// Deny list
    #[must_use]
    pub const fn deny_list(&self) -> &DenyList {
        &self.deny
    }

    /// Names handed to the transformer so far
    #[must_use]
    pub const fn seen(&self) -> &SeenSet {
        &self.seen
    }

    /// Whether `name` falls under a deny-listed namespace
    #[must_use]
    pub fn is_denied(&self, name: &CanonicalName) -> bool {
        self.deny.denies(name)
    }

    /// Add a predicate; all predicates must accept a module for it to be
    /// instrumented
    pub fn register_predicate<F>(&self, predicate: F) -> PredicateId
    where
        F: Fn(&CanonicalName) -> bool + Send + Sync + 'static,
    {
        let id = PredicateId(self.next_predicate.fetch_add(1, Ordering::Relaxed));
        let predicate: Arc<Predicate> = Arc::new(predicate);
        self.predicates
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((id, predicate));
        id
    }

    /// Remove a predicate; returns whether it was registered
    pub fn unregister_predicate(&self, id: PredicateId) -> bool {
        let mut predicates = self
            .predicates
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = predicates.len();
        predicates.retain(|(existing, _)| *existing != id);
        predicates.len() != before
    }

    /// Whether `name` should be rewritten
    ///
    /// False for empty names, when instrumentation is disabled, for
    /// deny-listed namespaces, and when any registered predicate refuses.
    #[must_use]
    pub fn should_instrument(&self, name: &str) -> bool {
        let name = CanonicalName::new(name);
        if name.is_empty() || !self.approach.is_enabled() || self.is_denied(&name) {
            return false;
        }
        // predicates run outside the lock; they may register others
        let predicates: Vec<Arc<Predicate>> = self
            .predicates
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|(_, p)| Arc::clone(p))
            .collect();
        predicates.iter().all(|accept| accept(&name))
    }

    /// Run `pipeline` over `raw` if `name` is eligible
    ///
    /// # Errors
    ///
    /// [`LoadError::DuplicateTransform`] if `name` was handed over before.
    /// Every other failure degrades to the original bytes.
    pub fn transform(
        &self,
        name: &CanonicalName,
        raw: &[u8],
        pipeline: &Pipeline,
    ) -> Result<Transformed, LoadError> {
        if !self.seen.insert(name.clone()) {
            error!(module = %name, "module handed to the transformer twice");
            return Err(LoadError::duplicate(name.as_str()));
        }
        if !self.should_instrument(name.as_str()) {
            debug!(module = %name, "not eligible for instrumentation");
            return Ok(Transformed::unchanged(raw, TransformOutcome::PassThrough));
        }

        let started = Instant::now();
        match rewrite(name, raw, pipeline) {
            Ok((bytes, report)) => {
                if self.log_timings {
                    debug!(
                        module = %name,
                        elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
                        stages = report.applied.len(),
                        "instrumented module"
                    );
                }
                Ok(Transformed {
                    bytes,
                    outcome: TransformOutcome::Instrumented,
                    report: Some(report),
                })
            }
            Err(err) => {
                warn!(module = %name, error = %err, "instrumentation failed, keeping original bytes");
                Ok(Transformed::unchanged(raw, TransformOutcome::Degraded(err)))
            }
        }
    }
}

fn rewrite(
    name: &CanonicalName,
    raw: &[u8],
    pipeline: &Pipeline,
) -> Result<(Vec<u8>, PipelineReport), LoadError> {
    let failed = |message: String| LoadError::transformation(name.as_str(), message);
    let mut image = decode(raw).map_err(|e| failed(e.to_string()))?;
    inline_module(&mut image).map_err(|e| failed(e.to_string()))?;
    let report = pipeline.run(name, &mut image).map_err(|e| failed(e.to_string()))?;
    let bytes = image.to_bytes().map_err(|e| failed(e.to_string()))?;
    Ok((bytes, report))
}
