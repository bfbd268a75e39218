//! Instrumentation session
//!
//! A [`Session`] is the one context shared by every loader of a process: it
//! owns the configuration, the eligibility gate, every registry the pipeline
//! is built from, and the sinks pipeline reports are committed to. Create it
//! once, wrap it in an `Arc`, and hand it to the loaders.

use crate::config::InstrumentationConfig;
use crate::dump;
use crate::gate::{EligibilityGate, PredicateId, Transformed};
use crate::naming::CanonicalName;
use crate::pipeline::{
    DependencyGraph, Interceptor, InterceptorId, InterceptorRegistry, MutantId, MutationCatalog,
    Pipeline, PipelineReport, SuperclassReplacements,
};
use crate::recorder::{CoverageRecorder, ProbeRegistry};
use crate::result::{LoadError, ScytheResult};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Shared instrumentation state
pub struct Session {
    config: InstrumentationConfig,
    gate: EligibilityGate,
    replacements: SuperclassReplacements,
    interceptors: InterceptorRegistry,
    dependency_graph_enabled: AtomicBool,
    mutation_enabled: AtomicBool,
    dependencies: DependencyGraph,
    mutants: MutationCatalog,
    recorder: Arc<dyn CoverageRecorder>,
    exit_guard_issued: AtomicBool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("gate", &self.gate)
            .field("interceptors", &self.interceptors)
            .finish_non_exhaustive()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(InstrumentationConfig::default())
    }
}

impl Session {
    /// Session recording coverage into a [`ProbeRegistry`]
    #[must_use]
    pub fn new(config: InstrumentationConfig) -> Self {
        Self::with_recorder(config, Arc::new(ProbeRegistry::new()))
    }

    /// Session recording coverage into `recorder`
    #[must_use]
    pub fn with_recorder(config: InstrumentationConfig, recorder: Arc<dyn CoverageRecorder>) -> Self {
        info!(
            approach = %config.approach,
            lines = config.instrument_lines,
            branches = config.instrument_branches,
            "instrumentation session started"
        );
        Self {
            gate: EligibilityGate::new(&config),
            config,
            replacements: SuperclassReplacements::new(),
            interceptors: InterceptorRegistry::new(),
            dependency_graph_enabled: AtomicBool::new(false),
            mutation_enabled: AtomicBool::new(false),
            dependencies: DependencyGraph::new(),
            mutants: MutationCatalog::new(),
            recorder,
            exit_guard_issued: AtomicBool::new(false),
        }
    }

    /// Settings the session was created with
    #[must_use]
    pub const fn config(&self) -> &InstrumentationConfig {
        &self.config
    }

    /// Eligibility gate
    #[must_use]
    pub const fn gate(&self) -> &EligibilityGate {
        &self.gate
    }

    /// Coverage sink
    #[must_use]
    pub fn recorder(&self) -> &Arc<dyn CoverageRecorder> {
        &self.recorder
    }

    /// Dependencies recorded so far
    #[must_use]
    pub const fn dependency_graph(&self) -> &DependencyGraph {
        &self.dependencies
    }

    /// Mutant sites recorded so far
    #[must_use]
    pub const fn mutants(&self) -> &MutationCatalog {
        &self.mutants
    }

    // =====================================================================
    // Extension points
    // =====================================================================

    /// Add an eligibility predicate
    pub fn register_predicate<F>(&self, predicate: F) -> PredicateId
    where
        F: Fn(&CanonicalName) -> bool + Send + Sync + 'static,
    {
        self.gate.register_predicate(predicate)
    }

    /// Remove an eligibility predicate
    pub fn unregister_predicate(&self, id: PredicateId) -> bool {
        self.gate.unregister_predicate(id)
    }

    /// Exclude a namespace prefix from instrumentation
    pub fn add_denied_prefix(&self, prefix: &str) -> bool {
        self.gate.deny_list().add(prefix)
    }

    /// Re-admit a namespace prefix
    pub fn remove_denied_prefix(&self, prefix: &str) -> bool {
        self.gate.deny_list().remove(prefix)
    }

    /// Replace supertype `original` by `replacement` in modules loaded from now on
    pub fn add_superclass_replacement(&self, original: &str, replacement: &str) {
        self.replacements.insert(original, replacement);
    }

    /// Drop a supertype replacement
    pub fn remove_superclass_replacement(&self, original: &str) -> bool {
        self.replacements
            .remove(&CanonicalName::new(original))
            .is_some()
    }

    /// Append an interceptor stage
    pub fn register_interceptor(&self, interceptor: Arc<dyn Interceptor>) -> InterceptorId {
        self.interceptors.register(interceptor)
    }

    /// Remove an interceptor stage
    pub fn unregister_interceptor(&self, id: InterceptorId) -> bool {
        self.interceptors.unregister(id)
    }

    /// Toggle dependency recording
    pub fn set_dependency_graph(&self, enabled: bool) {
        self.dependency_graph_enabled.store(enabled, Ordering::Release);
    }

    /// Toggle mutant visitation
    pub fn set_mutation(&self, enabled: bool) {
        self.mutation_enabled.store(enabled, Ordering::Release);
    }

    /// Switch a mutant on; takes effect for modules transformed afterwards
    pub fn activate_mutant(&self, id: MutantId) -> bool {
        self.mutants.activate(id)
    }

    /// Switch a mutant off
    pub fn deactivate_mutant(&self, id: &MutantId) -> bool {
        self.mutants.deactivate(id)
    }

    // =====================================================================
    // Transformation
    // =====================================================================

    /// Fresh pipeline over the current registries
    #[must_use]
    pub fn pipeline(&self) -> Pipeline {
        Pipeline::builder()
            .substitution(self.replacements.stage())
            .interceptors(self.interceptors.snapshot())
            .coverage(
                self.config.approach,
                self.config.instrument_lines,
                self.config.instrument_branches,
            )
            .dependency_graph(self.dependency_graph_enabled.load(Ordering::Acquire))
            .mutation(
                self.mutation_enabled
                    .load(Ordering::Acquire)
                    .then(|| self.mutants.stage()),
            )
            .build()
    }

    /// Run `original` through the gate and a fresh pipeline without defining it
    ///
    /// Reports of instrumented modules are committed to the recorder,
    /// dependency graph and mutation catalog. Persistence failures are logged
    /// and never fail the call.
    ///
    /// # Errors
    ///
    /// [`LoadError::NameEmpty`] for an empty name and
    /// [`LoadError::DuplicateTransform`] for a name transformed before.
    pub fn modify_bytes(&self, name: &str, original: &[u8]) -> Result<Transformed, LoadError> {
        let name = CanonicalName::new(name);
        if name.is_empty() {
            error!("empty module name given to the transformer");
            return Err(LoadError::NameEmpty);
        }

        let transformed = self.gate.transform(&name, original, &self.pipeline())?;
        if let Some(report) = &transformed.report {
            self.commit(&name, report);
        }
        self.persist(&name, &transformed);
        Ok(transformed)
    }

    fn commit(&self, name: &CanonicalName, report: &PipelineReport) {
        if let Some(probes) = &report.probes {
            self.recorder.module_instrumented(probes);
        }
        if let Some(dependencies) = &report.dependencies {
            self.dependencies.record(name.clone(), dependencies.clone());
        }
        if self.mutation_enabled.load(Ordering::Acquire) {
            self.mutants.record(name.clone(), report.mutants.clone());
        }
    }

    fn persist(&self, name: &CanonicalName, transformed: &Transformed) {
        let wanted = self.config.write_module
            || (self.config.write_if_modified && transformed.outcome.is_instrumented());
        if !wanted {
            return;
        }
        if let Err(err) = dump::write_module(&self.config.bytecode_dir, name, &transformed.bytes) {
            warn!(module = %name, error = %err, "could not persist module");
        }
    }

    // =====================================================================
    // Coverage flush
    // =====================================================================

    /// Write coverage to the configured file
    pub fn flush_coverage(&self) -> ScytheResult<()> {
        self.recorder.write_to(&self.config.coverage_file)
    }

    /// Guard flushing coverage once when dropped
    ///
    /// `None` unless `coverage_on_exit` is set, and for every call after the
    /// first.
    #[must_use]
    pub fn exit_flush_guard(self: &Arc<Self>) -> Option<ExitFlushGuard> {
        if !self.config.coverage_on_exit || self.exit_guard_issued.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(ExitFlushGuard {
            session: Arc::clone(self),
        })
    }
}

/// Flushes coverage of a session when dropped; hold it for the life of `main`
#[derive(Debug)]
pub struct ExitFlushGuard {
    session: Arc<Session>,
}

impl Drop for ExitFlushGuard {
    fn drop(&mut self) {
        match self.session.flush_coverage() {
            Ok(()) => info!(
                path = %self.session.config.coverage_file.display(),
                "flushed coverage on exit"
            ),
            Err(err) => warn!(error = %err, "coverage flush on exit failed"),
        }
    }
}
