//! Transformation Pipeline
//!
//! A [`Pipeline`] is an ordered chain of [`Stage`]s built fresh for every
//! transformation from the session's current settings. Stages are listed in
//! composition order (outermost first) and applied innermost first:
//!
//! ```text
//! composition:  Substitution, Interceptors..., Coverage, DependencyGraph, Mutation
//! application:  Mutation -> DependencyGraph -> Coverage -> Interceptors... -> Substitution
//! ```
//!
//! Interceptors are the exception: they run in registration order.

mod coverage;
mod dependency;
mod mutation;
mod substitution;

pub use coverage::{
    CoverageStage, CoverageVariant, Probe, ProbeKind, ProbeTable, BRANCH_HIT, COUNTER_FIELD,
    LINE_HIT, RECORDER_MODULE,
};
pub use dependency::{collect_dependencies, DependencyGraph, DependencySnapshot};
pub use mutation::{
    mutant_of, MutantId, MutantSite, MutationCatalog, MutationOperator, MutationStage,
};
pub use substitution::{SubstitutionStage, SuperclassReplacements};

use crate::bytecode::{FormatError, ModuleImage};
use crate::config::InstrumentationApproach;
use crate::naming::CanonicalName;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::trace;

/// Errors raised by a pipeline stage
#[derive(Debug, Error)]
pub enum StageError {
    /// Label space exhausted while rewriting
    #[error(transparent)]
    Format(#[from] FormatError),

    /// More coverable points than counter slots
    #[error("Too many coverable points in {module}: {count}")]
    TooManyPoints {
        /// Module name
        module: String,
        /// Points found so far
        count: usize,
    },

    /// The module already carries coverage counters
    #[error("Module {module} is already instrumented")]
    AlreadyInstrumented {
        /// Module name
        module: String,
    },

    /// A user interceptor failed
    #[error("Interceptor {name} failed: {message}")]
    Interceptor {
        /// Interceptor name
        name: String,
        /// Error message
        message: String,
    },
}

impl StageError {
    /// Create an interceptor failure
    #[must_use]
    pub fn interceptor(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Interceptor {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// What an interceptor did with a module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intercept {
    /// The image was rewritten
    Applied,
    /// The module is not of interest; image untouched
    Declined,
}

/// User-supplied rewrite stage
///
/// Implementations must be thread safe: several modules can be transformed
/// at once, each through its own pipeline.
pub trait Interceptor: Send + Sync {
    /// Name used in logs and errors
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Inspect or rewrite `image`
    fn intercept(
        &self,
        module: &CanonicalName,
        image: &mut ModuleImage,
    ) -> Result<Intercept, StageError>;
}

/// Handle returned by [`InterceptorRegistry::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterceptorId(u64);

/// Interceptors in registration order
#[derive(Default)]
pub struct InterceptorRegistry {
    entries: RwLock<Vec<(InterceptorId, Arc<dyn Interceptor>)>>,
    next_id: AtomicU64,
}

impl fmt::Debug for InterceptorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorRegistry")
            .field("len", &self.len())
            .finish()
    }
}

impl InterceptorRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an interceptor
    pub fn register(&self, interceptor: Arc<dyn Interceptor>) -> InterceptorId {
        let id = InterceptorId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((id, interceptor));
        id
    }

    /// Remove an interceptor; returns whether it was registered
    pub fn unregister(&self, id: InterceptorId) -> bool {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    /// Number of registered interceptors
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether none are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current list, in registration order
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<dyn Interceptor>> {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|(_, interceptor)| Arc::clone(interceptor))
            .collect()
    }
}

/// One step of a pipeline
#[derive(Clone)]
pub enum Stage {
    /// Supertype substitution
    Substitution(SubstitutionStage),
    /// User interceptor
    Interceptor(Arc<dyn Interceptor>),
    /// Coverage instrumentation
    Coverage(CoverageStage),
    /// Dependency recording
    DependencyGraph,
    /// Mutant enumeration and application
    Mutation(MutationStage),
}

impl Stage {
    /// Label used in logs and reports
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::Substitution(_) => "substitution".to_string(),
            Self::Interceptor(i) => format!("interceptor:{}", i.name()),
            Self::Coverage(c) => match c.variant() {
                CoverageVariant::Static => "coverage:static".to_string(),
                CoverageVariant::Array => "coverage:array".to_string(),
            },
            Self::DependencyGraph => "dependency-graph".to_string(),
            Self::Mutation(_) => "mutation".to_string(),
        }
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// What a pipeline run produced besides the rewritten image
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    /// Stage labels, in application order
    pub applied: Vec<String>,
    /// Coverage points, when the coverage stage rewrote anything
    pub probes: Option<ProbeTable>,
    /// Referenced modules, when dependency recording is on
    pub dependencies: Option<BTreeSet<CanonicalName>>,
    /// Mutant sites, when mutant visitation is on
    pub mutants: Vec<MutantSite>,
    /// Supertypes replaced
    pub substitutions: usize,
}

/// Ordered, immutable chain of stages
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    /// Create a builder
    #[must_use]
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Stages in composition order
    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Whether the pipeline has no stage
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stages in the order they touch the image
    #[must_use]
    pub fn application_order(&self) -> Vec<&Stage> {
        let mut order = Vec::with_capacity(self.stages.len());
        let mut interceptors = Vec::new();
        for stage in self.stages.iter().rev() {
            if matches!(stage, Stage::Interceptor(_)) {
                interceptors.push(stage);
                continue;
            }
            order.extend(interceptors.drain(..).rev());
            order.push(stage);
        }
        order.extend(interceptors.into_iter().rev());
        order
    }

    /// Run every stage over `image`
    pub fn run(
        &self,
        module: &CanonicalName,
        image: &mut ModuleImage,
    ) -> Result<PipelineReport, StageError> {
        let mut report = PipelineReport::default();
        for stage in self.application_order() {
            trace!(module = %module, stage = %stage.label(), "applying stage");
            match stage {
                Stage::Mutation(mutation) => report.mutants = mutation.apply(module, image),
                Stage::DependencyGraph => report.dependencies = Some(collect_dependencies(image)),
                Stage::Coverage(coverage) => report.probes = coverage.apply(module, image)?,
                Stage::Interceptor(interceptor) => {
                    if interceptor.intercept(module, image)? == Intercept::Declined {
                        continue;
                    }
                }
                Stage::Substitution(substitution) => {
                    report.substitutions = substitution.apply(image);
                }
            }
            report.applied.push(stage.label());
        }
        Ok(report)
    }
}

/// Assembles a [`Pipeline`] in canonical stage order
#[derive(Default)]
pub struct PipelineBuilder {
    substitution: Option<SubstitutionStage>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    coverage: Option<CoverageStage>,
    dependency_graph: bool,
    mutation: Option<MutationStage>,
}

impl PipelineBuilder {
    /// Outermost supertype substitution
    #[must_use]
    pub fn substitution(mut self, stage: Option<SubstitutionStage>) -> Self {
        self.substitution = stage;
        self
    }

    /// Append an interceptor
    #[must_use]
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Append interceptors, keeping their order
    #[must_use]
    pub fn interceptors(mut self, interceptors: impl IntoIterator<Item = Arc<dyn Interceptor>>) -> Self {
        self.interceptors.extend(interceptors);
        self
    }

    /// Coverage stage for `approach`; none when it is disabled
    #[must_use]
    pub fn coverage(mut self, approach: InstrumentationApproach, lines: bool, branches: bool) -> Self {
        self.coverage = CoverageStage::new(approach, lines, branches);
        self
    }

    /// Toggle dependency recording
    #[must_use]
    pub fn dependency_graph(mut self, enabled: bool) -> Self {
        self.dependency_graph = enabled;
        self
    }

    /// Innermost mutant visitation
    #[must_use]
    pub fn mutation(mut self, stage: Option<MutationStage>) -> Self {
        self.mutation = stage;
        self
    }

    /// Build the pipeline
    #[must_use]
    pub fn build(self) -> Pipeline {
        let mut stages = Vec::new();
        stages.extend(self.substitution.map(Stage::Substitution));
        stages.extend(self.interceptors.into_iter().map(Stage::Interceptor));
        stages.extend(self.coverage.map(Stage::Coverage));
        if self.dependency_graph {
            stages.push(Stage::DependencyGraph);
        }
        stages.extend(self.mutation.map(Stage::Mutation));
        Pipeline { stages }
    }
}
