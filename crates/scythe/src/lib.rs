//! Scythe: Load-Time Module Instrumentation
//!
//! Scythe sits between a module runtime and its module sources. Every module
//! requested through an [`InstrumentingLoader`] is fetched, run through a
//! [`Pipeline`] of rewrite stages (supertype substitution, user interceptors,
//! line and branch coverage, dependency recording, mutation) and defined into
//! the runtime. Modules it cannot or should not rewrite fall back to the
//! parent loader untouched.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   fetch    ┌────────────────┐   bytes   ┌──────────────┐
//! │ Instrumenting│──────────► │ ResourceSource │           │ ModuleRuntime│
//! │ Loader       │            └────────────────┘           │ / Parent     │
//! │  (cache)     │── transform ─► Session ── Gate ── Pipeline ─► define ──►│
//! └──────────────┘                                         └──────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use scythe::prelude::*;
//! use std::sync::Arc;
//!
//! let bytes = ModuleImage::new("app/Bar")
//!     .with_method(Method::new("run", vec![Instruction::Line(1), Instruction::Return]))
//!     .to_bytes()
//!     .unwrap();
//!
//! let runtime = Arc::new(InMemoryRuntime::new());
//! let loader = InstrumentingLoader::new(
//!     Arc::new(Session::default()),
//!     Arc::new(MemorySource::new().with("app/Bar", bytes)),
//!     runtime.clone(),
//!     runtime,
//! );
//!
//! let handle = loader.load("app.Bar", true).unwrap();
//! assert!(handle.is_linked());
//! ```

#![warn(missing_docs)]

pub mod bytecode;
pub mod config;
pub mod dump;
pub mod gate;
pub mod loader;
pub mod naming;
pub mod pipeline;
pub mod recorder;
mod result;
pub mod runtime;
pub mod session;
pub mod source;

pub use bytecode::{FormatError, Instruction, Label, Method, ModuleImage};
pub use config::{InstrumentationApproach, InstrumentationConfig, InstrumentationConfigBuilder};
pub use gate::{EligibilityGate, TransformOutcome, Transformed};
pub use loader::{InstrumentingLoader, OriginalLoader};
pub use naming::CanonicalName;
pub use pipeline::{Intercept, Interceptor, Pipeline, StageError};
pub use recorder::{CoverageRecorder, ProbeRegistry};
pub use result::{LoadError, ScytheError, ScytheResult};
pub use runtime::{InMemoryRuntime, ModuleHandle, ModuleRuntime, Namespace, ParentLoader};
pub use session::{ExitFlushGuard, Session};
pub use source::{MemorySource, ResourceSource, SearchPath};

/// Everything needed to drive a session
pub mod prelude {
    pub use super::bytecode::*;
    pub use super::config::*;
    pub use super::gate::{EligibilityGate, PredicateId, TransformOutcome, Transformed};
    pub use super::loader::*;
    pub use super::naming::CanonicalName;
    pub use super::pipeline::{
        Intercept, Interceptor, InterceptorId, MutantId, Pipeline, ProbeTable, StageError,
    };
    pub use super::recorder::*;
    pub use super::result::*;
    pub use super::runtime::*;
    pub use super::session::*;
    pub use super::source::*;
}
