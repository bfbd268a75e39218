#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::*;
use crate::bytecode::{FieldKind, Instruction, Label, Method, ModuleImage};
use crate::config::{InstrumentationApproach, InstrumentationConfig};
use crate::pipeline::{Intercept, Interceptor, StageError, COUNTER_FIELD};
use crate::runtime::InMemoryRuntime;
use crate::source::{MemorySource, SearchPath};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Barrier, Mutex};
use std::thread;

// =========================================================================
// Fixtures
// =========================================================================

/// Module with three line points and one conditional jump
fn module(name: &str) -> Vec<u8> {
    ModuleImage::new(name)
        .with_method(
            Method::new(
                "run",
                vec![
                    Instruction::Line(1),
                    Instruction::Load(0),
                    Instruction::IfZero(Label(0)),
                    Instruction::Line(2),
                    Instruction::Push(1),
                    Instruction::Store(0),
                    Instruction::Label(Label(0)),
                    Instruction::Line(3),
                    Instruction::Return,
                ],
            )
            .with_max_locals(1),
        )
        .to_bytes()
        .unwrap()
}

struct Fixture {
    runtime: Arc<InMemoryRuntime>,
    loader: InstrumentingLoader,
}

fn fixture(config: InstrumentationConfig, source: MemorySource) -> Fixture {
    let runtime = Arc::new(InMemoryRuntime::new());
    fixture_with(config, source, runtime)
}

fn fixture_with(
    config: InstrumentationConfig,
    source: MemorySource,
    runtime: Arc<InMemoryRuntime>,
) -> Fixture {
    let session = Arc::new(Session::new(config));
    let loader = InstrumentingLoader::new(
        session,
        Arc::new(source),
        Arc::clone(&runtime) as Arc<dyn ModuleRuntime>,
        Arc::clone(&runtime) as Arc<dyn ParentLoader>,
    );
    Fixture { runtime, loader }
}

fn lines_only() -> InstrumentationConfig {
    InstrumentationConfig::builder()
        .approach(InstrumentationApproach::Array)
        .instrument_lines(true)
        .instrument_branches(false)
        .build()
}

/// Counts invocations and declines
struct Counting(Arc<AtomicUsize>);

impl Interceptor for Counting {
    fn intercept(&self, _: &CanonicalName, _: &mut ModuleImage) -> Result<Intercept, StageError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        thread::sleep(std::time::Duration::from_millis(10));
        Ok(Intercept::Declined)
    }
}

/// Appends a marker constant to the first method
struct Marker(&'static str, Arc<Mutex<Vec<&'static str>>>);

impl Interceptor for Marker {
    fn name(&self) -> &str {
        self.0
    }

    fn intercept(&self, _: &CanonicalName, image: &mut ModuleImage) -> Result<Intercept, StageError> {
        self.1.lock().unwrap().push(self.0);
        image.methods[0].code.insert(0, Instruction::Ldc(self.0.to_string()));
        Ok(Intercept::Applied)
    }
}

/// Runtime refusing every definition in the instrumenting namespace
struct RefusingRuntime(Arc<InMemoryRuntime>);

impl ModuleRuntime for RefusingRuntime {
    fn define(
        &self,
        namespace: Namespace,
        name: &CanonicalName,
        bytes: &[u8],
    ) -> Result<ModuleHandle, LoadError> {
        if namespace == Namespace::Instrumenting {
            return Err(LoadError::define(name.as_str(), "verification failed"));
        }
        self.0.define(namespace, name, bytes)
    }

    fn link(&self, module: &ModuleHandle) -> Result<(), LoadError> {
        self.0.link(module)
    }
}

// =========================================================================
// Eligibility scenarios
// =========================================================================

#[test]
fn test_deny_listed_module_keeps_original_bytes() {
    let source = MemorySource::new()
        .with("internal/Foo", module("internal/Foo"))
        .with("app/Bar", module("app/Bar"));
    let fx = fixture(lines_only(), source);
    fx.loader.session().add_denied_prefix("internal/");

    let foo = fx.loader.load("internal.Foo", false).unwrap();
    assert_eq!(foo.bytes(), &module("internal/Foo")[..]);
    assert_eq!(foo.namespace(), Namespace::Parent);

    let bar = fx.loader.load("app.Bar", false).unwrap();
    assert_eq!(bar.namespace(), Namespace::Instrumenting);
    let image = ModuleImage::from_bytes(bar.bytes()).unwrap();
    assert_eq!(
        image.field(COUNTER_FIELD).unwrap().kind,
        FieldKind::IntArray(3)
    );
}

#[test]
fn test_both_categories_off_keeps_bytes() {
    let config = InstrumentationConfig::builder()
        .instrument_lines(false)
        .instrument_branches(false)
        .build();
    let fx = fixture(config, MemorySource::new().with("app/Bar", module("app/Bar")));
    let handle = fx.loader.load("app/Bar", false).unwrap();
    assert_eq!(handle.bytes(), &module("app/Bar")[..]);
    assert_eq!(handle.namespace(), Namespace::Instrumenting);
}

#[test]
fn test_disabled_approach_defines_original_bytes() {
    let config = InstrumentationConfig::builder()
        .approach(InstrumentationApproach::None)
        .build();
    let fx = fixture(config, MemorySource::new().with("app/Bar", module("app/Bar")));
    let handle = fx.loader.load("app/Bar", false).unwrap();
    assert_eq!(handle.bytes(), &module("app/Bar")[..]);
}

#[test]
fn test_predicate_excludes_module() {
    let fx = fixture(lines_only(), MemorySource::new().with("app/Bar", module("app/Bar")));
    fx.loader
        .session()
        .register_predicate(|name| name.package() != "app");
    let handle = fx.loader.load("app/Bar", false).unwrap();
    assert_eq!(handle.bytes(), &module("app/Bar")[..]);
}

// =========================================================================
// Pipeline ordering
// =========================================================================

#[test]
fn test_interceptors_apply_in_registration_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let fx = fixture(lines_only(), MemorySource::new().with("app/Bar", module("app/Bar")));
    let session = fx.loader.session();
    session.register_interceptor(Arc::new(Marker("A", Arc::clone(&log))));
    session.register_interceptor(Arc::new(Marker("B", Arc::clone(&log))));

    let handle = fx.loader.load("app/Bar", false).unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["A", "B"]);
    let image = ModuleImage::from_bytes(handle.bytes()).unwrap();
    let code = &image.method("run").unwrap().code;
    assert_eq!(code[0], Instruction::Ldc("B".into()));
    assert_eq!(code[1], Instruction::Ldc("A".into()));
}

// =========================================================================
// Caching and concurrency
// =========================================================================

#[test]
fn test_repeated_load_returns_cached_handle() {
    let fx = fixture(lines_only(), MemorySource::new().with("app/Bar", module("app/Bar")));
    let first = fx.loader.load("app/Bar", false).unwrap();
    let second = fx.loader.load("app.Bar", true).unwrap();
    assert_eq!(first, second);
    assert_eq!(fx.loader.cached_count(), 1);
    assert_eq!(fx.runtime.defined_count(Namespace::Instrumenting), 1);
}

#[test]
fn test_concurrent_loads_run_pipeline_once() {
    const THREADS: usize = 8;
    let runs = Arc::new(AtomicUsize::new(0));
    let fx = fixture(lines_only(), MemorySource::new().with("app/Bar", module("app/Bar")));
    fx.loader
        .session()
        .register_interceptor(Arc::new(Counting(Arc::clone(&runs))));
    let loader = Arc::new(fx.loader);
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let loader = Arc::clone(&loader);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                loader.load("app/Bar", false).unwrap()
            })
        })
        .collect();

    let handles: Vec<ModuleHandle> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(handles.iter().all(|h| *h == handles[0]));
    assert_eq!(fx.runtime.defined_count(Namespace::Instrumenting), 1);
}

#[test]
fn test_concurrent_loads_of_distinct_names() {
    let names: Vec<String> = (0..6).map(|i| format!("app/M{i}")).collect();
    let source = MemorySource::new();
    for name in &names {
        source.insert(name.as_str(), module(name));
    }
    let fx = fixture(lines_only(), source);
    let loader = Arc::new(fx.loader);

    let workers: Vec<_> = names
        .iter()
        .cloned()
        .map(|name| {
            let loader = Arc::clone(&loader);
            thread::spawn(move || loader.load(&name, false).unwrap())
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(loader.cached_count(), names.len());
    assert_eq!(fx.runtime.defined_count(Namespace::Instrumenting), names.len());
}

#[test]
fn test_resolve_links_fresh_module() {
    let fx = fixture(lines_only(), MemorySource::new().with("app/Bar", module("app/Bar")));
    let handle = fx.loader.load("app/Bar", true).unwrap();
    assert!(handle.is_linked());
}

// =========================================================================
// Delegation and errors
// =========================================================================

#[test]
fn test_missing_resource_delegated_to_parent() {
    let runtime =
        Arc::new(InMemoryRuntime::new().with_bootstrap("missing/Mod", module("missing/Mod")));
    let fx = fixture_with(lines_only(), MemorySource::new(), runtime);

    let handle = fx.loader.load("missing.Mod", false).unwrap();
    assert_eq!(handle.namespace(), Namespace::Parent);
    assert_eq!(fx.loader.cached("missing/Mod"), Some(handle));
    // nothing was transformed
    assert!(fx.loader.session().gate().seen().is_empty());
}

#[test]
fn test_missing_everywhere_is_not_found() {
    let fx = fixture(lines_only(), MemorySource::new());
    assert_eq!(
        fx.loader.load("missing/Mod", false).unwrap_err(),
        LoadError::not_found("missing/Mod")
    );
    assert_eq!(fx.loader.cached_count(), 0);
}

#[test]
fn test_empty_name() {
    let fx = fixture(lines_only(), MemorySource::new());
    assert_eq!(fx.loader.load("  ", false).unwrap_err(), LoadError::NameEmpty);
}

#[test]
fn test_define_failure_delegates_original_bytes() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let session = Arc::new(Session::new(lines_only()));
    let loader = InstrumentingLoader::new(
        session,
        Arc::new(MemorySource::new().with("app/Bar", module("app/Bar"))),
        Arc::new(RefusingRuntime(Arc::clone(&runtime))),
        Arc::clone(&runtime) as Arc<dyn ParentLoader>,
    );

    let handle = loader.load("app/Bar", false).unwrap();
    assert_eq!(handle.namespace(), Namespace::Parent);
    assert_eq!(handle.bytes(), &module("app/Bar")[..]);
}

#[test]
fn test_malformed_module_fails_without_panicking() {
    let fx = fixture(
        lines_only(),
        MemorySource::new().with("app/Bad", b"garbage".to_vec()),
    );
    let err = fx.loader.load("app/Bad", false).unwrap_err();
    assert!(matches!(err, LoadError::ModuleLoadFailed { .. }));
}

#[test]
fn test_transform_then_load_is_duplicate() {
    let fx = fixture(lines_only(), MemorySource::new().with("app/Bar", module("app/Bar")));
    fx.loader.modify_bytes("app/Bar", &module("app/Bar")).unwrap();
    assert_eq!(
        fx.loader.load("app/Bar", false).unwrap_err(),
        LoadError::duplicate("app/Bar")
    );
}

// =========================================================================
// Search path and original loader
// =========================================================================

#[test]
fn test_add_root_makes_modules_loadable() {
    let dir = tempfile::tempdir().unwrap();
    crate::dump::write_module(dir.path(), &CanonicalName::new("app/Late"), &module("app/Late"))
        .unwrap();

    let runtime = Arc::new(InMemoryRuntime::new());
    let loader = InstrumentingLoader::new(
        Arc::new(Session::new(lines_only())),
        Arc::new(SearchPath::default()),
        Arc::clone(&runtime) as Arc<dyn ModuleRuntime>,
        Arc::clone(&runtime) as Arc<dyn ParentLoader>,
    );
    assert!(loader.load("app/Late", false).is_err());

    assert!(loader.add_root(dir.path()));
    let handle = loader.load("app/Late", false).unwrap();
    assert_eq!(handle.namespace(), Namespace::Instrumenting);
}

#[test]
fn test_original_loader_bypasses_pipeline() {
    let fx = fixture(lines_only(), MemorySource::new().with("app/Bar", module("app/Bar")));
    let instrumented = fx.loader.load("app/Bar", false).unwrap();
    let original = fx.loader.original_loader().load_original("app/Bar").unwrap();

    assert_ne!(instrumented, original);
    assert_eq!(original.namespace(), Namespace::Original);
    assert_eq!(original.bytes(), &module("app/Bar")[..]);
    assert_ne!(instrumented.bytes(), original.bytes());
}

// =========================================================================
// Retries after late failures
// =========================================================================

/// Runtime whose first `link` fails
struct FlakyLink {
    inner: Arc<InMemoryRuntime>,
    failures: AtomicUsize,
}

impl ModuleRuntime for FlakyLink {
    fn define(
        &self,
        namespace: Namespace,
        name: &CanonicalName,
        bytes: &[u8],
    ) -> Result<ModuleHandle, LoadError> {
        self.inner.define(namespace, name, bytes)
    }

    fn link(&self, module: &ModuleHandle) -> Result<(), LoadError> {
        if self.failures.swap(0, Ordering::SeqCst) > 0 {
            return Err(LoadError::load_failed(module.name().as_str(), "transient link failure"));
        }
        self.inner.link(module)
    }
}

/// Parent loader whose first request fails
struct FlakyParent {
    inner: Arc<InMemoryRuntime>,
    failures: AtomicUsize,
}

impl ParentLoader for FlakyParent {
    fn load(
        &self,
        name: &CanonicalName,
        original: Option<&[u8]>,
        resolve: bool,
    ) -> Result<ModuleHandle, LoadError> {
        if self.failures.swap(0, Ordering::SeqCst) > 0 {
            return Err(LoadError::define(name.as_str(), "parent busy"));
        }
        self.inner.load(name, original, resolve)
    }
}

#[test]
fn test_failed_link_is_retried_without_transforming_again() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let loader = InstrumentingLoader::new(
        Arc::new(Session::new(lines_only())),
        Arc::new(MemorySource::new().with("app/Bar", module("app/Bar"))),
        Arc::new(FlakyLink {
            inner: Arc::clone(&runtime),
            failures: AtomicUsize::new(1),
        }),
        Arc::clone(&runtime) as Arc<dyn ParentLoader>,
    );

    let err = loader.load("app/Bar", true).unwrap_err();
    assert!(matches!(err, LoadError::ModuleLoadFailed { .. }));
    assert!(loader.cached("app/Bar").is_none());
    let defined = runtime
        .defined(Namespace::Instrumenting, &CanonicalName::new("app/Bar"))
        .unwrap();
    assert!(!defined.is_linked());

    let handle = loader.load("app/Bar", true).unwrap();
    assert_eq!(handle, defined);
    assert!(handle.is_linked());
    assert_eq!(runtime.defined_count(Namespace::Instrumenting), 1);
    assert_eq!(loader.cached("app/Bar"), Some(handle));
}

#[test]
fn test_refused_delegation_is_retried_without_transforming_again() {
    let runtime = Arc::new(InMemoryRuntime::new());
    let session = Arc::new(Session::new(lines_only()));
    session.add_denied_prefix("internal/");
    let loader = InstrumentingLoader::new(
        session,
        Arc::new(MemorySource::new().with("internal/Foo", module("internal/Foo"))),
        Arc::clone(&runtime) as Arc<dyn ModuleRuntime>,
        Arc::new(FlakyParent {
            inner: Arc::clone(&runtime),
            failures: AtomicUsize::new(1),
        }),
    );

    let err = loader.load("internal/Foo", true).unwrap_err();
    assert!(matches!(err, LoadError::ModuleLoadFailed { .. }));

    let handle = loader.load("internal/Foo", true).unwrap();
    assert_eq!(handle.namespace(), Namespace::Parent);
    assert_eq!(handle.bytes(), &module("internal/Foo")[..]);
    assert!(handle.is_linked());
}

// =========================================================================
// Subroutines
// =========================================================================

/// Two call sites sharing one subroutine with a single line point
fn module_with_subroutine(name: &str) -> Vec<u8> {
    ModuleImage::new(name)
        .with_method(
            Method::new(
                "run",
                vec![
                    Instruction::Line(1),
                    Instruction::Jsr(Label(1)),
                    Instruction::Load(0),
                    Instruction::IfZero(Label(2)),
                    Instruction::Line(2),
                    Instruction::Jsr(Label(1)),
                    Instruction::Label(Label(2)),
                    Instruction::Return,
                    Instruction::Label(Label(1)),
                    Instruction::Store(1),
                    Instruction::Line(9),
                    Instruction::Ret(1),
                ],
            )
            .with_max_locals(2),
        )
        .to_bytes()
        .unwrap()
}

#[test]
fn test_subroutines_inlined_before_coverage() {
    let fx = fixture(
        lines_only(),
        MemorySource::new().with("app/Finally", module_with_subroutine("app/Finally")),
    );
    let handle = fx.loader.load("app/Finally", true).unwrap();
    assert_eq!(handle.namespace(), Namespace::Instrumenting);

    let image = ModuleImage::from_bytes(handle.bytes()).unwrap();
    let run = image.method("run").unwrap();
    assert!(!run.has_subroutines());
    let copies = run.code.iter().filter(|i| **i == Instruction::Line(9)).count();
    assert_eq!(copies, 2);
    // line 1, line 2 and both copies of line 9
    assert_eq!(
        image.field(COUNTER_FIELD).unwrap().kind,
        FieldKind::IntArray(4)
    );
}
