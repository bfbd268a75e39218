//! Instrument command handler

use crate::config::CliConfig;
use crate::output::ProgressReporter;
use crate::{CliError, CliResult, InstrumentArgs};
use scythe::dump::module_path;
use scythe::prelude::*;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// What happened to one requested module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModuleStatus {
    /// Defined with coverage points
    Instrumented,
    /// Defined by the instrumenting loader without coverage points
    Unchanged,
    /// Handed to the parent loader
    Delegated,
    /// Could not be loaded
    Failed,
}

impl ModuleStatus {
    /// Human readable label
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Instrumented => "instrumented",
            Self::Unchanged => "unchanged",
            Self::Delegated => "delegated",
            Self::Failed => "failed",
        }
    }
}

/// Per-module summary line
#[derive(Debug, Clone, Serialize)]
pub struct ModuleSummary {
    /// Canonical module name
    pub module: String,
    /// Outcome
    pub status: ModuleStatus,
    /// Line points instrumented
    pub lines: usize,
    /// Branch points instrumented
    pub branches: usize,
    /// Persisted file, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub written: Option<PathBuf>,
    /// Referenced modules, when dependency recording is on
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    /// Failure message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Summary of one `instrument` run
#[derive(Debug, Clone, Default, Serialize)]
pub struct InstrumentSummary {
    /// Modules in request order
    pub modules: Vec<ModuleSummary>,
}

impl InstrumentSummary {
    /// Number of modules that failed to load
    #[must_use]
    pub fn failed(&self) -> usize {
        self.modules
            .iter()
            .filter(|m| m.status == ModuleStatus::Failed)
            .count()
    }

    /// Plain text rendering, one module per line
    #[must_use]
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for module in &self.modules {
            out.push_str(&format!("{:<40} {:<12}", module.module, module.status.label()));
            match &module.error {
                Some(error) => out.push_str(&format!(" {error}")),
                None => out.push_str(&format!(" lines={} branches={}", module.lines, module.branches)),
            }
            if !module.dependencies.is_empty() {
                out.push_str(&format!(" deps=[{}]", module.dependencies.join(", ")));
            }
            out.push('\n');
        }
        out
    }
}

/// Apply command-line overrides to file or default settings
#[must_use]
pub fn apply_overrides(mut settings: InstrumentationConfig, args: &InstrumentArgs) -> InstrumentationConfig {
    if let Some(approach) = args.approach {
        settings.approach = approach.into();
    }
    if args.no_lines {
        settings.instrument_lines = false;
    }
    if args.no_branches {
        settings.instrument_branches = false;
    }
    if let Some(out) = &args.out {
        settings.write_if_modified = true;
        settings.bytecode_dir.clone_from(out);
    }
    settings
}

/// Load every requested module and summarize the outcome
pub fn execute_instrument(
    config: &CliConfig,
    settings: InstrumentationConfig,
    args: &InstrumentArgs,
) -> CliResult<InstrumentSummary> {
    if args.names.iter().all(|n| n.trim().is_empty()) {
        return Err(CliError::invalid_argument("no module names given"));
    }

    let settings = apply_overrides(settings, args);
    let persist_dir = (settings.write_module || settings.write_if_modified)
        .then(|| settings.bytecode_dir.clone());
    let probes = Arc::new(ProbeRegistry::new());
    let session = Arc::new(Session::with_recorder(
        settings,
        Arc::clone(&probes) as Arc<dyn CoverageRecorder>,
    ));
    for prefix in &args.deny {
        session.add_denied_prefix(prefix);
    }
    session.set_dependency_graph(args.deps);

    let runtime = Arc::new(InMemoryRuntime::new());
    let loader = InstrumentingLoader::new(
        Arc::clone(&session),
        Arc::new(SearchPath::new(args.paths.iter().cloned())),
        Arc::clone(&runtime) as Arc<dyn ModuleRuntime>,
        runtime as Arc<dyn ParentLoader>,
    );
    let _flush = session.exit_flush_guard();

    let mut reporter = ProgressReporter::new(config.color.should_color(), config.verbosity.is_quiet());
    for path in args.paths.iter().filter(|p| !p.is_dir()) {
        reporter.warning(&format!("search path {} is not a directory", path.display()));
    }
    reporter.start_progress(args.names.len() as u64, "instrumenting");

    let mut summary = InstrumentSummary::default();
    for name in &args.names {
        let canonical = CanonicalName::new(name);
        reporter.advance(canonical.as_str());
        let mut entry = ModuleSummary {
            module: canonical.to_string(),
            status: ModuleStatus::Failed,
            lines: 0,
            branches: 0,
            written: None,
            dependencies: Vec::new(),
            error: None,
        };

        match loader.load(name, true) {
            Ok(handle) => {
                let table = probes.probes(&canonical);
                entry.status = match (handle.namespace(), &table) {
                    (Namespace::Parent, _) => ModuleStatus::Delegated,
                    (_, Some(_)) => ModuleStatus::Instrumented,
                    (_, None) => ModuleStatus::Unchanged,
                };
                if let Some(table) = table {
                    entry.lines = table.line_count();
                    entry.branches = table.branch_count();
                }
                entry.written = persist_dir
                    .as_deref()
                    .and_then(|dir| module_path(dir, &canonical))
                    .filter(|path| path.is_file());
                entry.dependencies = session
                    .dependency_graph()
                    .dependencies_of(&canonical)
                    .iter()
                    .map(ToString::to_string)
                    .collect();
                info!(module = %canonical, status = entry.status.label(), "processed module");
            }
            Err(err) => {
                reporter.failure(&format!("{canonical}: {err}"));
                entry.error = Some(err.to_string());
            }
        }
        summary.modules.push(entry);
    }
    reporter.finish();

    Ok(summary)
}
