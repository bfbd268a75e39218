//! Instrumentation Configuration
//!
//! Typed settings read once by a [`Session`](crate::Session) before the first
//! load. Values come from code (builder), YAML, or the CLI.

use crate::result::{ScytheError, ScytheResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Which coverage stage the pipeline inserts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentationApproach {
    /// Direct call-out to the recorder at every point
    Static,
    /// Per-module counter array polled by the recorder
    #[default]
    Array,
    /// No instrumentation at all
    None,
}

impl InstrumentationApproach {
    /// Whether any coverage stage is inserted
    #[must_use]
    pub const fn is_enabled(self) -> bool {
        !matches!(self, Self::None)
    }
}

impl fmt::Display for InstrumentationApproach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static => f.write_str("static"),
            Self::Array => f.write_str("array"),
            Self::None => f.write_str("none"),
        }
    }
}

impl FromStr for InstrumentationApproach {
    type Err = ScytheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "static" => Ok(Self::Static),
            "array" => Ok(Self::Array),
            "none" | "disabled" => Ok(Self::None),
            other => Err(ScytheError::config(format!(
                "unknown instrumentation approach '{other}'"
            ))),
        }
    }
}

/// Instrumentation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentationConfig {
    /// Coverage stage variant
    pub approach: InstrumentationApproach,
    /// Instrument line points
    pub instrument_lines: bool,
    /// Instrument branch points
    pub instrument_branches: bool,
    /// Persist every module that passes through the pipeline
    pub write_module: bool,
    /// Persist only modules that were actually instrumented
    pub write_if_modified: bool,
    /// Directory for persisted modules
    pub bytecode_dir: PathBuf,
    /// Flush coverage once when the session's exit guard drops
    pub coverage_on_exit: bool,
    /// Destination of the exit flush
    pub coverage_file: PathBuf,
    /// Log how long each rewrite takes
    pub log_timings: bool,
}

impl Default for InstrumentationConfig {
    fn default() -> Self {
        Self {
            approach: InstrumentationApproach::Array,
            instrument_lines: true,
            instrument_branches: true,
            write_module: false,
            write_if_modified: false,
            bytecode_dir: PathBuf::from("target/scythe/bytecode"),
            coverage_on_exit: false,
            coverage_file: PathBuf::from("target/scythe/coverage.json"),
            log_timings: true,
        }
    }
}

impl InstrumentationConfig {
    /// Create a builder
    #[must_use]
    pub fn builder() -> InstrumentationConfigBuilder {
        InstrumentationConfigBuilder::default()
    }

    /// Parse YAML; absent keys keep their defaults
    pub fn from_yaml_str(yaml: &str) -> ScytheResult<Self> {
        Ok(serde_yaml_ng::from_str(yaml)?)
    }

    /// Read a YAML file
    pub fn from_yaml_file(path: &Path) -> ScytheResult<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    /// Whether the coverage stage would rewrite anything
    #[must_use]
    pub const fn instruments_points(&self) -> bool {
        self.approach.is_enabled() && (self.instrument_lines || self.instrument_branches)
    }
}

/// Builder for [`InstrumentationConfig`]
#[derive(Debug, Default)]
pub struct InstrumentationConfigBuilder {
    config: InstrumentationConfig,
}

impl InstrumentationConfigBuilder {
    /// Set the coverage approach
    #[must_use]
    pub const fn approach(mut self, approach: InstrumentationApproach) -> Self {
        self.config.approach = approach;
        self
    }

    /// Toggle line instrumentation
    #[must_use]
    pub const fn instrument_lines(mut self, enabled: bool) -> Self {
        self.config.instrument_lines = enabled;
        self
    }

    /// Toggle branch instrumentation
    #[must_use]
    pub const fn instrument_branches(mut self, enabled: bool) -> Self {
        self.config.instrument_branches = enabled;
        self
    }

    /// Persist every module to `dir`
    #[must_use]
    pub fn write_module(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.write_module = true;
        self.config.bytecode_dir = dir.into();
        self
    }

    /// Persist instrumented modules to `dir`
    #[must_use]
    pub fn write_if_modified(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.write_if_modified = true;
        self.config.bytecode_dir = dir.into();
        self
    }

    /// Flush coverage to `file` when the exit guard drops
    #[must_use]
    pub fn coverage_on_exit(mut self, file: impl Into<PathBuf>) -> Self {
        self.config.coverage_on_exit = true;
        self.config.coverage_file = file.into();
        self
    }

    /// Toggle rewrite timing logs
    #[must_use]
    pub const fn log_timings(mut self, enabled: bool) -> Self {
        self.config.log_timings = enabled;
        self
    }

    /// Build the configuration
    #[must_use]
    pub fn build(self) -> InstrumentationConfig {
        self.config
    }
}
