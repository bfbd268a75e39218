//! Argument parsing

use clap::{Parser, Subcommand, ValueEnum};
use scythe::InstrumentationApproach;
use std::path::PathBuf;

/// Scythe: load-time module instrumentation for line and branch coverage
#[derive(Parser, Debug)]
#[command(name = "scythe")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only print failures
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// When to color status lines
    #[arg(long, value_enum, default_value = "auto", global = true)]
    pub color: ColorArg,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Instrumentation settings file (YAML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Command to run
    #[command(subcommand)]
    pub command: Commands,
}

/// What to do
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load modules through an instrumenting loader and report the outcome
    Instrument(InstrumentArgs),

    /// Print the listing of a module image
    Inspect(InspectArgs),
}

/// Arguments for the instrument command
#[derive(Parser, Debug)]
#[allow(clippy::struct_excessive_bools)]
pub struct InstrumentArgs {
    /// Module names, qualified (`app.Foo`) or path form (`app/Foo`)
    #[arg(required = true)]
    pub names: Vec<String>,

    /// Directory searched for `<name>.smod` files (repeatable)
    #[arg(short, long = "path", required = true)]
    pub paths: Vec<PathBuf>,

    /// Coverage approach
    #[arg(long, value_enum)]
    pub approach: Option<ApproachArg>,

    /// Skip line instrumentation
    #[arg(long)]
    pub no_lines: bool,

    /// Skip branch instrumentation
    #[arg(long)]
    pub no_branches: bool,

    /// Write rewritten modules under this directory
    #[arg(short, long)]
    pub out: Option<PathBuf>,

    /// Extra namespace prefix never instrumented (repeatable)
    #[arg(long)]
    pub deny: Vec<String>,

    /// Record and print module dependencies
    #[arg(long)]
    pub deps: bool,

    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the inspect command
#[derive(Parser, Debug)]
pub struct InspectArgs {
    /// Module image file
    pub file: PathBuf,
}

/// `--approach` values
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApproachArg {
    /// Recorder call at every point
    Static,
    /// Per-module counter array
    Array,
    /// No coverage stage
    None,
}

impl From<ApproachArg> for InstrumentationApproach {
    fn from(arg: ApproachArg) -> Self {
        match arg {
            ApproachArg::Static => Self::Static,
            ApproachArg::Array => Self::Array,
            ApproachArg::None => Self::None,
        }
    }
}

/// `--color` values
#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ColorArg {
    /// If stderr supports it
    #[default]
    Auto,
    /// Even when piped
    Always,
    /// Plain text
    Never,
}

impl From<ColorArg> for crate::config::ColorChoice {
    fn from(arg: ColorArg) -> Self {
        match arg {
            ColorArg::Auto => Self::Auto,
            ColorArg::Always => Self::Always,
            ColorArg::Never => Self::Never,
        }
    }
}
