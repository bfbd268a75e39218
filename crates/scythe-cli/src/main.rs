//! Scythe CLI: load-time module instrumentation
//!
//! ## Usage
//!
//! ```bash
//! scythe instrument app.Foo app.Bar --path mods     # Instrument and report
//! scythe instrument app.Foo -p mods --out target/x  # Also write rewritten modules
//! scythe inspect target/x/app/Foo.smod              # Print a module listing
//! ```

use clap::Parser;
use scythe::InstrumentationConfig;
use scythe_cli::{
    handlers::{execute_inspect, execute_instrument},
    logging::init_logging,
    Cli, CliConfig, CliError, CliResult, Commands, InstrumentArgs, ProgressReporter, Verbosity,
};
use std::process::ExitCode;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> CliResult<()> {
    let cli = Cli::parse();
    let config = build_config(&cli);
    init_logging(&config);

    let settings = match &cli.config {
        Some(path) => InstrumentationConfig::from_yaml_file(path)?,
        None => InstrumentationConfig::default(),
    };

    match cli.command {
        Commands::Instrument(args) => run_instrument(&config, settings, &args),
        Commands::Inspect(args) => {
            print!("{}", execute_inspect(&args)?);
            Ok(())
        }
    }
}

fn build_config(cli: &Cli) -> CliConfig {
    CliConfig::new()
        .with_verbosity(Verbosity::from_flags(cli.quiet, cli.verbose))
        .with_color(cli.color.into())
        .with_json_logs(cli.log_json)
}

fn run_instrument(
    config: &CliConfig,
    settings: InstrumentationConfig,
    args: &InstrumentArgs,
) -> CliResult<()> {
    let summary = execute_instrument(config, settings, args)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print!("{}", summary.render_text());
    }

    let failed = summary.failed();
    if failed > 0 {
        return Err(CliError::LoadFailures {
            failed,
            total: summary.modules.len(),
        });
    }

    let reporter = ProgressReporter::new(config.color.should_color(), config.verbosity.is_quiet());
    reporter.success(&format!("{} modules loaded", summary.modules.len()));
    Ok(())
}
