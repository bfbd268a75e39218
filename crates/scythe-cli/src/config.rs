//! Settings derived from the global flags

use console::Term;

/// How chatty the CLI is, from `-q` and repeated `-v`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Verbosity {
    /// Failures only
    Quiet,
    /// Warnings and the final summary
    #[default]
    Normal,
    /// One log line per processed module
    Verbose,
    /// Pipeline internals and timings
    Debug,
}

impl Verbosity {
    /// `-q` wins over any number of `-v`
    #[must_use]
    pub const fn from_flags(quiet: bool, verbose: u8) -> Self {
        match (quiet, verbose) {
            (true, _) => Self::Quiet,
            (false, 0) => Self::Normal,
            (false, 1) => Self::Verbose,
            (false, _) => Self::Debug,
        }
    }

    /// Failures only
    #[must_use]
    pub const fn is_quiet(self) -> bool {
        matches!(self, Self::Quiet)
    }

    /// Filter used when `RUST_LOG` is unset
    #[must_use]
    pub const fn log_directive(self) -> &'static str {
        match self {
            Self::Quiet => "error",
            Self::Normal => "warn",
            Self::Verbose => "info",
            Self::Debug => "debug",
        }
    }
}

/// `--color` resolved against the terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorChoice {
    /// Color even when piped
    Always,
    /// Color only if stderr supports it
    #[default]
    Auto,
    /// Plain text
    Never,
}

impl ColorChoice {
    /// Status lines go to stderr, so that is the stream probed
    #[must_use]
    pub fn should_color(self) -> bool {
        match self {
            Self::Always => true,
            Self::Auto => Term::stderr().features().colors_supported(),
            Self::Never => false,
        }
    }
}

/// Presentation settings shared by every command
#[derive(Debug, Clone, Copy, Default)]
pub struct CliConfig {
    /// Output and log level
    pub verbosity: Verbosity,
    /// Color mode for status lines
    pub color: ColorChoice,
    /// JSON-lines logs instead of the compact text format
    pub json_logs: bool,
}

impl CliConfig {
    /// Normal verbosity, auto color, text logs
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set verbosity
    #[must_use]
    pub const fn with_verbosity(self, verbosity: Verbosity) -> Self {
        Self { verbosity, ..self }
    }

    /// Set color mode
    #[must_use]
    pub const fn with_color(self, color: ColorChoice) -> Self {
        Self { color, ..self }
    }

    /// Switch log format
    #[must_use]
    pub const fn with_json_logs(self, json_logs: bool) -> Self {
        Self { json_logs, ..self }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_quiet_overrides_verbose() {
        assert_eq!(Verbosity::from_flags(true, 3), Verbosity::Quiet);
        assert_eq!(Verbosity::from_flags(false, 0), Verbosity::Normal);
        assert_eq!(Verbosity::from_flags(false, 1), Verbosity::Verbose);
        assert_eq!(Verbosity::from_flags(false, 5), Verbosity::Debug);
    }

    #[test]
    fn test_log_directive_per_level() {
        let directives: Vec<_> = [
            Verbosity::Quiet,
            Verbosity::Normal,
            Verbosity::Verbose,
            Verbosity::Debug,
        ]
        .iter()
        .map(|v| v.log_directive())
        .collect();
        assert_eq!(directives, ["error", "warn", "info", "debug"]);
        assert!(Verbosity::Quiet < Verbosity::Debug);
    }

    #[test]
    fn test_forced_color_modes() {
        assert!(ColorChoice::Always.should_color());
        assert!(!ColorChoice::Never.should_color());
    }

    #[test]
    fn test_with_methods_keep_other_fields() {
        let config = CliConfig::new()
            .with_json_logs(true)
            .with_verbosity(Verbosity::Verbose)
            .with_color(ColorChoice::Never);
        assert!(config.json_logs);
        assert_eq!(config.verbosity, Verbosity::Verbose);
        assert_eq!(config.color, ColorChoice::Never);
    }
}
