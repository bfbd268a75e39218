//! CLI failures; each one ends the process with a non-zero status

use thiserror::Error;

/// Result alias used by every handler
pub type CliResult<T> = Result<T, CliError>;

/// Why a command did not complete
#[derive(Debug, Error)]
pub enum CliError {
    /// Arguments parsed but make no sense together
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// What was wrong
        message: String,
    },

    /// Reading an input file failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Rendering the `--json` summary failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Settings file, codec or loader failure from the library
    #[error(transparent)]
    Scythe(#[from] scythe::ScytheError),

    /// The summary was printed but some modules did not load
    #[error("{failed} of {total} modules failed to load")]
    LoadFailures {
        /// Modules that failed
        failed: usize,
        /// Modules requested
        total: usize,
    },
}

impl CliError {
    /// Invalid argument with `message`
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }
}

impl From<scythe::FormatError> for CliError {
    fn from(err: scythe::FormatError) -> Self {
        Self::Scythe(err.into())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_argument_message() {
        let err = CliError::invalid_argument("no module names given");
        assert_eq!(err.to_string(), "Invalid argument: no module names given");
    }

    #[test]
    fn test_load_failures_message() {
        let err = CliError::LoadFailures { failed: 1, total: 3 };
        assert_eq!(err.to_string(), "1 of 3 modules failed to load");
    }

    #[test]
    fn test_codec_error_wraps() {
        let err: CliError = scythe::FormatError::BadMagic.into();
        assert!(matches!(err, CliError::Scythe(_)));
        assert!(err.to_string().starts_with("Malformed module image"));
    }
}
