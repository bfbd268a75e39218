//! Result and error types for Scythe.

use crate::bytecode::FormatError;
use thiserror::Error;

/// Result type for Scythe operations
pub type ScytheResult<T> = Result<T, ScytheError>;

/// Errors that can occur in Scythe
#[derive(Debug, Error)]
pub enum ScytheError {
    /// Module load failure
    #[error(transparent)]
    Load(#[from] LoadError),

    /// Malformed module image
    #[error("Malformed module image: {0}")]
    Format(#[from] FormatError),

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),
}

impl ScytheError {
    /// Create a configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

/// Errors raised while loading a module through a loader.
///
/// Cloneable so every caller converging on the same in-flight load
/// observes the same failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// The module name was empty after normalization
    #[error("Empty module name given")]
    NameEmpty,

    /// No resource backs the requested module
    #[error("Module resource not found: {name}")]
    ResourceNotFound {
        /// Canonical module name
        name: String,
    },

    /// The module was handed to the transformer a second time
    #[error("Module already transformed: {name}")]
    DuplicateTransform {
        /// Canonical module name
        name: String,
    },

    /// Rewriting the module failed; the original bytes are used instead
    #[error("Transformation of {name} failed: {message}")]
    TransformationFailed {
        /// Canonical module name
        name: String,
        /// Error message
        message: String,
    },

    /// The runtime refused the module definition
    #[error("Defining {name} failed: {message}")]
    DefineFailed {
        /// Canonical module name
        name: String,
        /// Error message
        message: String,
    },

    /// Terminal failure surfaced to the caller
    #[error("Couldn't load module {name}: {message}")]
    ModuleLoadFailed {
        /// Canonical module name
        name: String,
        /// Error message
        message: String,
    },
}

impl LoadError {
    /// Create a resource-not-found error
    #[must_use]
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::ResourceNotFound { name: name.into() }
    }

    /// Create a duplicate-transform error
    #[must_use]
    pub fn duplicate(name: impl Into<String>) -> Self {
        Self::DuplicateTransform { name: name.into() }
    }

    /// Create a transformation-failed error
    #[must_use]
    pub fn transformation(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransformationFailed {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create a define-failed error
    #[must_use]
    pub fn define(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DefineFailed {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create a module-load-failed error
    #[must_use]
    pub fn load_failed(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ModuleLoadFailed {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Whether this failure indicates a sequencing defect upstream
    #[must_use]
    pub const fn is_defect(&self) -> bool {
        matches!(self, Self::NameEmpty | Self::DuplicateTransform { .. })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_load_error_messages() {
        assert_eq!(LoadError::NameEmpty.to_string(), "Empty module name given");
        let err = LoadError::not_found("app/Foo");
        assert!(err.to_string().contains("app/Foo"));
        let err = LoadError::load_failed("app/Foo", "disk on fire");
        assert!(err.to_string().contains("disk on fire"));
    }

    #[test]
    fn test_defects() {
        assert!(LoadError::NameEmpty.is_defect());
        assert!(LoadError::duplicate("a/B").is_defect());
        assert!(!LoadError::not_found("a/B").is_defect());
        assert!(!LoadError::define("a/B", "bad").is_defect());
    }

    #[test]
    fn test_load_error_wraps_transparently() {
        let err: ScytheError = LoadError::duplicate("a/B").into();
        assert_eq!(err.to_string(), "Module already transformed: a/B");
    }

    #[test]
    fn test_io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ScytheError = io_err.into();
        assert!(err.to_string().contains("I/O"));
    }

    #[test]
    fn test_config_error() {
        let err = ScytheError::config("bad approach");
        assert!(err.to_string().contains("Configuration"));
        assert!(err.to_string().contains("bad approach"));
    }
}
