//! Settings error types.

use std::path::PathBuf;

use thiserror::Error;

/// Why settings could not be produced.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file exists but could not be read.
    #[error("cannot read settings file {}: {source}", .path.display())]
    Read {
        /// File that was being read.
        path: PathBuf,
        /// Underlying IO failure.
        #[source]
        source: std::io::Error,
    },
    /// The settings file is not JSON.
    #[error("settings file {} is not valid JSON: {source}", .path.display())]
    Parse {
        /// Offending file.
        path: PathBuf,
        /// Parser error, with line and column.
        #[source]
        source: serde_json::Error,
    },
    /// The merged document has a value of the wrong type for some field.
    #[error("settings have the wrong shape: {0}")]
    Shape(#[from] serde_json::Error),
    /// A field holds a value the sync client cannot run with.
    #[error("invalid {field} {value:?}: {reason}")]
    InvalidField {
        /// camelCase path of the field, e.g. `server.url`.
        field: &'static str,
        /// The rejected value as written.
        value: String,
        /// What the value has to satisfy.
        reason: &'static str,
    },
}

impl SettingsError {
    pub(crate) fn invalid(field: &'static str, value: impl ToString, reason: &'static str) -> Self {
        Self::InvalidField {
            field,
            value: value.to_string(),
            reason,
        }
    }

    /// Field path for [`SettingsError::InvalidField`].
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::InvalidField { field, .. } => Some(*field),
            _ => None,
        }
    }
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;
