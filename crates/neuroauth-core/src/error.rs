//! Error types for the neuroauth system.
//!
//! Error handling follows a two-level design: each subsystem has its own
//! [`thiserror`] enum ([`SignalError`], [`ModelError`], [`StorageError`]),
//! and [`CoreError`] unifies them at the crate boundary. The verification
//! engine never surfaces these to external callers directly; it maps them to
//! a rejecting decision carrying an [`ErrorKind`] label that is written to
//! the audit artifact and internal logs only.
//!
//! # Example
//!
//! ```rust
//! use neuroauth_core::error::{CoreError, SignalError};
//!
//! fn load() -> Result<(), CoreError> {
//!     Err(SignalError::ChannelCountMismatch { expected: 48, actual: 32 }.into())
//! }
//! ```

use thiserror::Error;

/// A specialized `Result` type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Top-level error type for the neuroauth system.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CoreError {
    /// Signal acquisition or preprocessing error
    #[error("Signal error: {0}")]
    Signal(#[from] SignalError),

    /// Model loading, inference, or fitting error
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    /// Artifact persistence error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// No prototype entry exists for the claimed identity
    #[error("Unknown user: '{user_id}'")]
    UnknownUser {
        /// The claimed identity
        user_id: String,
    },

    /// Verification exceeded its hard deadline
    #[error("Verification timed out after {elapsed_ms}ms (deadline {deadline_ms}ms)")]
    Timeout {
        /// Time spent before the deadline check fired
        elapsed_ms: u64,
        /// The caller-supplied hard deadline
        deadline_ms: u64,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration error
        message: String,
    },
}

impl CoreError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new unknown-user error.
    #[must_use]
    pub fn unknown_user(user_id: impl Into<String>) -> Self {
        Self::UnknownUser {
            user_id: user_id.into(),
        }
    }

    /// Returns `true` if this error is recoverable (the serving process can
    /// keep handling requests after mapping it to a reject decision).
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Signal(e) => e.is_recoverable(),
            Self::Model(e) => e.is_recoverable(),
            Self::Storage(_) | Self::UnknownUser { .. } | Self::Timeout { .. } => true,
            Self::Configuration { .. } => false,
        }
    }

    /// The audit-log label for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Signal(e) => e.kind(),
            Self::Model(e) => e.kind(),
            Self::Storage(_) => ErrorKind::Storage,
            Self::UnknownUser { .. } => ErrorKind::UnknownUser,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Configuration { .. } => ErrorKind::Configuration,
        }
    }
}

/// Errors from signal loading, preprocessing, and windowing.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SignalError {
    /// Malformed or unreadable recording
    #[error("Input format error: {message}")]
    InputFormat {
        /// What was wrong with the input
        message: String,
    },

    /// A canonical channel is missing from the recording
    #[error("Missing channel '{name}' in recording")]
    MissingChannel {
        /// Manifest name of the missing channel
        name: String,
    },

    /// Channel count does not match the manifest
    #[error("Channel count mismatch: expected {expected}, got {actual}")]
    ChannelCountMismatch {
        /// Channels required by the manifest
        expected: usize,
        /// Channels present on the input
        actual: usize,
    },

    /// Trial contains no samples
    #[error("Trial is empty")]
    EmptyTrial,

    /// Trial is shorter than one window
    #[error("Probe too short: need at least {required} samples, got {available}")]
    ProbeTooShort {
        /// Minimum samples for one window
        required: usize,
        /// Samples available in the trial
        available: usize,
    },

    /// Filter produced a numerically unstable output
    #[error("Filter error: {message}")]
    Filter {
        /// Description of the instability
        message: String,
    },

    /// Non-finite values encountered in the signal path
    #[error("Non-finite values in signal at stage '{stage}'")]
    NonFinite {
        /// Pipeline stage that observed the values
        stage: &'static str,
    },
}

impl SignalError {
    /// Creates a new input format error.
    #[must_use]
    pub fn input_format(message: impl Into<String>) -> Self {
        Self::InputFormat {
            message: message.into(),
        }
    }

    /// Creates a new filter error.
    #[must_use]
    pub fn filter(message: impl Into<String>) -> Self {
        Self::Filter {
            message: message.into(),
        }
    }

    /// Returns `true` if this error is recoverable.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::EmptyTrial | Self::ProbeTooShort { .. } | Self::NonFinite { .. } => true,
            Self::InputFormat { .. }
            | Self::MissingChannel { .. }
            | Self::ChannelCountMismatch { .. }
            | Self::Filter { .. } => false,
        }
    }

    /// The audit-log label for this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InputFormat { .. }
            | Self::MissingChannel { .. }
            | Self::ChannelCountMismatch { .. } => ErrorKind::InputFormat,
            Self::EmptyTrial => ErrorKind::EmptyTrial,
            Self::ProbeTooShort { .. } => ErrorKind::ProbeTooShort,
            Self::Filter { .. } => ErrorKind::Filter,
            Self::NonFinite { .. } => ErrorKind::Numeric,
        }
    }
}

/// Errors from model loading, inference, and fitting.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ModelError {
    /// Model artifact could not be loaded
    #[error("Failed to load model from '{path}': {reason}")]
    LoadFailed {
        /// Path to the artifact
        path: String,
        /// Reason for the failure
        reason: String,
    },

    /// Persisted artifact version does not match this implementation
    #[error("Artifact version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Version this build writes and reads
        expected: u32,
        /// Version found in the artifact
        found: u32,
    },

    /// Input shape does not match the architecture hyperparameters
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        actual: Vec<usize>,
    },

    /// Model produced non-finite values
    #[error("Non-finite model output in {what}")]
    NonFiniteOutput {
        /// Which output was non-finite
        what: &'static str,
    },

    /// Core invoked before the model bundle finished loading
    #[error("Model not loaded: {name}")]
    NotLoaded {
        /// Name of the missing component
        name: &'static str,
    },

    /// Fitting procedure failed to converge or was given unusable data
    #[error("Fit failed: {message}")]
    FitFailed {
        /// Description of the failure
        message: String,
    },
}

impl ModelError {
    /// Creates a new load failure.
    #[must_use]
    pub fn load_failed(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LoadFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new fit failure.
    #[must_use]
    pub fn fit_failed(message: impl Into<String>) -> Self {
        Self::FitFailed {
            message: message.into(),
        }
    }

    /// Returns `true` if this error is recoverable.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::NonFiniteOutput { .. } => true,
            Self::LoadFailed { .. }
            | Self::VersionMismatch { .. }
            | Self::ShapeMismatch { .. }
            | Self::NotLoaded { .. }
            | Self::FitFailed { .. } => false,
        }
    }

    /// The audit-log label for this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NonFiniteOutput { .. } => ErrorKind::Numeric,
            Self::NotLoaded { .. } => ErrorKind::ModelNotLoaded,
            Self::ShapeMismatch { .. } => ErrorKind::InputFormat,
            Self::LoadFailed { .. } | Self::VersionMismatch { .. } | Self::FitFailed { .. } => {
                ErrorKind::Internal
            }
        }
    }
}

/// Errors from artifact persistence.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StorageError {
    /// Filesystem error
    #[error("I/O error on '{path}': {source}")]
    Io {
        /// Path involved in the operation
        path: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Serialization or deserialization failed
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization error
        message: String,
    },

    /// No artifact stored under the requested identifier
    #[error("Artifact not found: '{id}'")]
    ArtifactNotFound {
        /// The requested identifier
        id: String,
    },
}

impl StorageError {
    /// Creates a new I/O error with path context.
    #[must_use]
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }
}

/// Categorized failure labels recorded in audit artifacts and logs.
///
/// These are the §7 error *kinds*. The external service boundary only ever
/// sees a uniform reject; the kind stays internal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed recording or channel mismatch
    InputFormat,
    /// Trial contained no samples
    EmptyTrial,
    /// Trial shorter than one window
    ProbeTooShort,
    /// Numerical instability while filtering
    Filter,
    /// Non-finite signal or model output
    Numeric,
    /// No prototypes for the claimed identity
    UnknownUser,
    /// Serving invoked before startup completed
    ModelNotLoaded,
    /// Hard deadline exceeded
    Timeout,
    /// Artifact store failure
    Storage,
    /// Invalid configuration
    Configuration,
    /// Anything that should not happen during serving
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::InputFormat => "input_format",
            Self::EmptyTrial => "empty_trial",
            Self::ProbeTooShort => "probe_too_short",
            Self::Filter => "filter",
            Self::Numeric => "numeric",
            Self::UnknownUser => "unknown_user",
            Self::ModelNotLoaded => "model_not_loaded",
            Self::Timeout => "timeout",
            Self::Storage => "storage",
            Self::Configuration => "configuration",
            Self::Internal => "internal",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = CoreError::from(SignalError::ChannelCountMismatch {
            expected: 48,
            actual: 32,
        });
        let msg = err.to_string();
        assert!(msg.contains("48"));
        assert!(msg.contains("32"));
    }

    #[test]
    fn signal_error_recoverability() {
        assert!(SignalError::ProbeTooShort {
            required: 256,
            available: 255,
        }
        .is_recoverable());
        assert!(!SignalError::filter("unstable biquad").is_recoverable());
    }

    #[test]
    fn kinds_map_to_taxonomy() {
        assert_eq!(
            CoreError::unknown_user("ghost").kind(),
            ErrorKind::UnknownUser
        );
        assert_eq!(
            CoreError::from(SignalError::EmptyTrial).kind(),
            ErrorKind::EmptyTrial
        );
        assert_eq!(
            CoreError::from(ModelError::NotLoaded { name: "encoder" }).kind(),
            ErrorKind::ModelNotLoaded
        );
        assert_eq!(
            CoreError::Timeout {
                elapsed_ms: 120,
                deadline_ms: 100,
            }
            .kind(),
            ErrorKind::Timeout
        );
    }

    #[test]
    fn unknown_user_is_recoverable() {
        // The service maps it to a reject and keeps running.
        assert!(CoreError::unknown_user("ghost").is_recoverable());
    }

    #[test]
    fn error_kind_serde_round_trip() {
        let json = serde_json::to_string(&ErrorKind::ProbeTooShort).unwrap();
        assert_eq!(json, "\"probe_too_short\"");
        let back: ErrorKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ErrorKind::ProbeTooShort);
    }
}
