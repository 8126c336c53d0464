//! Core error types for Strata.

use thiserror::Error;

/// Result type alias using `StrataError`.
pub type StrataResult<T> = std::result::Result<T, StrataError>;

/// Core error type for Strata operations.
///
/// The variants correspond to the failure classes of the read pipeline:
/// user mistakes caught at clause construction, schema and column
/// resolution failures, storage faults, internal contract violations and
/// cooperative cancellation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StrataError {
    /// Bad clause composition or argument, raised at pipeline build.
    #[error("InvalidUserArgument: {0}")]
    InvalidUserArgument(String),

    /// Type mismatch in a non-dynamic pipeline.
    #[error("SchemaError: {0}")]
    SchemaError(String),

    /// Reference to a column that is not present.
    #[error("MissingColumn: {0}")]
    MissingColumn(String),

    /// Fault propagated from the storage collaborator.
    #[error("StorageError: {0}")]
    StorageError(String),

    /// Internal contract violation (bug in Strata).
    #[error("AssertionFailure: {0}")]
    AssertionFailure(String),

    /// The run's cancellation token was tripped.
    ///
    /// Terminal, but not an error at the user API level.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// IO error.
    #[error("IoError: {0}")]
    IoError(#[from] std::io::Error),

    /// Arrow error.
    #[error("ArrowError: {0}")]
    ArrowError(#[from] arrow_schema::ArrowError),
}

impl StrataError {
    /// Create a new `InvalidUserArgument`.
    pub fn invalid_user_argument<S: Into<String>>(msg: S) -> Self {
        Self::InvalidUserArgument(msg.into())
    }

    /// Create a new `SchemaError`.
    pub fn schema_error<S: Into<String>>(msg: S) -> Self {
        Self::SchemaError(msg.into())
    }

    /// Create a new `MissingColumn` error.
    pub fn missing_column<S: Into<String>>(msg: S) -> Self {
        Self::MissingColumn(msg.into())
    }

    /// Create a new `StorageError`.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::StorageError(msg.into())
    }

    /// Create a new `AssertionFailure`.
    pub fn assertion<S: Into<String>>(msg: S) -> Self {
        Self::AssertionFailure(msg.into())
    }

    /// Create a cancellation error.
    pub fn cancelled<S: Into<String>>(msg: S) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Whether this error represents cooperative cancellation rather
    /// than a genuine failure.
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

/// Ensure a user-supplied condition holds, returning `InvalidUserArgument` if not.
#[macro_export]
macro_rules! user_check {
    ($cond:expr, $($msg:tt)*) => {
        if !$cond {
            return Err($crate::StrataError::InvalidUserArgument(format!($($msg)*)));
        }
    };
}

/// Ensure an internal invariant holds, returning `AssertionFailure` if not.
#[macro_export]
macro_rules! internal_check {
    ($cond:expr, $($msg:tt)*) => {
        if !$cond {
            return Err($crate::StrataError::AssertionFailure(format!($($msg)*)));
        }
    };
}

/// Return early with a `SchemaError`.
#[macro_export]
macro_rules! schema_err {
    ($($arg:tt)*) => {
        return Err($crate::StrataError::SchemaError(format!($($arg)*)))
    };
}
