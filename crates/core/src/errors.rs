//! Error types and handling
//!
//! Recoverable per-container outcomes (skips, per-item dexopt failures,
//! cancellation) are carried in result structs, not here. This module covers
//! the failures that abort a whole call.

use thiserror::Error;

/// Domain errors for the dexopt service.
#[derive(Error, Debug)]
pub enum DexoptError {
    /// Bad input from the caller: unknown package or split, malformed paths
    /// or class-loader contexts, contradictory flags.
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Broken internal invariant or an unexpected reply from a collaborator.
    #[error("Internal error: {message}")]
    Internal { message: String },

    /// The compiler daemon could not be reached or the transport failed
    /// mid-call. Treated like an internal error by callers.
    #[error("Compiler daemon transport error: {message}")]
    DaemonTransport { message: String },

    /// The compiler daemon completed the call but reported a
    /// service-specific failure for this particular input. Callers log it
    /// and skip the affected item.
    #[error("Compiler daemon failed {operation}: {message}")]
    DaemonService { operation: String, message: String },

    /// Profile snapshot/dump could not produce output.
    #[error("Profile snapshot failed: {message}")]
    SnapshotFailed {
        message: String,
        #[source]
        source: Option<Box<DexoptError>>,
    },

    /// A second service instance was requested in the same process.
    #[error("Dexopt service already created")]
    AlreadyCreated,

    /// Filesystem I/O error from state persistence.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl DexoptError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        DexoptError::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        DexoptError::Internal {
            message: message.into(),
        }
    }

    /// Whether this is a per-item daemon failure that the caller should log
    /// and absorb rather than abort the whole operation.
    pub fn is_daemon_service_error(&self) -> bool {
        matches!(self, DexoptError::DaemonService { .. })
    }
}

/// Convenience type alias for Results with DexoptError
pub type Result<T> = std::result::Result<T, DexoptError>;
