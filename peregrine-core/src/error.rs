//! Error types shared across the core components.

use thiserror::Error;

/// Result alias used throughout the core.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors surfaced by the core components.
///
/// Per-connection protocol problems are not errors in this sense; they are
/// encoded in the HTTP state machine's status codes. `CoreError` covers the
/// failures that abort startup or a whole component.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A capacity or thread-count parameter that must be positive was zero.
    #[error("invalid {what}: must be positive")]
    InvalidCapacity {
        /// Which parameter was rejected.
        what: &'static str,
    },

    /// The database rejected a connection attempt or a query.
    #[error("database error: {0}")]
    Database(#[from] mysql::Error),

    /// Filesystem or socket failure outside a connection's own lifecycle.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure in the epoll/signal/pipe syscall layer.
    #[error("syscall failed: {0}")]
    Sys(#[from] nix::errno::Errno),
}
