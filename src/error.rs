//! Error taxonomy for the session core.
//!
//! Three families, with different blast radii:
//! - [`ProtocolError`]: a request-level failure. Reported to the client as a
//!   500 page with a session-reset link; never crashes the process.
//! - [`AppError`]: a failure inside application code (entry function or an
//!   action callback). Fatal to the current request only.
//! - Stale client identifiers (unknown session, action, or window id on a
//!   missing session) are *not* errors at all: they are handled softly at the
//!   dispatch layer because the client fully controls them.

use thiserror::Error;

use crate::auth::AuthError;
use crate::pool::DbError;

// ============================================================================
// Protocol Errors
// ============================================================================

/// Request-level failure in the session protocol.
///
/// Always recoverable by the client via `?reset=1`.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The request supplied a `window` id that is not registered in the
    /// resolved session.
    #[error("invalid window ID: {0}")]
    UnknownWindow(String),

    /// No current window was set after the entry function or action ran.
    #[error("no current window")]
    NoCurrentWindow,

    /// The current window id points at a window that is not registered.
    /// Indicates an inconsistent registration, not a client mistake.
    #[error("current window {0} is not registered")]
    UnregisteredCurrentWindow(u64),
}

// ============================================================================
// Application Errors
// ============================================================================

/// Failure raised by application code while a request holds the session lock.
///
/// Aborts the current request with a diagnostic; the session itself and all
/// other in-flight sessions are unaffected.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    /// A configuration key the application requires is absent.
    #[error("required configuration key '{0}' is missing")]
    MissingConfig(String),

    #[error("{0}")]
    Other(String),
}
