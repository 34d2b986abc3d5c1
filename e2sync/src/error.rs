//! Error types for the sync client.

use thiserror::Error;

use e2sync_formats::FormatError;

/// Errors that can terminate a sync step.
///
/// Any of these aborts the current sync attempt immediately; there is no
/// structured retry. The orchestrator stringifies the error into the
/// progress event channel, so variants carry human-readable detail.
#[derive(Error, Debug)]
pub enum SyncError {
    /// TCP connect failure, refused connection or broken session.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Credentials were rejected, or a connectivity test saw a lingering
    /// password prompt.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The remote side answered a transfer command with an error status.
    /// The payload is the protocol's own response line.
    #[error("Transfer error: {0}")]
    Transfer(String),

    /// A configuration record could not be decoded.
    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request timed out")]
    Timeout,

    /// A sync is already running for this profile; sessions are not
    /// reentrant and the device cannot manage concurrent configuration
    /// access.
    #[error("A sync operation is already in progress for this profile")]
    Busy,

    /// Cancellation was requested and honored between two steps.
    #[error("Operation cancelled")]
    Cancelled,

    /// A session method was called from the wrong state.
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    /// A requested branch exists in the interface but has no
    /// implementation. Fails loudly, never a silent no-op.
    #[error("Not implemented yet: {0}")]
    NotImplemented(&'static str),
}
