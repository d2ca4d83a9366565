//! Error taxonomy shared across the workspace.

use std::io;
use thiserror::Error;

/// Failure classes surfaced by keywarden operations.
///
/// Per-request failures are packaged into RPC responses; only configuration
/// errors at startup are fatal to a daemon.
#[derive(Debug, Error)]
pub enum KeywardenError {
    /// Wrong password, unknown client certificate, or missing credential.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Caller is not in the allow-list or an admission limit was hit.
    #[error("access denied: {0}")]
    Access(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A record with the same UUID already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Malformed request, unsupported file system, short password, and such.
    #[error("invalid input: {0}")]
    Invalid(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    /// Transport-level failure talking to the key server.
    #[error("rpc failure: {0}")]
    Rpc(String),
}

pub type KeywardenResult<T> = Result<T, KeywardenError>;
