//! Error types for device sessions and configuration transactions.
//!
//! [`TransportError`] is what a transport implementation reports. The session
//! layer maps every transport failure into a [`DeviceError`] variant that names
//! the failure category, and the operation facade turns those into result
//! envelopes.

use thiserror::Error;

/// Errors reported by a [`DeviceTransport`](crate::transport::DeviceTransport)
/// implementation.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The device could not be reached.
    #[error("device unreachable: {0}")]
    Unreachable(String),

    /// The device refused the supplied credentials.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The device rejected the request.
    #[error("{0}")]
    Rejected(String),

    /// The management session is gone. Fatal for the owning connection.
    #[error("session closed")]
    Closed,

    /// The transport gave up waiting for the device.
    #[error("timeout: {0}")]
    Timeout(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while driving a device session.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Transport unreachable or authentication failure. Never retried automatically.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The connection has no live transport.
    #[error("not connected to {0}")]
    NotConnected(String),

    /// The configuration database could not be locked.
    ///
    /// Usually another actor already holds the lock.
    #[error("could not lock config: {0}")]
    Lock(String),

    /// The configuration database could not be unlocked.
    ///
    /// The device may stay locked until someone clears it by hand.
    #[error("could not unlock config: {0}")]
    Unlock(String),

    /// The candidate configuration was rejected.
    #[error("Failed to load config: {0}")]
    Load(String),

    /// Commit-check did not pass, so the commit was never attempted.
    #[error("Pre-commit check failed.")]
    CommitCheckFailed,

    /// The commit failed after a successful commit-check.
    ///
    /// The active configuration may be partially applied.
    #[error("Pre-commit check succeeded but actual commit failed with \"{0}\"")]
    CommitApply(String),

    #[error("rollback failed: {0}")]
    Rollback(String),

    /// An RPC failed on the device or in the transport.
    #[error("rpc {name} failed: {cause}")]
    Rpc { name: String, cause: String },

    /// The RPC name is not part of the catalog.
    #[error("unsupported RPC: {0}")]
    UnsupportedRpc(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An operation was called in a transaction phase that does not allow it.
    #[error("invalid transaction state: {0}")]
    InvalidTransaction(String),

    #[error("shutdown failed: {0}")]
    Shutdown(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
