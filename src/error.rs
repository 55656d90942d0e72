//! Crate-wide error taxonomy (§7).
//!
//! Every module keeps its own `thiserror`-derived error enum for local detail;
//! each converts into `CoreError` at the point where it crosses a component
//! boundary, the same pattern the reference core uses to fold `StoreError` /
//! `DbError` / `OpsError` into one error type at the FFI boundary.

use thiserror::Error;

use crate::blobstore::BlobError;
use crate::logcore::LogCoreError;
use crate::pairing::PairingError;
use crate::transport::TransportError;
use crate::view::ViewError;

/// The six error kinds every caller-facing failure is classified into.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Network drop, peer gone, or timeout. Callers may retry.
    #[error("transient: {0}")]
    Transient(String),

    /// Blob, message, or room absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Local writer has not yet been admitted to the room.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Duplicate invite redemption or forked writer detected.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Hash-chain or signature verification failed on a received entry.
    #[error("corrupt: {0}")]
    Corrupt(String),

    /// Local storage I/O failure; the room is closed.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl CoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Transient(_))
    }
}

impl From<LogCoreError> for CoreError {
    fn from(e: LogCoreError) -> Self {
        match e {
            LogCoreError::Fork { .. } => CoreError::Conflict(e.to_string()),
            LogCoreError::VerificationFailed(_) => CoreError::Corrupt(e.to_string()),
            LogCoreError::Unauthorized(_) => CoreError::Unauthorized(e.to_string()),
            LogCoreError::NotAvailable => CoreError::NotFound(e.to_string()),
            LogCoreError::Store(_) => CoreError::Fatal(e.to_string()),
        }
    }
}

impl From<ViewError> for CoreError {
    fn from(e: ViewError) -> Self {
        match e {
            ViewError::NotFound(_) => CoreError::NotFound(e.to_string()),
            ViewError::Sqlx(_) => CoreError::Fatal(e.to_string()),
        }
    }
}

impl From<TransportError> for CoreError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout => CoreError::Transient(e.to_string()),
            TransportError::PeerGone => CoreError::Transient(e.to_string()),
            _ => CoreError::Transient(e.to_string()),
        }
    }
}

impl From<BlobError> for CoreError {
    fn from(e: BlobError) -> Self {
        match e {
            BlobError::NotFound => CoreError::NotFound(e.to_string()),
            BlobError::Io(_) => CoreError::Fatal(e.to_string()),
            _ => CoreError::Fatal(e.to_string()),
        }
    }
}

impl From<PairingError> for CoreError {
    fn from(e: PairingError) -> Self {
        match e {
            PairingError::AlreadyRedeemed => CoreError::Conflict(e.to_string()),
            PairingError::Expired => CoreError::Unauthorized(e.to_string()),
            PairingError::IssuerMismatch => CoreError::Unauthorized(e.to_string()),
            PairingError::Transport(_) => CoreError::Transient(e.to_string()),
            _ => CoreError::Fatal(e.to_string()),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Fatal(e.to_string())
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        CoreError::Fatal(e.to_string())
    }
}
