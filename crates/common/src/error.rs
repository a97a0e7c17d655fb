//! Shared error taxonomy for the coordinator.
//!
//! Every component returns the same error enum so that callers can match on
//! the failure class without knowing which subsystem produced it. Transport
//! failures (`NotConnected`, `Timeout`, `DeviceRejected`) are attempt-level:
//! distribution and healing continue with remaining devices, retrieval fails
//! over to the next holder.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FabricError {
    /// Missing or invalid configuration. Fatal at startup.
    #[error("config error: {0}")]
    Config(String),

    /// Bad caller input: empty file, malformed payload, unknown field value.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Upload exceeds the configured maximum file size.
    #[error("file too large: {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    /// Placement could not find enough eligible devices.
    #[error("insufficient capacity: needed {needed} devices, found {found}")]
    InsufficientCapacity { needed: usize, found: usize },

    /// No live channel is bound for the logical device id.
    #[error("device not connected: {0}")]
    NotConnected(String),

    /// A device request did not complete within its deadline.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// The device answered but refused the request.
    #[error("device rejected request: {0}")]
    DeviceRejected(String),

    /// Content hash mismatch on ciphertext or on the reassembled file.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// AEAD tag or AAD mismatch during decryption.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Key wrapping/unwrapping or derivation failure.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Unknown file, chunk, or device id.
    #[error("not found: {0}")]
    NotFound(String),

    /// The requested data exists but no live replica can serve it.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Uniqueness violation on insert. Racing writers treat this as success.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, FabricError>;
