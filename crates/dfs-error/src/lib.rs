#![forbid(unsafe_code)]
//! Error types for driftfs.
//!
//! Defines `DfsError` and a `Result<T>` alias used throughout the workspace.
//! The variants follow the data path's taxonomy: transient conditions the
//! pipelines recover from locally, input errors, integrity failures that are
//! retried against other replicas, per-device I/O status, and fatal states.

use dfs_types::DeviceIdx;
use thiserror::Error;

/// Unified error type for all driftfs operations.
#[derive(Debug, Error)]
pub enum DfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Transient: recovered locally by the pipelines.
    #[error("allocation would block")]
    WouldBlock,

    #[error("index state changed, retry")]
    Raced,

    #[error("journal full")]
    JournalFull,

    #[error("stale cached pointer on device {dev}")]
    StaleCached { dev: DeviceIdx },

    // Input.
    #[error("no space left on device")]
    NoSpace,

    #[error("read-only filesystem")]
    ReadOnly,

    #[error("invalid data job target: {0}")]
    InvalidTarget(String),

    // Integrity: tried against the next replica before surfacing.
    #[error("checksum mismatch on device {dev}: expected {expected:#034x} got {actual:#034x}")]
    ChecksumMismatch {
        dev: DeviceIdx,
        expected: u128,
        actual: u128,
    },

    #[error("decompression failed: {0}")]
    DecompressionFailed(String),

    #[error("unpacking index key failed: {0}")]
    KeyUnpack(String),

    // Device.
    #[error("I/O error on device {dev}")]
    IoDevice { dev: DeviceIdx },

    #[error("no device to read from")]
    NoDevice,

    // Fatal / ambient.
    #[error("journal error")]
    JournalError,

    #[error("operation cancelled")]
    Cancelled,

    #[error("out of bounce memory")]
    NoMem,
}

impl DfsError {
    /// Whether the pipelines treat this error as transient and retryable.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::WouldBlock | Self::Raced | Self::JournalFull | Self::StaleCached { .. }
        )
    }
}

/// Result alias using `DfsError`.
pub type Result<T> = std::result::Result<T, DfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(DfsError::WouldBlock.is_transient());
        assert!(DfsError::Raced.is_transient());
        assert!(
            DfsError::StaleCached {
                dev: DeviceIdx(1)
            }
            .is_transient()
        );
        assert!(!DfsError::NoSpace.is_transient());
        assert!(!DfsError::NoDevice.is_transient());
    }

    #[test]
    fn io_error_converts() {
        let err: DfsError = std::io::Error::other("boom").into();
        assert!(matches!(err, DfsError::Io(_)));
    }
}
