#![forbid(unsafe_code)]
//! driftfs public API facade.
//!
//! Re-exports the data-path surface: filesystem assembly from `dfs-core`,
//! the read/write pipelines and data jobs from `dfs-io`, and the codec
//! option types callers configure writes with.

pub use dfs_codec::{ChecksumType, CompressionType, EncryptionKey};
pub use dfs_core::*;
pub use dfs_io::*;
