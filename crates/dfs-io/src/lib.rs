#![forbid(unsafe_code)]
//! The foreground data path: write pipeline, read pipeline, promotion and
//! the move engine.
//!
//! ## Modules
//!
//! - **write**: encode loop, replica submission, index update, flush.
//! - **read**: replica pick, bounce decisions, verify/decrypt/decompress,
//!   the retry state machine, narrow CRCs.
//! - **promote**: cache writes to the fastest tier on reads from slower
//!   tiers.
//! - **migrate**: the move engine and the migrate index-update protocol.

use asupersync::Cx;
use dfs_error::{DfsError, Result};

pub mod migrate;
mod promote;
pub mod read;
pub mod write;

pub use migrate::{DataJob, MoveArgs, MoveStats, RateLimit, SectorThrottle, data_job, move_data};
pub use read::{ReadFlags, read};
pub use write::{DefaultIndexUpdate, IndexUpdate, KeyCommit, WriteFlags, WriteOp, write};

#[inline]
pub(crate) fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| DfsError::Cancelled)
}
