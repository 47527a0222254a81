//! Cache promotion on read.
//!
//! When a read is served from a slower tier, the delivered extent is
//! handed back to the write pipeline as a cached copy targeting the
//! fastest tier. The payload is the stored-form coverage the read just
//! verified, so the write takes the pre-encoded shortcut; the index update
//! is the migrate protocol, which merges the new cached pointer into the
//! stored extent and silently loses to any concurrent foreground write.

use crate::migrate::MigrateUpdate;
use crate::read::Pick;
use crate::write::{WriteFlags, WriteOp, write};
use asupersync::Cx;
use dfs_alloc::{Reservation, WritePointSpec};
use dfs_core::Fs;
use dfs_error::DfsError;
use dfs_extent::ExtentKey;
use dfs_types::ExtentPos;
use tracing::{debug, trace};

/// Write point shared by promotion writes.
const PROMOTE_WP: WritePointSpec = WritePointSpec(0x70726f);

/// Fire-and-forget: failures only cost us the cached copy.
pub(crate) fn promote_write(cx: &Cx, fs: &Fs, key: &ExtentKey, pick: &Pick, coverage: &[u8]) {
    let live_start = pick.coverage_start + u64::from(pick.crc.offset);
    let res = Reservation::empty(&fs.usage);
    let mut op = WriteOp::new(
        fs,
        ExtentPos::new(key.inode(), live_start),
        coverage.to_vec(),
        res,
    );
    op.version = key.version;
    op.crc = pick.crc;
    op.nr_replicas = 1;
    op.nr_replicas_required = 1;
    op.devs = fs.devs.fastest_devs();
    op.devs_have = key.devices();
    op.write_point = PROMOTE_WP;
    op.flags = WriteFlags {
        data_encoded: true,
        pages_stable: true,
        pages_owned: true,
        cached: true,
        alloc_nowait: true,
        only_specified_devs: true,
        ..WriteFlags::default()
    };
    if pick.crc.csum_type.is_encryption() {
        op.nonce = pick.crc.nonce + pick.crc.offset;
        op.csum_type = pick.crc.csum_type;
    }
    op.set_updater(Box::new(MigrateUpdate {
        ptr: pick.ptr,
        coverage_start: pick.coverage_start,
        move_dev: None,
        stats: None,
    }));

    match write(cx, fs, &mut op) {
        Ok(()) => {
            trace!(
                target: "dfs::io::promote",
                event = "promoted",
                inode = %key.inode(),
                sectors = op.written,
            );
        }
        Err(DfsError::WouldBlock | DfsError::NoSpace) => {
            trace!(target: "dfs::io::promote", event = "skipped_no_space", inode = %key.inode());
        }
        Err(err) => {
            debug!(
                target: "dfs::io::promote",
                event = "promote_failed",
                inode = %key.inode(),
                error = %err,
            );
        }
    }
}
