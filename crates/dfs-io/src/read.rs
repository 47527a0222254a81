//! The read pipeline.
//!
//! `read` resolves a logical range to extents, picks a replica per extent,
//! issues the device read into the caller's buffer or a bounce buffer,
//! then verifies, decrypts, decompresses and delivers. Failures drive an
//! explicit retry state machine: a checksum mismatch on a user-mapped
//! buffer retries once with forced bouncing, integrity and device errors
//! retry against the next replica with the offender in the avoid set, and
//! decompression failures are fatal for the request.

use crate::{cx_checkpoint, promote};
use asupersync::Cx;
use dfs_codec::{CrcDescriptor, ExtentNonce};
use dfs_core::Fs;
use dfs_device::Dev;
use dfs_error::{DfsError, Result};
use dfs_extent::ExtentKey;
use dfs_types::{
    DataType, DeviceMask, ExtentPos, InodeNumber, IoDir, Pointer, bytes_to_sectors,
    sectors_to_bytes,
};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct ReadFlags {
    /// Enqueue a cached copy on the fastest tier if this read came from a
    /// slower one.
    pub may_promote: bool,
    /// The destination buffer may be modified concurrently by its owner;
    /// never trust checksums computed over it.
    pub user_mapped: bool,
    /// Force reading through a bounce buffer.
    pub must_bounce: bool,
    /// Retry instead of failing when a cached pointer went stale.
    pub retry_if_stale: bool,
    /// This attempt is already a retry: no promotion, no narrowing, no
    /// further deference.
    pub in_retry: bool,
}

/// A chosen replica: the pointer, its descriptor (possibly narrowed to the
/// fragment), and the logical sector where the stored coverage begins.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Pick {
    pub ptr: Pointer,
    pub crc: CrcDescriptor,
    pub coverage_start: u64,
}

enum Disposition {
    Done,
    Retry,
    RetryAvoid(dfs_types::DeviceIdx),
    Fatal(DfsError),
}

// ── Public operation ────────────────────────────────────────────────────────

/// Fill `buf` with the plaintext of `[offset, offset + buf_sectors)` of
/// `inode`. Holes read as zeroes.
pub fn read(
    cx: &Cx,
    fs: &Fs,
    buf: &mut [u8],
    inode: InodeNumber,
    offset: u64,
    flags: ReadFlags,
) -> Result<()> {
    debug_assert!(buf.len() % dfs_types::SECTOR_SIZE == 0);
    let end = offset + u64::from(bytes_to_sectors(buf.len()));
    let mut cur = offset;
    let mut flags = flags;
    let mut avoid = DeviceMask::EMPTY;
    let mut attempts: usize = 0;
    let max_attempts = fs.devs.len() + 2;

    while cur < end {
        cx_checkpoint(cx)?;

        let key = match fs.index.peek(ExtentPos::new(inode, cur)) {
            Some((k, _)) if k.inode() == inode && k.start_offset() < end => k,
            _ => {
                zero_fill(buf, offset, cur, end);
                return Ok(());
            }
        };

        if key.start_offset() > cur {
            zero_fill(buf, offset, cur, key.start_offset());
            cur = key.start_offset();
        }

        let frag_end = key.end_offset().min(end);
        let dst_start = sectors_to_bytes(u32::try_from(cur - offset).unwrap_or(0));
        let dst_end = sectors_to_bytes(u32::try_from(frag_end - offset).unwrap_or(0));
        let dst = &mut buf[dst_start..dst_end];

        match read_extent(cx, fs, &key, dst, cur, &mut flags, &avoid) {
            Disposition::Done => {
                cur = frag_end;
                attempts = 0;
                avoid = DeviceMask::EMPTY;
            }
            Disposition::RetryAvoid(dev) => {
                avoid.insert(dev);
                attempts += 1;
                flags.in_retry = true;
                flags.may_promote = false;
            }
            Disposition::Retry => {
                attempts += 1;
                flags.in_retry = true;
                flags.may_promote = false;
            }
            Disposition::Fatal(err) => return Err(err),
        }
        if attempts > max_attempts {
            error!(
                target: "dfs::io::read",
                event = "retries_exhausted",
                inode = %inode,
                sector = cur,
            );
            return Err(DfsError::NoDevice);
        }
    }
    Ok(())
}

fn zero_fill(buf: &mut [u8], base: u64, from: u64, to: u64) {
    let start = sectors_to_bytes(u32::try_from(from - base).unwrap_or(0));
    let end = sectors_to_bytes(u32::try_from(to - base).unwrap_or(0)).min(buf.len());
    buf[start..end].fill(0);
}

// ── Replica pick ────────────────────────────────────────────────────────────

/// Choose a replica: live device, not in the avoid set, not a stale cached
/// pointer; tie-break on measured read latency, then device index.
pub(crate) fn pick_ptr(fs: &Fs, key: &ExtentKey, avoid: &DeviceMask) -> Option<Pick> {
    key.ptrs
        .iter()
        .filter(|e| !avoid.contains(e.ptr.dev))
        .filter_map(|e| fs.devs.get(e.ptr.dev).map(|d| (e, d)))
        .filter(|(e, d)| !d.is_dying() && !(e.ptr.cached && d.ptr_stale(&e.ptr)))
        .min_by_key(|(e, d)| (d.latency_us(IoDir::Read), e.ptr.dev.0))
        .map(|(e, _)| {
            let crc = *key.crc_for(e);
            Pick {
                ptr: e.ptr,
                crc,
                coverage_start: key.start_offset() - u64::from(crc.offset),
            }
        })
}

fn should_promote(fs: &Fs, pick: &Pick) -> bool {
    if fs.is_read_only() {
        return false;
    }
    let Some(fastest) = fs.devs.fastest_tier() else {
        return false;
    };
    fs.devs
        .get(pick.ptr.dev)
        .is_some_and(|d| d.tier > fastest)
}

// ── Per-extent read ─────────────────────────────────────────────────────────

fn read_extent(
    cx: &Cx,
    fs: &Fs,
    key: &ExtentKey,
    dst: &mut [u8],
    cur: u64,
    flags: &mut ReadFlags,
    avoid: &DeviceMask,
) -> Disposition {
    let frag_sectors = bytes_to_sectors(dst.len());
    let Some(mut pick) = pick_ptr(fs, key, avoid) else {
        warn!(
            target: "dfs::io::read",
            event = "no_device",
            inode = %key.inode(),
            sector = cur,
        );
        return Disposition::Fatal(DfsError::NoDevice);
    };
    let Some(dev) = fs.devs.get(pick.ptr.dev).cloned() else {
        return Disposition::Fatal(DfsError::NoDevice);
    };

    let narrow = !flags.in_retry && key.crcs.len() == 1 && pick.crc.can_narrow();
    let promote_wanted = flags.may_promote
        && !flags.in_retry
        && fs.io_opts(key.inode()).promote
        && should_promote(fs, &pick);

    let read_full = pick.crc.is_compressed()
        || (!pick.crc.csum_type.is_none()
            && (frag_sectors != pick.crc.uncompressed_size
                || narrow
                || (pick.crc.csum_type.is_encryption() && flags.user_mapped)
                || flags.must_bounce));
    let bounce = read_full || promote_wanted;

    if !read_full {
        // Reading a plain subrange: aim the pointer straight at the live
        // bytes and shrink the descriptor's coverage to the fragment. With
        // a checksum present this only happens when the fragment is the
        // whole coverage, so every adjustment below is zero.
        debug_assert!(
            pick.crc.csum_type.is_none()
                || (frag_sectors == pick.crc.uncompressed_size
                    && pick.crc.offset == 0
                    && cur == key.start_offset())
        );
        pick.ptr.offset += u64::from(pick.crc.offset) + (cur - key.start_offset());
        pick.crc.compressed_size = frag_sectors;
        pick.crc.uncompressed_size = frag_sectors;
        pick.crc.live_size = frag_sectors;
        pick.crc.offset = 0;
        pick.coverage_start = cur;
    }

    if bounce {
        let coverage_bytes = sectors_to_bytes(pick.crc.compressed_size);
        let mut buf = match fs.bounce.acquire(cx, coverage_bytes) {
            Ok(b) => b,
            Err(err) => return Disposition::Fatal(err),
        };
        trace!(target: "dfs::io::read", event = "read_bounce", sector = cur, bytes = coverage_bytes);
        let disp = read_extent_bounced(
            cx,
            fs,
            key,
            &pick,
            &dev,
            buf.as_mut_slice(),
            dst,
            cur,
            flags,
            narrow,
            promote_wanted,
        );
        fs.bounce.release(buf);
        disp
    } else {
        read_extent_direct(cx, fs, key, &pick, &dev, dst, flags)
    }
}

/// Post-I/O checks shared by both paths: stale-cache detection and
/// checksum verification over the received bytes.
fn check_received(
    fs: &Fs,
    key: &ExtentKey,
    pick: &Pick,
    dev: &Arc<Dev>,
    data: &[u8],
    bounced: bool,
    flags: &mut ReadFlags,
) -> Option<Disposition> {
    if pick.ptr.cached
        && ((flags.retry_if_stale && fs.race_fault()) || dev.ptr_stale(&pick.ptr))
    {
        fs.counters
            .read_realloc_races
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        debug!(
            target: "dfs::io::read",
            event = "stale_cached_ptr",
            dev = %pick.ptr.dev,
        );
        return Some(if flags.retry_if_stale {
            Disposition::Retry
        } else {
            Disposition::Fatal(DfsError::StaleCached { dev: pick.ptr.dev })
        });
    }

    let nonce = ExtentNonce::from_crc(key.version, &pick.crc);
    if let Err(err) = dfs_codec::verify_checksum(
        pick.crc.csum_type,
        fs.key(),
        nonce,
        data,
        pick.crc.csum,
        pick.ptr.dev,
    ) {
        // If the data wasn't bounced the owner of the buffer may have
        // scribbled over it mid-flight; retry bounced before blaming the
        // device.
        if !bounced && flags.user_mapped {
            flags.must_bounce = true;
            return Some(Disposition::Retry);
        }
        warn!(
            target: "dfs::io::read",
            event = "checksum_mismatch",
            dev = %pick.ptr.dev,
            inode = %key.inode(),
            error = %err,
        );
        dev.note_io_error(IoDir::Read);
        return Some(Disposition::RetryAvoid(pick.ptr.dev));
    }
    None
}

#[expect(clippy::too_many_arguments)]
fn read_extent_bounced(
    cx: &Cx,
    fs: &Fs,
    key: &ExtentKey,
    pick: &Pick,
    dev: &Arc<Dev>,
    coverage: &mut [u8],
    dst: &mut [u8],
    cur: u64,
    flags: &mut ReadFlags,
    narrow: bool,
    promote_wanted: bool,
) -> Disposition {
    match dev.submit_read(cx, pick.ptr.offset, coverage, DataType::User) {
        Ok(()) => {}
        Err(DfsError::Cancelled) => return Disposition::Fatal(DfsError::Cancelled),
        Err(_) => return Disposition::RetryAvoid(pick.ptr.dev),
    }

    if let Some(disp) = check_received(fs, key, pick, dev, coverage, true, flags) {
        return disp;
    }

    if narrow {
        try_narrow_crcs(cx, fs, key, pick, coverage);
    }

    let nonce = ExtentNonce::from_crc(key.version, &pick.crc);
    // Fragment position within the uncompressed coverage.
    let sub_off = u32::try_from(cur - pick.coverage_start).unwrap_or(0);
    let frag_bytes = dst.len();

    if pick.crc.is_compressed() {
        if let Err(err) = dfs_codec::encrypt(pick.crc.csum_type, fs.key(), nonce, coverage) {
            return Disposition::Fatal(err);
        }
        let plain = match dfs_codec::decompress(&pick.crc, coverage) {
            Ok(p) => p,
            Err(err) => {
                error!(
                    target: "dfs::io::read",
                    event = "decompression_error",
                    inode = %key.inode(),
                    sector = cur,
                    error = %err,
                );
                return Disposition::Fatal(err);
            }
        };
        let start = sectors_to_bytes(sub_off);
        dst.copy_from_slice(&plain[start..start + frag_bytes]);
        // Restore the coverage to its stored form for promotion.
        if promote_wanted
            && let Err(err) = dfs_codec::encrypt(pick.crc.csum_type, fs.key(), nonce, coverage)
        {
            return Disposition::Fatal(err);
        }
    } else {
        let start = sectors_to_bytes(sub_off);
        let sub_nonce = nonce.add_sectors(sub_off);
        let sub = &mut coverage[start..start + frag_bytes];
        if let Err(err) = dfs_codec::encrypt(pick.crc.csum_type, fs.key(), sub_nonce, sub) {
            return Disposition::Fatal(err);
        }
        dst.copy_from_slice(sub);
        if promote_wanted
            && let Err(err) = dfs_codec::encrypt(pick.crc.csum_type, fs.key(), sub_nonce, sub)
        {
            return Disposition::Fatal(err);
        }
    }

    if promote_wanted {
        promote::promote_write(cx, fs, key, pick, coverage);
    }
    Disposition::Done
}

fn read_extent_direct(
    cx: &Cx,
    fs: &Fs,
    key: &ExtentKey,
    pick: &Pick,
    dev: &Arc<Dev>,
    dst: &mut [u8],
    flags: &mut ReadFlags,
) -> Disposition {
    match dev.submit_read(cx, pick.ptr.offset, dst, DataType::User) {
        Ok(()) => {}
        Err(DfsError::Cancelled) => return Disposition::Fatal(DfsError::Cancelled),
        Err(_) => return Disposition::RetryAvoid(pick.ptr.dev),
    }

    if let Some(disp) = check_received(fs, key, pick, dev, dst, false, flags) {
        return disp;
    }

    // Unbounced reads are either plain or an exact-coverage decrypt.
    let nonce = ExtentNonce::from_crc(key.version, &pick.crc);
    if let Err(err) = dfs_codec::encrypt(pick.crc.csum_type, fs.key(), nonce, dst) {
        return Disposition::Fatal(err);
    }
    Disposition::Done
}

// ── Narrow CRCs ─────────────────────────────────────────────────────────────

/// Opportunistically rewrite the stored extent's checksum to cover exactly
/// its live range, so future reads stop fetching dead coverage. Best
/// effort: any mismatch with the current index state aborts silently; a
/// verification failure against our own bounce data is loudly logged.
fn try_narrow_crcs(cx: &Cx, fs: &Fs, key_read: &ExtentKey, pick: &Pick, coverage: &[u8]) {
    if pick.crc.is_compressed() {
        return;
    }
    let inode = key_read.inode();
    let read_pos = key_read.start_offset();

    loop {
        let Some((stored, seq)) = fs.index.peek(ExtentPos::new(inode, read_pos)) else {
            return;
        };
        if stored.inode() != inode
            || stored.version != key_read.version
            || !stored.matches_ptr(pick.ptr, pick.coverage_start)
        {
            return;
        }
        // Extent was merged or extended past what we read?
        if stored.start_offset() < read_pos
            || stored.end_offset() > read_pos + u64::from(pick.crc.uncompressed_size)
        {
            return;
        }

        let offset = pick.crc.offset + u32::try_from(stored.start_offset() - read_pos).unwrap_or(0);
        let new_crc = match dfs_codec::rechecksum(
            coverage,
            key_read.version,
            &pick.crc,
            offset,
            stored.size,
            pick.crc.csum_type,
            fs.key(),
        ) {
            Ok(c) => c,
            Err(err) => {
                error!(
                    target: "dfs::io::read",
                    event = "narrow_verify_failed",
                    inode = %inode,
                    error = %err,
                );
                return;
            }
        };

        let mut replacement = stored;
        if !replacement.narrow_crc(new_crc) {
            return;
        }
        match fs.index.insert_atomic(cx, replacement, seq) {
            Ok(()) => {
                trace!(target: "dfs::io::read", event = "narrowed_crcs", inode = %inode);
                return;
            }
            Err(DfsError::Raced) => continue,
            Err(_) => return,
        }
    }
}

// ── Nodecode reads (move engine) ────────────────────────────────────────────

pub(crate) struct NodecodeRead {
    pub pick: Pick,
    pub data: Vec<u8>,
}

/// Read an extent's stored coverage verbatim: verify the checksum but do
/// not decrypt or decompress. Retries across replicas on integrity or
/// device errors.
pub(crate) fn read_extent_nodecode(cx: &Cx, fs: &Fs, key: &ExtentKey) -> Result<NodecodeRead> {
    let mut avoid = DeviceMask::EMPTY;
    loop {
        cx_checkpoint(cx)?;
        let Some(pick) = pick_ptr(fs, key, &avoid) else {
            return Err(DfsError::NoDevice);
        };
        let Some(dev) = fs.devs.get(pick.ptr.dev).cloned() else {
            return Err(DfsError::NoDevice);
        };
        let mut data = vec![0u8; sectors_to_bytes(pick.crc.compressed_size)];
        if dev
            .submit_read(cx, pick.ptr.offset, &mut data, DataType::User)
            .is_err()
        {
            avoid.insert(pick.ptr.dev);
            continue;
        }
        if pick.ptr.cached && dev.ptr_stale(&pick.ptr) {
            fs.counters
                .read_realloc_races
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return Err(DfsError::StaleCached { dev: pick.ptr.dev });
        }
        let nonce = ExtentNonce::from_crc(key.version, &pick.crc);
        match dfs_codec::verify_checksum(
            pick.crc.csum_type,
            fs.key(),
            nonce,
            &data,
            pick.crc.csum,
            pick.ptr.dev,
        ) {
            Ok(()) => return Ok(NodecodeRead { pick, data }),
            Err(_) => {
                dev.note_io_error(IoDir::Read);
                avoid.insert(pick.ptr.dev);
            }
        }
    }
}
