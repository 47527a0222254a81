//! The write pipeline.
//!
//! `write` turns an in-memory payload plus a target position into one or
//! more extent-index entries covering durable replicas: reserve space,
//! open a write point, encode (compress / encrypt / checksum) in chunks
//! sized by the open buckets, submit one device write per replica, then
//! hand the accumulated key list to the index updater. Failures commit
//! whatever was successfully written before surfacing the error.

use crate::cx_checkpoint;
use asupersync::Cx;
use dfs_alloc::{Reservation, ReserveClass, WritePoint, WritePointSpec};
use dfs_codec::{ChecksumType, CompressionType, CrcDescriptor, ExtentNonce};
use dfs_core::Fs;
use dfs_error::{DfsError, Result};
use dfs_extent::ExtentKey;
use dfs_journal::JournalRes;
use dfs_types::{
    DataType, DeviceMask, ExtentPos, JournalSeq, SECTOR_SIZE, Version, bytes_to_sectors,
    sectors_to_bytes,
};
use tracing::{debug, error, trace, warn};

// ── Payload buffer ──────────────────────────────────────────────────────────

/// The op's view of its payload: a window `[pos, end)` that advances as
/// chunks are consumed and narrows when pre-encoded data is trimmed to its
/// live range.
struct IoBuf {
    data: Vec<u8>,
    pos: usize,
    end: usize,
}

impl IoBuf {
    fn new(data: Vec<u8>) -> Self {
        let end = data.len();
        Self { data, pos: 0, end }
    }

    fn remaining(&self) -> usize {
        self.end - self.pos
    }

    fn remaining_sectors(&self) -> u32 {
        bytes_to_sectors(self.remaining())
    }

    fn as_slice(&self) -> &[u8] {
        &self.data[self.pos..self.end]
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.pos..self.end]
    }

    fn advance(&mut self, bytes: usize) {
        debug_assert!(bytes <= self.remaining());
        self.pos += bytes;
    }

    fn restrict(&mut self, bytes: usize) {
        debug_assert!(bytes <= self.remaining());
        self.end = self.pos + bytes;
    }

    /// Replace the window contents (after an in-place decompression).
    fn replace(&mut self, data: Vec<u8>) {
        self.end = data.len();
        self.pos = 0;
        self.data = data;
    }
}

// ── Write op ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct WriteFlags {
    /// Payload is already encoded; `crc` describes it.
    pub data_encoded: bool,
    /// Payload bytes cannot change underneath us.
    pub pages_stable: bool,
    /// Payload pages belong to the op.
    pub pages_owned: bool,
    /// Produce cached (evictable) pointers.
    pub cached: bool,
    /// Fail with `WouldBlock` rather than wait for allocation.
    pub alloc_nowait: bool,
    /// Wait for journal durability before completing.
    pub flush: bool,
    /// Never fall back to devices outside the target mask.
    pub only_specified_devs: bool,
    /// Skip recording the replica set in the superblock table.
    pub nomark_replicas: bool,
}

/// Key list handed to an index updater. The updater consumes keys front to
/// back; keys left behind on error were not inserted.
pub struct KeyCommit<'a> {
    pub keys: &'a mut Vec<ExtentKey>,
    pub journal_res: &'a JournalRes,
}

/// How a write's key list reaches the extent index.
pub trait IndexUpdate: Send {
    fn update(&mut self, cx: &Cx, fs: &Fs, commit: &mut KeyCommit<'_>) -> Result<()>;
}

/// Plain copy-on-write insertion, for foreground writes.
pub struct DefaultIndexUpdate;

impl IndexUpdate for DefaultIndexUpdate {
    fn update(&mut self, cx: &Cx, fs: &Fs, commit: &mut KeyCommit<'_>) -> Result<()> {
        while let Some(key) = commit.keys.first() {
            fs.index.insert(cx, key.clone())?;
            commit.keys.remove(0);
        }
        Ok(())
    }
}

/// A foreground or background write in flight.
pub struct WriteOp {
    /// Next append position; advances as keys are built.
    pub pos: ExtentPos,
    pub version: Version,
    pub csum_type: ChecksumType,
    pub compression_type: CompressionType,
    pub nr_replicas: u32,
    pub nr_replicas_required: u32,
    pub devs: DeviceMask,
    pub devs_have: DeviceMask,
    pub write_point: WritePointSpec,
    pub alloc_reserve: ReserveClass,
    pub flags: WriteFlags,
    /// Descriptor of the payload when `data_encoded`.
    pub crc: CrcDescriptor,
    /// Encryption nonce cursor, in sectors.
    pub nonce: u32,
    pub res: Reservation,
    pub insert_keys: Vec<ExtentKey>,
    pub failed: DeviceMask,
    /// Sectors whose keys reached the index.
    pub written: u64,
    pub journal_seq: Option<JournalSeq>,
    payload: IoBuf,
    updater: Box<dyn IndexUpdate>,
}

impl WriteOp {
    /// A write of `payload` at `pos` with the inode's I/O options and the
    /// filesystem's replication defaults.
    #[must_use]
    pub fn new(fs: &Fs, pos: ExtentPos, payload: Vec<u8>, res: Reservation) -> Self {
        debug_assert!(payload.len() % SECTOR_SIZE == 0);
        let opts = fs.io_opts(pos.inode);
        Self {
            pos,
            version: Version::ZERO,
            csum_type: opts.csum,
            compression_type: opts.compression,
            nr_replicas: fs.opts().data_replicas,
            nr_replicas_required: 1,
            devs: fs.opts().foreground_target,
            devs_have: DeviceMask::EMPTY,
            write_point: WritePointSpec(0),
            alloc_reserve: ReserveClass::None,
            flags: WriteFlags::default(),
            crc: CrcDescriptor::default(),
            nonce: 0,
            res,
            insert_keys: Vec::new(),
            failed: DeviceMask::EMPTY,
            written: 0,
            journal_seq: None,
            payload: IoBuf::new(payload),
            updater: Box::new(DefaultIndexUpdate),
        }
    }

    pub fn set_updater(&mut self, updater: Box<dyn IndexUpdate>) {
        self.updater = updater;
    }

    #[must_use]
    pub fn payload_sectors(&self) -> u32 {
        self.payload.remaining_sectors()
    }
}

// ── Public operation ────────────────────────────────────────────────────────

/// Run a write to completion: allocate, encode, submit replicas, update the
/// index, optionally flush the journal.
///
/// On error, keys for chunks that were successfully written are still
/// inserted before the error is returned; `op.written` reports the
/// committed sectors.
pub fn write(cx: &Cx, fs: &Fs, op: &mut WriteOp) -> Result<()> {
    if fs.is_read_only() {
        warn!(target: "dfs::io::write", event = "read_only", pos = %op.pos);
        return Err(DfsError::ReadOnly);
    }
    if op.payload.remaining() == 0 {
        return Ok(());
    }
    if op.version.is_zero() {
        op.version = fs.next_version();
    }

    let mut result = Ok(());
    loop {
        if let Err(err) = cx_checkpoint(cx) {
            result = Err(err);
            break;
        }
        let wp = fs.alloc.sectors_start(
            cx,
            op.devs,
            op.write_point,
            op.devs_have,
            op.nr_replicas,
            op.nr_replicas_required,
            op.alloc_reserve,
            op.flags.only_specified_devs,
            op.flags.alloc_nowait,
        );
        let mut wp = match wp {
            Ok(wp) => wp,
            Err(err) => {
                result = Err(err);
                break;
            }
        };

        let more = write_extent(cx, fs, op, &mut wp);
        fs.alloc.sectors_done(wp);
        match more {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => {
                result = Err(err);
                break;
            }
        }
    }

    if !op.insert_keys.is_empty() {
        match write_index(cx, fs, op) {
            Ok(()) => {}
            Err(err) => {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
    }

    if result.is_ok() && !op.failed.is_empty() {
        // Some replica writes failed; the surviving pointers were committed
        // but the write is degraded.
        result = Err(DfsError::IoDevice {
            dev: op.failed.iter().next().unwrap_or(dfs_types::DeviceIdx(0)),
        });
    }

    if result.is_ok() && op.flags.flush {
        if let Some(seq) = op.journal_seq {
            result = fs.journal.flush_seq(cx, seq);
        }
    }

    trace!(
        target: "dfs::io::write",
        event = "write_done",
        pos = %op.pos,
        written = op.written,
        ok = result.is_ok(),
    );
    result
}

// ── Pre-encoded data ────────────────────────────────────────────────────────

enum PrepEncoded {
    Ok,
    DoWrite,
}

/// Decide what to do with already-encoded payloads: write as-is when the
/// extent fits the write point with matching kinds, otherwise decompress /
/// rechecksum / decrypt as needed so the encode loop can re-chunk it.
fn prep_encoded_data(fs: &Fs, op: &mut WriteOp, wp: &WritePoint) -> Result<PrepEncoded> {
    if !op.flags.data_encoded {
        return Ok(PrepEncoded::Ok);
    }
    debug_assert_eq!(op.payload.remaining_sectors(), op.crc.compressed_size);

    // Can we just write the entire extent as-is?
    if op.crc.uncompressed_size == op.crc.live_size
        && op.crc.compressed_size <= wp.sectors_free()
        && op.crc.compression_type == op.compression_type
    {
        if !op.crc.is_compressed() && op.csum_type != op.crc.csum_type {
            write_rechecksum(fs, op, op.csum_type)?;
        }
        return Ok(PrepEncoded::DoWrite);
    }

    // Compressed data that no longer fits the write point must be
    // decompressed before re-chunking.
    if op.crc.is_compressed() {
        write_decrypt(fs, op)?;

        // Last point where the existing checksum can still be verified.
        let nonce = ExtentNonce::from_crc(op.version, &op.crc);
        dfs_codec::verify_checksum(
            op.crc.csum_type,
            fs.key(),
            nonce,
            op.payload.as_slice(),
            op.crc.csum,
            dfs_types::DeviceIdx(u32::MAX),
        )?;

        let mut buf = op.payload.as_slice().to_vec();
        dfs_codec::decompress_inplace(&mut buf, &op.crc)?;
        op.payload.replace(buf);
        op.crc.compressed_size = op.crc.uncompressed_size;
        op.crc.compression_type = CompressionType::None;
        op.crc.csum_type = ChecksumType::None;
        op.crc.csum = Default::default();
    }

    // Writing a subset, or a different checksum kind: rechecksum and trim
    // the payload to the live range.
    if op.crc.live_size != op.crc.uncompressed_size || op.crc.csum_type != op.csum_type {
        write_rechecksum(fs, op, op.csum_type)?;
    }

    // Compressing, or changing the encryption discipline, requires
    // plaintext.
    if !op.compression_type.is_none()
        || op.crc.csum_type.is_encryption() != op.csum_type.is_encryption()
    {
        write_decrypt(fs, op)?;
    }

    Ok(PrepEncoded::Ok)
}

/// Narrow `op.crc` to its live range under a (possibly new) checksum kind,
/// trimming the payload window to match. A verification failure here means
/// the data changed underneath us.
fn write_rechecksum(fs: &Fs, op: &mut WriteOp, new_kind: ChecksumType) -> Result<()> {
    let new_crc = dfs_codec::rechecksum(
        op.payload.as_slice(),
        op.version,
        &op.crc,
        op.crc.offset,
        op.crc.live_size,
        new_kind,
        fs.key(),
    )
    .inspect_err(|_| {
        error!(
            target: "dfs::io::write",
            event = "rechecksum_verify_failed",
            pos = %op.pos,
        );
    })?;
    op.payload.advance(sectors_to_bytes(op.crc.offset));
    op.payload.restrict(sectors_to_bytes(new_crc.live_size));
    op.crc = new_crc;
    Ok(())
}

/// Verify then decrypt the payload in place. After this the data carries no
/// checksum; the encode loop computes a fresh one.
fn write_decrypt(fs: &Fs, op: &mut WriteOp) -> Result<()> {
    if !op.crc.csum_type.is_encryption() {
        return Ok(());
    }
    let nonce = ExtentNonce::from_crc(op.version, &op.crc);
    dfs_codec::verify_checksum(
        op.crc.csum_type,
        fs.key(),
        nonce,
        op.payload.as_slice(),
        op.crc.csum,
        dfs_types::DeviceIdx(u32::MAX),
    )
    .inspect_err(|_| {
        error!(
            target: "dfs::io::write",
            event = "decrypt_verify_failed",
            pos = %op.pos,
        );
    })?;
    dfs_codec::encrypt(op.crc.csum_type, fs.key(), nonce, op.payload.as_mut_slice())?;
    op.crc.csum_type = ChecksumType::None;
    op.crc.csum = Default::default();
    Ok(())
}

// ── Encode loop ─────────────────────────────────────────────────────────────

fn init_append_extent(fs: &Fs, op: &mut WriteOp, wp: &mut WritePoint, crc: CrcDescriptor) {
    let mut key = ExtentKey::new(
        op.pos.inode,
        op.pos.offset,
        crc.uncompressed_size,
        op.version,
    );
    key.cached = op.flags.cached;
    let crc_idx = key.append_crc(crc);
    for mut ptr in fs.alloc.append_ptrs(wp, crc.compressed_size) {
        ptr.cached = op.flags.cached;
        key.append_ptr(crc_idx, ptr);
    }
    op.pos.offset += u64::from(crc.uncompressed_size);
    op.insert_keys.push(key);
}

/// Encode one write-point round: consume payload into chunks, append keys,
/// submit the round's bytes to every replica. Returns whether payload
/// remains for another round.
fn write_extent(cx: &Cx, fs: &Fs, op: &mut WriteOp, wp: &mut WritePoint) -> Result<bool> {
    debug_assert!(op.payload.remaining() > 0);

    match prep_encoded_data(fs, op, wp)? {
        PrepEncoded::DoWrite => {
            let crc = op.crc;
            let first_key = op.insert_keys.len();
            init_append_extent(fs, op, wp, crc);
            let data = op.payload.as_slice().to_vec();
            op.payload.advance(data.len());
            submit_round(cx, fs, op, &data, first_key)?;
            return Ok(false);
        }
        PrepEncoded::Ok => {}
    }

    let bounce = !op.compression_type.is_none()
        || (!op.csum_type.is_none() && !op.flags.pages_stable)
        || (op.csum_type.is_encryption() && !op.flags.pages_owned);

    let extent_max_bytes = sectors_to_bytes(fs.opts().encoded_extent_max);
    let round_cap = op
        .payload
        .remaining()
        .min(sectors_to_bytes(wp.sectors_free()));
    let mut round_buf = if bounce {
        Some(fs.bounce.acquire(cx, round_cap)?)
    } else {
        None
    };

    let first_key = op.insert_keys.len();
    let round_src_start = op.payload.pos;
    let mut total_out = 0usize;

    let encode_result: Result<()> = (|| {
        loop {
            let src_remaining = op.payload.remaining();
            let wp_free = sectors_to_bytes(wp.sectors_free());
            if src_remaining == 0 || wp_free == 0 {
                break;
            }
            let out_room = match &round_buf {
                Some(buf) => wp_free.min(buf.len() - total_out),
                None => wp_free,
            };
            if out_room == 0 {
                break;
            }

            let mut chunk_max = src_remaining.min(out_room);
            if !op.compression_type.is_none() || !op.csum_type.is_none() {
                chunk_max = chunk_max.min(extent_max_bytes);
            }

            let mut crc = CrcDescriptor::default();
            if op.csum_type.is_encryption() {
                crc.nonce = op.nonce;
            }

            // Try compression first; fall back to a plain copy (or alias)
            // when the chunk is incompressible.
            let src = &op.payload.as_slice()[..chunk_max];
            let compressed = if op.compression_type.is_none() {
                None
            } else {
                debug_assert!(round_buf.is_some());
                dfs_codec::compress(op.compression_type, src, out_room.min(extent_max_bytes))
            };

            let (src_len, mut chunk): (usize, Vec<u8>) = match compressed {
                Some(out) => {
                    crc.compression_type = op.compression_type;
                    (chunk_max, out)
                }
                None => (chunk_max, src.to_vec()),
            };
            let src_sectors = bytes_to_sectors(src_len);
            let dst_sectors = bytes_to_sectors(chunk.len());

            if op.csum_type.is_encryption() {
                op.nonce += src_sectors;
            }

            if op.flags.data_encoded
                && crc.compression_type.is_none()
                && op.crc.csum_type.is_encryption() == op.csum_type.is_encryption()
            {
                // Pre-encoded with a compatible checksum discipline: split
                // the existing checksum instead of re-encoding. The source
                // holds everything the old checksum covers, so checksum it
                // rather than the chunk copy.
                let (front, rest) = dfs_codec::crc_split(
                    op.payload.as_slice(),
                    op.version,
                    &op.crc,
                    src_sectors,
                    op.csum_type,
                    fs.key(),
                )
                .inspect_err(|_| {
                    error!(
                        target: "dfs::io::write",
                        event = "rechecksum_verify_failed",
                        pos = %op.pos,
                    );
                })?;
                crc = front;
                op.crc = rest;
            } else {
                if op.flags.data_encoded {
                    // Different discipline: verify and split the old
                    // checksum before re-encoding the chunk.
                    let (_, rest) = dfs_codec::crc_split(
                        op.payload.as_slice(),
                        op.version,
                        &op.crc,
                        src_sectors,
                        op.crc.csum_type,
                        fs.key(),
                    )
                    .inspect_err(|_| {
                        error!(
                            target: "dfs::io::write",
                            event = "rechecksum_verify_failed",
                            pos = %op.pos,
                        );
                    })?;
                    op.crc = rest;
                }
                crc.compressed_size = dst_sectors;
                crc.uncompressed_size = src_sectors;
                crc.live_size = src_sectors;
                crc.offset = 0;

                let nonce = ExtentNonce {
                    version: op.version,
                    bytes: u64::from(crc.nonce) * SECTOR_SIZE as u64,
                };
                dfs_codec::encrypt(op.csum_type, fs.key(), nonce, &mut chunk)?;
                crc.csum = dfs_codec::checksum(op.csum_type, fs.key(), nonce, &chunk)?;
                crc.csum_type = op.csum_type;
            }

            if let Some(buf) = &mut round_buf {
                buf.as_mut_slice()[total_out..total_out + chunk.len()].copy_from_slice(&chunk);
            }
            total_out += chunk.len();

            init_append_extent(fs, op, wp, crc);
            op.payload.advance(src_len);
        }
        Ok(())
    })();

    if let Err(err) = encode_result {
        if let Some(buf) = round_buf.take() {
            fs.bounce.release(buf);
        }
        return Err(err);
    }

    let more = op.payload.remaining() > 0;

    let submit_result = if total_out > 0 {
        match &round_buf {
            Some(buf) => submit_round(cx, fs, op, &buf.as_slice()[..total_out], first_key),
            None => {
                let data =
                    op.payload.data[round_src_start..round_src_start + total_out].to_vec();
                submit_round(cx, fs, op, &data, first_key)
            }
        }
    } else {
        Ok(())
    };

    if let Some(buf) = round_buf.take() {
        fs.bounce.release(buf);
    }
    submit_result?;
    Ok(more)
}

/// Write one round's encoded bytes to every replica of its first key.
/// Chunks within a round land contiguously in each open bucket, so the
/// first key's pointers anchor the whole round on each device.
fn submit_round(cx: &Cx, fs: &Fs, op: &mut WriteOp, data: &[u8], first_key: usize) -> Result<()> {
    let Some(key) = op.insert_keys.get(first_key) else {
        return Ok(());
    };
    let ty = if op.flags.cached {
        DataType::Cached
    } else {
        DataType::User
    };
    for entry in key.ptrs.clone() {
        let Some(dev) = fs.devs.get(entry.ptr.dev) else {
            op.failed.insert(entry.ptr.dev);
            continue;
        };
        let fua = !dev.journal_flushes;
        match dev.submit_write(cx, entry.ptr.offset, data, ty, fua) {
            Ok(()) => {}
            Err(DfsError::Cancelled) => return Err(DfsError::Cancelled),
            Err(_) => {
                op.failed.insert(entry.ptr.dev);
            }
        }
    }
    Ok(())
}

// ── Index update ────────────────────────────────────────────────────────────

/// After the data is durable, point the index at it: drop pointers on
/// failed devices, record replica sets, journal the keys, and run the op's
/// index updater.
fn write_index(cx: &Cx, fs: &Fs, op: &mut WriteOp) -> Result<()> {
    let mut keys = std::mem::take(&mut op.insert_keys);

    for key in &mut keys {
        key.drop_failed(op.failed);
        if key.ptrs.is_empty() {
            // No surviving replica anywhere in this write: nothing we could
            // insert would be readable.
            error!(
                target: "dfs::io::write",
                event = "no_surviving_replica",
                pos = %key.pos,
            );
            return Err(DfsError::IoDevice {
                dev: op.failed.iter().next().unwrap_or(dfs_types::DeviceIdx(0)),
            });
        }
        if !key.cached && (key.nr_dirty_ptrs() as u32) < op.nr_replicas {
            key.degraded = true;
        }
        if !op.flags.nomark_replicas {
            fs.replicas.check_mark(key.devices())?;
        }
    }

    let journal_res = match fs.journal.res_get(cx) {
        Ok(res) => res,
        Err(DfsError::JournalFull) => {
            debug!(target: "dfs::io::write", event = "journal_full_retry");
            fs.journal.flush_device(cx, None)?;
            fs.journal.res_get(cx)?
        }
        Err(err) => return Err(err),
    };
    for key in &keys {
        fs.journal.add_keys(&journal_res, key);
    }
    op.journal_seq = Some(journal_res.seq);

    let sectors_start: u64 = keys.iter().map(|k| u64::from(k.size)).sum();
    let mut commit = KeyCommit {
        keys: &mut keys,
        journal_res: &journal_res,
    };
    let mut updater = std::mem::replace(&mut op.updater, Box::new(DefaultIndexUpdate));
    let result = updater.update(cx, fs, &mut commit);
    op.updater = updater;

    let sectors_left: u64 = keys.iter().map(|k| u64::from(k.size)).sum();
    op.written += sectors_start - sectors_left;
    fs.journal.res_put(journal_res);

    if let Err(err) = result {
        error!(target: "dfs::io::write", event = "index_update_failed", error = %err);
        op.insert_keys = keys;
        return Err(err);
    }
    Ok(())
}
