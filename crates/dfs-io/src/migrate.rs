//! The move engine: rewrite selected extents without losing concurrent
//! foreground updates.
//!
//! A pass iterates a key range in order, reads each candidate extent
//! verbatim (checksum verified, no decode), and queues it for rewrite
//! through the write pipeline; writes drain in read-start order, so index
//! updates happen in ascending key order. The rewrite commits through the
//! migrate index-update protocol below, which wins or accounts a race
//! deterministically against foreground writes.

use crate::read::{self, NodecodeRead};
use crate::write::{IndexUpdate, KeyCommit, WriteFlags, WriteOp, write};
use crate::cx_checkpoint;
use asupersync::Cx;
use dfs_alloc::{Reservation, ReserveClass, WritePointSpec};
use dfs_core::{Fs, IoOpts};
use dfs_error::{DfsError, Result};
use dfs_extent::ExtentKey;
use dfs_types::{DeviceIdx, DeviceMask, ExtentPos, Pointer};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

// ── Stats ───────────────────────────────────────────────────────────────────

/// Per-pass statistics.
#[derive(Default)]
pub struct MoveStats {
    pub keys_moved: AtomicU64,
    pub sectors_moved: AtomicU64,
    pub sectors_seen: AtomicU64,
    pub sectors_raced: AtomicU64,
}

impl MoveStats {
    #[must_use]
    pub fn keys_moved(&self) -> u64 {
        self.keys_moved.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn sectors_moved(&self) -> u64 {
        self.sectors_moved.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn sectors_seen(&self) -> u64 {
        self.sectors_seen.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn sectors_raced(&self) -> u64 {
        self.sectors_raced.load(Ordering::Relaxed)
    }
}

// ── Rate limiting ───────────────────────────────────────────────────────────

/// Admission control for background passes.
pub trait RateLimit: Send + Sync {
    /// Time until the next unit of work is admissible, if any.
    fn delay(&self) -> Option<Duration>;
    /// Block until admissible, observing cancellation.
    fn wait(&self, cx: &Cx) -> Result<()>;
    fn increment(&self, sectors: u64);
    fn reset(&self);
}

/// Token-bucket limiter in sectors per second.
pub struct SectorThrottle {
    sectors_per_sec: u64,
    next_allowed: Mutex<Instant>,
}

impl SectorThrottle {
    #[must_use]
    pub fn new(sectors_per_sec: u64) -> Self {
        Self {
            sectors_per_sec: sectors_per_sec.max(1),
            next_allowed: Mutex::new(Instant::now()),
        }
    }
}

impl RateLimit for SectorThrottle {
    fn delay(&self) -> Option<Duration> {
        let next = *self.next_allowed.lock();
        let now = Instant::now();
        (next > now).then(|| next - now)
    }

    fn wait(&self, cx: &Cx) -> Result<()> {
        while let Some(d) = self.delay() {
            cx_checkpoint(cx)?;
            std::thread::sleep(d.min(Duration::from_millis(10)));
        }
        Ok(())
    }

    fn increment(&self, sectors: u64) {
        let mut next = self.next_allowed.lock();
        let credit = Duration::from_secs_f64(sectors as f64 / self.sectors_per_sec as f64);
        let now = Instant::now();
        *next = next.max(now) + credit;
    }

    fn reset(&self) {
        *self.next_allowed.lock() = Instant::now();
    }
}

// ── Migrate index update ────────────────────────────────────────────────────

/// Index updater that re-points existing extents at freshly written
/// replicas instead of inserting over them.
///
/// For each region of each new key, the stored extent is re-read and the
/// rewrite applies only if the stored extent is still the one the data was
/// read from (same version, still carrying the source pointer at the same
/// coverage anchor). Anything else is a foreground write that beat us: the
/// region is accounted as raced and skipped, never failed. A foreground
/// write that loses instead finds the stored extent carrying both its own
/// pointers and ours.
pub struct MigrateUpdate {
    /// The pointer the data was read from.
    pub ptr: Pointer,
    /// Logical sector the source pointer's coverage is anchored at.
    pub coverage_start: u64,
    /// Drop this device from every rewritten extent.
    pub move_dev: Option<DeviceIdx>,
    pub stats: Option<Arc<MoveStats>>,
}

impl MigrateUpdate {
    fn raced(&self, fs: &Fs, sectors: u64) {
        fs.counters
            .extent_migrate_raced
            .fetch_add(1, Ordering::Relaxed);
        if let Some(stats) = &self.stats {
            stats.sectors_raced.fetch_add(sectors, Ordering::Relaxed);
        }
        trace!(target: "dfs::io::migrate", event = "raced", sectors = sectors);
    }
}

impl IndexUpdate for MigrateUpdate {
    fn update(&mut self, cx: &Cx, fs: &Fs, commit: &mut KeyCommit<'_>) -> Result<()> {
        while let Some(front) = commit.keys.first().cloned() {
            let inode = front.inode();
            let mut cur = front.start_offset();

            while cur < front.end_offset() {
                cx_checkpoint(cx)?;

                let peeked = fs.index.peek(ExtentPos::new(inode, cur));
                let (stored, seq) = match peeked {
                    Some((k, seq))
                        if k.inode() == inode && k.start_offset() < front.end_offset() =>
                    {
                        (k, seq)
                    }
                    _ => {
                        // Nothing stored here any more: the whole remainder
                        // raced with a delete or truncate.
                        self.raced(fs, front.end_offset() - cur);
                        cur = front.end_offset();
                        continue;
                    }
                };

                if stored.start_offset() > cur {
                    // A hole where our data used to be.
                    self.raced(fs, stored.start_offset() - cur);
                    cur = stored.start_offset();
                    continue;
                }

                let region_end = stored.end_offset().min(front.end_offset());
                if stored.version != front.version
                    || !stored.matches_ptr(self.ptr, self.coverage_start)
                {
                    self.raced(fs, region_end - cur);
                    cur = region_end;
                    continue;
                }

                // Splice: cut the stored extent to this region, cut our new
                // key to the stored extent's bounds, drop the evacuating
                // device, and append the fresh pointers the stored copy
                // does not already have.
                let mut insert = stored.clone();
                insert.cut_front_to(cur);
                insert.cut_back_to(front.end_offset());

                let mut new = front.clone();
                new.cut_front_to(cur);
                new.cut_back_to(insert.end_offset());

                if let Some(dev) = self.move_dev {
                    insert.drop_device(dev);
                }

                let mut did_work = false;
                for entry in new.ptrs.clone() {
                    if insert.has_device(entry.ptr.dev).is_none() {
                        let crc_idx = insert.append_crc(*new.crc_for(&entry));
                        insert.append_ptr(crc_idx, entry.ptr);
                        did_work = true;
                    }
                }

                if !did_work {
                    // A concurrent move produced our replica first.
                    self.raced(fs, insert.end_offset() - cur);
                    cur = insert.end_offset();
                    continue;
                }

                insert.normalize();
                fs.replicas.check_mark(insert.devices())?;
                fs.journal.add_keys(commit.journal_res, &insert);

                let insert_end = insert.end_offset();
                match fs.index.insert_atomic(cx, insert, seq) {
                    Ok(()) => {
                        fs.counters
                            .extent_migrate_done
                            .fetch_add(1, Ordering::Relaxed);
                        cur = insert_end;
                    }
                    Err(DfsError::Raced) => {
                        // The index moved underneath the snapshot; redo
                        // this region against the fresh state.
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            }

            commit.keys.remove(0);
        }
        Ok(())
    }
}

// ── Move pass ───────────────────────────────────────────────────────────────

struct MovingIo {
    key: ExtentKey,
    read: NodecodeRead,
    io_opts: IoOpts,
    sectors: u64,
}

/// Parameters of one pass over a key range.
pub struct MoveArgs<'a> {
    pub rate: Option<&'a dyn RateLimit>,
    /// Admission budget: suspend issuing reads past this many sectors in
    /// flight.
    pub sectors_in_flight: u64,
    pub devs: DeviceMask,
    pub write_point: WritePointSpec,
    pub use_reserve: bool,
    /// Evacuate this device: exclude it from destinations and drop it from
    /// every rewritten extent.
    pub move_device: Option<DeviceIdx>,
    pub start: ExtentPos,
    pub end: ExtentPos,
}

fn nr_good_ptrs(fs: &Fs, key: &ExtentKey) -> u32 {
    key.ptrs
        .iter()
        .filter(|e| !e.ptr.cached)
        .filter(|e| fs.devs.get(e.ptr.dev).is_some_and(|d| !d.is_dying()))
        .count() as u32
}

/// Iterate `[start, end)`, rewriting every extent `pred` selects.
///
/// Reads are issued ahead subject to the in-flight budget; writes drain in
/// read order. Cancellation is observed between extents and unwinds by
/// draining the queued work.
pub fn move_data(
    cx: &Cx,
    fs: &Fs,
    args: &MoveArgs<'_>,
    pred: &dyn Fn(&Fs, &ExtentKey, &IoOpts) -> bool,
    stats: &Arc<MoveStats>,
) -> Result<()> {
    if let Some(rate) = args.rate {
        rate.reset();
    }

    let mut pending: VecDeque<MovingIo> = VecDeque::new();
    let mut in_flight: u64 = 0;
    let mut pos = args.start;
    let mut result = Ok(());

    loop {
        if let Err(err) = cx_checkpoint(cx) {
            result = Err(err);
            break;
        }

        // Admission: drain queued writes (in read order) until below
        // budget.
        while in_flight >= args.sectors_in_flight {
            let Some(io) = pending.pop_front() else { break };
            in_flight -= io.sectors;
            if let Err(err) = write_pending(cx, fs, args, io, stats) {
                result = Err(err);
                break;
            }
        }
        if result.is_err() {
            break;
        }

        if let Some(rate) = args.rate {
            if rate.delay().is_some() {
                if let Err(err) = rate.wait(cx) {
                    result = Err(err);
                    break;
                }
            }
        }

        let Some((key, _)) = fs.index.peek(pos) else {
            break;
        };
        if key.start() >= args.end {
            break;
        }
        pos = key.pos;

        stats
            .sectors_seen
            .fetch_add(u64::from(key.size) * key.nr_dirty_ptrs() as u64, Ordering::Relaxed);

        // Inode options are looked up with no index locks held.
        let io_opts = fs.io_opts(key.inode());
        if !pred(fs, &key, &io_opts) {
            continue;
        }

        match read::read_extent_nodecode(cx, fs, &key) {
            Ok(read) => {
                let sectors = u64::from(key.size);
                stats.keys_moved.fetch_add(1, Ordering::Relaxed);
                stats.sectors_moved.fetch_add(sectors, Ordering::Relaxed);
                if let Some(rate) = args.rate {
                    rate.increment(sectors);
                }
                in_flight += sectors;
                pending.push_back(MovingIo {
                    key,
                    read,
                    io_opts,
                    sectors,
                });
            }
            Err(DfsError::Cancelled) => {
                result = Err(DfsError::Cancelled);
                break;
            }
            Err(err) => {
                warn!(
                    target: "dfs::io::migrate",
                    event = "move_read_failed",
                    inode = %key.inode(),
                    error = %err,
                );
            }
        }
    }

    // Unwind: complete queued writes in order rather than abandoning them.
    while let Some(io) = pending.pop_front() {
        in_flight -= io.sectors;
        if let Err(err) = write_pending(cx, fs, args, io, stats) {
            if result.is_ok() {
                result = Err(err);
            }
        }
    }
    debug_assert_eq!(in_flight, 0);
    result
}

/// Rewrite one queued extent through the write pipeline with the migrate
/// index update.
fn write_pending(
    cx: &Cx,
    fs: &Fs,
    args: &MoveArgs<'_>,
    io: MovingIo,
    stats: &Arc<MoveStats>,
) -> Result<()> {
    let MovingIo {
        key,
        read,
        io_opts,
        ..
    } = io;
    let nr_good = nr_good_ptrs(fs, &key);
    let (nr_replicas, res) = if args.move_device.is_none() && nr_good < fs.opts().data_replicas
    {
        let missing = fs.opts().data_replicas - nr_good;
        (
            missing,
            Reservation::get(&fs.usage, u64::from(key.size), missing)?,
        )
    } else {
        (1, Reservation::empty(&fs.usage))
    };
    let mut op = WriteOp::new(
        fs,
        ExtentPos::new(key.inode(), key.start_offset()),
        read.data,
        res,
    );
    op.version = key.version;
    op.crc = read.pick.crc;
    op.nr_replicas = nr_replicas;
    op.nr_replicas_required = 1;
    op.flags = WriteFlags {
        data_encoded: true,
        pages_stable: true,
        pages_owned: true,
        nomark_replicas: true,
        only_specified_devs: true,
        ..WriteFlags::default()
    };
    op.write_point = args.write_point;
    op.alloc_reserve = if args.use_reserve {
        ReserveClass::MovingGc
    } else {
        ReserveClass::None
    };
    op.devs = args.devs;
    op.devs_have = key.devices();
    if let Some(dev) = args.move_device {
        op.devs.remove(dev);
        op.devs_have.remove(dev);
    }
    op.csum_type = io_opts.csum;
    op.compression_type = io_opts.compression;
    if read.pick.crc.csum_type.is_encryption() {
        op.nonce = read.pick.crc.nonce + read.pick.crc.offset;
        op.csum_type = read.pick.crc.csum_type;
    }
    op.set_updater(Box::new(MigrateUpdate {
        ptr: read.pick.ptr,
        coverage_start: read.pick.coverage_start,
        move_dev: args.move_device,
        stats: Some(Arc::clone(stats)),
    }));

    match write(cx, fs, &mut op) {
        Ok(()) => Ok(()),
        Err(DfsError::Cancelled) => Err(DfsError::Cancelled),
        Err(err) => {
            // The extent keeps its old replicas; losing one rewrite does
            // not poison the pass.
            warn!(
                target: "dfs::io::migrate",
                event = "move_write_failed",
                inode = %key.inode(),
                error = %err,
            );
            Ok(())
        }
    }
}

// ── Data jobs ───────────────────────────────────────────────────────────────

/// Background work driven through the move engine.
#[derive(Debug, Clone, Copy)]
pub enum DataJob {
    /// Restore missing dirty replicas in `[start, end)`.
    Rereplicate { start: ExtentPos, end: ExtentPos },
    /// Evacuate every extent pointing at `dev` in `[start, end)`.
    Migrate {
        dev: DeviceIdx,
        start: ExtentPos,
        end: ExtentPos,
    },
}

/// Default in-flight budget for data jobs, in sectors.
const JOB_SECTORS_IN_FLIGHT: u64 = 2048;

/// Run a data job to completion and return its stats.
pub fn data_job(cx: &Cx, fs: &Fs, job: DataJob) -> Result<Arc<MoveStats>> {
    let stats = Arc::new(MoveStats::default());
    match job {
        DataJob::Rereplicate { start, end } => {
            debug!(target: "dfs::io::migrate", event = "rereplicate_start");
            fs.journal.flush_device(cx, None)?;
            let args = MoveArgs {
                rate: None,
                sectors_in_flight: JOB_SECTORS_IN_FLIGHT,
                devs: DeviceMask::ALL,
                write_point: WritePointSpec(0x6a6f62),
                use_reserve: false,
                move_device: None,
                start,
                end,
            };
            move_data(cx, fs, &args, &rereplicate_pred, &stats)?;
        }
        DataJob::Migrate { dev, start, end } => {
            if fs.devs.get(dev).is_none() {
                return Err(DfsError::InvalidTarget(format!("no such device {dev}")));
            }
            debug!(target: "dfs::io::migrate", event = "migrate_start", dev = %dev);
            fs.journal.flush_device(cx, Some(dev))?;
            let args = MoveArgs {
                rate: None,
                sectors_in_flight: JOB_SECTORS_IN_FLIGHT,
                devs: DeviceMask::ALL,
                write_point: WritePointSpec(0x6a6f62),
                use_reserve: false,
                move_device: Some(dev),
                start,
                end,
            };
            let pred =
                move |_: &Fs, key: &ExtentKey, _: &IoOpts| key.has_device(dev).is_some();
            move_data(cx, fs, &args, &pred, &stats)?;
        }
    }
    Ok(stats)
}

fn rereplicate_pred(fs: &Fs, key: &ExtentKey, _opts: &IoOpts) -> bool {
    let nr_good = nr_good_ptrs(fs, key);
    nr_good > 0 && nr_good < fs.opts().data_replicas
}
