#![forbid(unsafe_code)]
//! Sector allocation for the write pipeline.
//!
//! The data path consumes the allocator through a narrow
//! `reserve -> write point -> commit/release` interface: a disk
//! `Reservation` charges space up front, `sectors_start` hands back a
//! `WritePoint` holding one open bucket per replica, `append_ptrs` stamps
//! replica pointers for each encoded chunk, and `sectors_done` returns
//! leftover bucket space to the write point for the next write.
//!
//! The free-bucket policy is deliberately simple (sequential allocation
//! plus a freelist and a small moving-GC reserve); the open-bucket
//! interface is the contract.

use asupersync::Cx;
use dfs_device::DeviceSet;
use dfs_error::{DfsError, Result};
use dfs_types::{DeviceIdx, DeviceMask, Pointer};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

#[inline]
fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| DfsError::Cancelled)
}

// ── Disk reservations ───────────────────────────────────────────────────────

/// Filesystem-wide space accounting, in sectors.
#[derive(Debug)]
pub struct FsUsage {
    capacity: u64,
    used: AtomicU64,
}

impl FsUsage {
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            used: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    #[must_use]
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.used())
    }
}

/// A charged space reservation. Releases whatever remains on drop.
#[derive(Debug)]
pub struct Reservation {
    usage: Arc<FsUsage>,
    remaining: u64,
}

impl Reservation {
    /// Charge `sectors * replicas` against the filesystem, failing with
    /// `NoSpace` when the capacity cannot cover it.
    pub fn get(usage: &Arc<FsUsage>, sectors: u64, replicas: u32) -> Result<Self> {
        let want = sectors * u64::from(replicas);
        let mut used = usage.used.load(Ordering::Relaxed);
        loop {
            if used + want > usage.capacity {
                return Err(DfsError::NoSpace);
            }
            match usage.used.compare_exchange_weak(
                used,
                used + want,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Ok(Self {
                        usage: Arc::clone(usage),
                        remaining: want,
                    });
                }
                Err(v) => used = v,
            }
        }
    }

    /// An empty reservation, for paths (cached writes, migrate rewrites)
    /// that charge no new space.
    #[must_use]
    pub fn empty(usage: &Arc<FsUsage>) -> Self {
        Self {
            usage: Arc::clone(usage),
            remaining: 0,
        }
    }

    #[must_use]
    pub fn sectors(&self) -> u64 {
        self.remaining
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.remaining > 0 {
            self.usage.used.fetch_sub(self.remaining, Ordering::AcqRel);
        }
    }
}

/// Which bucket reserve an allocation may dip into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveClass {
    None,
    /// Data movement may use the held-back buckets so evacuation can make
    /// progress on a full filesystem.
    MovingGc,
}

// ── Open buckets and write points ───────────────────────────────────────────

/// Identifies a persistent write point; writes sharing a specifier stream
/// into the same open buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WritePointSpec(pub u64);

/// An open bucket: a device region a write may stream into.
#[derive(Debug, Clone, Copy)]
pub struct OpenBucket {
    pub dev: DeviceIdx,
    pub bucket: u64,
    pub used: u32,
}

impl OpenBucket {
    #[must_use]
    pub fn start_sector(&self, bucket_sectors: u32) -> u64 {
        self.bucket * u64::from(bucket_sectors)
    }

    #[must_use]
    pub fn remaining(&self, bucket_sectors: u32) -> u32 {
        bucket_sectors - self.used
    }
}

/// One open bucket per replica, handed to the write pipeline for the
/// duration of one `write_extent` round.
pub struct WritePoint {
    pub spec: WritePointSpec,
    pub buckets: Vec<OpenBucket>,
    bucket_sectors: u32,
}

impl WritePoint {
    /// Sectors each replica can still accept in this round.
    #[must_use]
    pub fn sectors_free(&self) -> u32 {
        self.buckets
            .iter()
            .map(|b| b.remaining(self.bucket_sectors))
            .min()
            .unwrap_or(0)
    }
}

// ── Allocator ───────────────────────────────────────────────────────────────

struct DevAlloc {
    next_bucket: u64,
    nr_buckets: u64,
    freelist: Vec<u64>,
}

impl DevAlloc {
    fn free_buckets(&self) -> u64 {
        self.nr_buckets - self.next_bucket + self.freelist.len() as u64
    }

    fn take(&mut self) -> Option<u64> {
        if let Some(b) = self.freelist.pop() {
            return Some(b);
        }
        if self.next_bucket < self.nr_buckets {
            let b = self.next_bucket;
            self.next_bucket += 1;
            return Some(b);
        }
        None
    }
}

struct AllocState {
    per_dev: Vec<DevAlloc>,
    write_points: HashMap<WritePointSpec, Vec<OpenBucket>>,
}

pub struct Allocator {
    devs: Arc<DeviceSet>,
    bucket_sectors: u32,
    reserve_buckets: u64,
    state: Mutex<AllocState>,
}

impl Allocator {
    #[must_use]
    pub fn new(devs: Arc<DeviceSet>, bucket_sectors: u32) -> Self {
        let per_dev = devs
            .iter()
            .map(|d| DevAlloc {
                next_bucket: 0,
                nr_buckets: d.size_sectors() / u64::from(bucket_sectors),
                freelist: Vec::new(),
            })
            .collect();
        Self {
            devs,
            bucket_sectors,
            reserve_buckets: 2,
            state: Mutex::new(AllocState {
                per_dev,
                write_points: HashMap::new(),
            }),
        }
    }

    #[must_use]
    pub fn bucket_sectors(&self) -> u32 {
        self.bucket_sectors
    }

    /// Open a write point with one bucket per requested replica.
    ///
    /// Devices in `have` (already holding a copy) and dying devices are
    /// skipped. When fewer than `nr_replicas` buckets can be opened from
    /// `target` and `only_specified` is clear, the remaining devices are
    /// tried as well. Failing to reach `nr_required` yields `WouldBlock`
    /// under `nowait` (the caller declines to wait for space) and `NoSpace`
    /// otherwise.
    #[expect(clippy::too_many_arguments)]
    pub fn sectors_start(
        &self,
        cx: &Cx,
        target: DeviceMask,
        spec: WritePointSpec,
        have: DeviceMask,
        nr_replicas: u32,
        nr_required: u32,
        class: ReserveClass,
        only_specified: bool,
        nowait: bool,
    ) -> Result<WritePoint> {
        cx_checkpoint(cx)?;
        debug_assert!(nr_required <= nr_replicas);
        let mut state = self.state.lock();
        let mut buckets: Vec<OpenBucket> = state
            .write_points
            .remove(&spec)
            .unwrap_or_default()
            .into_iter()
            .filter(|b| {
                target.contains(b.dev)
                    && !have.contains(b.dev)
                    && self.devs.get(b.dev).is_some_and(|d| !d.is_dying())
                    && b.remaining(self.bucket_sectors) > 0
            })
            .collect();
        buckets.truncate(nr_replicas as usize);

        self.fill_buckets(&mut state, &mut buckets, target, have, nr_replicas, class);
        if buckets.len() < nr_replicas as usize && !only_specified {
            self.fill_buckets(
                &mut state,
                &mut buckets,
                DeviceMask::ALL,
                have,
                nr_replicas,
                class,
            );
        }

        if (buckets.len() as u32) < nr_required {
            // Put whatever we opened back for the next caller.
            state
                .write_points
                .entry(spec)
                .or_default()
                .extend(buckets);
            return Err(if nowait {
                DfsError::WouldBlock
            } else {
                DfsError::NoSpace
            });
        }

        trace!(
            target: "dfs::alloc",
            event = "sectors_start",
            wp = spec.0,
            buckets = buckets.len(),
        );
        Ok(WritePoint {
            spec,
            buckets,
            bucket_sectors: self.bucket_sectors,
        })
    }

    fn fill_buckets(
        &self,
        state: &mut AllocState,
        buckets: &mut Vec<OpenBucket>,
        target: DeviceMask,
        have: DeviceMask,
        nr_replicas: u32,
        class: ReserveClass,
    ) {
        while buckets.len() < nr_replicas as usize {
            let candidate = self
                .devs
                .iter()
                .filter(|d| {
                    target.contains(d.idx)
                        && !have.contains(d.idx)
                        && !d.is_dying()
                        && !buckets.iter().any(|b| b.dev == d.idx)
                })
                .filter(|d| {
                    let free = state.per_dev[d.idx.0 as usize].free_buckets();
                    match class {
                        ReserveClass::None => free > self.reserve_buckets,
                        ReserveClass::MovingGc => free > 0,
                    }
                })
                .max_by_key(|d| {
                    (
                        state.per_dev[d.idx.0 as usize].free_buckets(),
                        std::cmp::Reverse(d.idx.0),
                    )
                })
                .map(|d| d.idx);
            let Some(dev) = candidate else { break };
            let Some(bucket) = state.per_dev[dev.0 as usize].take() else {
                break;
            };
            buckets.push(OpenBucket {
                dev,
                bucket,
                used: 0,
            });
        }
    }

    /// Stamp one replica pointer per open bucket for a chunk of
    /// `sectors`, advancing each bucket's fill.
    #[must_use]
    pub fn append_ptrs(&self, wp: &mut WritePoint, sectors: u32) -> Vec<Pointer> {
        debug_assert!(sectors <= wp.sectors_free());
        wp.buckets
            .iter_mut()
            .map(|b| {
                let offset = b.start_sector(self.bucket_sectors) + u64::from(b.used);
                b.used += sectors;
                let generation = self
                    .devs
                    .get(b.dev)
                    .map_or(0, |d| d.bucket_gen(b.bucket));
                Pointer {
                    dev: b.dev,
                    offset,
                    generation,
                    cached: false,
                }
            })
            .collect()
    }

    /// Return a write point's buckets: leftover space goes back to the
    /// write-point cache, exhausted buckets are closed.
    pub fn sectors_done(&self, wp: WritePoint) {
        let mut state = self.state.lock();
        let keep: Vec<OpenBucket> = wp
            .buckets
            .into_iter()
            .filter(|b| b.remaining(self.bucket_sectors) > 0)
            .collect();
        if !keep.is_empty() {
            state.write_points.entry(wp.spec).or_default().extend(keep);
        }
    }

    /// Evict a bucket: advance its generation (staling any cached pointers
    /// into it) and make it allocatable again.
    pub fn invalidate_bucket(&self, dev: DeviceIdx, bucket: u64) {
        if let Some(d) = self.devs.get(dev) {
            d.bump_bucket_gen(bucket);
        }
        let mut state = self.state.lock();
        state.per_dev[dev.0 as usize].freelist.push(bucket);
    }

    /// Free buckets remaining on a device, for observability.
    #[must_use]
    pub fn free_buckets(&self, dev: DeviceIdx) -> u64 {
        self.state.lock().per_dev[dev.0 as usize].free_buckets()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use dfs_device::{Dev, MemBackend};
    use dfs_types::Tier;

    fn test_cx() -> Cx {
        Cx::for_testing()
    }

    fn mk_devs(n: u32, sectors: u64) -> Arc<DeviceSet> {
        let devs = (0..n)
            .map(|i| {
                Arc::new(Dev::new(
                    DeviceIdx(i),
                    Tier(0),
                    64,
                    true,
                    Arc::new(MemBackend::new(sectors)),
                ))
            })
            .collect();
        Arc::new(DeviceSet::new(devs))
    }

    #[test]
    fn reservation_charges_and_releases() {
        let usage = Arc::new(FsUsage::new(1000));
        let res = Reservation::get(&usage, 100, 2).unwrap();
        assert_eq!(usage.used(), 200);
        assert_eq!(res.sectors(), 200);
        drop(res);
        assert_eq!(usage.used(), 0);
    }

    #[test]
    fn reservation_rejects_overcommit() {
        let usage = Arc::new(FsUsage::new(100));
        let _held = Reservation::get(&usage, 80, 1).unwrap();
        assert!(matches!(
            Reservation::get(&usage, 30, 1),
            Err(DfsError::NoSpace)
        ));
    }

    #[test]
    fn write_point_spreads_replicas() {
        let cx = test_cx();
        let devs = mk_devs(3, 64 * 16);
        let alloc = Allocator::new(devs, 64);
        let wp = alloc
            .sectors_start(
                &cx,
                DeviceMask::ALL,
                WritePointSpec(1),
                DeviceMask::EMPTY,
                2,
                2,
                ReserveClass::None,
                false,
                false,
            )
            .unwrap();
        assert_eq!(wp.buckets.len(), 2);
        assert_ne!(wp.buckets[0].dev, wp.buckets[1].dev);
        assert_eq!(wp.sectors_free(), 64);
    }

    #[test]
    fn append_ptrs_advances_fill() {
        let cx = test_cx();
        let devs = mk_devs(2, 64 * 16);
        let alloc = Allocator::new(devs, 64);
        let mut wp = alloc
            .sectors_start(
                &cx,
                DeviceMask::ALL,
                WritePointSpec(1),
                DeviceMask::EMPTY,
                2,
                2,
                ReserveClass::None,
                false,
                false,
            )
            .unwrap();
        let ptrs = alloc.append_ptrs(&mut wp, 16);
        assert_eq!(ptrs.len(), 2);
        assert_eq!(wp.sectors_free(), 48);
        let more = alloc.append_ptrs(&mut wp, 8);
        // Second chunk lands right after the first in each bucket.
        for (a, b) in ptrs.iter().zip(&more) {
            assert_eq!(a.dev, b.dev);
            assert_eq!(a.offset + 16, b.offset);
        }
    }

    #[test]
    fn write_point_persists_across_writes() {
        let cx = test_cx();
        let devs = mk_devs(2, 64 * 16);
        let alloc = Allocator::new(devs, 64);
        let mut wp = alloc
            .sectors_start(
                &cx,
                DeviceMask::ALL,
                WritePointSpec(7),
                DeviceMask::EMPTY,
                1,
                1,
                ReserveClass::None,
                false,
                false,
            )
            .unwrap();
        let first = alloc.append_ptrs(&mut wp, 16)[0];
        alloc.sectors_done(wp);

        let mut wp = alloc
            .sectors_start(
                &cx,
                DeviceMask::ALL,
                WritePointSpec(7),
                DeviceMask::EMPTY,
                1,
                1,
                ReserveClass::None,
                false,
                false,
            )
            .unwrap();
        let second = alloc.append_ptrs(&mut wp, 16)[0];
        assert_eq!(first.dev, second.dev);
        assert_eq!(first.offset + 16, second.offset);
    }

    #[test]
    fn have_devs_are_skipped() {
        let cx = test_cx();
        let devs = mk_devs(2, 64 * 16);
        let alloc = Allocator::new(devs, 64);
        let wp = alloc
            .sectors_start(
                &cx,
                DeviceMask::ALL,
                WritePointSpec(1),
                DeviceMask::single(DeviceIdx(0)),
                1,
                1,
                ReserveClass::None,
                false,
                false,
            )
            .unwrap();
        assert_eq!(wp.buckets[0].dev, DeviceIdx(1));
    }

    #[test]
    fn only_specified_devs_blocks_fallback() {
        let cx = test_cx();
        let devs = mk_devs(2, 64 * 16);
        let alloc = Allocator::new(devs, 64);
        // Target a single device but claim it as already-have: nothing can
        // be opened without fallback.
        let err = alloc
            .sectors_start(
                &cx,
                DeviceMask::single(DeviceIdx(0)),
                WritePointSpec(1),
                DeviceMask::single(DeviceIdx(0)),
                1,
                1,
                ReserveClass::None,
                true,
                false,
            )
            .unwrap_err();
        assert!(matches!(err, DfsError::NoSpace));

        // With fallback allowed, device 1 serves the write.
        let wp = alloc
            .sectors_start(
                &cx,
                DeviceMask::single(DeviceIdx(0)),
                WritePointSpec(1),
                DeviceMask::single(DeviceIdx(0)),
                1,
                1,
                ReserveClass::None,
                false,
                false,
            )
            .unwrap();
        assert_eq!(wp.buckets[0].dev, DeviceIdx(1));
    }

    #[test]
    fn nowait_reports_would_block() {
        let cx = test_cx();
        let devs = mk_devs(1, 64 * 16);
        let alloc = Allocator::new(Arc::clone(&devs), 64);
        devs.get(DeviceIdx(0)).unwrap().set_dying(true);
        let err = alloc
            .sectors_start(
                &cx,
                DeviceMask::ALL,
                WritePointSpec(1),
                DeviceMask::EMPTY,
                1,
                1,
                ReserveClass::None,
                false,
                true,
            )
            .unwrap_err();
        assert!(matches!(err, DfsError::WouldBlock));
    }

    #[test]
    fn moving_gc_reaches_reserve() {
        let cx = test_cx();
        // 4 buckets per device; 2 are held in reserve.
        let devs = mk_devs(1, 64 * 4);
        let alloc = Allocator::new(devs, 64);
        for _ in 0..2 {
            let mut wp = alloc
                .sectors_start(
                    &cx,
                    DeviceMask::ALL,
                    WritePointSpec(1),
                    DeviceMask::EMPTY,
                    1,
                    1,
                    ReserveClass::None,
                    false,
                    false,
                )
                .unwrap();
            let _ = alloc.append_ptrs(&mut wp, 64);
            alloc.sectors_done(wp);
        }
        // Normal allocation is out of buckets.
        assert!(matches!(
            alloc.sectors_start(
                &cx,
                DeviceMask::ALL,
                WritePointSpec(2),
                DeviceMask::EMPTY,
                1,
                1,
                ReserveClass::None,
                false,
                false,
            ),
            Err(DfsError::NoSpace)
        ));
        // Moving GC may dip into the reserve.
        let wp = alloc
            .sectors_start(
                &cx,
                DeviceMask::ALL,
                WritePointSpec(2),
                DeviceMask::EMPTY,
                1,
                1,
                ReserveClass::MovingGc,
                false,
                false,
            )
            .unwrap();
        assert_eq!(wp.buckets.len(), 1);
    }

    #[test]
    fn invalidate_bucket_bumps_gen_and_frees() {
        let cx = test_cx();
        let devs = mk_devs(1, 64 * 16);
        let alloc = Allocator::new(Arc::clone(&devs), 64);
        let mut wp = alloc
            .sectors_start(
                &cx,
                DeviceMask::ALL,
                WritePointSpec(1),
                DeviceMask::EMPTY,
                1,
                1,
                ReserveClass::None,
                false,
                false,
            )
            .unwrap();
        let ptr = alloc.append_ptrs(&mut wp, 8)[0];
        let bucket = wp.buckets[0].bucket;
        alloc.sectors_done(wp);

        let dev = devs.get(DeviceIdx(0)).unwrap();
        assert!(!dev.ptr_stale(&ptr));
        let free_before = alloc.free_buckets(DeviceIdx(0));
        alloc.invalidate_bucket(DeviceIdx(0), bucket);
        assert!(dev.ptr_stale(&ptr));
        assert_eq!(alloc.free_buckets(DeviceIdx(0)), free_before + 1);
    }
}
