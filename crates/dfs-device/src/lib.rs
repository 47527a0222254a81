#![forbid(unsafe_code)]
//! Member devices: sector-addressed backends plus the per-device state the
//! data path accounts against.
//!
//! A `Dev` wraps a `SectorBackend` with I/O error counters, a lock-free
//! latency EWMA per direction, in-flight tracking, a dying flag, per-bucket
//! generations (stale-cached-pointer detection) and per-data-type sector
//! counters. The in-memory backend carries fault and corruption injection
//! for tests; the file backend uses positioned reads/writes.

use asupersync::Cx;
use dfs_error::{DfsError, Result};
use dfs_types::{DataType, DeviceIdx, IoDir, Pointer, SECTOR_SIZE, Tier};
use parking_lot::RwLock;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Instant;
use tracing::{trace, warn};

#[inline]
fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| DfsError::Cancelled)
}

// ── Backends ────────────────────────────────────────────────────────────────

/// Sector-addressed storage backing a member device.
pub trait SectorBackend: Send + Sync {
    fn size_sectors(&self) -> u64;
    fn read_at(&self, cx: &Cx, sector: u64, buf: &mut [u8]) -> Result<()>;
    fn write_at(&self, cx: &Cx, sector: u64, data: &[u8]) -> Result<()>;
    fn flush(&self, cx: &Cx) -> Result<()>;
}

/// In-memory backend with fault injection, for tests and tooling.
pub struct MemBackend {
    sectors: u64,
    data: RwLock<Vec<u8>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemBackend {
    #[must_use]
    pub fn new(sectors: u64) -> Self {
        Self {
            sectors,
            data: RwLock::new(vec![0u8; sectors as usize * SECTOR_SIZE]),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Flip every byte in `[sector, sector + count)`, simulating media
    /// corruption underneath a stored checksum.
    pub fn corrupt(&self, sector: u64, count: u64) {
        let mut data = self.data.write();
        let start = sector as usize * SECTOR_SIZE;
        let end = (sector + count) as usize * SECTOR_SIZE;
        for b in &mut data[start..end] {
            *b ^= 0xff;
        }
    }

    fn check_range(&self, sector: u64, len: usize) -> Result<()> {
        if len % SECTOR_SIZE != 0 {
            return Err(DfsError::Io(std::io::Error::other("unaligned I/O length")));
        }
        let end = sector
            .checked_add((len / SECTOR_SIZE) as u64)
            .ok_or(DfsError::NoSpace)?;
        if end > self.sectors {
            return Err(DfsError::Io(std::io::Error::other("I/O past end of device")));
        }
        Ok(())
    }
}

impl SectorBackend for MemBackend {
    fn size_sectors(&self) -> u64 {
        self.sectors
    }

    fn read_at(&self, cx: &Cx, sector: u64, buf: &mut [u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(DfsError::Io(std::io::Error::other("injected read failure")));
        }
        self.check_range(sector, buf.len())?;
        let data = self.data.read();
        let start = sector as usize * SECTOR_SIZE;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&self, cx: &Cx, sector: u64, data: &[u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DfsError::Io(std::io::Error::other("injected write failure")));
        }
        self.check_range(sector, data.len())?;
        let mut stored = self.data.write();
        let start = sector as usize * SECTOR_SIZE;
        stored[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn flush(&self, _cx: &Cx) -> Result<()> {
        Ok(())
    }
}

/// File-backed backend using positioned I/O.
pub struct FileBackend {
    file: File,
    sectors: u64,
}

impl FileBackend {
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?;
        let sectors = file.metadata()?.len() / SECTOR_SIZE as u64;
        Ok(Self { file, sectors })
    }
}

impl SectorBackend for FileBackend {
    fn size_sectors(&self) -> u64 {
        self.sectors
    }

    fn read_at(&self, cx: &Cx, sector: u64, buf: &mut [u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        self.file
            .read_exact_at(buf, sector * SECTOR_SIZE as u64)
            .map_err(DfsError::Io)
    }

    fn write_at(&self, cx: &Cx, sector: u64, data: &[u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        self.file
            .write_all_at(data, sector * SECTOR_SIZE as u64)
            .map_err(DfsError::Io)
    }

    fn flush(&self, cx: &Cx) -> Result<()> {
        cx_checkpoint(cx)?;
        self.file.sync_data().map_err(DfsError::Io)
    }
}

// ── Latency EWMA ────────────────────────────────────────────────────────────

const EWMA_WEIGHT_SHIFT: u32 = 6;

#[inline]
fn ewma_add(old: u64, sample: u64) -> u64 {
    if old == 0 {
        sample
    } else {
        ((old << EWMA_WEIGHT_SHIFT) - old + sample) >> EWMA_WEIGHT_SHIFT
    }
}

// ── Member device ───────────────────────────────────────────────────────────

pub struct Dev {
    pub idx: DeviceIdx,
    pub tier: Tier,
    /// Whether the journal's commit protocol flushes this device; when it
    /// does not, data writes are tagged FUA.
    pub journal_flushes: bool,
    backend: Arc<dyn SectorBackend>,
    bucket_sectors: u32,
    bucket_gens: Vec<AtomicU8>,
    dying: AtomicBool,
    io_errors: [AtomicU64; 2],
    latency_us: [AtomicU64; 2],
    in_flight: AtomicU64,
    fua_writes: AtomicU64,
    /// Sectors moved, indexed `[dir][data type]`.
    sectors_done: [[AtomicU64; 2]; 2],
}

impl Dev {
    #[must_use]
    pub fn new(
        idx: DeviceIdx,
        tier: Tier,
        bucket_sectors: u32,
        journal_flushes: bool,
        backend: Arc<dyn SectorBackend>,
    ) -> Self {
        let nbuckets = backend.size_sectors() / u64::from(bucket_sectors);
        Self {
            idx,
            tier,
            journal_flushes,
            backend,
            bucket_sectors,
            bucket_gens: (0..nbuckets).map(|_| AtomicU8::new(0)).collect(),
            dying: AtomicBool::new(false),
            io_errors: [AtomicU64::new(0), AtomicU64::new(0)],
            latency_us: [AtomicU64::new(0), AtomicU64::new(0)],
            in_flight: AtomicU64::new(0),
            fua_writes: AtomicU64::new(0),
            sectors_done: [
                [AtomicU64::new(0), AtomicU64::new(0)],
                [AtomicU64::new(0), AtomicU64::new(0)],
            ],
        }
    }

    #[must_use]
    pub fn size_sectors(&self) -> u64 {
        self.backend.size_sectors()
    }

    #[must_use]
    pub fn bucket_sectors(&self) -> u32 {
        self.bucket_sectors
    }

    #[must_use]
    pub fn nr_buckets(&self) -> u64 {
        self.bucket_gens.len() as u64
    }

    pub fn set_dying(&self, dying: bool) {
        self.dying.store(dying, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_dying(&self) -> bool {
        self.dying.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn io_errors(&self, dir: IoDir) -> u64 {
        self.io_errors[dir.index()].load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn latency_us(&self, dir: IoDir) -> u64 {
        self.latency_us[dir.index()].load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn fua_writes(&self) -> u64 {
        self.fua_writes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn sectors_done(&self, dir: IoDir, ty: DataType) -> u64 {
        self.sectors_done[dir.index()][ty.index()].load(Ordering::Relaxed)
    }

    // ── Bucket generations ──────────────────────────────────────────────

    #[must_use]
    pub fn bucket_of(&self, sector: u64) -> u64 {
        sector / u64::from(self.bucket_sectors)
    }

    #[must_use]
    pub fn bucket_gen(&self, bucket: u64) -> u8 {
        self.bucket_gens[bucket as usize].load(Ordering::Acquire)
    }

    /// Advance a bucket's generation, invalidating every cached pointer
    /// stamped with the old one.
    pub fn bump_bucket_gen(&self, bucket: u64) {
        self.bucket_gens[bucket as usize].fetch_add(1, Ordering::AcqRel);
    }

    /// Whether a pointer's bucket generation has moved on since it was
    /// written. Only meaningful for cached pointers; dirty data is never
    /// invalidated by bucket reuse.
    #[must_use]
    pub fn ptr_stale(&self, ptr: &Pointer) -> bool {
        self.bucket_gen(self.bucket_of(ptr.offset)) != ptr.generation
    }

    /// Charge an I/O error discovered after completion (e.g. a checksum
    /// mismatch attributed to this device's copy).
    pub fn note_io_error(&self, dir: IoDir) {
        self.io_errors[dir.index()].fetch_add(1, Ordering::Relaxed);
    }

    // ── Latency accounting ──────────────────────────────────────────────

    /// Fold one I/O latency sample into the device EWMA.
    ///
    /// Skips the atomic update when the sample is within half the current
    /// value and the low bits of the clock miss a small sampling window, so
    /// steady-state I/O does not hammer the cache line.
    pub fn latency_acct(&self, submitted: Instant, dir: IoDir) {
        let sample = u64::try_from(submitted.elapsed().as_micros()).unwrap_or(u64::MAX);
        let now_ns = u64::try_from(submitted.elapsed().as_nanos()).unwrap_or(0);
        let latency = &self.latency_us[dir.index()];

        let mut old = latency.load(Ordering::Relaxed);
        loop {
            if old.abs_diff(sample) < old / 2 && now_ns & 0x1f != 0 {
                break;
            }
            let new = ewma_add(old, sample);
            match latency.compare_exchange_weak(old, new, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break,
                Err(v) => old = v,
            }
        }
    }

    // ── Submission ──────────────────────────────────────────────────────

    pub fn submit_read(&self, cx: &Cx, sector: u64, buf: &mut [u8], ty: DataType) -> Result<()> {
        if self.is_dying() {
            trace!(target: "dfs::device", event = "read_on_dying", dev = %self.idx);
            return Err(DfsError::IoDevice { dev: self.idx });
        }
        let start = Instant::now();
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let res = self.backend.read_at(cx, sector, buf);
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.latency_acct(start, IoDir::Read);

        match res {
            Ok(()) => {
                self.sectors_done[IoDir::Read.index()][ty.index()]
                    .fetch_add((buf.len() / SECTOR_SIZE) as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(DfsError::Cancelled) => Err(DfsError::Cancelled),
            Err(err) => {
                self.io_errors[IoDir::Read.index()].fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "dfs::device",
                    event = "read_error",
                    dev = %self.idx,
                    sector = sector,
                    error = %err,
                );
                Err(DfsError::IoDevice { dev: self.idx })
            }
        }
    }

    pub fn submit_write(
        &self,
        cx: &Cx,
        sector: u64,
        data: &[u8],
        ty: DataType,
        fua: bool,
    ) -> Result<()> {
        if self.is_dying() {
            // Torn-down device: complete with a synthetic removed status
            // without touching the backend.
            trace!(target: "dfs::device", event = "write_on_dying", dev = %self.idx);
            return Err(DfsError::IoDevice { dev: self.idx });
        }
        let start = Instant::now();
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let res = self.backend.write_at(cx, sector, data).and_then(|()| {
            if fua {
                self.fua_writes.fetch_add(1, Ordering::Relaxed);
                self.backend.flush(cx)
            } else {
                Ok(())
            }
        });
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.latency_acct(start, IoDir::Write);

        match res {
            Ok(()) => {
                self.sectors_done[IoDir::Write.index()][ty.index()]
                    .fetch_add((data.len() / SECTOR_SIZE) as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(DfsError::Cancelled) => Err(DfsError::Cancelled),
            Err(err) => {
                self.io_errors[IoDir::Write.index()].fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "dfs::device",
                    event = "write_error",
                    dev = %self.idx,
                    sector = sector,
                    error = %err,
                );
                Err(DfsError::IoDevice { dev: self.idx })
            }
        }
    }

    pub fn flush(&self, cx: &Cx) -> Result<()> {
        self.backend.flush(cx)
    }
}

// ── Device set ──────────────────────────────────────────────────────────────

/// The filesystem's member devices, indexed densely by `DeviceIdx`.
pub struct DeviceSet {
    devs: Vec<Arc<Dev>>,
}

impl DeviceSet {
    #[must_use]
    pub fn new(devs: Vec<Arc<Dev>>) -> Self {
        for (i, d) in devs.iter().enumerate() {
            debug_assert_eq!(d.idx.0 as usize, i);
        }
        Self { devs }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.devs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devs.is_empty()
    }

    #[must_use]
    pub fn get(&self, idx: DeviceIdx) -> Option<&Arc<Dev>> {
        self.devs.get(idx.0 as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Dev>> {
        self.devs.iter()
    }

    /// The fastest tier present across live devices.
    #[must_use]
    pub fn fastest_tier(&self) -> Option<Tier> {
        self.devs
            .iter()
            .filter(|d| !d.is_dying())
            .map(|d| d.tier)
            .min()
    }

    /// Mask of live devices on the fastest tier.
    #[must_use]
    pub fn fastest_devs(&self) -> dfs_types::DeviceMask {
        let mut mask = dfs_types::DeviceMask::EMPTY;
        if let Some(t) = self.fastest_tier() {
            for d in &self.devs {
                if d.tier == t && !d.is_dying() {
                    mask.insert(d.idx);
                }
            }
        }
        mask
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cx() -> Cx {
        Cx::for_testing()
    }

    fn mk_dev(sectors: u64) -> Dev {
        Dev::new(
            DeviceIdx(0),
            Tier(0),
            64,
            true,
            Arc::new(MemBackend::new(sectors)),
        )
    }

    #[test]
    fn mem_backend_roundtrip() {
        let cx = test_cx();
        let dev = mk_dev(256);
        let data = vec![0xAB; 2 * SECTOR_SIZE];
        dev.submit_write(&cx, 10, &data, DataType::User, false)
            .unwrap();
        let mut out = vec![0u8; 2 * SECTOR_SIZE];
        dev.submit_read(&cx, 10, &mut out, DataType::User).unwrap();
        assert_eq!(out, data);
        assert_eq!(dev.sectors_done(IoDir::Write, DataType::User), 2);
        assert_eq!(dev.sectors_done(IoDir::Read, DataType::User), 2);
    }

    #[test]
    fn read_failure_counts_error() {
        let cx = test_cx();
        let backend = MemBackend::new(64);
        backend.set_fail_reads(true);
        let dev = Dev::new(DeviceIdx(0), Tier(0), 64, true, Arc::new(backend));
        let mut buf = vec![0u8; SECTOR_SIZE];
        let err = dev.submit_read(&cx, 0, &mut buf, DataType::User).unwrap_err();
        assert!(matches!(err, DfsError::IoDevice { .. }));
        assert_eq!(dev.io_errors(IoDir::Read), 1);
    }

    #[test]
    fn dying_device_synthesizes_removed() {
        let cx = test_cx();
        let dev = mk_dev(64);
        dev.set_dying(true);
        let err = dev
            .submit_write(&cx, 0, &vec![0u8; SECTOR_SIZE], DataType::User, false)
            .unwrap_err();
        assert!(matches!(err, DfsError::IoDevice { .. }));
        // Synthetic removed status, not a media error.
        assert_eq!(dev.io_errors(IoDir::Write), 0);
    }

    #[test]
    fn fua_write_flushes() {
        let cx = test_cx();
        let dev = mk_dev(64);
        dev.submit_write(&cx, 0, &vec![1u8; SECTOR_SIZE], DataType::User, true)
            .unwrap();
        assert_eq!(dev.fua_writes(), 1);
    }

    #[test]
    fn bucket_gen_staleness() {
        let dev = mk_dev(256);
        let ptr = Pointer {
            dev: DeviceIdx(0),
            offset: 70,
            generation: dev.bucket_gen(1),
            cached: true,
        };
        assert!(!dev.ptr_stale(&ptr));
        dev.bump_bucket_gen(1);
        assert!(dev.ptr_stale(&ptr));
        // A pointer in another bucket is unaffected.
        let other = Pointer {
            dev: DeviceIdx(0),
            offset: 10,
            generation: dev.bucket_gen(0),
            cached: true,
        };
        assert!(!dev.ptr_stale(&other));
    }

    #[test]
    fn ewma_converges() {
        assert_eq!(ewma_add(0, 100), 100);
        let mut v = 100;
        for _ in 0..200 {
            v = ewma_add(v, 200);
        }
        assert!(v > 190 && v <= 200, "ewma stuck at {v}");
    }

    #[test]
    fn corruption_flips_bytes() {
        let cx = test_cx();
        let backend = MemBackend::new(64);
        let data = vec![0x55; SECTOR_SIZE];
        backend.write_at(&cx, 3, &data).unwrap();
        backend.corrupt(3, 1);
        let mut out = vec![0u8; SECTOR_SIZE];
        backend.read_at(&cx, 3, &mut out).unwrap();
        assert!(out.iter().all(|b| *b == 0xAA));
    }

    #[test]
    fn fastest_tier_ignores_dying() {
        let d0 = Arc::new(Dev::new(
            DeviceIdx(0),
            Tier(0),
            64,
            true,
            Arc::new(MemBackend::new(64)),
        ));
        let d1 = Arc::new(Dev::new(
            DeviceIdx(1),
            Tier(1),
            64,
            true,
            Arc::new(MemBackend::new(64)),
        ));
        let set = DeviceSet::new(vec![Arc::clone(&d0), Arc::clone(&d1)]);
        assert_eq!(set.fastest_tier(), Some(Tier(0)));
        d0.set_dying(true);
        assert_eq!(set.fastest_tier(), Some(Tier(1)));
        assert_eq!(set.fastest_devs(), dfs_types::DeviceMask::single(DeviceIdx(1)));
    }

    #[test]
    fn file_backend_roundtrip() {
        let cx = test_cx();
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(64 * SECTOR_SIZE as u64).unwrap();
        let backend = FileBackend::open(tmp.path()).unwrap();
        assert_eq!(backend.size_sectors(), 64);
        let data = vec![9u8; SECTOR_SIZE];
        backend.write_at(&cx, 5, &data).unwrap();
        let mut out = vec![0u8; SECTOR_SIZE];
        backend.read_at(&cx, 5, &mut out).unwrap();
        assert_eq!(out, data);
    }
}
