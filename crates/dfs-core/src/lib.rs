#![forbid(unsafe_code)]
//! Filesystem assembly: options, counters, and the `Fs` handle the data
//! path operates on.
//!
//! `Fs` owns the member devices, the extent index, the allocator, the
//! journal, the bounce pool, the encryption key and the per-filesystem
//! counters. It holds no persisted state of its own; everything durable
//! lives in the extent index, the replicas table and the journal.

use dfs_alloc::{Allocator, FsUsage};
use dfs_bounce::BouncePool;
use dfs_codec::{ChecksumType, CompressionType, EncryptionKey};
use dfs_device::{Dev, DeviceSet};
use dfs_error::{DfsError, Result};
use dfs_index::ExtentIndex;
use dfs_journal::Journal;
use dfs_types::{
    DeviceMask, ENCODED_EXTENT_MAX_DEFAULT, InodeNumber, SECTOR_SIZE, Tier, Version,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::info;

// ── Options ─────────────────────────────────────────────────────────────────

/// Filesystem-wide defaults for the data path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opts {
    /// Dirty replicas required per extent.
    pub data_replicas: u32,
    pub csum: ChecksumType,
    pub compression: CompressionType,
    /// Cap on a single encoded extent, in sectors.
    pub encoded_extent_max: u32,
    pub bucket_sectors: u32,
    /// Whether reads from slower tiers enqueue cached copies on the
    /// fastest tier.
    pub promote: bool,
    /// Devices foreground writes target.
    pub foreground_target: DeviceMask,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            data_replicas: 1,
            csum: ChecksumType::Crc32c,
            compression: CompressionType::None,
            encoded_extent_max: ENCODED_EXTENT_MAX_DEFAULT,
            bucket_sectors: 256,
            promote: false,
            foreground_target: DeviceMask::ALL,
        }
    }
}

/// Per-inode I/O option overrides.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IoOpts {
    pub csum: ChecksumType,
    pub compression: CompressionType,
    pub promote: bool,
}

// ── Counters ────────────────────────────────────────────────────────────────

/// Per-filesystem event counters, exposed to the sysfs-style surface.
/// Init-at-mount, teardown-at-unmount; updates are relaxed atomics.
#[derive(Default)]
pub struct Counters {
    pub read_realloc_races: AtomicU64,
    pub extent_migrate_done: AtomicU64,
    pub extent_migrate_raced: AtomicU64,
}

impl Counters {
    #[must_use]
    pub fn read_realloc_races(&self) -> u64 {
        self.read_realloc_races.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn extent_migrate_done(&self) -> u64 {
        self.extent_migrate_done.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn extent_migrate_raced(&self) -> u64 {
        self.extent_migrate_raced.load(Ordering::Relaxed)
    }
}

// ── Replicas table ──────────────────────────────────────────────────────────

/// The superblock's record of which device sets hold data. The write and
/// migrate paths record an extent's device set here before inserting it.
#[derive(Default)]
pub struct ReplicasTable {
    entries: Mutex<BTreeSet<Vec<u32>>>,
}

impl ReplicasTable {
    pub fn check_mark(&self, devs: DeviceMask) -> Result<()> {
        if devs.is_empty() {
            return Err(DfsError::KeyUnpack("extent with no devices".into()));
        }
        let set: Vec<u32> = devs.iter().map(|d| d.0).collect();
        self.entries.lock().insert(set);
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, devs: DeviceMask) -> bool {
        let set: Vec<u32> = devs.iter().map(|d| d.0).collect();
        self.entries.lock().contains(&set)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

// ── Tier usage ──────────────────────────────────────────────────────────────

/// Compressed/uncompressed sector counts for one tier, computed from the
/// live index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierUsage {
    pub tier: Tier,
    pub compressed_sectors: u64,
    pub uncompressed_sectors: u64,
}

// ── Fs ──────────────────────────────────────────────────────────────────────

pub struct Fs {
    opts: Opts,
    pub devs: Arc<DeviceSet>,
    pub index: ExtentIndex,
    pub alloc: Allocator,
    pub usage: Arc<FsUsage>,
    pub journal: Journal,
    pub bounce: BouncePool,
    pub counters: Counters,
    pub replicas: ReplicasTable,
    key: EncryptionKey,
    key_version: AtomicU64,
    io_opts: RwLock<HashMap<InodeNumber, IoOpts>>,
    read_only: AtomicBool,
    race_fault: AtomicBool,
}

/// Reserved bounce segments guaranteeing encode/decode progress.
const BOUNCE_POOL_SEGMENTS: usize = 8;

impl Fs {
    #[must_use]
    pub fn new(opts: Opts, devices: Vec<Arc<Dev>>, key: EncryptionKey) -> Self {
        let capacity = devices.iter().map(|d| d.size_sectors()).sum();
        let devs = Arc::new(DeviceSet::new(devices));
        let alloc = Allocator::new(Arc::clone(&devs), opts.bucket_sectors);
        let bounce = BouncePool::new(
            BOUNCE_POOL_SEGMENTS,
            opts.encoded_extent_max as usize * SECTOR_SIZE,
        );
        info!(
            target: "dfs::core",
            event = "mount",
            devices = devs.len(),
            capacity_sectors = capacity,
            replicas = opts.data_replicas,
        );
        Self {
            opts,
            devs,
            index: ExtentIndex::new(),
            alloc,
            usage: Arc::new(FsUsage::new(capacity)),
            journal: Journal::new(),
            bounce,
            counters: Counters::default(),
            replicas: ReplicasTable::default(),
            key,
            key_version: AtomicU64::new(0),
            io_opts: RwLock::new(HashMap::new()),
            read_only: AtomicBool::new(false),
            race_fault: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn opts(&self) -> &Opts {
        &self.opts
    }

    #[must_use]
    pub fn key(&self) -> &EncryptionKey {
        &self.key
    }

    /// Allocate a fresh extent version. Never reused.
    #[must_use]
    pub fn next_version(&self) -> Version {
        Version {
            hi: 0,
            lo: self.key_version.fetch_add(1, Ordering::AcqRel) + 1,
        }
    }

    /// Effective I/O options for an inode: the per-inode override or the
    /// filesystem defaults.
    #[must_use]
    pub fn io_opts(&self, inode: InodeNumber) -> IoOpts {
        self.io_opts
            .read()
            .get(&inode)
            .copied()
            .unwrap_or(IoOpts {
                csum: self.opts.csum,
                compression: self.opts.compression,
                promote: self.opts.promote,
            })
    }

    pub fn set_io_opts(&self, inode: InodeNumber, opts: IoOpts) {
        self.io_opts.write().insert(inode, opts);
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    pub fn set_read_only(&self, ro: bool) {
        self.read_only.store(ro, Ordering::SeqCst);
    }

    /// Stale-read race injection, distinct from device-generation
    /// mismatch. Always false in production; tests arm it to exercise the
    /// retry-if-stale path.
    #[must_use]
    pub fn race_fault(&self) -> bool {
        self.race_fault.load(Ordering::SeqCst)
    }

    pub fn set_race_fault(&self, armed: bool) {
        self.race_fault.store(armed, Ordering::SeqCst);
    }

    /// Per-tier compressed/uncompressed sector counts from the live index.
    #[must_use]
    pub fn tier_usage(&self) -> Vec<TierUsage> {
        let mut by_tier: HashMap<Tier, (u64, u64)> = HashMap::new();
        for key in self.index.all() {
            for entry in &key.ptrs {
                let Some(dev) = self.devs.get(entry.ptr.dev) else {
                    continue;
                };
                let crc = key.crc_for(entry);
                let slot = by_tier.entry(dev.tier).or_default();
                if crc.is_compressed() {
                    slot.0 += u64::from(crc.compressed_size);
                } else {
                    slot.1 += u64::from(crc.compressed_size);
                }
            }
        }
        let mut out: Vec<TierUsage> = by_tier
            .into_iter()
            .map(|(tier, (c, u))| TierUsage {
                tier,
                compressed_sectors: c,
                uncompressed_sectors: u,
            })
            .collect();
        out.sort_by_key(|t| t.tier);
        out
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
