#![forbid(unsafe_code)]
//! Core identifier and unit types for the driftfs data path.
//!
//! Everything on-device is addressed in 512-byte sectors; bounce memory is
//! managed in 4 KiB pages. The newtypes here exist to keep sectors, bytes,
//! device indices and inode numbers from being mixed up at interface
//! boundaries.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of a device sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Size of a bounce page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Default cap, in sectors, on a single encoded (checksummed or compressed)
/// extent. Reads must fetch a checksummed extent in full, so this bounds
/// read amplification and the bounce memory a single extent can require.
pub const ENCODED_EXTENT_MAX_DEFAULT: u32 = 128;

#[inline]
#[must_use]
pub fn sectors_to_bytes(sectors: u32) -> usize {
    sectors as usize * SECTOR_SIZE
}

#[inline]
#[must_use]
pub fn bytes_to_sectors(bytes: usize) -> u32 {
    debug_assert!(bytes % SECTOR_SIZE == 0, "unaligned byte count: {bytes}");
    (bytes / SECTOR_SIZE) as u32
}

/// Round a byte count up to whole pages.
#[inline]
#[must_use]
pub fn pages_for_bytes(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}

// ── Identifiers ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

/// Index of a member device within the filesystem (dense, small).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceIdx(pub u32);

/// Journal sequence number. Monotonic; `flush_seq` makes everything up to a
/// given sequence durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JournalSeq(pub u64);

/// Storage tier. Lower is faster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tier(pub u8);

/// Extent version: a per-filesystem monotonic counter stamped at write time.
///
/// Versions are never reused; overlapping extents within an inode are
/// totally ordered by version and the newer version supersedes.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Version {
    pub hi: u32,
    pub lo: u64,
}

impl Version {
    pub const ZERO: Self = Self { hi: 0, lo: 0 };

    #[must_use]
    pub fn is_zero(self) -> bool {
        self == Self::ZERO
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hi, self.lo)
    }
}

// ── Positions ───────────────────────────────────────────────────────────────

/// A position in extent-key space: `(inode, sector offset)`.
///
/// Extent keys are addressed by their *end* position; an extent of size `s`
/// at position `p` covers sectors `[p.offset - s, p.offset)` of `p.inode`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ExtentPos {
    pub inode: InodeNumber,
    pub offset: u64,
}

impl ExtentPos {
    pub const MIN: Self = Self {
        inode: InodeNumber(0),
        offset: 0,
    };
    pub const MAX: Self = Self {
        inode: InodeNumber(u64::MAX),
        offset: u64::MAX,
    };

    #[must_use]
    pub fn new(inode: InodeNumber, offset: u64) -> Self {
        Self { inode, offset }
    }
}

impl fmt::Display for ExtentPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.inode.0, self.offset)
    }
}

// ── Pointers ────────────────────────────────────────────────────────────────

/// A replica pointer: one device-resident copy of an extent's stored bytes.
///
/// `generation` is that of the device bucket the pointer lands in, stamped
/// at write time; a cached pointer whose bucket generation has since advanced
/// is stale and must not be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pointer {
    pub dev: DeviceIdx,
    pub offset: u64,
    pub generation: u8,
    pub cached: bool,
}

// ── Device masks ────────────────────────────────────────────────────────────

/// Maximum number of member devices.
pub const MAX_DEVICES: u32 = 64;

/// A set of device indices, used for avoid-sets, failure bitmaps and
/// allocation targets.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct DeviceMask(u64);

impl DeviceMask {
    pub const EMPTY: Self = Self(0);
    pub const ALL: Self = Self(u64::MAX);

    #[must_use]
    pub fn single(dev: DeviceIdx) -> Self {
        let mut m = Self::EMPTY;
        m.insert(dev);
        m
    }

    pub fn insert(&mut self, dev: DeviceIdx) {
        debug_assert!(dev.0 < MAX_DEVICES);
        self.0 |= 1 << dev.0;
    }

    pub fn remove(&mut self, dev: DeviceIdx) {
        self.0 &= !(1 << dev.0);
    }

    #[must_use]
    pub fn contains(self, dev: DeviceIdx) -> bool {
        self.0 & (1 << dev.0) != 0
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn len(self) -> u32 {
        self.0.count_ones()
    }

    #[must_use]
    pub fn without(self, dev: DeviceIdx) -> Self {
        let mut m = self;
        m.remove(dev);
        m
    }

    /// Iterate set device indices in ascending order.
    pub fn iter(self) -> impl Iterator<Item = DeviceIdx> {
        (0..MAX_DEVICES).filter_map(move |i| self.contains(DeviceIdx(i)).then_some(DeviceIdx(i)))
    }
}

// ── Data types ──────────────────────────────────────────────────────────────

/// Classification of data moving through the pipelines, for per-device
/// sector accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// Foreground user data (dirty replicas).
    User,
    /// Best-effort cached copies (promotion targets, cached writes).
    Cached,
}

impl DataType {
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::User => 0,
            Self::Cached => 1,
        }
    }
}

/// Read/write direction, for latency and sector accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoDir {
    Read,
    Write,
}

impl IoDir {
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Read => 0,
            Self::Write => 1,
        }
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for DeviceIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for JournalSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_mask_basics() {
        let mut m = DeviceMask::EMPTY;
        assert!(m.is_empty());
        m.insert(DeviceIdx(0));
        m.insert(DeviceIdx(5));
        assert!(m.contains(DeviceIdx(0)));
        assert!(m.contains(DeviceIdx(5)));
        assert!(!m.contains(DeviceIdx(1)));
        assert_eq!(m.len(), 2);
        assert_eq!(
            m.iter().collect::<Vec<_>>(),
            vec![DeviceIdx(0), DeviceIdx(5)]
        );
        m.remove(DeviceIdx(0));
        assert!(!m.contains(DeviceIdx(0)));
    }

    #[test]
    fn extent_pos_orders_by_inode_then_offset() {
        let a = ExtentPos::new(InodeNumber(1), 100);
        let b = ExtentPos::new(InodeNumber(2), 0);
        let c = ExtentPos::new(InodeNumber(2), 50);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn version_ordering() {
        let old = Version { hi: 0, lo: 7 };
        let new = Version { hi: 0, lo: 8 };
        assert!(old < new);
        assert!(Version::ZERO.is_zero());
        assert!(!new.is_zero());
    }

    #[test]
    fn sector_conversions() {
        assert_eq!(sectors_to_bytes(4), 2048);
        assert_eq!(bytes_to_sectors(2048), 4);
        assert_eq!(pages_for_bytes(1), 1);
        assert_eq!(pages_for_bytes(PAGE_SIZE + 1), 2);
    }
}
