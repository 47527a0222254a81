#![forbid(unsafe_code)]
//! Extent keys: the data path's view of the extent index.
//!
//! An `ExtentKey` maps a contiguous logical range of an inode to one or more
//! replica pointers, each describing a device-resident copy through a CRC
//! descriptor. Keys are addressed by their end position; an extent of `size`
//! sectors at `pos` covers `[pos.offset - size, pos.offset)`.
//!
//! The cut and splice operations here are what the write pipeline and the
//! migrate index update use to resolve overlaps: cutting trims the live
//! range while carrying each descriptor's offset/live window (and thereby
//! its keystream identity) through unchanged stored coverage.

use dfs_codec::CrcDescriptor;
use dfs_error::{DfsError, Result};
use dfs_types::{DeviceIdx, DeviceMask, ExtentPos, InodeNumber, Pointer, Version};
use serde::{Deserialize, Serialize};

/// A replica pointer plus the index of the CRC descriptor describing its
/// stored bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtrEntry {
    pub crc_idx: usize,
    pub ptr: Pointer,
}

/// An extent: a logical range of an inode mapped to replica pointers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentKey {
    /// End position; the extent covers `[pos.offset - size, pos.offset)`.
    pub pos: ExtentPos,
    /// Live sectors covered in logical space.
    pub size: u32,
    pub version: Version,
    /// Best-effort copy: every pointer is evictable, the extent counts
    /// against no replication quota.
    pub cached: bool,
    /// Fewer dirty pointers than policy requires survived the write.
    pub degraded: bool,
    pub crcs: Vec<CrcDescriptor>,
    pub ptrs: Vec<PtrEntry>,
}

impl ExtentKey {
    #[must_use]
    pub fn new(inode: InodeNumber, start_offset: u64, size: u32, version: Version) -> Self {
        Self {
            pos: ExtentPos::new(inode, start_offset + u64::from(size)),
            size,
            version,
            cached: false,
            degraded: false,
            crcs: Vec::new(),
            ptrs: Vec::new(),
        }
    }

    #[must_use]
    pub fn start_offset(&self) -> u64 {
        self.pos.offset - u64::from(self.size)
    }

    #[must_use]
    pub fn end_offset(&self) -> u64 {
        self.pos.offset
    }

    #[must_use]
    pub fn start(&self) -> ExtentPos {
        ExtentPos::new(self.pos.inode, self.start_offset())
    }

    #[must_use]
    pub fn inode(&self) -> InodeNumber {
        self.pos.inode
    }

    /// Whether this extent overlaps `[start, end)` of its inode.
    #[must_use]
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start_offset() < end && self.end_offset() > start
    }

    pub fn append_crc(&mut self, crc: CrcDescriptor) -> usize {
        self.crcs.push(crc);
        self.crcs.len() - 1
    }

    pub fn append_ptr(&mut self, crc_idx: usize, ptr: Pointer) {
        debug_assert!(crc_idx < self.crcs.len());
        self.ptrs.push(PtrEntry { crc_idx, ptr });
    }

    #[must_use]
    pub fn crc_for(&self, entry: &PtrEntry) -> &CrcDescriptor {
        &self.crcs[entry.crc_idx]
    }

    #[must_use]
    pub fn nr_ptrs(&self) -> usize {
        self.ptrs.len()
    }

    /// Pointers counted against the replication quota.
    #[must_use]
    pub fn nr_dirty_ptrs(&self) -> usize {
        self.ptrs.iter().filter(|e| !e.ptr.cached).count()
    }

    #[must_use]
    pub fn has_device(&self, dev: DeviceIdx) -> Option<&PtrEntry> {
        self.ptrs.iter().find(|e| e.ptr.dev == dev)
    }

    /// The set of devices this extent points at.
    #[must_use]
    pub fn devices(&self) -> DeviceMask {
        let mut mask = DeviceMask::EMPTY;
        for e in &self.ptrs {
            mask.insert(e.ptr.dev);
        }
        mask
    }

    pub fn drop_device(&mut self, dev: DeviceIdx) {
        self.ptrs.retain(|e| e.ptr.dev != dev);
    }

    /// Drop every pointer whose device is in `failed`.
    pub fn drop_failed(&mut self, failed: DeviceMask) {
        self.ptrs.retain(|e| !failed.contains(e.ptr.dev));
    }

    /// Whether this extent still references the replica `ptr` describes,
    /// with `coverage_start` as the logical sector `ptr` is anchored at.
    ///
    /// This is the identity test used by narrow-crcs, promotion and the
    /// migrate index update. The stored extent may have been cut since it
    /// was read, and the caller's pointer may have been narrowed to a
    /// subrange; the replica matches when the stored pointer, shifted by
    /// the logical distance between the two coverage anchors, lands on the
    /// caller's device offset.
    #[must_use]
    pub fn matches_ptr(&self, ptr: Pointer, coverage_start: u64) -> bool {
        self.ptrs.iter().any(|e| {
            if e.ptr.dev != ptr.dev {
                return false;
            }
            let stored_anchor = self.start_offset() - u64::from(self.crc_for(e).offset);
            i128::from(e.ptr.offset) + (i128::from(coverage_start) - i128::from(stored_anchor))
                == i128::from(ptr.offset)
        })
    }

    /// Trim `sectors` off the front of the live range.
    pub fn cut_front(&mut self, sectors: u32) {
        debug_assert!(sectors < self.size);
        self.size -= sectors;
        for crc in &mut self.crcs {
            crc.offset += sectors;
            crc.live_size -= sectors;
        }
    }

    /// Trim `sectors` off the back of the live range.
    pub fn cut_back(&mut self, sectors: u32) {
        debug_assert!(sectors < self.size);
        self.pos.offset -= u64::from(sectors);
        self.size -= sectors;
        for crc in &mut self.crcs {
            crc.live_size -= sectors;
        }
    }

    /// Cut this key so it starts no earlier than `offset`.
    pub fn cut_front_to(&mut self, offset: u64) {
        if offset > self.start_offset() {
            let n = u32::try_from(offset - self.start_offset()).unwrap_or(self.size);
            self.cut_front(n);
        }
    }

    /// Cut this key so it ends no later than `offset`.
    pub fn cut_back_to(&mut self, offset: u64) {
        if offset < self.end_offset() {
            let n = u32::try_from(self.end_offset() - offset).unwrap_or(self.size);
            self.cut_back(n);
        }
    }

    /// Replace this extent's CRC descriptor with a tighter one covering
    /// exactly the live range.
    ///
    /// The new coverage begins `old.offset` sectors into the old one, so
    /// every pointer advances by that much. Only applies to
    /// single-descriptor extents (after a migrate splice the pointers may
    /// be described by different descriptors, and narrowing one would
    /// orphan the others). Returns whether the replacement happened.
    pub fn narrow_crc(&mut self, new_crc: CrcDescriptor) -> bool {
        if self.crcs.len() != 1 {
            return false;
        }
        if !self.crcs[0].can_narrow() {
            return false;
        }
        if new_crc.live_size != self.size
            || new_crc.offset != 0
            || new_crc.uncompressed_size != new_crc.live_size
        {
            return false;
        }
        let shift = u64::from(self.crcs[0].offset);
        self.crcs[0] = new_crc;
        for e in &mut self.ptrs {
            e.ptr.offset += shift;
        }
        true
    }

    /// Drop CRC descriptors no pointer references and reindex.
    pub fn normalize(&mut self) {
        let mut used = vec![false; self.crcs.len()];
        for e in &self.ptrs {
            used[e.crc_idx] = true;
        }
        if used.iter().all(|u| *u) {
            return;
        }
        let mut remap = vec![usize::MAX; self.crcs.len()];
        let mut next = 0;
        for (i, keep) in used.iter().enumerate() {
            if *keep {
                remap[i] = next;
                next += 1;
            }
        }
        let mut i = 0;
        self.crcs.retain(|_| {
            let keep = used[i];
            i += 1;
            keep
        });
        for e in &mut self.ptrs {
            e.crc_idx = remap[e.crc_idx];
        }
    }

    /// Structural sanity: descriptor invariants hold and every pointer's
    /// descriptor exists with a live range matching the key size.
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(DfsError::KeyUnpack("zero-size extent".into()));
        }
        for crc in &self.crcs {
            crc.validate()?;
            if crc.live_size != self.size {
                return Err(DfsError::KeyUnpack(format!(
                    "descriptor live {} != key size {}",
                    crc.live_size, self.size
                )));
            }
        }
        for e in &self.ptrs {
            if e.crc_idx >= self.crcs.len() {
                return Err(DfsError::KeyUnpack("pointer references missing crc".into()));
            }
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
