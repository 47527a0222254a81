#![forbid(unsafe_code)]
//! The extent index consumed by the data path.
//!
//! The node storage engine behind the real index is out of scope; this
//! crate realizes its contract as an ordered map of non-overlapping extent
//! keys with copy-on-write splice insertion, snapshot reads, and an atomic
//! (compare-and-swap) insert mode for the migrate and narrow-crcs paths.
//!
//! Insert resolves overlaps by version: a stored extent with a newer
//! version wins and the incoming key is cut around it; older stored extents
//! are cut around the incoming key. Readers take cloned snapshots and never
//! hold the index lock across I/O.

use asupersync::Cx;
use dfs_error::{DfsError, Result};
use dfs_extent::ExtentKey;
use dfs_types::{ExtentPos, InodeNumber};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

#[inline]
fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| DfsError::Cancelled)
}

/// Ordered index of extents, keyed by end position.
#[derive(Default)]
pub struct ExtentIndex {
    map: RwLock<BTreeMap<ExtentPos, ExtentKey>>,
    change_seq: AtomicU64,
}

impl ExtentIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current change sequence. Advances on every mutation; snapshot it
    /// before building an atomic insert.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.change_seq.load(Ordering::Acquire)
    }

    /// Clone the first extent ending after `pos`, together with the change
    /// sequence observed. The caller re-checks inode and range; the lock is
    /// dropped before returning.
    #[must_use]
    pub fn peek(&self, pos: ExtentPos) -> Option<(ExtentKey, u64)> {
        let map = self.map.read();
        let seq = self.change_seq.load(Ordering::Acquire);
        map.range((Excluded(pos), Unbounded))
            .next()
            .map(|(_, k)| (k.clone(), seq))
    }

    /// Snapshot every extent overlapping `[start, end)` of `inode`.
    #[must_use]
    pub fn snapshot_range(&self, inode: InodeNumber, start: u64, end: u64) -> Vec<ExtentKey> {
        let map = self.map.read();
        map.range((Excluded(ExtentPos::new(inode, start)), Unbounded))
            .take_while(|(p, _)| p.inode == inode)
            .filter(|(_, k)| k.overlaps(start, end))
            .map(|(_, k)| k.clone())
            .collect()
    }

    /// Snapshot the whole index in key order.
    #[must_use]
    pub fn all(&self) -> Vec<ExtentKey> {
        self.map.read().values().cloned().collect()
    }

    /// Insert a key, splicing overlaps by version order.
    pub fn insert(&self, cx: &Cx, key: ExtentKey) -> Result<()> {
        self.insert_inner(cx, key, None)
    }

    /// Insert a key only if the index is unchanged since `expected_seq`;
    /// returns `DfsError::Raced` otherwise. This is the compare-and-swap the
    /// migrate index update and narrow-crcs build on.
    pub fn insert_atomic(&self, cx: &Cx, key: ExtentKey, expected_seq: u64) -> Result<()> {
        self.insert_inner(cx, key, Some(expected_seq))
    }

    fn insert_inner(&self, cx: &Cx, key: ExtentKey, expected_seq: Option<u64>) -> Result<()> {
        cx_checkpoint(cx)?;
        key.validate()?;

        let mut map = self.map.write();
        if let Some(expected) = expected_seq {
            let seq = self.change_seq.load(Ordering::Acquire);
            if seq != expected {
                trace!(
                    target: "dfs::index",
                    event = "atomic_insert_raced",
                    expected = expected,
                    actual = seq,
                );
                return Err(DfsError::Raced);
            }
        }

        let overlaps = Self::take_overlaps(&mut map, &key);
        let mut newer: Vec<(u64, u64)> = Vec::new();

        for stored in overlaps {
            if stored.version > key.version {
                // Stored extent supersedes: keep it whole, remember the
                // region so the incoming key is cut around it.
                newer.push((stored.start_offset(), stored.end_offset()));
                map.insert(stored.pos, stored);
            } else {
                // Incoming key supersedes: keep the stored extent's
                // non-overlapping edges.
                if stored.start_offset() < key.start_offset() {
                    let mut left = stored.clone();
                    left.cut_back_to(key.start_offset());
                    map.insert(left.pos, left);
                }
                if stored.end_offset() > key.end_offset() {
                    let mut right = stored;
                    right.cut_front_to(key.end_offset());
                    map.insert(right.pos, right);
                }
            }
        }

        newer.sort_unstable();
        for piece in Self::subtract(key, &newer) {
            map.insert(piece.pos, piece);
        }

        self.change_seq.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Remove every mapping in `[start, end)` of `inode`, keeping the
    /// non-overlapping edges of boundary extents.
    pub fn delete_range(&self, cx: &Cx, inode: InodeNumber, start: u64, end: u64) -> Result<()> {
        cx_checkpoint(cx)?;
        let mut map = self.map.write();
        let doomed: Vec<ExtentPos> = map
            .range((Excluded(ExtentPos::new(inode, start)), Unbounded))
            .take_while(|(p, _)| p.inode == inode)
            .filter(|(_, k)| k.overlaps(start, end))
            .map(|(p, _)| *p)
            .collect();
        for pos in doomed {
            let Some(stored) = map.remove(&pos) else {
                continue;
            };
            if stored.start_offset() < start {
                let mut left = stored.clone();
                left.cut_back_to(start);
                map.insert(left.pos, left);
            }
            if stored.end_offset() > end {
                let mut right = stored;
                right.cut_front_to(end);
                map.insert(right.pos, right);
            }
        }
        self.change_seq.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn take_overlaps(map: &mut BTreeMap<ExtentPos, ExtentKey>, key: &ExtentKey) -> Vec<ExtentKey> {
        let start = key.start_offset();
        let end = key.end_offset();
        let inode = key.inode();
        let positions: Vec<ExtentPos> = map
            .range((Excluded(ExtentPos::new(inode, start)), Unbounded))
            .take_while(|(p, _)| p.inode == inode)
            .filter(|(_, k)| k.overlaps(start, end))
            .map(|(p, _)| *p)
            .collect();
        positions
            .into_iter()
            .filter_map(|p| map.remove(&p))
            .collect()
    }

    /// Fragments of `key` not covered by any of the (sorted, disjoint)
    /// `regions`.
    fn subtract(key: ExtentKey, regions: &[(u64, u64)]) -> Vec<ExtentKey> {
        let mut out = Vec::new();
        let mut cursor = key.start_offset();
        let end = key.end_offset();
        for &(rs, re) in regions {
            if rs > cursor {
                let mut piece = key.clone();
                piece.cut_front_to(cursor);
                piece.cut_back_to(rs.min(end));
                if piece.size > 0 {
                    out.push(piece);
                }
            }
            cursor = cursor.max(re);
            if cursor >= end {
                break;
            }
        }
        if cursor < end {
            let mut piece = key;
            piece.cut_front_to(cursor);
            out.push(piece);
        }
        out
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use dfs_codec::{Checksum, ChecksumType, CompressionType, CrcDescriptor};
    use dfs_types::{DeviceIdx, Pointer, Version};

    fn test_cx() -> Cx {
        Cx::for_testing()
    }

    fn mk_key(inode: u64, start: u64, size: u32, version: u64) -> ExtentKey {
        let mut k = ExtentKey::new(
            InodeNumber(inode),
            start,
            size,
            Version { hi: 0, lo: version },
        );
        let crc = k.append_crc(CrcDescriptor {
            compressed_size: size,
            uncompressed_size: size,
            live_size: size,
            offset: 0,
            nonce: 0,
            csum_type: ChecksumType::Crc32c,
            compression_type: CompressionType::None,
            csum: Checksum { lo: version, hi: 0 },
        });
        k.append_ptr(
            crc,
            Pointer {
                dev: DeviceIdx(0),
                offset: start,
                generation: 0,
                cached: false,
            },
        );
        k
    }

    fn ranges(index: &ExtentIndex, inode: u64) -> Vec<(u64, u64, u64)> {
        index
            .snapshot_range(InodeNumber(inode), 0, u64::MAX)
            .iter()
            .map(|k| (k.start_offset(), k.end_offset(), k.version.lo))
            .collect()
    }

    #[test]
    fn insert_and_peek() {
        let cx = test_cx();
        let index = ExtentIndex::new();
        index.insert(&cx, mk_key(1, 0, 16, 1)).unwrap();

        let (k, _) = index.peek(ExtentPos::new(InodeNumber(1), 0)).unwrap();
        assert_eq!(k.start_offset(), 0);
        assert_eq!(k.end_offset(), 16);

        // Peeking past the extent's end finds nothing in this inode.
        assert!(index.peek(ExtentPos::new(InodeNumber(1), 16)).is_none());
    }

    #[test]
    fn newer_version_overwrites_middle() {
        let cx = test_cx();
        let index = ExtentIndex::new();
        index.insert(&cx, mk_key(1, 0, 16, 1)).unwrap();
        index.insert(&cx, mk_key(1, 4, 4, 2)).unwrap();

        assert_eq!(ranges(&index, 1), vec![(0, 4, 1), (4, 8, 2), (8, 16, 1)]);
    }

    #[test]
    fn older_version_fills_around_newer() {
        let cx = test_cx();
        let index = ExtentIndex::new();
        index.insert(&cx, mk_key(1, 4, 4, 9)).unwrap();
        // An older, wider key must not clobber the newer middle.
        index.insert(&cx, mk_key(1, 0, 16, 3)).unwrap();

        assert_eq!(ranges(&index, 1), vec![(0, 4, 3), (4, 8, 9), (8, 16, 3)]);
    }

    #[test]
    fn same_version_replaces_in_place() {
        let cx = test_cx();
        let index = ExtentIndex::new();
        index.insert(&cx, mk_key(1, 0, 8, 5)).unwrap();
        let mut replacement = mk_key(1, 0, 8, 5);
        replacement.ptrs[0].ptr.dev = DeviceIdx(3);
        index.insert(&cx, replacement).unwrap();

        let keys = index.snapshot_range(InodeNumber(1), 0, 8);
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].ptrs[0].ptr.dev, DeviceIdx(3));
    }

    #[test]
    fn atomic_insert_detects_race() {
        let cx = test_cx();
        let index = ExtentIndex::new();
        index.insert(&cx, mk_key(1, 0, 8, 1)).unwrap();

        let (_, seq) = index.peek(ExtentPos::new(InodeNumber(1), 0)).unwrap();
        // A concurrent mutation moves the sequence on.
        index.insert(&cx, mk_key(2, 0, 8, 2)).unwrap();

        let err = index.insert_atomic(&cx, mk_key(1, 0, 8, 3), seq).unwrap_err();
        assert!(matches!(err, DfsError::Raced));

        // Retrying with the fresh sequence succeeds.
        let (_, seq) = index.peek(ExtentPos::new(InodeNumber(1), 0)).unwrap();
        index.insert_atomic(&cx, mk_key(1, 0, 8, 3), seq).unwrap();
    }

    #[test]
    fn delete_range_keeps_edges() {
        let cx = test_cx();
        let index = ExtentIndex::new();
        index.insert(&cx, mk_key(1, 0, 16, 1)).unwrap();
        index.delete_range(&cx, InodeNumber(1), 4, 12).unwrap();

        assert_eq!(ranges(&index, 1), vec![(0, 4, 1), (12, 16, 1)]);
    }

    #[test]
    fn inode_boundaries_are_respected() {
        let cx = test_cx();
        let index = ExtentIndex::new();
        index.insert(&cx, mk_key(1, 0, 8, 1)).unwrap();
        index.insert(&cx, mk_key(2, 0, 8, 2)).unwrap();

        // A full-range overwrite of inode 1 must not touch inode 2.
        index.insert(&cx, mk_key(1, 0, 8, 3)).unwrap();
        assert_eq!(ranges(&index, 2), vec![(0, 8, 2)]);
        assert_eq!(ranges(&index, 1), vec![(0, 8, 3)]);
    }

    #[test]
    fn subtract_splits_around_newer_regions() {
        let cx = test_cx();
        let index = ExtentIndex::new();
        index.insert(&cx, mk_key(1, 4, 2, 10)).unwrap();
        index.insert(&cx, mk_key(1, 10, 2, 11)).unwrap();
        index.insert(&cx, mk_key(1, 0, 16, 5)).unwrap();

        assert_eq!(
            ranges(&index, 1),
            vec![(0, 4, 5), (4, 6, 10), (6, 10, 5), (10, 12, 11), (12, 16, 5)]
        );
    }

    #[test]
    fn cut_crc_windows_survive_splice() {
        let cx = test_cx();
        let index = ExtentIndex::new();
        index.insert(&cx, mk_key(1, 0, 16, 1)).unwrap();
        index.insert(&cx, mk_key(1, 4, 4, 2)).unwrap();

        let keys = index.snapshot_range(InodeNumber(1), 0, 16);
        let right = keys.iter().find(|k| k.start_offset() == 8).unwrap();
        // The tail fragment's descriptor still covers the original 16
        // sectors, offset past the overwritten prefix.
        assert_eq!(right.crcs[0].uncompressed_size, 16);
        assert_eq!(right.crcs[0].offset, 8);
        assert_eq!(right.crcs[0].live_size, 8);
    }
}
