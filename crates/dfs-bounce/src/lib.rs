#![forbid(unsafe_code)]
//! Bounce buffers: private scratch memory for encode and decode.
//!
//! Payloads are bounced whenever later pipeline stages must be immune to
//! concurrent modification of the caller's buffer, or when compression and
//! encryption need to write out-of-place. Allocation tries the heap first
//! and falls back to a reserved pool under a mutex, so an encode or decode
//! of up to `encoded_extent_max` bytes can always make progress under
//! memory pressure. Buffers are tagged with their origin so release routes
//! pool segments back to the free list.
//!
//! The mutex protects only the freelist; it is never held across I/O.

use asupersync::Cx;
use dfs_error::{DfsError, Result};
use dfs_types::pages_for_bytes;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::trace;

enum Storage {
    Direct(Vec<u8>),
    Pool(Box<[u8]>),
}

/// An owned bounce buffer of `len` bytes.
pub struct BounceBuf {
    storage: Storage,
    len: usize,
}

impl BounceBuf {
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match &self.storage {
            Storage::Direct(v) => &v[..self.len],
            Storage::Pool(b) => &b[..self.len],
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Storage::Direct(v) => &mut v[..self.len],
            Storage::Pool(b) => &mut b[..self.len],
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Shrink the buffer's live length, keeping its storage.
    pub fn truncate(&mut self, len: usize) {
        debug_assert!(len <= self.len);
        self.len = len;
    }

    /// Replace the contents, growing the live length up to the storage
    /// capacity.
    pub fn fill_from(&mut self, data: &[u8]) {
        let cap = match &self.storage {
            Storage::Direct(v) => v.len(),
            Storage::Pool(b) => b.len(),
        };
        debug_assert!(data.len() <= cap);
        self.len = data.len().min(cap);
        let len = self.len;
        self.as_mut_slice()[..len].copy_from_slice(&data[..len]);
    }

    /// Pages this buffer holds, for accounting.
    #[must_use]
    pub fn pages(&self) -> usize {
        match &self.storage {
            Storage::Direct(v) => pages_for_bytes(v.len()),
            Storage::Pool(b) => pages_for_bytes(b.len()),
        }
    }
}

/// The per-filesystem bounce pool.
pub struct BouncePool {
    segment_bytes: usize,
    segments: Mutex<Vec<Box<[u8]>>>,
    available: Condvar,
    fail_direct: AtomicBool,
    outstanding_pages: AtomicU64,
    peak_pages: AtomicU64,
}

impl BouncePool {
    /// Reserve `segments` buffers of `segment_bytes` each (the declared
    /// pool-backed maximum, normally `encoded_extent_max` bytes).
    #[must_use]
    pub fn new(segments: usize, segment_bytes: usize) -> Self {
        Self {
            segment_bytes,
            segments: Mutex::new(
                (0..segments)
                    .map(|_| vec![0u8; segment_bytes].into_boxed_slice())
                    .collect(),
            ),
            available: Condvar::new(),
            fail_direct: AtomicBool::new(false),
            outstanding_pages: AtomicU64::new(0),
            peak_pages: AtomicU64::new(0),
        }
    }

    /// Test hook: force every direct allocation to fail, exercising the
    /// pool fallback.
    pub fn set_fail_direct(&self, fail: bool) {
        self.fail_direct.store(fail, Ordering::SeqCst);
    }

    /// Acquire a zeroed bounce buffer of `bytes`.
    ///
    /// Never fails while `bytes` does not exceed the pool segment size:
    /// when direct allocation is unavailable the caller blocks until a
    /// reserved segment frees up. Larger requests can only be served
    /// directly and fail with `NoMem` under pressure; callers retry with a
    /// smaller request.
    pub fn acquire(&self, cx: &Cx, bytes: usize) -> Result<BounceBuf> {
        cx.checkpoint().map_err(|_| DfsError::Cancelled)?;

        if !self.fail_direct.load(Ordering::SeqCst) {
            return Ok(self.account(BounceBuf {
                storage: Storage::Direct(vec![0u8; bytes]),
                len: bytes,
            }));
        }

        if bytes > self.segment_bytes {
            trace!(
                target: "dfs::bounce",
                event = "over_pool_max",
                bytes = bytes,
                segment_bytes = self.segment_bytes,
            );
            return Err(DfsError::NoMem);
        }

        let mut segments = self.segments.lock();
        loop {
            if let Some(mut seg) = segments.pop() {
                seg.fill(0);
                drop(segments);
                return Ok(self.account(BounceBuf {
                    storage: Storage::Pool(seg),
                    len: bytes,
                }));
            }
            self.available.wait(&mut segments);
        }
    }

    fn account(&self, buf: BounceBuf) -> BounceBuf {
        let pages = buf.pages() as u64;
        let now = self.outstanding_pages.fetch_add(pages, Ordering::AcqRel) + pages;
        self.peak_pages.fetch_max(now, Ordering::AcqRel);
        buf
    }

    /// Release a bounce buffer; pool segments go back to the free list.
    pub fn release(&self, buf: BounceBuf) {
        self.outstanding_pages
            .fetch_sub(buf.pages() as u64, Ordering::AcqRel);
        if let Storage::Pool(seg) = buf.storage {
            self.segments.lock().push(seg);
            self.available.notify_one();
        }
    }

    /// Bounce pages currently held, for the bounded-bounce property.
    #[must_use]
    pub fn outstanding_pages(&self) -> u64 {
        self.outstanding_pages.load(Ordering::Acquire)
    }

    /// High-water mark of held pages.
    #[must_use]
    pub fn peak_pages(&self) -> u64 {
        self.peak_pages.load(Ordering::Acquire)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
