#![forbid(unsafe_code)]
//! The journal as the data path consumes it: an append-only log of extent
//! keys with sequence numbers, pins, and flush-to-stable.
//!
//! The commit protocol of the real journal is out of scope; this
//! realization keeps entries in memory, tracks the stable horizon, and
//! reclaims entries past it unless pinned. `res_get` fails with
//! `JournalFull` when the in-flight window is exhausted, which callers
//! resolve by flushing and retrying.

use asupersync::Cx;
use dfs_error::{DfsError, Result};
use dfs_extent::ExtentKey;
use dfs_types::{DeviceIdx, JournalSeq};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::{debug, trace};

const DEFAULT_WINDOW: usize = 4096;

struct Entry {
    keys: Vec<ExtentKey>,
}

struct State {
    next_seq: u64,
    stable_seq: u64,
    entries: BTreeMap<u64, Entry>,
    pins: BTreeMap<u64, u32>,
    error: bool,
}

/// A journal reservation: one sequence number the caller may append keys
/// under until `res_put`.
#[derive(Debug)]
pub struct JournalRes {
    pub seq: JournalSeq,
}

pub struct Journal {
    state: Mutex<State>,
    window: usize,
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for State {
    fn default() -> Self {
        Self {
            next_seq: 1,
            stable_seq: 0,
            entries: BTreeMap::new(),
            pins: BTreeMap::new(),
            error: false,
        }
    }
}

impl Journal {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            window: DEFAULT_WINDOW,
        }
    }

    #[must_use]
    pub fn with_window(window: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            window,
        }
    }

    /// Reserve the next sequence number.
    pub fn res_get(&self, cx: &Cx) -> Result<JournalRes> {
        cx.checkpoint().map_err(|_| DfsError::Cancelled)?;
        let mut state = self.state.lock();
        if state.error {
            return Err(DfsError::JournalError);
        }
        if state.entries.len() >= self.window {
            return Err(DfsError::JournalFull);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(seq, Entry { keys: Vec::new() });
        trace!(target: "dfs::journal", event = "res_get", seq = seq);
        Ok(JournalRes {
            seq: JournalSeq(seq),
        })
    }

    /// Append a key under a held reservation.
    pub fn add_keys(&self, res: &JournalRes, key: &ExtentKey) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(&res.seq.0) {
            entry.keys.push(key.clone());
        }
    }

    /// Release a reservation; its sequence becomes flushable.
    pub fn res_put(&self, res: JournalRes) {
        trace!(target: "dfs::journal", event = "res_put", seq = res.seq.0);
    }

    /// Make everything up to `seq` durable and reclaim unpinned entries.
    pub fn flush_seq(&self, cx: &Cx, seq: JournalSeq) -> Result<()> {
        cx.checkpoint().map_err(|_| DfsError::Cancelled)?;
        let mut state = self.state.lock();
        if state.error {
            return Err(DfsError::JournalError);
        }
        if seq.0 > state.stable_seq {
            state.stable_seq = seq.0;
            debug!(target: "dfs::journal", event = "flush_seq", stable = seq.0);
        }
        let stable = state.stable_seq;
        let pinned_floor = state.pins.keys().next().copied().unwrap_or(u64::MAX);
        state.entries.retain(|s, _| *s > stable || *s >= pinned_floor);
        Ok(())
    }

    /// Flush on behalf of a device teardown or data job: everything
    /// reserved so far becomes stable.
    pub fn flush_device(&self, cx: &Cx, dev: Option<DeviceIdx>) -> Result<()> {
        let latest = {
            let state = self.state.lock();
            state.next_seq - 1
        };
        debug!(
            target: "dfs::journal",
            event = "flush_device",
            dev = dev.map_or(-1, |d| i64::from(d.0)),
            seq = latest,
        );
        self.flush_seq(cx, JournalSeq(latest))
    }

    /// Pin `seq`, keeping it and everything after reclaimable only once
    /// unpinned.
    pub fn pin(&self, seq: JournalSeq) {
        let mut state = self.state.lock();
        *state.pins.entry(seq.0).or_insert(0) += 1;
    }

    pub fn unpin(&self, seq: JournalSeq) {
        let mut state = self.state.lock();
        if let Some(count) = state.pins.get_mut(&seq.0) {
            *count -= 1;
            if *count == 0 {
                state.pins.remove(&seq.0);
            }
        }
    }

    #[must_use]
    pub fn is_stable(&self, seq: JournalSeq) -> bool {
        self.state.lock().stable_seq >= seq.0
    }

    #[must_use]
    pub fn stable_seq(&self) -> JournalSeq {
        JournalSeq(self.state.lock().stable_seq)
    }

    /// Keys recorded under `seq`, for inspection.
    #[must_use]
    pub fn keys_at(&self, seq: JournalSeq) -> Vec<ExtentKey> {
        self.state
            .lock()
            .entries
            .get(&seq.0)
            .map(|e| e.keys.clone())
            .unwrap_or_default()
    }

    /// Drive the journal into its error state; subsequent reservations and
    /// flushes fail.
    pub fn set_error(&self) {
        self.state.lock().error = true;
    }

    #[must_use]
    pub fn error(&self) -> bool {
        self.state.lock().error
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use dfs_types::{InodeNumber, Version};

    fn test_cx() -> Cx {
        Cx::for_testing()
    }

    fn mk_key() -> ExtentKey {
        ExtentKey::new(InodeNumber(1), 0, 8, Version { hi: 0, lo: 1 })
    }

    #[test]
    fn seq_monotonic_and_flush() {
        let cx = test_cx();
        let journal = Journal::new();
        let a = journal.res_get(&cx).unwrap();
        let b = journal.res_get(&cx).unwrap();
        assert!(b.seq > a.seq);
        assert!(!journal.is_stable(a.seq));

        journal.flush_seq(&cx, b.seq).unwrap();
        assert!(journal.is_stable(a.seq));
        assert!(journal.is_stable(b.seq));
    }

    #[test]
    fn keys_recorded_under_seq() {
        let cx = test_cx();
        let journal = Journal::new();
        let res = journal.res_get(&cx).unwrap();
        journal.add_keys(&res, &mk_key());
        journal.add_keys(&res, &mk_key());
        assert_eq!(journal.keys_at(res.seq).len(), 2);
        journal.res_put(res);
    }

    #[test]
    fn window_exhaustion_reports_full() {
        let cx = test_cx();
        let journal = Journal::with_window(2);
        let a = journal.res_get(&cx).unwrap();
        let _b = journal.res_get(&cx).unwrap();
        assert!(matches!(journal.res_get(&cx), Err(DfsError::JournalFull)));

        // Flushing reclaims the window.
        journal.flush_seq(&cx, JournalSeq(2)).unwrap();
        assert!(journal.res_get(&cx).is_ok());
        let _ = a;
    }

    #[test]
    fn pinned_entries_survive_flush() {
        let cx = test_cx();
        let journal = Journal::with_window(8);
        let a = journal.res_get(&cx).unwrap();
        journal.add_keys(&a, &mk_key());
        journal.pin(a.seq);
        let seq = a.seq;
        journal.res_put(a);

        journal.flush_seq(&cx, seq).unwrap();
        assert_eq!(journal.keys_at(seq).len(), 1);

        journal.unpin(seq);
        journal.flush_seq(&cx, seq).unwrap();
        assert_eq!(journal.keys_at(seq).len(), 0);
    }

    #[test]
    fn error_state_poisons_reservations() {
        let cx = test_cx();
        let journal = Journal::new();
        journal.set_error();
        assert!(matches!(journal.res_get(&cx), Err(DfsError::JournalError)));
        assert!(matches!(
            journal.flush_seq(&cx, JournalSeq(1)),
            Err(DfsError::JournalError)
        ));
    }
}
