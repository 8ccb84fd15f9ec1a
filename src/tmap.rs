//! The sample_id ↔ UTC time map.
//!
//! A circular array of [`TimeMap`] entries, monotone non-decreasing in both
//! offset time and offset counter. One writer (the ingest path) and any
//! number of readers share the map across threads through an `Arc`.
//!
//! Writers never wait for readers: while any reader is inside its
//! `reader_enter`/`reader_exit` bracket, writer updates are stashed in
//! pending slots and applied by the last exiting reader. Readers therefore
//! observe a frozen ring for the whole bracket.

use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;

use crate::error::{ErrorCode, Result};
use crate::time::{TimeMap, UtcTime};

const INITIAL_CAPACITY: usize = 8;

struct State {
    /// Power-of-two capacity ring.
    ring: Vec<TimeMap>,
    /// Index of the oldest entry.
    start: usize,
    len: usize,
    reader_count: usize,
    pending_add: Option<TimeMap>,
    pending_expire: Option<u64>,
    pending_clear: bool,
}

impl State {
    fn get(&self, i: usize) -> TimeMap {
        self.ring[(self.start + i) & (self.ring.len() - 1)]
    }

    fn newest(&self) -> Option<TimeMap> {
        if self.len == 0 {
            None
        } else {
            Some(self.get(self.len - 1))
        }
    }

    fn apply_add(&mut self, entry: TimeMap) {
        if let Some(last) = self.newest() {
            if entry == last {
                // Duplicate adds coalesce with the newest entry.
                return;
            }
            if entry.offset_counter < last.offset_counter
                || entry.offset_time < last.offset_time
            {
                warn!(
                    "time map entry not monotone (counter {} < {}), dropped",
                    entry.offset_counter, last.offset_counter
                );
                return;
            }
        }
        if self.len == self.ring.len() {
            self.grow();
        }
        let cap = self.ring.len();
        self.ring[(self.start + self.len) & (cap - 1)] = entry;
        self.len += 1;
    }

    /// Doubles capacity, rebuilding the ring contiguous from index 0.
    fn grow(&mut self) {
        let mut next = vec![TimeMap::default(); self.ring.len() * 2];
        for i in 0..self.len {
            next[i] = self.get(i);
        }
        self.ring = next;
        self.start = 0;
    }

    fn apply_expire(&mut self, sample_id: u64) {
        // Keep the newest entry whose counter is at or below sample_id so
        // the id itself stays translatable.
        while self.len >= 2 && self.get(1).offset_counter <= sample_id {
            self.start = (self.start + 1) & (self.ring.len() - 1);
            self.len -= 1;
        }
    }

    fn apply_clear(&mut self) {
        self.start = 0;
        self.len = 0;
    }

    fn apply_pending(&mut self) {
        if self.pending_clear {
            self.pending_clear = false;
            self.apply_clear();
        }
        if let Some(sid) = self.pending_expire.take() {
            self.apply_expire(sid);
        }
        if let Some(entry) = self.pending_add.take() {
            self.apply_add(entry);
        }
    }

    /// Index of the governing entry for a counter value: the last entry
    /// with `offset_counter <= sid`, or the first entry when all are above.
    /// An interpolation guess keeps the scan O(1) for smooth maps.
    fn find_by_counter(&self, sid: u64) -> usize {
        let n = self.len;
        debug_assert!(n > 0);
        if n == 1 {
            return 0;
        }
        let first = self.get(0).offset_counter;
        let last = self.get(n - 1).offset_counter;
        let mut i = if last > first && sid > first {
            let frac = (sid - first) as f64 / (last - first) as f64;
            ((frac * (n - 1) as f64) as usize).min(n - 1)
        } else {
            0
        };
        while i + 1 < n && self.get(i + 1).offset_counter <= sid {
            i += 1;
        }
        while i > 0 && self.get(i).offset_counter > sid {
            i -= 1;
        }
        i
    }

    fn find_by_time(&self, t: UtcTime) -> usize {
        let n = self.len;
        debug_assert!(n > 0);
        if n == 1 {
            return 0;
        }
        let first = self.get(0).offset_time.q30();
        let last = self.get(n - 1).offset_time.q30();
        let mut i = if last > first && t.q30() > first {
            let frac = (t.q30() - first) as f64 / (last - first) as f64;
            ((frac * (n - 1) as f64) as usize).min(n - 1)
        } else {
            0
        };
        while i + 1 < n && self.get(i + 1).offset_time <= t {
            i += 1;
        }
        while i > 0 && self.get(i).offset_time > t {
            i -= 1;
        }
        i
    }
}

pub struct Tmap {
    state: Mutex<State>,
}

impl Tmap {
    /// Shared ownership replaces the reference counting of the handle-based
    /// design: clone the `Arc` before sharing across threads, drop it after
    /// use.
    pub fn new() -> Arc<Tmap> {
        Arc::new(Tmap {
            state: Mutex::new(State {
                ring: vec![TimeMap::default(); INITIAL_CAPACITY],
                start: 0,
                len: 0,
                reader_count: 0,
                pending_add: None,
                pending_expire: None,
                pending_clear: false,
            }),
        })
    }

    /// Appends or coalesces an entry. Deferred while readers are active.
    pub fn add(&self, entry: TimeMap) {
        if !entry.is_valid() {
            warn!("time map entry with invalid rate {}", entry.counter_rate);
            return;
        }
        let mut state = self.state.lock();
        if state.reader_count > 0 {
            state.pending_add = Some(entry);
        } else {
            state.apply_add(entry);
        }
    }

    /// Drops entries no longer needed to translate ids at or above
    /// `sample_id`. Deferred while readers are active.
    pub fn expire_by_sample_id(&self, sample_id: u64) {
        let mut state = self.state.lock();
        if state.reader_count > 0 {
            state.pending_expire = Some(sample_id);
        } else {
            state.apply_expire(sample_id);
        }
    }

    /// Removes all entries. Deferred while readers are active.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        if state.reader_count > 0 {
            state.pending_clear = true;
            state.pending_expire = None;
            state.pending_add = None;
        } else {
            state.apply_clear();
        }
    }

    /// Opens a read bracket; the ring will not change until the matching
    /// [`Tmap::reader_exit`].
    pub fn reader_enter(&self) {
        self.state.lock().reader_count += 1;
    }

    /// Closes a read bracket; the last reader out applies pending writes.
    pub fn reader_exit(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.reader_count > 0);
        state.reader_count -= 1;
        if state.reader_count == 0 {
            state.apply_pending();
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The entry at `index`, oldest first.
    pub fn get(&self, index: usize) -> Option<TimeMap> {
        let state = self.state.lock();
        if index < state.len {
            Some(state.get(index))
        } else {
            None
        }
    }

    /// Translates a sample id to UTC. `Unavailable` on an empty map.
    pub fn sample_id_to_timestamp(&self, sample_id: u64) -> Result<UtcTime> {
        let state = self.state.lock();
        if state.len == 0 {
            return Err(ErrorCode::Unavailable);
        }
        let entry = state.get(state.find_by_counter(sample_id));
        Ok(entry.counter_to_time(sample_id))
    }

    /// Translates a UTC time to a sample id. `Unavailable` on an empty map.
    pub fn timestamp_to_sample_id(&self, t: UtcTime) -> Result<u64> {
        let state = self.state.lock();
        if state.len == 0 {
            return Err(ErrorCode::Unavailable);
        }
        let entry = state.get(state.find_by_time(t));
        Ok(entry.time_to_counter(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::SECOND;

    // Epoch + 1 year.
    fn y() -> UtcTime {
        UtcTime::from_q30(365 * 24 * 3600 * SECOND)
    }

    fn entry(t: UtcTime, counter: u64, rate: f64) -> TimeMap {
        TimeMap::new(t, counter, rate)
    }

    #[test]
    fn empty_is_unavailable() {
        let tmap = Tmap::new();
        assert_eq!(
            tmap.sample_id_to_timestamp(0),
            Err(ErrorCode::Unavailable)
        );
        assert_eq!(
            tmap.timestamp_to_sample_id(UtcTime::EPOCH),
            Err(ErrorCode::Unavailable)
        );
    }

    #[test]
    fn monotone_lookup() {
        let tmap = Tmap::new();
        tmap.add(entry(y(), 1000, 1000.0));
        tmap.add(entry(y().add_q30(SECOND), 2000, 1010.0));
        tmap.add(entry(y().add_q30(2 * SECOND), 3010, 1020.0));
        assert_eq!(tmap.len(), 3);

        // 2505 is governed by the middle entry: Y + 1s + 505/1010 = Y + 1.5s.
        let t = tmap.sample_id_to_timestamp(2505).unwrap();
        let expect = y().add_q30(SECOND + SECOND / 2);
        assert!((t.delta_q30(expect)).abs() <= 1);

        // Before the first entry, the first entry governs.
        let t = tmap.sample_id_to_timestamp(0).unwrap();
        assert_eq!(t, y().add_q30(-SECOND));
        // After the last entry, the last entry governs.
        let t = tmap.sample_id_to_timestamp(4030).unwrap();
        let expect = y().add_q30(3 * SECOND);
        assert!((t.delta_q30(expect)).abs() <= 1);
    }

    #[test]
    fn round_trip_within_one_tick() {
        let tmap = Tmap::new();
        tmap.add(entry(y(), 1000, 1000.0));
        tmap.add(entry(y().add_q30(SECOND), 2000, 1010.0));
        tmap.add(entry(y().add_q30(2 * SECOND), 3010, 1020.0));
        for sid in [1000u64, 1500, 2000, 2505, 3010, 3500] {
            let t = tmap.sample_id_to_timestamp(sid).unwrap();
            let back = tmap.timestamp_to_sample_id(t).unwrap();
            assert!(back.abs_diff(sid) <= 1, "sid {sid} -> {back}");
        }
    }

    #[test]
    fn expire_keeps_governing_entry() {
        let tmap = Tmap::new();
        for i in 0..5u64 {
            tmap.add(entry(
                y().add_q30(i as i64 * SECOND),
                1000 + i * 1000,
                1000.0,
            ));
        }
        assert_eq!(tmap.len(), 5);
        tmap.expire_by_sample_id(2001);
        // Entry at counter 2000 still governs 2001; only the first is gone.
        assert_eq!(tmap.len(), 4);
        assert_eq!(tmap.get(0).unwrap().offset_counter, 2000);
    }

    #[test]
    fn duplicate_add_coalesces() {
        let tmap = Tmap::new();
        let e = entry(y(), 1000, 1000.0);
        tmap.add(e);
        tmap.add(e);
        assert_eq!(tmap.len(), 1);
    }

    #[test]
    fn non_monotone_add_is_dropped() {
        let tmap = Tmap::new();
        tmap.add(entry(y(), 2000, 1000.0));
        tmap.add(entry(y().add_q30(-SECOND), 1000, 1000.0));
        assert_eq!(tmap.len(), 1);
        assert_eq!(tmap.get(0).unwrap().offset_counter, 2000);
    }

    #[test]
    fn grows_past_initial_capacity() {
        let tmap = Tmap::new();
        for i in 0..100u64 {
            tmap.add(entry(y().add_q30(i as i64 * SECOND), i * 1000, 1000.0));
        }
        assert_eq!(tmap.len(), 100);
        assert_eq!(tmap.get(0).unwrap().offset_counter, 0);
        assert_eq!(tmap.get(99).unwrap().offset_counter, 99_000);
    }

    #[test]
    fn writes_defer_while_readers_active() {
        let tmap = Tmap::new();
        tmap.add(entry(y(), 1000, 1000.0));

        tmap.reader_enter();
        tmap.add(entry(y().add_q30(SECOND), 2000, 1000.0));
        tmap.expire_by_sample_id(5000);
        // Nothing applied while the bracket is open.
        assert_eq!(tmap.len(), 1);
        tmap.reader_exit();
        // The last reader out applies expire then add: expire keeps the
        // 1000 entry (nothing newer at or below 5000 yet), then the add
        // lands.
        assert_eq!(tmap.len(), 2);
        assert_eq!(tmap.get(1).unwrap().offset_counter, 2000);
    }

    #[test]
    fn nested_readers_apply_on_last_exit() {
        let tmap = Tmap::new();
        tmap.add(entry(y(), 1000, 1000.0));
        tmap.reader_enter();
        tmap.reader_enter();
        tmap.clear();
        tmap.reader_exit();
        assert_eq!(tmap.len(), 1);
        tmap.reader_exit();
        assert_eq!(tmap.len(), 0);
    }
}
