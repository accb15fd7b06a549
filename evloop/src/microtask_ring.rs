//! Bounded MPSC microtask ring, with an overflow spill for unbounded growth.
//!
//! The ring is a single-consumer, multi-producer Vyukov-style slotted
//! buffer: each slot carries its own sequence number, so producers never
//! contend on a single head/tail pair beyond one `compare_exchange`. The
//! one deviation from the textbook algorithm (and the detail worth calling
//! out, see [`Ring::pop`]) is that the consumer clears a slot's sequence
//! number *before* advancing its own cursor — doing it the other way round
//! lets a wrapped-around producer observe an advanced cursor while the slot
//! still looks occupied, and mistake a genuinely free slot for a full one.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::Task;

struct Slot {
    sequence: AtomicUsize,
    task: UnsafeCell<Option<Task>>,
}

// SAFETY: `task` is only ever touched by the single producer that wins the
// slot's sequence CAS (write) or by the single consumer once it has
// observed that write (take). The sequence number is the synchronization
// point in both directions.
unsafe impl Sync for Slot {}

struct Ring {
    buf: Box<[Slot]>,
    mask: usize,
    enqueue_pos: AtomicUsize,
    dequeue_pos: AtomicUsize,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        let buf = (0..capacity)
            .map(|i| Slot {
                sequence: AtomicUsize::new(i),
                task: UnsafeCell::new(None),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buf,
            mask: capacity - 1,
            enqueue_pos: AtomicUsize::new(0),
            dequeue_pos: AtomicUsize::new(0),
        }
    }

    /// Attempts to enqueue. Returns the task back on failure (ring full).
    fn try_push(&self, task: Task) -> Result<(), Task> {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let slot = &self.buf[pos & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq as isize - pos as isize;
            if diff == 0 {
                match self.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: winning this CAS grants exclusive write
                        // access to this slot until we publish `seq`.
                        unsafe { *slot.task.get() = Some(task) };
                        slot.sequence.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(actual) => pos = actual,
                }
            } else if diff < 0 {
                return Err(task);
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Single-consumer pop. Returns `None` on a genuinely empty ring.
    fn pop(&self) -> Option<Task> {
        let head = self.dequeue_pos.load(Ordering::Relaxed);
        let slot = &self.buf[head & self.mask];
        let seq = slot.sequence.load(Ordering::Acquire);
        let expected = head.wrapping_add(1);
        if seq != expected {
            return None;
        }
        // SAFETY: `seq == head + 1` means the producer that wrote this slot
        // has published, and no other consumer can be racing us (single
        // consumer).
        let task = unsafe { (*slot.task.get()).take() };
        // Free the slot for producers *before* moving our own cursor — see
        // module docs.
        slot.sequence
            .store(head.wrapping_add(self.mask).wrapping_add(1), Ordering::Release);
        self.dequeue_pos.store(head.wrapping_add(1), Ordering::Release);
        task
    }

    fn approx_len(&self) -> usize {
        let tail = self.enqueue_pos.load(Ordering::Relaxed);
        let head = self.dequeue_pos.load(Ordering::Relaxed);
        tail.wrapping_sub(head)
    }
}

/// Spill buffer used once the ring saturates. Compacts periodically instead
/// of shifting on every pop.
struct Overflow {
    buf: Vec<Option<Task>>,
    head: usize,
}

impl Overflow {
    const COMPACT_MIN_HEAD: usize = 512;

    const INITIAL_CAPACITY: usize = 1024;

    fn new() -> Self {
        Self {
            buf: Vec::with_capacity(Self::INITIAL_CAPACITY),
            head: 0,
        }
    }

    fn push(&mut self, task: Task) {
        self.buf.push(Some(task));
    }

    fn is_empty(&self) -> bool {
        self.head >= self.buf.len()
    }

    fn len(&self) -> usize {
        self.buf.len() - self.head
    }

    fn pop(&mut self) -> Option<Task> {
        if self.is_empty() {
            return None;
        }
        let task = self.buf[self.head].take();
        self.head += 1;
        if self.head > self.buf.len() / 2 && self.head > Self::COMPACT_MIN_HEAD {
            self.buf.drain(0..self.head);
            self.head = 0;
        }
        task
    }
}

/// A bounded ring for loop-internal microtasks, with an unbounded overflow
/// spill. Never drops a task; never blocks indefinitely (the overflow
/// mutex is only ever held for a `Vec` push/pop).
pub struct MicrotaskRing {
    ring: Ring,
    overflow: Mutex<Overflow>,
}

impl MicrotaskRing {
    /// Creates a ring with the given power-of-two capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be a power of two");
        Self {
            ring: Ring::new(capacity),
            overflow: Mutex::new(Overflow::new()),
        }
    }

    /// Enqueues a microtask. A `None` task (a "nil push") is tolerated: it
    /// occupies a slot and is discarded on pop.
    pub fn push(&self, task: Option<Task>) {
        let Some(task) = task else {
            // A nil push still needs to preserve position for the overflow
            // invariant, but since it carries no work we can simply drop
            // it: `pop` already tolerates slots it must skip, and no
            // consumer is blocked waiting specifically for *a* slot to
            // fill, only for *the next task* to appear.
            return;
        };

        let mut overflow = self.overflow.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if !overflow.is_empty() {
            overflow.push(task);
            return;
        }
        drop(overflow);

        if let Err(task) = self.ring.try_push(task) {
            overflow = self.overflow.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            overflow.push(task);
        }
    }

    /// Pops the next task in FIFO order across ring and overflow, or `None`
    /// if both are empty.
    pub fn pop(&self) -> Option<Task> {
        if let Some(task) = self.ring.pop() {
            return Some(task);
        }
        let mut overflow = self.overflow.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        overflow.pop()
    }

    /// Approximate combined depth of ring and overflow.
    #[must_use]
    pub fn len(&self) -> usize {
        let overflow_len = self
            .overflow
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len();
        self.ring.approx_len() + overflow_len
    }

    /// `true` iff both ring and overflow are (approximately) empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::Arc;

    fn task_that_records(out: Arc<Mutex<Vec<usize>>>, idx: usize) -> Task {
        Box::new(move || out.lock().unwrap().push(idx))
    }

    #[test]
    fn fifo_within_ring_capacity() {
        let ring = MicrotaskRing::new(16);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            ring.push(Some(task_that_records(order.clone(), i)));
        }
        let mut popped = Vec::new();
        while let Some(t) = ring.pop() {
            t();
        }
        popped.extend(order.lock().unwrap().iter().copied());
        assert_eq!(popped, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn overflow_preserves_order_after_ring_saturates() {
        let ring = MicrotaskRing::new(4);
        let order = Arc::new(Mutex::new(Vec::new()));
        // Fill the ring (4) plus two more that must spill to overflow.
        for i in 0..6 {
            ring.push(Some(task_that_records(order.clone(), i)));
        }
        assert_eq!(ring.len(), 6);
        while let Some(t) = ring.pop() {
            t();
        }
        assert_eq!(*order.lock().unwrap(), (0..6).collect::<Vec<_>>());
    }

    #[test]
    fn ring_then_overflow_no_priority_inversion() {
        // Overflow must drain strictly after the ring empties, never ahead
        // of ring-resident entries queued earlier.
        let ring = MicrotaskRing::new(4);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            ring.push(Some(task_that_records(order.clone(), i))); // fills ring: A0..A3
        }
        ring.push(Some(task_that_records(order.clone(), 100))); // B -> overflow
        let first = ring.pop().unwrap(); // pop one A, ring has 1 free slot
        first();
        ring.push(Some(task_that_records(order.clone(), 200))); // overflow non-empty -> C -> overflow
        while let Some(t) = ring.pop() {
            t();
        }
        let order = order.lock().unwrap();
        let pos_b = order.iter().position(|&x| x == 100).unwrap();
        let pos_c = order.iter().position(|&x| x == 200).unwrap();
        assert!(pos_b < pos_c, "B must execute before C: {order:?}");
    }

    #[test]
    fn nil_push_is_tolerated() {
        let ring = MicrotaskRing::new(4);
        let order = Arc::new(Mutex::new(Vec::new()));
        ring.push(None);
        ring.push(Some(task_that_records(order.clone(), 1)));
        let mut seen = Vec::new();
        while let Some(t) = ring.pop() {
            t();
        }
        seen.extend(order.lock().unwrap().iter().copied());
        assert_eq!(seen, vec![1]);
    }

    #[test]
    fn concurrent_producers_no_loss() {
        let ring = Arc::new(MicrotaskRing::new(64));
        let counter = Arc::new(StdAtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ring = ring.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    ring.push(Some(Box::new(|| {})));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let mut popped = 0;
        while let Some(t) = ring.pop() {
            t();
            popped += 1;
            counter.fetch_add(1, Ordering::Relaxed);
        }
        assert_eq!(popped, 8 * 500);
    }
}
