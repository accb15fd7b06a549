//! Lock-free MPSC ingress queue for externally submitted tasks.
//!
//! A Michael & Scott non-blocking queue: a singly-linked list with a
//! sentinel head, `head`/`tail` atomics, and a two-step enqueue (link, then
//! help-swing `tail`) so progress never depends on any one producer
//! finishing. Only the loop thread calls [`Ingress::pop`] /
//! [`Ingress::pop_batch`]; that single-consumer assumption is what lets the
//! dequeued sentinel be freed immediately, with no hazard pointers or
//! epoch reclamation needed.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::Task;

struct Node {
    data: UnsafeCell<Option<Task>>,
    next: AtomicPtr<Node>,
}

impl Node {
    fn sentinel() -> *mut Node {
        Box::into_raw(Box::new(Node {
            data: UnsafeCell::new(None),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }

    fn with_task(task: Task) -> *mut Node {
        Box::into_raw(Box::new(Node {
            data: UnsafeCell::new(Some(task)),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

/// Lock-free multi-producer single-consumer task queue.
pub struct Ingress {
    head: AtomicPtr<Node>,
    tail: AtomicPtr<Node>,
    approx_len: AtomicUsize,
}

// SAFETY: all node data is only read by whichever side (producer writing
// before the publishing CAS, consumer reading after observing the link)
// legitimately owns it at that instant; see the comment on each access.
unsafe impl Send for Ingress {}
unsafe impl Sync for Ingress {}

impl Default for Ingress {
    fn default() -> Self {
        Self::new()
    }
}

impl Ingress {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        let sentinel = Node::sentinel();
        Self {
            head: AtomicPtr::new(sentinel),
            tail: AtomicPtr::new(sentinel),
            approx_len: AtomicUsize::new(0),
        }
    }

    /// Enqueues a task. Wait-free modulo the helping loop; never blocks and
    /// never drops work.
    pub fn push(&self, task: Task) {
        let new_node = Node::with_task(task);
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            // SAFETY: `tail` was loaded from a live atomic and nodes are
            // only freed from the head side, which this (tail-side) code
            // never touches.
            let tail_ref = unsafe { &*tail };
            let next = tail_ref.next.load(Ordering::Acquire);

            if tail != self.tail.load(Ordering::Acquire) {
                continue;
            }

            if next.is_null() {
                if tail_ref
                    .next
                    .compare_exchange(ptr::null_mut(), new_node, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let _ = self.tail.compare_exchange(
                        tail,
                        new_node,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    self.approx_len.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            } else {
                // Another producer linked but hasn't swung `tail` yet; help
                // it along and retry.
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Ordering::AcqRel, Ordering::Acquire);
            }
        }
    }

    /// Pops the next task, or `None` if empty. Must only be called from the
    /// loop thread.
    pub fn pop(&self) -> Option<Task> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            // SAFETY: `head` is only freed after a successful head-swing in
            // this same single-consumer function, so a value we just loaded
            // is guaranteed live.
            let head_ref = unsafe { &*head };
            let next = head_ref.next.load(Ordering::Acquire);

            if head != self.head.load(Ordering::Acquire) {
                continue;
            }

            if head == tail {
                if next.is_null() {
                    return None;
                }
                // Tail lags the true end of the list; help it along, then
                // re-check rather than returning a false empty.
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Ordering::AcqRel, Ordering::Acquire);
                continue;
            }

            if next.is_null() {
                // A producer has reserved this position but not finished
                // linking. The contract requires spinning here rather than
                // reporting empty, since a subsequent call would find the
                // item.
                std::hint::spin_loop();
                continue;
            }

            // SAFETY: `next` outlives this call: it only gets freed once a
            // later pop head-swings past it, which cannot race us (single
            // consumer).
            let task = unsafe { (*next).data.get().as_mut().unwrap_unchecked().take() };

            if self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // SAFETY: single consumer, so no other reader can be
                // holding `head`; `head` is the old sentinel, now detached.
                unsafe { drop(Box::from_raw(head)) };
                self.approx_len.fetch_sub(1, Ordering::Relaxed);
                return task;
            }
            // Single-consumer invariant means this CAS cannot fail; loop
            // defensively rather than assume it.
        }
    }

    /// Pops up to `max` tasks into `out`, applying the same spin discipline
    /// as [`Self::pop`] per item so a batched drain never misses an
    /// in-flight item that a plain `pop` would have found.
    pub fn pop_batch(&self, out: &mut Vec<Task>, max: usize) {
        for _ in 0..max {
            match self.pop() {
                Some(task) => out.push(task),
                None => break,
            }
        }
    }

    /// Approximate queue depth.
    #[must_use]
    pub fn len(&self) -> usize {
        self.approx_len.load(Ordering::Relaxed)
    }

    /// `true` iff the approximate depth is zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for Ingress {
    fn drop(&mut self) {
        while self.pop().is_some() {}
        let sentinel = self.head.load(Ordering::Acquire);
        // SAFETY: no consumer races us during drop; free the final sentinel.
        unsafe { drop(Box::from_raw(sentinel)) };
    }
}
