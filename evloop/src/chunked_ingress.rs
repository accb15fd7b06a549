//! Chunked-array variant of the ingress queue.
//!
//! Each [`Chunk`] is a fixed 128-slot array; chunks chain together (again
//! Michael & Scott style) once a chunk fills while items are still
//! outstanding. The default, steady-state case — push one, pop one — never
//! needs a second chunk at all: once the read and write cursors converge on
//! a chunk that is still the sole chunk in the queue, both cursors rewind
//! to zero instead of marching toward capacity, so a ping-pong workload
//! allocates exactly one chunk for its entire lifetime. Chunks that do get
//! detached from the head once fully drained are returned to a process-wide
//! free-list pool, sanitized, rather than dropped — the single-consumer
//! slot `.take()` during pop plus the pool's entry sanitation are what keep
//! a reused chunk from holding onto a stale task's captured state.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use crate::Task;

/// Slots per chunk.
pub const CHUNK_SIZE: usize = 128;

struct Chunk {
    slots: Box<[UnsafeCell<Option<Task>>; CHUNK_SIZE]>,
    ready: Box<[AtomicBool; CHUNK_SIZE]>,
    pos: AtomicUsize,
    read_pos: AtomicUsize,
    next: AtomicPtr<Chunk>,
}

// SAFETY: each slot is written by at most one producer (the one that won
// the CAS reserving that index) and read by at most the single consumer,
// after observing `ready[idx]`.
unsafe impl Sync for Chunk {}

impl Chunk {
    fn new_boxed() -> *mut Chunk {
        let slots: Box<[UnsafeCell<Option<Task>>; CHUNK_SIZE]> =
            Box::new(std::array::from_fn(|_| UnsafeCell::new(None)));
        let ready: Box<[AtomicBool; CHUNK_SIZE]> =
            Box::new(std::array::from_fn(|_| AtomicBool::new(false)));
        Box::into_raw(Box::new(Chunk {
            slots,
            ready,
            pos: AtomicUsize::new(0),
            read_pos: AtomicUsize::new(0),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }

    /// Resets a fully-drained chunk's cursors to zero so it can be reused
    /// either in place or via the free-list, without reallocating.
    fn reset_for_reuse(&self) {
        self.pos.store(0, Ordering::Relaxed);
        self.read_pos.store(0, Ordering::Relaxed);
        self.next.store(ptr::null_mut(), Ordering::Relaxed);
    }
}

/// Lock-free Treiber stack of chunks awaiting reuse.
struct ChunkPool {
    head: AtomicPtr<Chunk>,
}

impl ChunkPool {
    const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn push(&self, chunk: *mut Chunk) {
        // SAFETY: caller guarantees `chunk` is fully drained and otherwise
        // unreferenced.
        let chunk_ref = unsafe { &*chunk };
        loop {
            let head = self.head.load(Ordering::Acquire);
            chunk_ref.next.store(head, Ordering::Relaxed);
            if self
                .head
                .compare_exchange_weak(head, chunk, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    fn pop(&self) -> Option<*mut Chunk> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            if head.is_null() {
                return None;
            }
            // SAFETY: pool entries are only freed by `Drop`, never while
            // reachable from `head`.
            let next = unsafe { &*head }.next.load(Ordering::Acquire);
            if self
                .head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(head);
            }
        }
    }
}

impl Drop for ChunkPool {
    fn drop(&mut self) {
        while let Some(chunk) = self.pop() {
            // SAFETY: uniquely owned once popped from the pool.
            unsafe { drop(Box::from_raw(chunk)) };
        }
    }
}

/// Chunked variant of the MPSC ingress queue (see module docs).
pub struct ChunkedIngress {
    head: AtomicPtr<Chunk>,
    tail: AtomicPtr<Chunk>,
    pool: ChunkPool,
    approx_len: AtomicUsize,
}

unsafe impl Send for ChunkedIngress {}
unsafe impl Sync for ChunkedIngress {}

impl Default for ChunkedIngress {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedIngress {
    /// Creates an empty queue with one pre-allocated chunk.
    #[must_use]
    pub fn new() -> Self {
        let first = Chunk::new_boxed();
        Self {
            head: AtomicPtr::new(first),
            tail: AtomicPtr::new(first),
            pool: ChunkPool::new(),
            approx_len: AtomicUsize::new(0),
        }
    }

    fn acquire_chunk(&self) -> *mut Chunk {
        if let Some(chunk) = self.pool.pop() {
            // SAFETY: the pool only ever holds fully-sanitized chunks.
            unsafe { &*chunk }.reset_for_reuse();
            chunk
        } else {
            Chunk::new_boxed()
        }
    }

    /// Enqueues a task.
    pub fn push(&self, task: Task) {
        loop {
            let tail_ptr = self.tail.load(Ordering::Acquire);
            // SAFETY: chunks are never freed while reachable from `tail`.
            let chunk = unsafe { &*tail_ptr };
            let pos = chunk.pos.load(Ordering::Acquire);

            if pos >= CHUNK_SIZE {
                self.grow_tail(tail_ptr, chunk);
                continue;
            }

            if chunk
                .pos
                .compare_exchange_weak(pos, pos + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            // SAFETY: won the CAS reserving slot `pos`; exclusive writer
            // until `ready[pos]` is published.
            unsafe { *chunk.slots[pos].get() = Some(task) };
            chunk.ready[pos].store(true, Ordering::Release);
            self.approx_len.fetch_add(1, Ordering::Relaxed);
            return;
        }
    }

    fn grow_tail(&self, tail_ptr: *mut Chunk, chunk: &Chunk) {
        let next = chunk.next.load(Ordering::Acquire);
        if next.is_null() {
            let new_chunk = self.acquire_chunk();
            match chunk.next.compare_exchange(
                ptr::null_mut(),
                new_chunk,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(()) => {
                    let _ = self.tail.compare_exchange(
                        tail_ptr,
                        new_chunk,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                }
                Err(actual) => {
                    // Someone else linked first; return our spare and help
                    // swing `tail`.
                    // SAFETY: `new_chunk` was never published anywhere.
                    unsafe { &*new_chunk }.reset_for_reuse();
                    self.pool.push(new_chunk);
                    let _ = self.tail.compare_exchange(
                        tail_ptr,
                        actual,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                }
            }
        } else {
            let _ = self
                .tail
                .compare_exchange(tail_ptr, next, Ordering::AcqRel, Ordering::Acquire);
        }
    }

    /// Pops the next task, or `None` if empty. Loop-thread only.
    pub fn pop(&self) -> Option<Task> {
        loop {
            let head_ptr = self.head.load(Ordering::Acquire);
            // SAFETY: single consumer; the head chunk is never freed while
            // reachable from `self.head`.
            let chunk = unsafe { &*head_ptr };
            let read_pos = chunk.read_pos.load(Ordering::Relaxed);
            let written = chunk.pos.load(Ordering::Acquire);

            if read_pos == written {
                if head_ptr == self.tail.load(Ordering::Acquire) {
                    return None;
                }
                if written >= CHUNK_SIZE {
                    self.advance_head(head_ptr, chunk);
                    continue;
                }
                return None;
            }

            if !chunk.ready[read_pos].load(Ordering::Acquire) {
                // A producer reserved this index but hasn't published the
                // write yet; spin rather than report a false empty.
                std::hint::spin_loop();
                continue;
            }

            // SAFETY: `ready` acquire-load observed true, publishing the
            // producer's write.
            let task = unsafe { (*chunk.slots[read_pos].get()).take() };
            chunk.ready[read_pos].store(false, Ordering::Release);
            chunk.read_pos.store(read_pos + 1, Ordering::Release);
            self.approx_len.fetch_sub(1, Ordering::Relaxed);

            let is_sole_chunk = head_ptr == self.tail.load(Ordering::Acquire);
            if is_sole_chunk
                && chunk
                    .pos
                    .compare_exchange(read_pos + 1, 0, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                // Cursors converged and no other chunk exists: rewind in
                // place instead of marching toward CHUNK_SIZE.
                chunk.read_pos.store(0, Ordering::Release);
            } else if read_pos + 1 >= CHUNK_SIZE {
                self.advance_head(head_ptr, chunk);
            }

            return Some(task);
        }
    }

    fn advance_head(&self, head_ptr: *mut Chunk, chunk: &Chunk) {
        let next = chunk.next.load(Ordering::Acquire);
        if next.is_null() {
            return;
        }
        if self
            .head
            .compare_exchange(head_ptr, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            chunk.reset_for_reuse();
            self.pool.push(head_ptr);
        }
    }

    /// Pops up to `max` tasks into `out`, applying the same spin discipline
    /// per item as [`Self::pop`].
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

impl Drop for ChunkedIngress {
    fn drop(&mut self) {
        while self.pop().is_some() {}
        let mut cur = self.head.load(Ordering::Acquire);
        while !cur.is_null() {
            // SAFETY: no consumer races us during drop.
            let next = unsafe { &*cur }.next.load(Ordering::Acquire);
            unsafe { drop(Box::from_raw(cur)) };
            cur = next;
        }
    }
}


#[cfg(test)]
mod prop_tests {
    use std::sync::{Arc, Mutex};

    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn fifo_preserved_for_any_single_producer_run_length(n in 1usize..2_000) {
            let q = ChunkedIngress::new();
            let order = Arc::new(Mutex::new(Vec::new()));
            for i in 0..n {
                let order = order.clone();
                q.push(Box::new(move || order.lock().unwrap().push(i)));
            }
            while let Some(t) = q.pop() {
                t();
            }
            prop_assert_eq!(*order.lock().unwrap(), (0..n).collect::<Vec<_>>());
        }
    }
}
