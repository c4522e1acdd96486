//! Multi-producer, multi-consumer ring queue.
//!
//! The queue lives in memory shared between the worker processes and moves
//! opaque packet handles between pipeline stages. A producer claims a slot
//! by advancing `producer.head` with a CAS, writes the handle, then
//! publishes it by advancing `producer.tail` in slot order. Consumers do
//! the mirrored dance on their own span. A slot is therefore never visible
//! to a consumer before the producer that claimed it has finished writing.
//!
//! Head and tail are free-running 32-bit counters; wrap-around is handled
//! by modular subtraction. Everything is sequentially consistent.

use std::hint;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering::SeqCst};

/// Hard upper bound on ring capacity; the slot array is sized for it.
pub const RING_MAX_CAPACITY: usize = 4096;

/// The capacity used for all inter-stage queues.
pub const RING_DEFAULT_CAPACITY: usize = 1024;

#[repr(C)]
#[derive(Default)]
struct Span {
    head: AtomicU32,
    tail: AtomicU32,
}

/// A bounded MPMC queue of `usize` handles.
///
/// The structure is `repr(C)` so it can be placed in a shared mapping and
/// used concurrently from several processes. Capacity must be a power of
/// two no larger than [`RING_MAX_CAPACITY`].
#[repr(C)]
pub struct Ring {
    capacity: u32,
    mask: u32,
    producer: Span,
    consumer: Span,
    data: [AtomicUsize; RING_MAX_CAPACITY],
}

impl Ring {
    /// Initialise a ring in place, typically inside a freshly mapped
    /// (zeroed) shared region.
    pub fn init(&mut self, capacity: usize) {
        assert!(
            capacity > 0 && capacity <= RING_MAX_CAPACITY && capacity.is_power_of_two(),
            "ring capacity must be a power of two <= {}",
            RING_MAX_CAPACITY
        );

        self.capacity = capacity as u32;
        self.mask = capacity as u32 - 1;
        self.producer = Span::default();
        self.consumer = Span::default();
        for slot in self.data.iter() {
            slot.store(0, SeqCst);
        }
    }

    /// Heap-allocate an initialised ring. Used by in-process consumers
    /// such as the test harness; the daemon itself places rings in shared
    /// memory via [`crate::shm::Shared`].
    pub fn with_capacity(capacity: usize) -> Box<Ring> {
        let mut ring = Box::new(Ring {
            capacity: 0,
            mask: 0,
            producer: Span::default(),
            consumer: Span::default(),
            data: std::array::from_fn(|_| AtomicUsize::new(0)),
        });
        ring.init(capacity);
        ring
    }

    /// Number of entries ready to be dequeued. Consumer-side view.
    pub fn pending(&self) -> usize {
        let head = self.consumer.head.load(SeqCst);
        let tail = self.producer.tail.load(SeqCst);
        tail.wrapping_sub(head) as usize
    }

    /// Number of free slots. Producer-side view.
    pub fn available(&self) -> usize {
        let head = self.producer.head.load(SeqCst);
        let tail = self.consumer.tail.load(SeqCst);
        self.capacity.wrapping_add(tail.wrapping_sub(head)) as usize
    }

    /// Queue a handle. Returns false when the ring is full; the caller
    /// owns the handle again and must release the packet behind it.
    pub fn push(&self, value: usize) -> bool {
        loop {
            let head = self.producer.head.load(SeqCst);
            let tail = self.consumer.tail.load(SeqCst);

            if self.capacity.wrapping_add(tail.wrapping_sub(head)) == 0 {
                return false;
            }

            let next = head.wrapping_add(1);
            if self
                .producer
                .head
                .compare_exchange(head, next, SeqCst, SeqCst)
                .is_err()
            {
                continue;
            }

            self.data[(head & self.mask) as usize].store(value, SeqCst);

            // Publish in slot order: wait for producers of earlier slots.
            while self
                .producer
                .tail
                .compare_exchange(head, next, SeqCst, SeqCst)
                .is_err()
            {
                hint::spin_loop();
            }

            return true;
        }
    }

    /// Dequeue a handle, or None when the ring is empty.
    pub fn pop(&self) -> Option<usize> {
        loop {
            let head = self.consumer.head.load(SeqCst);
            let tail = self.producer.tail.load(SeqCst);

            if tail.wrapping_sub(head) == 0 {
                return None;
            }

            let next = head.wrapping_add(1);
            if self
                .consumer
                .head
                .compare_exchange(head, next, SeqCst, SeqCst)
                .is_err()
            {
                continue;
            }

            let value = self.data[(head & self.mask) as usize].load(SeqCst);

            while self
                .consumer
                .tail
                .compare_exchange(head, next, SeqCst, SeqCst)
                .is_err()
            {
                hint::spin_loop();
            }

            return Some(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order_single_producer() {
        let ring = Ring::with_capacity(8);
        for v in 1..=5usize {
            assert!(ring.push(v));
        }
        assert_eq!(ring.pending(), 5);
        for v in 1..=5usize {
            assert_eq!(ring.pop(), Some(v));
        }
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn full_after_exactly_capacity() {
        let ring = Ring::with_capacity(1024);
        for v in 0..1024usize {
            assert!(ring.push(v), "push {} should succeed", v);
        }
        assert!(!ring.push(9999), "push past capacity must report full");
        assert_eq!(ring.available(), 0);
        assert_eq!(ring.pop(), Some(0));
        assert!(ring.push(9999), "one slot frees up after a pop");
    }

    #[test]
    fn counters_wrap_around() {
        let ring = Ring::with_capacity(4);
        // Cycle well past u32-worth of index bits on a tiny ring.
        for round in 0..10_000usize {
            assert!(ring.push(round));
            assert_eq!(ring.pop(), Some(round));
        }
        assert_eq!(ring.pending(), 0);
        assert_eq!(ring.available(), 4);
    }

    #[test]
    fn concurrent_no_duplicates_and_conserved() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: usize = 10_000;

        let ring: Arc<Ring> = Arc::from(Ring::with_capacity(256));
        let mut handles = Vec::new();

        for p in 0..PRODUCERS {
            let ring = Arc::clone(&ring);
            handles.push(thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    // Handles are globally unique; 0 is reserved since the
                    // slot array starts zeroed.
                    let value = 1 + p * PER_PRODUCER + i;
                    while !ring.push(value) {
                        thread::yield_now();
                    }
                }
            }));
        }

        let mut consumers = Vec::new();
        for _ in 0..CONSUMERS {
            let ring = Arc::clone(&ring);
            consumers.push(thread::spawn(move || {
                let mut seen = Vec::new();
                while seen.len() < PRODUCERS * PER_PRODUCER / CONSUMERS {
                    if let Some(v) = ring.pop() {
                        seen.push(v);
                    } else {
                        thread::yield_now();
                    }
                }
                seen
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        let mut all = HashSet::new();
        let mut total = 0usize;
        for c in consumers {
            for v in c.join().unwrap() {
                assert!(all.insert(v), "handle {} delivered twice", v);
                total += 1;
            }
        }
        assert_eq!(total + ring.pending(), PRODUCERS * PER_PRODUCER);
        // Drain whatever the consumers left behind.
        while let Some(v) = ring.pop() {
            assert!(all.insert(v), "handle {} delivered twice", v);
            total += 1;
        }
        assert_eq!(total, PRODUCERS * PER_PRODUCER);
        assert_eq!(ring.pending(), 0);
    }
}
