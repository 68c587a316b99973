use crate::backoff::Backoff;
use crate::ring::InputRing;
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Work item handed from producers to the consumer.
///
/// `Records` says "this ring has frames from its current start cursor up to
/// `end`"; the `Arc` keeps the ring alive for as long as the extent is in
/// flight, so a producer thread may exit with extents still queued.
/// `Shutdown` and `PanicShutdown` are the queue sentinels: FIFO ordering
/// guarantees every earlier submission drains before the consumer acts on
/// them.
pub(crate) enum Extent {
    Records { ring: Arc<InputRing>, end: usize },
    Shutdown,
    PanicShutdown,
}

// =============================================================================
// MEMORY ORDERING PROTOCOL
// =============================================================================
//
// Bounded multi-producer/single-consumer array queue. Each slot carries a
// sequence number:
//
//   sequence == pos              slot free, a producer may claim it
//   sequence == pos + 1          slot holds the value published at pos
//   otherwise                    another producer is ahead; retry or full
//
// **Producer:** claim a position with a CAS on `tail` (relaxed; the slot
// sequence does the publishing), write the value, then store
// `sequence = pos + 1` with Release. That Release is also what makes the
// frame bytes the extent points at visible to the consumer.
//
// **Consumer:** read the slot sequence with Acquire; `pos + 1` means the
// value (and everything written before its Release) is visible. Take the
// value, then store `sequence = pos + capacity` with Release to hand the
// slot back to producers one lap later.
//
// =============================================================================

struct Slot {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<Extent>>,
}

/// Bounded lock-free MPSC queue of commit extents.
pub(crate) struct SubmissionQueue {
    slots: Box<[Slot]>,
    mask: usize,
    /// Next position to claim (producers).
    tail: CachePadded<AtomicUsize>,
    /// Next position to take (consumer).
    head: CachePadded<AtomicUsize>,
}

// SAFETY: slots are handed between threads by the sequence-number protocol
// above; a slot's value is only touched by the thread that owns it per that
// protocol.
unsafe impl Send for SubmissionQueue {}
unsafe impl Sync for SubmissionQueue {}

impl SubmissionQueue {
    /// Creates a queue with `capacity` slots (must be a power of two).
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "queue capacity must be a power of two");
        let slots = (0..capacity)
            .map(|i| Slot {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            slots,
            mask: capacity - 1,
            tail: CachePadded::new(AtomicUsize::new(0)),
            head: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Attempts to enqueue; hands the extent back if the queue is full.
    pub(crate) fn push(&self, extent: Extent) -> Result<(), Extent> {
        let mut backoff = Backoff::new();
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let sequence = slot.sequence.load(Ordering::Acquire);

            if sequence == pos {
                match self
                    .tail
                    .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                {
                    Ok(_) => {
                        // SAFETY: the CAS claimed slot ownership for pos; no
                        // other thread touches the value until the Release
                        // below.
                        unsafe { (*slot.value.get()).write(extent) };
                        slot.sequence.store(pos + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => {
                        pos = current;
                        backoff.lost_race();
                    }
                }
            } else if sequence < pos {
                // The consumer has not recycled this slot yet: full.
                return Err(extent);
            } else {
                // Another producer claimed pos but has not published; chase
                // the tail.
                pos = self.tail.load(Ordering::Relaxed);
                backoff.slot_busy();
            }
        }
    }

    /// Dequeues the next extent, if any. Single consumer only.
    pub(crate) fn pop(&self) -> Option<Extent> {
        let pos = self.head.load(Ordering::Relaxed);
        let slot = &self.slots[pos & self.mask];
        let sequence = slot.sequence.load(Ordering::Acquire);
        if sequence == pos + 1 {
            // SAFETY: the Acquire above pairs with the producer's Release;
            // the slot holds an initialized value that only this (single)
            // consumer may take.
            let extent = unsafe { (*slot.value.get()).assume_init_read() };
            slot.sequence.store(pos + self.mask + 1, Ordering::Release);
            self.head.store(pos + 1, Ordering::Relaxed);
            Some(extent)
        } else {
            None
        }
    }
}

impl Drop for SubmissionQueue {
    fn drop(&mut self) {
        // Release any ring references still queued.
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn records(ring: &Arc<InputRing>, end: usize) -> Extent {
        Extent::Records {
            ring: Arc::clone(ring),
            end,
        }
    }

    fn end_of(extent: &Extent) -> usize {
        match extent {
            Extent::Records { end, .. } => *end,
            _ => panic!("expected records extent"),
        }
    }

    #[test]
    fn test_fifo_single_producer() {
        let queue = SubmissionQueue::with_capacity(8);
        let ring = Arc::new(InputRing::new(1024));
        for end in [16, 32, 48] {
            queue.push(records(&ring, end)).ok().unwrap();
        }
        assert_eq!(end_of(&queue.pop().unwrap()), 16);
        assert_eq!(end_of(&queue.pop().unwrap()), 32);
        assert_eq!(end_of(&queue.pop().unwrap()), 48);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_full_queue_returns_extent() {
        let queue = SubmissionQueue::with_capacity(2);
        let ring = Arc::new(InputRing::new(1024));
        queue.push(records(&ring, 16)).ok().unwrap();
        queue.push(records(&ring, 32)).ok().unwrap();
        let rejected = queue.push(records(&ring, 48));
        assert!(rejected.is_err());
        // Popping frees a slot.
        let _ = queue.pop().unwrap();
        queue.push(rejected.unwrap_err()).ok().unwrap();
    }

    #[test]
    fn test_shutdown_sentinel_is_fifo() {
        let queue = SubmissionQueue::with_capacity(8);
        let ring = Arc::new(InputRing::new(1024));
        queue.push(records(&ring, 16)).ok().unwrap();
        queue.push(Extent::Shutdown).ok().unwrap();
        assert!(matches!(queue.pop().unwrap(), Extent::Records { .. }));
        assert!(matches!(queue.pop().unwrap(), Extent::Shutdown));
    }

    #[test]
    fn test_contended_producers_preserve_per_thread_order() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 2_000;

        let queue = Arc::new(SubmissionQueue::with_capacity(64));
        let mut handles = Vec::new();
        for id in 0..PRODUCERS {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                let ring = Arc::new(InputRing::new(1024));
                for i in 0..PER_PRODUCER {
                    // Encode (producer, i) in the end offset; retry on full.
                    let mut extent = records(&ring, id * PER_PRODUCER + i);
                    while let Err(back) = queue.push(extent) {
                        extent = back;
                        thread::yield_now();
                    }
                }
            }));
        }

        let mut next_expected = [0usize; PRODUCERS];
        let mut received = 0;
        while received < PRODUCERS * PER_PRODUCER {
            if let Some(extent) = queue.pop() {
                let end = end_of(&extent);
                let id = end / PER_PRODUCER;
                let i = end % PER_PRODUCER;
                assert_eq!(i, next_expected[id], "producer {id} out of order");
                next_expected[id] += 1;
                received += 1;
            } else {
                thread::yield_now();
            }
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
