use crate::event::Event;
use crate::frame::{round_up_to_frame_alignment, FRAME_ALIGNMENT};
use crossbeam_utils::CachePadded;
use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

// =============================================================================
// SYNCHRONIZATION STRATEGY
// =============================================================================
//
// One InputRing is owned by exactly one producer thread and drained by the
// single consumer thread:
//
// - `end` is written and read only by the owning producer. It is published to
//   the consumer indirectly: every commit extent pushed onto the submission
//   queue carries the post-allocation `end`, and the queue's release store on
//   the slot sequence is what makes the frame bytes visible to the consumer's
//   acquire pop.
//
// - `start` is written only by the consumer (relaxed) and read by the
//   producer (relaxed) to compute free space. Relaxed is sufficient because
//   the consumer only ever *widens* the producer's free space; a stale value
//   makes the producer conservatively wait, never corrupts data. On the slow
//   path the producer re-reads `start` after snapshotting the consumed
//   event's generation, and the event's mutex provides the full barrier that
//   delivers a fresh value.
//
// - The ring is empty exactly when `start == end`. The producer refuses any
//   allocation that would make the cursors meet with data present, so one
//   byte of slack acts as the full/empty discriminator.
//
// =============================================================================

/// Per-producer circular byte ring carrying input frames to the consumer.
///
/// Frames are aligned to [`FRAME_ALIGNMENT`]. When the contiguous tail of the
/// ring cannot hold a frame, the producer stamps a wraparound marker (a zero
/// dispatch word) at the current end and continues from the origin; the
/// consumer resets its cursor when it reads the marker.
pub(crate) struct InputRing {
    /// Ring storage, 64-byte aligned.
    buf: NonNull<u8>,
    capacity: usize,
    /// Producer cursor. Written only by the owning producer thread.
    end: CachePadded<UnsafeCell<usize>>,
    /// Consumer cursor. Written only by the consumer thread.
    start: CachePadded<AtomicUsize>,
    /// Signaled by the consumer after draining an extent from this ring.
    consumed: Event,
}

// SAFETY: the single-producer/single-consumer access discipline documented
// above is upheld by construction: `end` is reached only through the
// thread-local handle of the owning producer, `start` and the frame bytes
// below a committed extent end only by the consumer thread.
unsafe impl Send for InputRing {}
unsafe impl Sync for InputRing {}

impl InputRing {
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity >= 2 * FRAME_ALIGNMENT && capacity % FRAME_ALIGNMENT == 0);
        let layout = Layout::from_size_align(capacity, 64).expect("invalid ring layout");
        // SAFETY: layout has non-zero size (capacity checked above).
        let buf = unsafe { alloc(layout) };
        let Some(buf) = NonNull::new(buf) else {
            handle_alloc_error(layout);
        };
        Self {
            buf,
            capacity,
            end: CachePadded::new(UnsafeCell::new(0)),
            start: CachePadded::new(AtomicUsize::new(0)),
            consumed: Event::new(),
        }
    }

    // ---------------------------------------------------------------------
    // PRODUCER API
    // ---------------------------------------------------------------------

    /// Reserves `size` bytes (rounded up to the frame alignment) for one
    /// frame, blocking on the consumed event while the ring is full.
    ///
    /// The returned offset is either contiguous before the ring's end or at
    /// the origin after a wraparound marker has been stamped.
    ///
    /// # Panics
    ///
    /// Panics if the rounded size cannot ever fit in this ring.
    ///
    /// # Safety
    ///
    /// Must be called only from the thread that owns this ring.
    pub(crate) unsafe fn allocate(&self, size: usize) -> usize {
        let size = round_up_to_frame_alignment(size);
        assert!(
            size < self.capacity - 1,
            "input frame of {size} bytes cannot fit in a {} byte ring; \
             raise input_buffer_capacity",
            self.capacity
        );

        loop {
            let end = *self.end.get();
            debug_assert!(end < self.capacity);
            debug_assert_eq!(end % FRAME_ALIGNMENT, 0);

            // Snapshot the event generation before reading `start` so a
            // consumption that lands in between cannot be missed below.
            let seen = self.consumed.generation();
            let start = self.start.load(Ordering::Relaxed);

            if start == end {
                // The ring is empty, so the consumer has nothing in flight
                // for it (extents are drained in full before the cursors can
                // meet). Rewinding both cursors gives the frame the whole
                // contiguous buffer.
                self.start.store(0, Ordering::Relaxed);
                *self.end.get() = self.advance(0, size);
                return 0;
            } else if start > end {
                // Free space is the single contiguous run [end, start).
                // Strictly less: consuming the last byte would leave
                // start == end with data present.
                if size < start - end {
                    *self.end.get() = self.advance(end, size);
                    return end;
                }
            } else {
                // Free space is the tail [end, capacity) plus the head
                // [0, start).
                let tail = self.capacity - end;
                if size < tail {
                    *self.end.get() = self.advance(end, size);
                    return end;
                } else if size < start {
                    // The frame does not fit contiguously before the edge,
                    // but does at the origin. Tell the consumer to skip
                    // ahead. Frame alignment guarantees the tail has room
                    // for the marker word.
                    self.write_wraparound_marker(end);
                    *self.end.get() = self.advance(0, size);
                    return 0;
                }
            }

            self.consumed.wait(seen);
        }
    }

    /// Current producer cursor.
    ///
    /// # Safety
    ///
    /// Must be called only from the thread that owns this ring.
    #[inline]
    pub(crate) unsafe fn end_offset(&self) -> usize {
        *self.end.get()
    }

    fn write_wraparound_marker(&self, offset: usize) {
        debug_assert_eq!(offset % FRAME_ALIGNMENT, 0);
        // SAFETY: offset is in bounds and frame-aligned, and the bytes at
        // [offset, offset + word) are free space owned by the producer.
        unsafe {
            self.buf.as_ptr().add(offset).cast::<usize>().write(0);
        }
    }

    // ---------------------------------------------------------------------
    // CONSUMER API
    // ---------------------------------------------------------------------

    #[inline]
    pub(crate) fn start_offset(&self) -> usize {
        self.start.load(Ordering::Relaxed)
    }

    /// Releases everything below `offset` back to the producer.
    #[inline]
    pub(crate) fn set_start(&self, offset: usize) {
        self.start.store(offset, Ordering::Relaxed);
    }

    /// Wakes the producer if it is blocked waiting for ring space.
    #[inline]
    pub(crate) fn notify_consumed(&self) {
        self.consumed.notify_all();
    }

    // ---------------------------------------------------------------------
    // SHARED
    // ---------------------------------------------------------------------

    #[inline]
    pub(crate) fn frame_ptr(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset < self.capacity);
        // In-bounds offset into the allocation.
        unsafe { self.buf.as_ptr().add(offset) }
    }

    /// Reads the dispatch word at the head of the frame at `offset`. Zero is
    /// the wraparound marker.
    ///
    /// # Safety
    ///
    /// `offset` must refer to a frame (or marker) the producer has committed
    /// through an extent that the caller obtained from the submission queue.
    #[inline]
    pub(crate) unsafe fn dispatch_word(&self, offset: usize) -> usize {
        self.frame_ptr(offset).cast::<usize>().read()
    }

    /// Moves an offset forward by `distance`, wrapping at the ring edge so
    /// the result never points one-past-the-end.
    #[inline]
    pub(crate) fn advance(&self, offset: usize, distance: usize) -> usize {
        debug_assert_eq!(offset % FRAME_ALIGNMENT, 0);
        debug_assert_eq!(distance % FRAME_ALIGNMENT, 0);
        let next = offset + distance;
        debug_assert!(next <= self.capacity);
        if next == self.capacity {
            0
        } else {
            next
        }
    }
}

impl Drop for InputRing {
    fn drop(&mut self) {
        // Frames still in the ring at this point were never drained (the log
        // was torn down without a close); their payloads are leaked, not
        // dropped, because only the dispatch function knows their types.
        let layout = Layout::from_size_align(self.capacity, 64).expect("invalid ring layout");
        // SAFETY: buf was allocated in `new` with this exact layout.
        unsafe { dealloc(self.buf.as_ptr(), layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The unsafe calls below are sound: each test is the ring's only
    // producer and only consumer.

    #[test]
    fn test_allocate_contiguous() {
        let ring = InputRing::new(1024);
        let a = unsafe { ring.allocate(32) };
        let b = unsafe { ring.allocate(48) };
        assert_eq!(a, 0);
        assert_eq!(b, 32);
        assert_eq!(unsafe { ring.end_offset() }, 80);
    }

    #[test]
    fn test_rounds_to_frame_alignment() {
        let ring = InputRing::new(1024);
        let _ = unsafe { ring.allocate(9) };
        assert_eq!(unsafe { ring.end_offset() }, FRAME_ALIGNMENT);
    }

    #[test]
    fn test_empty_ring_rewinds_cursors() {
        let ring = InputRing::new(1024);
        let _ = unsafe { ring.allocate(512) };
        // Consumer drains everything.
        ring.set_start(512);
        // The next allocation restarts from the origin with the whole ring
        // contiguous.
        let offset = unsafe { ring.allocate(768) };
        assert_eq!(offset, 0);
        assert_eq!(ring.start_offset(), 0);
        assert_eq!(unsafe { ring.end_offset() }, 768);
    }

    #[test]
    fn test_wraparound_marker_at_edge() {
        let ring = InputRing::new(1024);
        let _ = unsafe { ring.allocate(192) };
        let _ = unsafe { ring.allocate(736) };
        // Consumer drains the first frame only, freeing the head.
        ring.set_start(192);
        // 96 tail bytes remain; a 128-byte frame must wrap and stamp the
        // marker where the next frame would have started.
        let offset = unsafe { ring.allocate(128) };
        assert_eq!(offset, 0);
        assert_eq!(unsafe { ring.dispatch_word(928) }, 0);
        assert_eq!(unsafe { ring.end_offset() }, 128);
    }

    #[test]
    fn test_advance_wraps_at_capacity() {
        let ring = InputRing::new(1024);
        assert_eq!(ring.advance(1008, 16), 0);
        assert_eq!(ring.advance(0, 16), 16);
    }

    #[test]
    #[should_panic(expected = "cannot fit")]
    fn test_oversized_frame_panics() {
        let ring = InputRing::new(1024);
        let _ = unsafe { ring.allocate(1024) };
    }
}
