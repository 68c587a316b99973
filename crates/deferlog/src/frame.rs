//! Input frame layout and the type-erased dispatch bridge.
//!
//! Every frame in a producer ring starts with one dispatch word: the address
//! of a function monomorphized for the frame's `(Formatter, Payload)` pair.
//! That function is the only link between the producer that stamped the frame
//! and the consumer that formats it. A zero word is the wraparound marker.

use crate::error::FlushError;
use crate::output::OutputBuffer;
use std::any;
use std::mem;

/// Alignment of every frame offset in an input ring.
///
/// At least the size and alignment of the dispatch word, so the ring always
/// has room to stamp a wraparound marker where a frame would have started,
/// and large enough for the payload types the formatters carry (bounded by a
/// const assertion in [`encode_frame`]).
pub(crate) const FRAME_ALIGNMENT: usize = 16;

#[inline]
pub(crate) const fn round_up_to_frame_alignment(n: usize) -> usize {
    (n + FRAME_ALIGNMENT - 1) & !(FRAME_ALIGNMENT - 1)
}

/// Deferred formatter for payloads of type `P`.
///
/// `format` runs on the consumer thread with the payload the producer moved
/// into the ring. Flush failures surface through [`FlushError`] and should be
/// propagated with `?`; the consumer accounts for the lost frame. A panic is
/// caught by the consumer, reported through the format-error callback, and
/// the next frame proceeds.
pub trait Formatter<P> {
    fn format(out: &mut OutputBuffer, payload: P) -> Result<(), FlushError>;
}

/// What the consumer asks of a frame's dispatch function.
pub(crate) enum Operation<'a> {
    /// Move the payload out of the frame and format it.
    Format { out: &'a mut OutputBuffer },
    /// Report the frame's type name without touching the payload. Used to
    /// size past a frame whose payload is already gone (formatter panic or
    /// flush failure) and to identify it in error callbacks.
    Describe { type_name: &'a mut &'static str },
}

/// Type-erased entry point stored at the head of every frame. Returns the
/// frame size on success.
pub(crate) type DispatchFn =
    for<'a> unsafe fn(Operation<'a>, *mut u8) -> Result<usize, FlushError>;

/// Byte offset of the payload within a frame: the dispatch word, rounded up
/// to the payload's alignment.
pub(crate) const fn payload_offset<P>() -> usize {
    let align = mem::align_of::<P>();
    (mem::size_of::<DispatchFn>() + align - 1) / align * align
}

/// Total frame size for a payload of type `P`, rounded to the frame
/// alignment.
pub(crate) const fn frame_size<P>() -> usize {
    round_up_to_frame_alignment(payload_offset::<P>() + mem::size_of::<P>())
}

/// Stamps a frame: dispatch word first, payload constructed in place at its
/// aligned offset.
///
/// # Safety
///
/// `frame` must point to at least [`frame_size::<P>()`](frame_size) writable
/// bytes aligned to [`FRAME_ALIGNMENT`].
pub(crate) unsafe fn encode_frame<F, P>(frame: *mut u8, payload: P)
where
    F: Formatter<P>,
    P: Send + 'static,
{
    const {
        assert!(
            mem::align_of::<P>() <= FRAME_ALIGNMENT,
            "payload alignment exceeds the frame alignment"
        );
    }
    let dispatch: DispatchFn = dispatch_frame::<F, P>;
    frame.cast::<DispatchFn>().write(dispatch);
    frame.add(payload_offset::<P>()).cast::<P>().write(payload);
}

/// Reinterprets a non-zero dispatch word read from a frame head.
///
/// # Safety
///
/// `word` must have been written by [`encode_frame`] on this ring.
#[inline]
pub(crate) unsafe fn dispatch_fn_from_word(word: usize) -> DispatchFn {
    debug_assert_ne!(word, 0);
    mem::transmute::<usize, DispatchFn>(word)
}

/// The one function the consumer knows about per `(Formatter, Payload)` pair.
///
/// # Safety
///
/// `frame` must point to a frame stamped by `encode_frame::<F, P>`. A
/// `Format` operation consumes the payload; at most one may be issued per
/// frame, and no `Format` may follow it.
unsafe fn dispatch_frame<F, P>(operation: Operation<'_>, frame: *mut u8) -> Result<usize, FlushError>
where
    F: Formatter<P>,
    P: Send + 'static,
{
    match operation {
        Operation::Format { out } => {
            // Read the payload out before invoking the formatter: if the
            // formatter panics, the moved payload is dropped by the unwind
            // and the frame bytes are dead either way.
            let payload = frame.add(payload_offset::<P>()).cast::<P>().read();
            F::format(out, payload)?;
            Ok(frame_size::<P>())
        }
        Operation::Describe { type_name } => {
            *type_name = any::type_name::<P>();
            Ok(frame_size::<P>())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputBuffer;
    use crate::writer::Writer;
    use std::sync::{Arc, Mutex};

    struct VecWriter(Arc<Mutex<Vec<u8>>>);

    impl Writer for VecWriter {
        fn write(&mut self, bytes: &[u8]) -> Result<usize, crate::WriteError> {
            self.0.lock().unwrap().extend_from_slice(bytes);
            Ok(bytes.len())
        }
    }

    #[repr(align(16))]
    struct AlignedFrame([u8; 64]);

    struct RawFormatter;

    impl Formatter<(u32, u64)> for RawFormatter {
        fn format(out: &mut OutputBuffer, payload: (u32, u64)) -> Result<(), FlushError> {
            out.write_bytes(format!("{}:{}", payload.0, payload.1).as_bytes())?;
            Ok(())
        }
    }

    #[test]
    fn test_layout_is_aligned() {
        assert_eq!(payload_offset::<(u32, u64)>() % mem::align_of::<(u32, u64)>(), 0);
        assert_eq!(frame_size::<(u32, u64)>() % FRAME_ALIGNMENT, 0);
        assert!(frame_size::<()>() >= mem::size_of::<DispatchFn>());
    }

    #[test]
    fn test_encode_then_dispatch_round_trip() {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let mut out = OutputBuffer::new(Box::new(VecWriter(Arc::clone(&sink))), 4096);

        let mut frame = AlignedFrame([0; 64]);
        let frame_ptr: *mut u8 = frame.0.as_mut_ptr();
        assert_eq!(frame_ptr as usize % FRAME_ALIGNMENT, 0);

        // SAFETY: the stack frame is large and aligned enough, and Format is
        // issued exactly once.
        unsafe {
            encode_frame::<RawFormatter, (u32, u64)>(frame_ptr, (7, 9000));
            let word = frame_ptr.cast::<usize>().read();
            let dispatch = dispatch_fn_from_word(word);
            let size = dispatch(Operation::Format { out: &mut out }, frame_ptr).unwrap();
            assert_eq!(size, frame_size::<(u32, u64)>());
        }

        out.frame_end();
        out.flush().unwrap();
        assert_eq!(sink.lock().unwrap().as_slice(), b"7:9000");
    }

    #[test]
    fn test_describe_reports_type_name() {
        let mut frame = AlignedFrame([0; 64]);
        let frame_ptr: *mut u8 = frame.0.as_mut_ptr();
        // SAFETY: Describe never touches the payload, so an unstamped
        // payload area is fine.
        unsafe {
            encode_frame::<RawFormatter, (u32, u64)>(frame_ptr, (1, 2));
            let dispatch = dispatch_fn_from_word(frame_ptr.cast::<usize>().read());
            let mut name = "";
            let size = dispatch(Operation::Describe { type_name: &mut name }, frame_ptr).unwrap();
            assert_eq!(size, frame_size::<(u32, u64)>());
            assert!(name.contains("u32"));
            // The payload was never formatted; read it back out so it is not
            // leaked (a no-op for Copy types, but keeps the test honest).
            let _payload = frame_ptr
                .add(payload_offset::<(u32, u64)>())
                .cast::<(u32, u64)>()
                .read();
        }
    }
}
