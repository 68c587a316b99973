//! The log front end and its background consumer.
//!
//! A `write` call copies its payload into the calling thread's input ring and
//! enqueues a commit extent; the worker thread formats frames into the
//! staging buffer and flushes them to the writer. The producer path performs
//! no I/O, takes no contended lock, and after a thread's first call performs
//! no allocation and no system call.

use crate::config::Config;
use crate::error::{ErrorPolicy, FlushError, FormatError, WriteError};
use crate::event::Event;
use crate::frame::{self, DispatchFn, Formatter, Operation};
use crate::metrics::MetricsSnapshot;
use crate::output::{OutputBuffer, OutputState};
use crate::queue::{Extent, SubmissionQueue};
use crate::ring::InputRing;
use crate::writer::Writer;
use std::cell::RefCell;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const MAX_IDLE_POLL_MS: u64 = 1000;

/// Distinguishes rings of different (or reopened) logs in the thread-local
/// registry.
static NEXT_LOG_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// This thread's input rings, one per log it has written to. Threads
    /// rarely write to more than a couple of logs, so a scan beats a map.
    static INPUT_RINGS: RefCell<Vec<(u64, Arc<InputRing>)>> = const { RefCell::new(Vec::new()) };
}

pub(crate) struct Shared {
    id: u64,
    input_buffer_capacity: usize,
    queue: SubmissionQueue,
    /// Producers blocked on a full queue wait here for the consumer.
    queue_consumed: Event,
    pub(crate) output: Arc<OutputState>,
    panic_done: AtomicBool,
    panic_done_event: Event,
}

/// Low-latency deferred-formatting log.
///
/// `Log` is `Send + Sync`; share it across producer threads behind an `Arc`
/// or a scoped borrow. Every producer thread gets its own input ring on
/// first use. Dropping the log closes it best-effort; use
/// [`close`](Log::close) to observe the final writer error.
///
/// Formatters and callbacks run on the worker thread and must never write to
/// the log themselves; doing so can deadlock the pipeline.
pub struct Log {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Log {
    /// Opens a log with default capacities and starts the consumer thread.
    pub fn open(writer: Box<dyn Writer>) -> io::Result<Self> {
        Self::with_config(writer, Config::default())
    }

    /// Opens a log with explicit capacities and starts the consumer thread.
    pub fn with_config(writer: Box<dyn Writer>, config: Config) -> io::Result<Self> {
        let output_state = Arc::new(OutputState::default());
        let shared = Arc::new(Shared {
            id: NEXT_LOG_ID.fetch_add(1, Ordering::Relaxed),
            input_buffer_capacity: config.input_buffer_capacity,
            queue: SubmissionQueue::with_capacity(config.queue_capacity),
            queue_consumed: Event::new(),
            output: Arc::clone(&output_state),
            panic_done: AtomicBool::new(false),
            panic_done_event: Event::new(),
        });
        let out = OutputBuffer::with_state(writer, config.output_buffer_capacity, output_state);
        let worker = thread::Builder::new().name("deferlog-worker".into()).spawn({
            let shared = Arc::clone(&shared);
            move || output_worker(&shared, out)
        })?;
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Submits one record: copies `payload` into this thread's input ring
    /// and hands it to the consumer, which will call `F::format` with it
    /// exactly once, in submission order for this thread.
    ///
    /// Blocks only when this thread's ring or the submission queue is full.
    /// Fails only when the fail-immediately policy has latched a writer
    /// error.
    pub fn write<F, P>(&self, payload: P) -> Result<(), WriteError>
    where
        F: Formatter<P>,
        P: Send + 'static,
    {
        let shared = &self.shared;
        if shared.output.error_flag.load(Ordering::Relaxed) {
            if let Some(error) = shared.output.latched_error() {
                return Err(error);
            }
        }

        let ring = INPUT_RINGS.with(|rings| {
            let mut rings = rings.borrow_mut();
            if let Some((_, ring)) = rings.iter().find(|(id, _)| *id == shared.id) {
                Arc::clone(ring)
            } else {
                let ring = Arc::new(InputRing::new(shared.input_buffer_capacity));
                rings.push((shared.id, Arc::clone(&ring)));
                ring
            }
        });

        // SAFETY: the ring came out of this thread's registry, so this
        // thread is its one producer; encode_frame writes into bytes the
        // allocation reserved.
        let end = unsafe {
            let offset = ring.allocate(frame::frame_size::<P>());
            frame::encode_frame::<F, P>(ring.frame_ptr(offset), payload);
            ring.end_offset()
        };
        submit(shared, Extent::Records { ring, end });
        Ok(())
    }

    /// Blocks until every record submitted before this call has been
    /// formatted, then flushes the staging buffer and reports the outcome.
    ///
    /// Implemented as an in-band event frame: a hidden formatter flushes on
    /// the consumer thread and signals a gate this thread waits on.
    pub fn flush(&self) -> Result<(), WriteError> {
        let gate = FlushGate::new();
        self.write::<FlushFormatter, FlushGate>(gate.clone())?;
        self.shared.output.worker_wake.notify_all();
        gate.wait()
    }

    /// Drains all outstanding records, stops the consumer thread, and
    /// surfaces the final writer error, if any.
    ///
    /// Writing to the log from other threads while `close` runs is not
    /// supported.
    pub fn close(mut self) -> Result<(), WriteError> {
        self.close_impl()
    }

    fn close_impl(&mut self) -> Result<(), WriteError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        if self.shared.output.panic_flush.load(Ordering::Relaxed) {
            // The worker parked forever after the panic flush; detach it.
            drop(worker);
            return Ok(());
        }
        submit(&self.shared, Extent::Shutdown);
        self.shared.output.worker_wake.notify_all();
        if worker.join().is_err() {
            return Err(WriteError::permanent(0));
        }
        if self.shared.output.error_flag.load(Ordering::Acquire) {
            if let Some(error) = self.shared.output.latched_error() {
                return Err(error);
            }
        }
        Ok(())
    }

    /// Sets the response to temporary writer failures (default:
    /// [`ErrorPolicy::Ignore`]).
    pub fn set_temporary_error_policy(&self, policy: ErrorPolicy) {
        self.shared
            .output
            .temporary_policy
            .store(policy as u8, Ordering::Relaxed);
    }

    /// Sets the response to permanent writer failures (default:
    /// [`ErrorPolicy::FailImmediately`]).
    ///
    /// # Panics
    ///
    /// Panics on the retry-style policies: waiting out a permanent failure
    /// cannot succeed.
    pub fn set_permanent_error_policy(&self, policy: ErrorPolicy) {
        assert!(
            !matches!(policy, ErrorPolicy::NotifyOnRecovery | ErrorPolicy::Block),
            "retry-style policies are not valid for permanent failures"
        );
        self.shared
            .output
            .permanent_policy
            .store(policy as u8, Ordering::Relaxed);
    }

    /// Installs the callback invoked when a writer recovers after frames
    /// were lost under [`ErrorPolicy::NotifyOnRecovery`].
    pub fn on_writer_error(
        &self,
        callback: impl FnMut(&mut OutputBuffer, WriteError, u64) + Send + 'static,
    ) {
        *self.shared.output.writer_error_callback.lock().unwrap() = Some(Box::new(callback));
    }

    /// Removes the writer-error callback.
    pub fn clear_writer_error_callback(&self) {
        self.shared.output.writer_error_callback.lock().unwrap().take();
    }

    /// Installs the callback invoked when a formatter fails; it receives the
    /// failure and the frame payload's type name.
    pub fn on_format_error(
        &self,
        callback: impl FnMut(&mut OutputBuffer, FormatError, &'static str) + Send + 'static,
    ) {
        *self.shared.output.format_error_callback.lock().unwrap() = Some(Box::new(callback));
    }

    /// Removes the format-error callback.
    pub fn clear_format_error_callback(&self) {
        self.shared.output.format_error_callback.lock().unwrap().take();
    }

    /// Initiates a panic flush from a crash handler: freezes producers,
    /// queues the panic marker, and lets the consumer drain what it can.
    /// One-shot; the log cannot be used afterwards.
    pub fn start_panic_flush(&self) {
        // The flag must be visible before the marker so the consumer stops
        // releasing ring space back to (possibly corrupted) producers. The
        // swap also makes a second call a no-op: the worker is already gone.
        if self.shared.output.panic_flush.swap(true, Ordering::SeqCst) {
            return;
        }
        submit(&self.shared, Extent::PanicShutdown);
        self.shared.output.worker_wake.notify_all();
    }

    /// Waits for the panic flush to complete. Returns false on timeout.
    pub fn await_panic_flush(&self, timeout: Option<Duration>) -> bool {
        loop {
            let seen = self.shared.panic_done_event.generation();
            if self.shared.panic_done.load(Ordering::Acquire) {
                return true;
            }
            match timeout {
                Some(timeout) => {
                    if !self.shared.panic_done_event.wait_timeout(seen, timeout) {
                        return self.shared.panic_done.load(Ordering::Acquire);
                    }
                }
                None => self.shared.panic_done_event.wait(seen),
            }
        }
    }

    /// Consumer-side counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.output.metrics.snapshot()
    }
}

impl Drop for Log {
    fn drop(&mut self) {
        let _ = self.close_impl();
    }
}

/// Pushes an extent, honoring the full-queue protocol: wake the consumer,
/// wait for the queue-consumed event, retry. Per-producer submission order
/// is preserved because the producer does not return until its extent is in.
fn submit(shared: &Shared, mut extent: Extent) {
    loop {
        match shared.queue.push(extent) {
            Ok(()) => return,
            Err(back) => extent = back,
        }
        let seen = shared.queue_consumed.generation();
        shared.output.worker_wake.notify_all();
        match shared.queue.push(extent) {
            Ok(()) => return,
            Err(back) => {
                extent = back;
                shared.queue_consumed.wait(seen);
            }
        }
    }
}

// ---------------------------------------------------------------------
// FLUSH GATE
// ---------------------------------------------------------------------

struct GateInner {
    result: Mutex<Option<Result<(), WriteError>>>,
    cond: Condvar,
}

/// Payload of the in-band flush frame.
#[derive(Clone)]
struct FlushGate {
    inner: Arc<GateInner>,
}

impl FlushGate {
    fn new() -> Self {
        Self {
            inner: Arc::new(GateInner {
                result: Mutex::new(None),
                cond: Condvar::new(),
            }),
        }
    }

    fn set(&self, result: Result<(), WriteError>) {
        *self.inner.result.lock().unwrap() = Some(result);
        self.inner.cond.notify_all();
    }

    fn wait(&self) -> Result<(), WriteError> {
        let mut result = self.inner.result.lock().unwrap();
        while result.is_none() {
            result = self.inner.cond.wait(result).unwrap();
        }
        result.take().unwrap_or(Ok(()))
    }
}

struct FlushFormatter;

impl Formatter<FlushGate> for FlushFormatter {
    fn format(out: &mut OutputBuffer, gate: FlushGate) -> Result<(), FlushError> {
        let result = if out.has_complete_frame() {
            match out.flush() {
                Ok(()) => Ok(()),
                Err(FlushError::Write(error)) => Err(error),
                Err(FlushError::ExcessiveOutputByFrame) => {
                    unreachable!("flush does not raise excessive-output")
                }
            }
        } else {
            Ok(())
        };
        gate.set(result);
        // A failed checkpoint flush is reported through the gate, not as a
        // lost frame.
        Ok(())
    }
}

// ---------------------------------------------------------------------
// CONSUMER WORKER
// ---------------------------------------------------------------------

fn output_worker(shared: &Shared, mut out: OutputBuffer) {
    loop {
        let extent = match shared.queue.pop() {
            Some(extent) => extent,
            None => wait_for_extent(shared, &mut out),
        };
        shared.queue_consumed.notify_all();

        match extent {
            Extent::Records { ring, end } => {
                drain_ring(shared, &mut out, &ring, end);
                if !shared.output.panic_flush.load(Ordering::Relaxed) {
                    ring.notify_consumed();
                }
            }
            Extent::Shutdown => {
                if out.has_complete_frame() {
                    // Whatever error this reports was latched for close()
                    // to surface; nothing else to do while shutting down.
                    let _ = out.flush();
                }
                return;
            }
            Extent::PanicShutdown => on_panic_flush_done(shared, &mut out),
        }
    }
}

/// Idle path: flush pending output, then poll the queue with exponentially
/// growing waits, unblocked early by the worker-wake event.
fn wait_for_extent(shared: &Shared, out: &mut OutputBuffer) -> Extent {
    let mut wait_ms: u64 = 0;
    loop {
        let seen = shared.output.worker_wake.generation();
        if let Some(extent) = shared.queue.pop() {
            return extent;
        }
        // Flush before waiting so output reaches the writer whenever there
        // is a pause in incoming records. A temporary error can leave data
        // behind, hence the retry on every iteration.
        if out.has_complete_frame() {
            let _ = out.flush();
            if let Some(extent) = shared.queue.pop() {
                return extent;
            }
        }
        shared
            .output
            .worker_wake
            .wait_timeout(seen, Duration::from_millis(wait_ms));
        wait_ms = (wait_ms + (wait_ms / 4).max(1)).min(MAX_IDLE_POLL_MS);
    }
}

fn drain_ring(shared: &Shared, out: &mut OutputBuffer, ring: &InputRing, end: usize) {
    let panic_flush = shared.output.panic_flush.load(Ordering::Relaxed);
    let mut pos = ring.start_offset();
    while pos != end {
        // SAFETY: [pos, end) was committed by the extent that brought us
        // here; the queue pop's acquire pairs with the push's release, so
        // the frame bytes are visible.
        let word = unsafe { ring.dispatch_word(pos) };
        if word == 0 {
            // Wraparound marker: the producer continued at the origin.
            pos = 0;
            if !panic_flush {
                ring.set_start(0);
            }
            continue;
        }
        // SAFETY: a non-zero dispatch word was written by encode_frame.
        let dispatch = unsafe { frame::dispatch_fn_from_word(word) };
        let size = process_frame(shared, out, dispatch, ring.frame_ptr(pos));
        pos = ring.advance(pos, size);
        // Releasing per frame lets a blocked producer resume as early as
        // possible. Withheld during a panic flush to keep producers frozen.
        if !panic_flush {
            ring.set_start(pos);
        }
    }
}

/// Formats one frame, returning its size. Failures never propagate: a flush
/// failure costs the frame, a formatter panic or oversized frame costs the
/// frame and reports through the format-error callback.
fn process_frame(
    shared: &Shared,
    out: &mut OutputBuffer,
    dispatch: DispatchFn,
    frame_ptr: *mut u8,
) -> usize {
    let result = catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: frame_ptr heads a committed frame; Format is invoked
        // exactly once for it.
        unsafe { dispatch(Operation::Format { out: &mut *out }, frame_ptr) }
    }));
    match result {
        Ok(Ok(size)) => {
            out.frame_end();
            size
        }
        Ok(Err(FlushError::Write(_))) => {
            // The output buffer had to be flushed mid-frame and the flush
            // failed; the frame is lost.
            out.lost_frame();
            describe(dispatch, frame_ptr).0
        }
        Ok(Err(FlushError::ExcessiveOutputByFrame)) => {
            out.revert_frame();
            shared.output.metrics.lost_frames.fetch_add(1, Ordering::Relaxed);
            let (size, type_name) = describe(dispatch, frame_ptr);
            report_format_error(shared, out, FormatError::ExcessiveOutputByFrame, type_name);
            size
        }
        Err(panic_payload) => {
            out.revert_frame();
            shared.output.metrics.lost_frames.fetch_add(1, Ordering::Relaxed);
            let (size, type_name) = describe(dispatch, frame_ptr);
            report_format_error(shared, out, FormatError::Panic(panic_payload), type_name);
            size
        }
    }
}

fn describe(dispatch: DispatchFn, frame_ptr: *mut u8) -> (usize, &'static str) {
    let mut type_name = "";
    // SAFETY: Describe never touches the payload, which may already be gone.
    let result = unsafe {
        dispatch(
            Operation::Describe {
                type_name: &mut type_name,
            },
            frame_ptr,
        )
    };
    match result {
        Ok(size) => (size, type_name),
        Err(_) => unreachable!("describe cannot fail"),
    }
}

fn report_format_error(
    shared: &Shared,
    out: &mut OutputBuffer,
    error: FormatError,
    type_name: &'static str,
) {
    let callback = shared.output.format_error_callback.lock().unwrap().take();
    if let Some(mut callback) = callback {
        // A misbehaving callback must not take down the worker.
        let _ = catch_unwind(AssertUnwindSafe(|| callback(out, error, type_name)));
        let mut slot = shared.output.format_error_callback.lock().unwrap();
        if slot.is_none() {
            *slot = Some(callback);
        }
    }
}

fn on_panic_flush_done(shared: &Shared, out: &mut OutputBuffer) -> ! {
    if out.has_complete_frame() {
        // One chance to flush what remains. If it fails now, we live with
        // it and let the process die.
        let _ = out.flush();
    }
    shared.panic_done.store(true, Ordering::Release);
    shared.panic_done_event.notify_all();
    // Sleep and wait for death so the crash handler can finish.
    loop {
        thread::park();
    }
}
