//! Consumer-owned output staging buffer.
//!
//! Formatters append here through reserve/commit; completed input frames are
//! flushed to the writer. The frame-end watermark guarantees the sink never
//! receives part of a frame: on a formatter failure everything past the last
//! completed frame is discarded.

use crate::error::{ErrorPolicy, FlushError, FormatError, Severity, WriteError};
use crate::event::Event;
use crate::metrics::Metrics;
use crate::writer::Writer;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Invoked once a flush succeeds after frames were lost under
/// `NotifyOnRecovery`: receives the staging buffer (anything written to it is
/// flushed right after), the first error seen, and the lost-frame count.
/// Must not write to the log itself.
pub type WriterErrorCallback = Box<dyn FnMut(&mut OutputBuffer, WriteError, u64) + Send>;

/// Invoked when a frame's formatter fails: receives the staging buffer, the
/// failure, and the frame payload's type name. Must not write to the log
/// itself.
pub type FormatErrorCallback = Box<dyn FnMut(&mut OutputBuffer, FormatError, &'static str) + Send>;

const MAX_BLOCK_POLL_MS: u64 = 1000;

/// State shared between the consumer-owned buffer and the `Log` handle that
/// configures it.
pub(crate) struct OutputState {
    pub(crate) temporary_policy: AtomicU8,
    pub(crate) permanent_policy: AtomicU8,
    /// Latched by the fail-immediately policy; observed by producers.
    pub(crate) error_flag: AtomicBool,
    pub(crate) error_code: Mutex<Option<WriteError>>,
    pub(crate) panic_flush: AtomicBool,
    /// Wakes the worker out of its idle poll; also the poll event for the
    /// block policy, so a panic flush can interrupt it.
    pub(crate) worker_wake: Event,
    pub(crate) writer_error_callback: Mutex<Option<WriterErrorCallback>>,
    pub(crate) format_error_callback: Mutex<Option<FormatErrorCallback>>,
    pub(crate) metrics: Metrics,
}

impl Default for OutputState {
    fn default() -> Self {
        Self {
            temporary_policy: AtomicU8::new(ErrorPolicy::Ignore as u8),
            permanent_policy: AtomicU8::new(ErrorPolicy::FailImmediately as u8),
            error_flag: AtomicBool::new(false),
            error_code: Mutex::new(None),
            panic_flush: AtomicBool::new(false),
            worker_wake: Event::new(),
            writer_error_callback: Mutex::new(None),
            format_error_callback: Mutex::new(None),
            metrics: Metrics::default(),
        }
    }
}

impl OutputState {
    pub(crate) fn policy_for(&self, severity: Severity) -> ErrorPolicy {
        let raw = match severity {
            Severity::Temporary => self.temporary_policy.load(Ordering::Relaxed),
            Severity::Permanent => self.permanent_policy.load(Ordering::Relaxed),
        };
        ErrorPolicy::from_u8(raw)
    }

    pub(crate) fn latched_error(&self) -> Option<WriteError> {
        *self.error_code.lock().unwrap()
    }
}

/// Byte-addressable append buffer between the formatters and the writer.
pub struct OutputBuffer {
    writer: Box<dyn Writer>,
    buf: Box<[u8]>,
    /// End of the last *completed* input frame's output. Flush never writes
    /// past this.
    frame_end: usize,
    /// End of everything committed so far, including the frame in progress.
    commit_end: usize,
    state: Arc<OutputState>,
    /// Frames lost since the last successful flush, for the recovery
    /// callback.
    lost_frames: u64,
    /// First error that caused `lost_frames` to become non-zero.
    initial_error: Option<WriteError>,
}

impl OutputBuffer {
    /// Creates a free-standing staging buffer with default policies, not
    /// attached to any log. Useful for testing formatters.
    pub fn new(writer: Box<dyn Writer>, capacity: usize) -> Self {
        Self::with_state(writer, capacity, Arc::new(OutputState::default()))
    }

    pub(crate) fn with_state(writer: Box<dyn Writer>, capacity: usize, state: Arc<OutputState>) -> Self {
        Self {
            writer,
            buf: vec![0u8; capacity].into_boxed_slice(),
            frame_end: 0,
            commit_end: 0,
            state,
            lost_frames: 0,
            initial_error: None,
        }
    }

    /// Returns at least `size` contiguous writable bytes, flushing completed
    /// frames first if the buffer is full.
    pub fn reserve(&mut self, size: usize) -> Result<&mut [u8], FlushError> {
        if self.commit_end + size <= self.buf.len() {
            let start = self.commit_end;
            Ok(&mut self.buf[start..start + size])
        } else {
            self.reserve_slow_path(size)
        }
    }

    fn reserve_slow_path(&mut self, size: usize) -> Result<&mut [u8], FlushError> {
        let frame_size = (self.commit_end - self.frame_end) + size;
        if frame_size > self.buf.len() {
            return Err(FlushError::ExcessiveOutputByFrame);
        }
        self.flush()?;
        let start = self.commit_end;
        Ok(&mut self.buf[start..start + size])
    }

    /// Commits `size` bytes previously obtained from [`reserve`](Self::reserve).
    pub fn commit(&mut self, size: usize) {
        debug_assert!(self.commit_end + size <= self.buf.len());
        self.commit_end += size;
    }

    /// Appends a byte slice, flushing as needed.
    pub fn write_bytes(&mut self, mut bytes: &[u8]) -> Result<(), FlushError> {
        while !bytes.is_empty() {
            let chunk_len = bytes.len().min(self.buf.len());
            let dst = self.reserve(chunk_len)?;
            dst.copy_from_slice(&bytes[..chunk_len]);
            self.commit(chunk_len);
            bytes = &bytes[chunk_len..];
        }
        Ok(())
    }

    /// Appends a string slice.
    pub fn write_str(&mut self, s: &str) -> Result<(), FlushError> {
        self.write_bytes(s.as_bytes())
    }

    /// Appends a single byte.
    pub fn write_byte(&mut self, byte: u8) -> Result<(), FlushError> {
        let dst = self.reserve(1)?;
        dst[0] = byte;
        self.commit(1);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // CONSUMER-LOOP BOOKKEEPING
    // ---------------------------------------------------------------------

    /// Marks the output produced so far as belonging to completed frames.
    pub(crate) fn frame_end(&mut self) {
        self.frame_end = self.commit_end;
    }

    /// Discards the output of the frame in progress.
    pub(crate) fn revert_frame(&mut self) {
        self.commit_end = self.frame_end;
    }

    /// Records that the frame in progress was lost to a flush failure and
    /// discards its partial output.
    pub(crate) fn lost_frame(&mut self) {
        self.lost_frames += 1;
        self.state.metrics.lost_frames.fetch_add(1, Ordering::Relaxed);
        self.commit_end = self.frame_end;
    }

    pub(crate) fn has_complete_frame(&self) -> bool {
        self.frame_end != 0
    }

    /// Writes all completed frames to the sink, applying the error policies.
    ///
    /// On return with `Ok`, every completed frame has either reached the
    /// writer or been discarded by the `Ignore` policy; any frame in
    /// progress has been moved to the front of the buffer.
    pub(crate) fn flush(&mut self) -> Result<(), FlushError> {
        let mut remaining = self.frame_end;
        let mut block_ms: u64 = 0;
        loop {
            if remaining == 0 {
                return Ok(());
            }
            match self.writer.write(&self.buf[..remaining]) {
                Ok(written) => {
                    debug_assert!(0 < written && written <= remaining);
                    // Drop what was written, keep the rest (including the
                    // partial frame past frame_end).
                    self.buf.copy_within(written..self.commit_end, 0);
                    self.frame_end -= written;
                    self.commit_end -= written;
                    remaining = self.frame_end;

                    self.state.metrics.flushes.fetch_add(1, Ordering::Relaxed);
                    self.state
                        .metrics
                        .bytes_written
                        .fetch_add(written as u64, Ordering::Relaxed);
                    self.state.error_flag.store(false, Ordering::Release);
                    self.state.error_code.lock().unwrap().take();

                    if self.lost_frames != 0 {
                        // Frames were discarded under notify-on-recovery and
                        // the writer works again: tell the client, then keep
                        // flushing so anything the callback wrote also goes
                        // out before we return.
                        let lost = self.lost_frames;
                        self.lost_frames = 0;
                        let first_error = self
                            .initial_error
                            .take()
                            .unwrap_or(WriteError::permanent(0));
                        let callback = self.state.writer_error_callback.lock().unwrap().take();
                        if let Some(mut callback) = callback {
                            callback(self, first_error, lost);
                            self.frame_end();
                            let mut slot = self.state.writer_error_callback.lock().unwrap();
                            if slot.is_none() {
                                *slot = Some(callback);
                            }
                        }
                        remaining = self.frame_end;
                    }
                }
                Err(error) => match self.state.policy_for(error.severity) {
                    ErrorPolicy::Ignore => {
                        // Discard the bytes this flush failed to deliver and
                        // carry on as if they were written. No callback.
                        self.buf.copy_within(remaining..self.commit_end, 0);
                        self.commit_end -= remaining;
                        self.frame_end = 0;
                        return Ok(());
                    }
                    ErrorPolicy::NotifyOnRecovery => {
                        // Keep the data for retry; the client hears about it
                        // once the writer recovers.
                        if self.initial_error.is_none() {
                            self.initial_error = Some(error);
                        }
                        return Err(FlushError::Write(error));
                    }
                    ErrorPolicy::Block => {
                        // Poll the writer until it recovers. Producers block
                        // naturally once their rings fill. The wait rides the
                        // worker-wake event so a panic flush interrupts it,
                        // in which case the remaining data is abandoned.
                        let seen = self.state.worker_wake.generation();
                        if self.state.panic_flush.load(Ordering::Relaxed) {
                            return Err(FlushError::Write(error));
                        }
                        self.state
                            .worker_wake
                            .wait_timeout(seen, Duration::from_millis(block_ms));
                        block_ms = (block_ms + (block_ms / 4).max(1)).min(MAX_BLOCK_POLL_MS);
                    }
                    ErrorPolicy::FailImmediately => {
                        if !self.state.error_flag.load(Ordering::Relaxed) {
                            *self.state.error_code.lock().unwrap() = Some(error);
                            self.state.error_flag.store(true, Ordering::Release);
                        }
                        return Err(FlushError::Write(error));
                    }
                },
            }
        }
    }
}
