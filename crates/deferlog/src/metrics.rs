use std::sync::atomic::{AtomicU64, Ordering};

/// Consumer-side counters. Producers never touch these, so the write hot
/// path stays free of shared-counter traffic.
#[derive(Debug, Default)]
pub(crate) struct Metrics {
    pub(crate) lost_frames: AtomicU64,
    pub(crate) flushes: AtomicU64,
    pub(crate) bytes_written: AtomicU64,
}

impl Metrics {
    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            lost_frames: self.lost_frames.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the log's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Input frames dropped because of flush failures or formatter errors.
    pub lost_frames: u64,
    /// Successful flush calls that reached the writer.
    pub flushes: u64,
    /// Bytes accepted by the writer.
    pub bytes_written: u64,
}
