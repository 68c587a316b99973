//! Error types shared across the producer and consumer sides.

use std::any::Any;
use std::fmt;
use thiserror::Error;

/// How a writer failure should be interpreted.
///
/// Temporary failures (disk full, interrupted call, device busy) may clear up
/// on their own; permanent failures (I/O error, access denied) will not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The writer may succeed if retried later.
    Temporary,
    /// Retrying is pointless.
    Permanent,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Temporary => f.write_str("temporary"),
            Severity::Permanent => f.write_str("permanent"),
        }
    }
}

/// Error reported by a [`Writer`](crate::Writer).
///
/// `code` carries the raw OS error when one exists, so callbacks can tell
/// ENOSPC from EIO; zero means no OS code was available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{severity} writer failure (os error {code})")]
pub struct WriteError {
    pub severity: Severity,
    pub code: i32,
}

impl WriteError {
    pub fn temporary(code: i32) -> Self {
        Self {
            severity: Severity::Temporary,
            code,
        }
    }

    pub fn permanent(code: i32) -> Self {
        Self {
            severity: Severity::Permanent,
            code,
        }
    }
}

/// Error propagated out of [`OutputBuffer::reserve`](crate::OutputBuffer::reserve)
/// to unwind the formatter of the current input frame.
///
/// Formatters are expected to pass this through with `?`; the consumer loop
/// accounts for the lost frame and carries on with the next one.
#[derive(Debug, Error)]
pub enum FlushError {
    /// A flush intended to make room in the staging buffer failed.
    #[error("flush failed: {0}")]
    Write(WriteError),
    /// A single input frame produced more output than the staging buffer can
    /// hold at all. Enlarge the output buffer or produce less output.
    #[error("excessive output by a single frame")]
    ExcessiveOutputByFrame,
}

/// Why a frame could not be formatted.
pub enum FormatError {
    /// The formatter panicked; the payload is whatever the panic carried.
    Panic(Box<dyn Any + Send>),
    /// The frame's output exceeded the staging buffer capacity.
    ExcessiveOutputByFrame,
}

impl fmt::Debug for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatError::Panic(_) => f.write_str("FormatError::Panic(..)"),
            FormatError::ExcessiveOutputByFrame => f.write_str("FormatError::ExcessiveOutputByFrame"),
        }
    }
}

/// Response to a writer failure, configurable per severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorPolicy {
    /// Swallow the error; data from the failed flush is discarded silently.
    Ignore = 0,
    /// Keep the data, count lost frames, and invoke the writer-error callback
    /// once a later flush succeeds. Only valid for temporary failures.
    NotifyOnRecovery = 1,
    /// Poll the writer with exponential backoff until it recovers; producers
    /// block naturally once their rings fill. Only valid for temporary
    /// failures.
    Block = 2,
    /// Record the error, latch the error flag, and fail the current frame.
    /// Subsequent `write` calls observe the flag and return the error.
    FailImmediately = 3,
}

impl ErrorPolicy {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ErrorPolicy::Ignore,
            1 => ErrorPolicy::NotifyOnRecovery,
            2 => ErrorPolicy::Block,
            3 => ErrorPolicy::FailImmediately,
            _ => unreachable!("invalid error policy discriminant"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_round_trip() {
        for policy in [
            ErrorPolicy::Ignore,
            ErrorPolicy::NotifyOnRecovery,
            ErrorPolicy::Block,
            ErrorPolicy::FailImmediately,
        ] {
            assert_eq!(ErrorPolicy::from_u8(policy as u8), policy);
        }
    }

    #[test]
    fn test_write_error_display() {
        let e = WriteError::temporary(28);
        assert_eq!(e.to_string(), "temporary writer failure (os error 28)");
    }
}
