//! The byte sink consumed by the worker thread, plus the stock file and
//! stdout implementations.

use crate::error::{Severity, WriteError};
use std::fs::{File, OpenOptions};
use std::io::{self, Write as _};
use std::path::Path;

/// A byte sink for formatted log output.
///
/// Called only from the consumer thread. A partial write is legal — return
/// `Ok(n)` with `n < bytes.len()` and the consumer loops. Report failures as
/// [`WriteError`] so the error policies can distinguish temporary from
/// permanent conditions; an implementation must not panic.
pub trait Writer: Send + 'static {
    fn write(&mut self, bytes: &[u8]) -> Result<usize, WriteError>;
}

/// Maps an I/O error onto the temporary/permanent taxonomy.
///
/// Out-of-space and interruption-style conditions clear up on their own;
/// everything else (EIO, EACCES, unknown errors) is treated as permanent.
pub fn classify_io_error(error: &io::Error) -> WriteError {
    let code = error.raw_os_error().unwrap_or(0);
    let severity = match error.kind() {
        io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut
        | io::ErrorKind::StorageFull
        | io::ErrorKind::QuotaExceeded => Severity::Temporary,
        _ => Severity::Permanent,
    };
    WriteError { severity, code }
}

/// Writer that appends to a file.
pub struct FileWriter {
    file: File,
}

impl FileWriter {
    /// Opens `path` for appending, creating it if needed.
    pub fn new<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }
}

impl Writer for FileWriter {
    fn write(&mut self, bytes: &[u8]) -> Result<usize, WriteError> {
        self.file.write(bytes).map_err(|e| classify_io_error(&e))
    }
}

/// Writer that forwards to standard output.
///
/// Locks stdout for each write so log frames are not interleaved with other
/// output mid-frame.
pub struct StdoutWriter;

impl Writer for StdoutWriter {
    fn write(&mut self, bytes: &[u8]) -> Result<usize, WriteError> {
        io::stdout()
            .lock()
            .write(bytes)
            .map_err(|e| classify_io_error(&e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_interrupted_as_temporary() {
        let e = io::Error::from(io::ErrorKind::Interrupted);
        assert_eq!(classify_io_error(&e).severity, Severity::Temporary);
    }

    #[test]
    fn test_classify_permission_denied_as_permanent() {
        let e = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(classify_io_error(&e).severity, Severity::Permanent);
    }

    #[test]
    fn test_file_writer_appends() {
        let dir = std::env::temp_dir().join("deferlog-writer-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("out.log");
        let _ = std::fs::remove_file(&path);

        let mut writer = FileWriter::new(&path).unwrap();
        assert_eq!(writer.write(b"hello ").unwrap(), 6);
        assert_eq!(writer.write(b"world").unwrap(), 5);
        drop(writer);

        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
        let _ = std::fs::remove_file(&path);
    }
}
