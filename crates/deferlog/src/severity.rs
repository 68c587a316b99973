//! Severity-tagged line façade over the generic write path.
//!
//! Each record becomes `<letter> <formatted body>\n` — enough structure for
//! grep without imposing a record schema.

use crate::config::Config;
use crate::error::{ErrorPolicy, FlushError, WriteError};
use crate::frame::Formatter;
use crate::log::Log;
use crate::output::OutputBuffer;
use crate::template::TemplateArgs;
use crate::writer::Writer;
use std::io;

struct SeverityFormatter;

impl<A: TemplateArgs> Formatter<(u8, &'static str, A)> for SeverityFormatter {
    fn format(out: &mut OutputBuffer, payload: (u8, &'static str, A)) -> Result<(), FlushError> {
        let (severity, fmt, args) = payload;
        out.write_byte(severity)?;
        out.write_byte(b' ')?;
        args.format_with(out, fmt)?;
        out.write_byte(b'\n')
    }
}

/// A [`Log`] that writes one severity-tagged line per record.
///
/// ```no_run
/// use deferlog::{FileWriter, SeverityLog};
///
/// let log = SeverityLog::open(Box::new(FileWriter::new("app.log")?))?;
/// log.info("listening on port %d", (8080,))?;
/// log.warn("%s is %.1f%% full", ("/var", 93.5))?;
/// log.close()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct SeverityLog {
    log: Log,
}

impl SeverityLog {
    pub fn open(writer: Box<dyn Writer>) -> io::Result<Self> {
        Ok(Self {
            log: Log::open(writer)?,
        })
    }

    pub fn with_config(writer: Box<dyn Writer>, config: Config) -> io::Result<Self> {
        Ok(Self {
            log: Log::with_config(writer, config)?,
        })
    }

    pub fn debug<A: TemplateArgs>(&self, fmt: &'static str, args: A) -> Result<(), WriteError> {
        self.write(b'D', fmt, args)
    }

    pub fn info<A: TemplateArgs>(&self, fmt: &'static str, args: A) -> Result<(), WriteError> {
        self.write(b'I', fmt, args)
    }

    pub fn warn<A: TemplateArgs>(&self, fmt: &'static str, args: A) -> Result<(), WriteError> {
        self.write(b'W', fmt, args)
    }

    pub fn error<A: TemplateArgs>(&self, fmt: &'static str, args: A) -> Result<(), WriteError> {
        self.write(b'E', fmt, args)
    }

    fn write<A: TemplateArgs>(
        &self,
        severity: u8,
        fmt: &'static str,
        args: A,
    ) -> Result<(), WriteError> {
        self.log
            .write::<SeverityFormatter, (u8, &'static str, A)>((severity, fmt, args))
    }

    pub fn flush(&self) -> Result<(), WriteError> {
        self.log.flush()
    }

    pub fn close(self) -> Result<(), WriteError> {
        self.log.close()
    }

    pub fn set_temporary_error_policy(&self, policy: ErrorPolicy) {
        self.log.set_temporary_error_policy(policy);
    }

    pub fn set_permanent_error_policy(&self, policy: ErrorPolicy) {
        self.log.set_permanent_error_policy(policy);
    }

    /// The underlying log, for callback and panic-flush wiring.
    pub fn as_log(&self) -> &Log {
        &self.log
    }
}
