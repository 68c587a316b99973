//! deferlog — low-latency deferred-formatting log.
//!
//! The producer side of a log call completes in bounded, cache-local time:
//! it copies the arguments into a per-thread circular byte ring, stamps a
//! type-erased dispatch pointer in front of them, and enqueues a commit
//! extent on a bounded lock-free MPSC queue. No I/O, no contended locks, no
//! formatting. A dedicated background thread pops extents, walks each ring,
//! invokes the dispatch function of every frame to format it into a staging
//! buffer, and flushes completed frames to a [`Writer`].
//!
//! # Architecture
//!
//! - One input ring per producer thread per log; frames are handed over by
//!   `(ring, end)` commit extents, so producers never contend with each
//!   other.
//! - One dispatch function per `(Formatter, Payload)` pair, monomorphized at
//!   the `write` call site, is the only thing the consumer needs to know to
//!   reconstruct and format a frame.
//! - Writer failures are classified temporary/permanent and handled per
//!   configurable [`ErrorPolicy`]; a panic flush drains what it can from a
//!   crashing process.
//!
//! # Example
//!
//! ```no_run
//! use deferlog::{FileWriter, SeverityLog};
//!
//! let log = SeverityLog::open(Box::new(FileWriter::new("app.log")?))?;
//! log.info("connected to %s in %.2f ms", ("db-1", 0.35))?;
//! log.close()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Custom record types implement [`Formatter`] and go through
//! [`Log::write`]; the formatter runs on the consumer thread with the
//! payload the producer moved in.

mod backoff;
mod config;
mod crash;
mod error;
mod event;
mod frame;
mod log;
mod metrics;
mod ntoa;
mod output;
mod queue;
mod ring;
mod severity;
mod template;
mod writer;

pub use config::Config;
pub use crash::{install_crash_handler, uninstall_crash_handler};
pub use error::{ErrorPolicy, FlushError, FormatError, Severity, WriteError};
pub use frame::Formatter;
pub use log::Log;
pub use metrics::MetricsSnapshot;
pub use ntoa::{
    ftoa_base10_f, ftoa_base10_g, itoa_base10, itoa_base16, ConversionSpec, Integer,
};
pub use output::{FormatErrorCallback, OutputBuffer, WriterErrorCallback};
pub use severity::SeverityLog;
pub use template::{TemplateArg, TemplateArgs, TemplateFormatter};
pub use writer::{classify_io_error, FileWriter, StdoutWriter, Writer};
