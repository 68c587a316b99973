//! Crash-handler integration: flush registered logs when the process
//! panics.
//!
//! A process-wide registry holds the logs to rescue plus the previously
//! installed panic hook. The hook triggers a panic flush on every registered
//! log, waits a bounded time for each, then chains to the previous hook so
//! default backtrace printing still happens. This is the portable crash
//! path; signal-level integration is left to the embedding application.

use crate::log::Log;
use std::panic::{self, PanicHookInfo};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

const PANIC_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

struct Registry {
    logs: Vec<Arc<Log>>,
    previous_hook: Option<Box<dyn Fn(&PanicHookInfo<'_>) + Send + Sync>>,
}

fn registry() -> &'static Mutex<Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        Mutex::new(Registry {
            logs: Vec::new(),
            previous_hook: None,
        })
    })
}

fn crash_hook(info: &PanicHookInfo<'_>) {
    // Flush first: the previous hook may abort the process.
    let logs: Vec<Arc<Log>> = registry().lock().unwrap().logs.clone();
    for log in &logs {
        log.start_panic_flush();
        log.await_panic_flush(Some(PANIC_FLUSH_TIMEOUT));
    }
    let registry = registry().lock().unwrap();
    if let Some(previous) = &registry.previous_hook {
        previous(info);
    }
}

/// Registers `log` to be panic-flushed when the process panics. The first
/// registration installs the hook, chaining whatever hook was set before.
pub fn install_crash_handler(log: &Arc<Log>) {
    let mut registry = registry().lock().unwrap();
    if registry.logs.is_empty() && registry.previous_hook.is_none() {
        registry.previous_hook = Some(panic::take_hook());
        panic::set_hook(Box::new(crash_hook));
    }
    registry.logs.push(Arc::clone(log));
}

/// Unregisters `log`. Removing the last log restores the previous panic
/// hook.
pub fn uninstall_crash_handler(log: &Arc<Log>) {
    let mut registry = registry().lock().unwrap();
    registry.logs.retain(|entry| !Arc::ptr_eq(entry, log));
    if registry.logs.is_empty() {
        if let Some(previous) = registry.previous_hook.take() {
            panic::set_hook(previous);
        }
    }
}
