use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Generation-counted wakeup event.
///
/// A waiter snapshots the generation with [`Event::generation`] *before*
/// re-checking whatever condition it is blocked on, then passes the snapshot
/// to [`Event::wait`]. If a notification arrived between the snapshot and the
/// wait, the wait returns immediately, so wakeups cannot be lost.
///
/// Only slow paths touch this type; the log's hot path performs no lock or
/// system call.
#[derive(Debug, Default)]
pub(crate) struct Event {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl Event {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Snapshot the current generation.
    pub(crate) fn generation(&self) -> u64 {
        *self.generation.lock().unwrap()
    }

    /// Wake every thread blocked in `wait`/`wait_timeout`.
    pub(crate) fn notify_all(&self) {
        let mut generation = self.generation.lock().unwrap();
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Block until a notification arrives after the `seen` snapshot.
    pub(crate) fn wait(&self, seen: u64) {
        let mut generation = self.generation.lock().unwrap();
        while *generation == seen {
            generation = self.cond.wait(generation).unwrap();
        }
    }

    /// Block until a notification or until `timeout` elapses. Returns true if
    /// a notification arrived.
    pub(crate) fn wait_timeout(&self, seen: u64, timeout: Duration) -> bool {
        let mut generation = self.generation.lock().unwrap();
        if *generation != seen {
            return true;
        }
        if timeout.is_zero() {
            return false;
        }
        let (generation, result) = self
            .cond
            .wait_timeout_while(generation, timeout, |generation| *generation == seen)
            .unwrap();
        drop(generation);
        !result.timed_out()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_notification_before_wait_is_not_lost() {
        let event = Event::new();
        let seen = event.generation();
        event.notify_all();
        // Must return immediately rather than time out.
        assert!(event.wait_timeout(seen, Duration::from_secs(10)));
    }

    #[test]
    fn test_wait_timeout_expires() {
        let event = Event::new();
        let seen = event.generation();
        assert!(!event.wait_timeout(seen, Duration::from_millis(10)));
    }

    #[test]
    fn test_cross_thread_wakeup() {
        let event = Arc::new(Event::new());
        let seen = event.generation();
        let waker = {
            let event = Arc::clone(&event);
            thread::spawn(move || event.notify_all())
        };
        event.wait(seen);
        waker.join().unwrap();
    }
}
