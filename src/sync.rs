//! Small synchronisation primitives shared by the client mailbox and
//! server dispatcher.
//!
//! The original source builds these out of `SyncSemThread`/`SemThread`
//! counting and binary semaphores (see `spec.md` §9, "Inheritance via
//! Handle_upCast/downCast on semaphore types"). Rust has no portable
//! semaphore in `std`, so a binary semaphore ("has the event fired yet")
//! is the one primitive worth hand-rolling here — it is what
//! `ClientMailbox`'s `Recipient.event` needs and nothing in `std` or the
//! crates this crate already depends on provides it directly.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A binary semaphore: `post` sets a flag and wakes one waiter; `wait`
/// blocks until the flag is set, then clears it.
///
/// Mirrors `SemThread_post`/`SemThread_pend` as used on `Recipient.event`
/// in `RcmClient_getReturnMsg_P`.
#[derive(Debug)]
pub struct Event {
    state: Mutex<bool>,
    cond: Condvar,
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl Event {
    /// Creates an unset event.
    pub fn new() -> Self {
        Event {
            state: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Sets the flag and wakes the (single) waiter.
    pub fn post(&self) {
        let mut fired = self.state.lock().unwrap();
        *fired = true;
        self.cond.notify_one();
    }

    /// Blocks until `post` is called, then clears the flag.
    pub fn wait(&self) {
        let mut fired = self.state.lock().unwrap();
        while !*fired {
            fired = self.cond.wait(fired).unwrap();
        }
        *fired = false;
    }

    /// Blocks until `post` is called or `timeout` elapses. Returns `true`
    /// if the event fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut fired = self.state.lock().unwrap();
        while !*fired {
            let (guard, result) = self.cond.wait_timeout(fired, timeout).unwrap();
            fired = guard;
            if result.timed_out() && !*fired {
                return false;
            }
        }
        *fired = false;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn post_wakes_waiter() {
        let event = Arc::new(Event::new());
        let waiter = Arc::clone(&event);
        let handle = thread::spawn(move || waiter.wait());
        thread::sleep(Duration::from_millis(20));
        event.post();
        handle.join().unwrap();
    }

    #[test]
    fn wait_timeout_expires() {
        let event = Event::new();
        assert!(!event.wait_timeout(Duration::from_millis(10)));
    }
}
