use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// One-shot completion flag set from a delivery thread and awaited, with a
/// bound, by the capturing thread.
///
/// Setting happens under the mutex, so every write the setter made before
/// `set` is visible to a waiter that observes the flag.
#[derive(Default)]
pub struct CompletionSignal {
    done: Mutex<bool>,
    cond: Condvar,
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.done.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.done.lock()
    }

    /// Block until set or until `timeout` elapses. Returns whether the
    /// signal was set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock();
        while !*done {
            if self.cond.wait_until(&mut done, deadline).timed_out() {
                return *done;
            }
        }
        true
    }
}
