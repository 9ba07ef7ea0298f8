//! One-bit work signaller.
//!
//! `signal` sets the bit and wakes one waiter if it was clear;
//! `wait_until_signalled` atomically consumes the bit, sleeping only when it
//! was already clear. Multiple signals before a wait collapse into one wake.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

#[derive(Default)]
pub struct WorkSignaller {
    signalled: Mutex<bool>,
    cond: Condvar,
}

impl WorkSignaller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        let mut flag = self.signalled.lock().unwrap();
        if !*flag {
            *flag = true;
            self.cond.notify_one();
        }
    }

    pub fn wait_until_signalled(&self) {
        let mut flag = self.signalled.lock().unwrap();
        while !*flag {
            flag = self.cond.wait(flag).unwrap();
        }
        *flag = false;
    }

    /// Returns true if signalled, false on timeout.
    pub fn wait_until_signalled_or_timeout(&self, timeout: Duration) -> bool {
        let mut flag = self.signalled.lock().unwrap();
        if !*flag {
            let (guard, result) = self
                .cond
                .wait_timeout_while(flag, timeout, |signalled| !*signalled)
                .unwrap();
            flag = guard;
            if result.timed_out() && !*flag {
                return false;
            }
        }
        *flag = false;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn signal_before_wait_does_not_block() {
        let signaller = WorkSignaller::new();
        signaller.signal();
        signaller.wait_until_signalled();
    }

    #[test]
    fn wait_consumes_the_signal() {
        let signaller = WorkSignaller::new();
        signaller.signal();
        signaller.signal();
        signaller.wait_until_signalled();
        assert!(!signaller.wait_until_signalled_or_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn signal_wakes_a_waiting_thread() {
        let signaller = Arc::new(WorkSignaller::new());
        let waiter = {
            let signaller = Arc::clone(&signaller);
            std::thread::spawn(move || {
                signaller.wait_until_signalled();
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        signaller.signal();
        waiter.join().unwrap();
    }
}
