//! Backpressure for indexing threads.
//!
//! When DWPTs become flush pending faster than they can be written, new
//! indexing calls block here until flushing catches up. The gate stalls once
//! more than twice the thread pool size DWPTs are pending and opens again
//! when the pending count drops to the number of DWPTs actively flushing.

use std::time::Duration;

use log::debug;
use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
pub struct StallControl {
    stalled: Mutex<bool>,
    released: Condvar,
    pool_size: usize,
}

impl StallControl {
    pub fn new(pool_size: usize) -> Self {
        StallControl {
            stalled: Mutex::new(false),
            released: Condvar::new(),
            pool_size: pool_size.max(1),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Next stall state given the current counts.
    pub fn should_stall(&self, currently_stalled: bool, pending: usize, flushing: usize) -> bool {
        if currently_stalled {
            pending > flushing
        } else {
            pending > 2 * self.pool_size
        }
    }

    /// Re-evaluate the gate. Returns the new state.
    pub fn update(&self, pending: usize, flushing: usize) -> bool {
        let mut current = self.stalled.lock();
        let stalled = self.should_stall(*current, pending, flushing);
        if stalled != *current {
            *current = stalled;
            if stalled {
                debug!("indexing stalled: {pending} DWPTs pending flush, {flushing} flushing");
            } else {
                debug!("indexing released: {pending} DWPTs pending flush, {flushing} flushing");
                self.released.notify_all();
            }
        }
        stalled
    }

    /// Force the gate open, e.g. when the writer closes.
    pub fn release(&self) {
        let mut stalled = self.stalled.lock();
        if *stalled {
            *stalled = false;
            self.released.notify_all();
        }
    }

    /// Block while stalled, at most `timeout`. Returns whether the gate is
    /// open. Callers loop so they can help flushing between waits.
    pub fn wait_if_stalled_for(&self, timeout: Duration) -> bool {
        let mut stalled = self.stalled.lock();
        if *stalled {
            let _ = self.released.wait_for(&mut stalled, timeout);
        }
        !*stalled
    }

    pub fn is_stalled(&self) -> bool {
        *self.stalled.lock()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_thresholds() {
        let control = StallControl::new(2);
        assert!(!control.update(4, 0));
        assert!(control.update(5, 0));
        // stays stalled until pending drops to the flushing count
        assert!(control.update(3, 2));
        assert!(!control.update(2, 2));
        assert!(!control.is_stalled());
    }

    #[test]
    fn test_blocked_thread_released_by_flush_completion() {
        let control = Arc::new(StallControl::new(1));
        assert!(control.update(3, 1));

        let (tx, rx) = crossbeam_channel::bounded(1);
        let waiter = {
            let control = Arc::clone(&control);
            thread::spawn(move || {
                while !control.wait_if_stalled_for(Duration::from_millis(20)) {}
                tx.send(()).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(!control.update(1, 1));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();
    }

    #[test]
    fn test_release_opens_gate() {
        let control = StallControl::new(1);
        control.update(10, 0);
        assert!(!control.wait_if_stalled_for(Duration::from_millis(10)));
        control.release();
        assert!(control.wait_if_stalled_for(Duration::from_secs(5)));
        assert!(!control.is_stalled());
    }
}
