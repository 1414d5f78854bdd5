//! Condition-variable gate shared between the reactor thread and callers.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Pending,
    Open,
    Closed,
}

/// A resettable latch.
///
/// Waiters block until the gate is opened or shut down. `wait_for` returns
/// true only for an open gate, so a shutdown releases waiters with a
/// negative answer.
#[derive(Debug)]
pub struct Gate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Pending),
            cond: Condvar::new(),
        }
    }

    /// Opens the gate and wakes every waiter. No effect after `shutdown`.
    pub fn open(&self) {
        let mut state = self.state.lock();
        if *state != GateState::Closed {
            *state = GateState::Open;
            self.cond.notify_all();
        }
    }

    /// Back to pending. No effect after `shutdown`.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        if *state == GateState::Open {
            *state = GateState::Pending;
        }
    }

    /// Closes the gate for good and releases every waiter.
    pub fn shutdown(&self) {
        *self.state.lock() = GateState::Closed;
        self.cond.notify_all();
    }

    pub fn is_open(&self) -> bool {
        *self.state.lock() == GateState::Open
    }

    pub fn is_shut(&self) -> bool {
        *self.state.lock() == GateState::Closed
    }

    /// Blocks until the gate leaves `Pending` or `timeout` elapses.
    /// Returns true iff the gate is open.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        while *state == GateState::Pending {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
        *state == GateState::Open
    }

    /// Blocks until the gate leaves `Pending`.
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock();
        while *state == GateState::Pending {
            self.cond.wait(&mut state);
        }
        *state == GateState::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn times_out_while_pending() {
        let gate = Gate::new();
        assert!(!gate.wait_for(Duration::from_millis(10)));
        assert!(!gate.is_open());
    }

    #[test]
    fn open_releases_waiter() {
        let gate = Arc::new(Gate::new());
        let waiter = {
            let gate = Arc::clone(&gate);
            std::thread::spawn(move || gate.wait_for(Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(20));
        gate.open();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn shutdown_releases_with_false_and_sticks() {
        let gate = Arc::new(Gate::new());
        let waiter = {
            let gate = Arc::clone(&gate);
            std::thread::spawn(move || gate.wait())
        };
        std::thread::sleep(Duration::from_millis(20));
        gate.shutdown();
        assert!(!waiter.join().unwrap());

        gate.open();
        gate.reset();
        assert!(gate.is_shut());
        assert!(!gate.wait_for(Duration::ZERO));
    }

    #[test]
    fn reset_rearms() {
        let gate = Gate::new();
        gate.open();
        assert!(gate.wait_for(Duration::ZERO));
        gate.reset();
        assert!(!gate.wait_for(Duration::from_millis(5)));
    }
}
