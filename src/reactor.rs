//! Socket reactor.
//!
//! One `poll_once` call waits for the connection descriptor to become ready
//! and dispatches the connection's hooks in the order error, write, read.
//! The descriptor is re-read between hooks because a hook may close the
//! connection; once it is gone the remaining hooks are skipped.
//!
//! The connection lock is held only around the descriptor query and the hook
//! calls, never across the wait, so command issuers on other threads are not
//! blocked while the reactor sleeps.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use parking_lot::Mutex;

use ib_gateway::SocketPump;

use crate::errors::SessionError;

// ============================================================================
// Multiplexer
// ============================================================================

/// Readiness the reactor asks for. Read and error are always of interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub write: bool,
}

/// Readiness reported by a multiplexer. All false means the wait timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

impl Readiness {
    pub fn is_empty(&self) -> bool {
        !(self.readable || self.writable || self.error)
    }
}

/// Waits for readiness on a single descriptor.
pub trait Multiplexer: Send {
    fn wait(&mut self, fd: RawFd, interest: Interest, timeout: Duration) -> io::Result<Readiness>;
}

/// `poll(2)`-based multiplexer.
#[derive(Debug, Default, Clone, Copy)]
pub struct PollMultiplexer;

impl Multiplexer for PollMultiplexer {
    fn wait(&mut self, fd: RawFd, interest: Interest, timeout: Duration) -> io::Result<Readiness> {
        let mut events = libc::POLLIN;
        if interest.write {
            events |= libc::POLLOUT;
        }
        let mut pfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        let millis = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);

        // SAFETY: `pfd` is a valid, exclusively borrowed pollfd and nfds is 1.
        let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Readiness::default());
            }
            return Err(err);
        }

        let revents = pfd.revents;
        Ok(Readiness {
            // A hang-up is reported as readable so the hook observes EOF.
            readable: revents & (libc::POLLIN | libc::POLLHUP) != 0,
            writable: revents & libc::POLLOUT != 0,
            error: revents & (libc::POLLERR | libc::POLLNVAL) != 0,
        })
    }
}

// ============================================================================
// Reactor
// ============================================================================

/// Result of one reactor iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Keep looping.
    Continue,
    /// The wait itself failed; the connection has been closed.
    Stop,
}

pub struct Reactor {
    mux: Box<dyn Multiplexer>,
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new(Box::new(PollMultiplexer))
    }
}

impl Reactor {
    pub fn new(mux: Box<dyn Multiplexer>) -> Self {
        Self { mux }
    }

    /// Waits up to `timeout` and runs the ready hooks of `conn`.
    pub fn poll_once<T>(&mut self, conn: &Mutex<T>, timeout: Duration) -> PollOutcome
    where
        T: SocketPump + ?Sized,
    {
        let (fd, interest) = {
            let guard = conn.lock();
            match guard.fd() {
                Some(fd) => (
                    fd,
                    Interest {
                        write: !guard.is_out_buffer_empty(),
                    },
                ),
                None => return PollOutcome::Continue,
            }
        };

        let ready = match self.mux.wait(fd, interest, timeout) {
            Ok(ready) => ready,
            Err(e) => {
                let err = SessionError::ReactorIo(e);
                tracing::error!(fd, "{err}; closing connection");
                conn.lock().disconnect();
                return PollOutcome::Stop;
            }
        };
        if ready.is_empty() {
            return PollOutcome::Continue;
        }

        let mut guard = conn.lock();
        if ready.error {
            if guard.fd().is_none() {
                return PollOutcome::Continue;
            }
            guard.on_error();
        }
        if ready.writable {
            if guard.fd().is_none() {
                return PollOutcome::Continue;
            }
            guard.on_send();
        }
        if ready.readable {
            if guard.fd().is_none() {
                return PollOutcome::Continue;
            }
            guard.on_receive();
        }
        PollOutcome::Continue
    }
}

// ============================================================================
// Tests
// ============================================================================
