//! Readiness multiplexer.
//!
//! Thin ownership layer over `mio::Poll` (epoll on Linux, kqueue on macOS).
//! Delivery is edge-triggered: a source is reported once per readiness
//! transition, so every handler must keep issuing the syscall until it
//! returns `WouldBlock` (or explicitly defer the leftover work).
//!
//! The watched set is unbounded. The event batch grows with the number of
//! registered sources so one `wait` can report all of them.

use crate::error::{ServeError, ServeResult};
use crate::runtime::signal;
use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Token reserved for the shutdown waker.
pub const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// What a source is ready for after a `wait`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// Peer hung up one or both directions.
    pub closed: bool,
    pub error: bool,
}

/// One entry of a `wait` result.
#[derive(Debug, Clone, Copy)]
pub struct Ready {
    pub token: Token,
    pub readiness: Readiness,
}

/// Why `wait` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// Zero or more sources are ready (zero only on timeout).
    Ready,
    /// Shutdown was requested, by signal or by a [`ShutdownHandle`].
    Shutdown,
}

/// Cloneable handle that stops a loop blocked in [`Multiplexer::wait`].
#[derive(Clone)]
pub struct ShutdownHandle {
    waker: Arc<Waker>,
    requested: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) -> io::Result<()> {
        self.requested.store(true, Ordering::SeqCst);
        self.waker.wake()
    }
}

pub struct Multiplexer {
    poll: Poll,
    events: Events,
    watched: usize,
    waker: Arc<Waker>,
    requested: Arc<AtomicBool>,
}

impl Multiplexer {
    /// Create a multiplexer whose first event batch holds `capacity` events.
    pub fn new(capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        Ok(Self {
            poll,
            events: Events::with_capacity(capacity.max(1)),
            watched: 0,
            waker,
            requested: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            waker: Arc::clone(&self.waker),
            requested: Arc::clone(&self.requested),
        }
    }

    /// Add `source` to the interest set under `token`.
    pub fn register<S>(&mut self, source: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.poll.registry().register(source, token, interest)?;
        self.watched += 1;
        Ok(())
    }

    /// Change the interest of an already registered source.
    pub fn reregister<S>(&mut self, source: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.poll.registry().reregister(source, token, interest)
    }

    /// Remove `source` from the interest set.
    pub fn unregister<S>(&mut self, source: &mut S) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.poll.registry().deregister(source)?;
        self.watched = self.watched.saturating_sub(1);
        Ok(())
    }

    /// Number of sources currently in the interest set.
    pub fn watched(&self) -> usize {
        self.watched
    }

    /// Block until a source is ready, `timeout` elapses or shutdown is requested.
    ///
    /// `ready` is cleared and refilled. Signal interruptions are retried
    /// unless they carried a termination request; any other OS failure is
    /// returned as [`ServeError::Wait`] and is not recoverable.
    pub fn wait(&mut self, timeout: Option<Duration>, ready: &mut Vec<Ready>) -> ServeResult<Wake> {
        ready.clear();

        if self.watched > self.events.capacity() {
            self.events = Events::with_capacity(self.watched.next_power_of_two());
            trace!(capacity = self.events.capacity(), "Grew event batch");
        }

        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                    if signal::terminate_requested() {
                        return Ok(Wake::Shutdown);
                    }
                }
                Err(e) => return Err(ServeError::Wait(e)),
            }
        }

        let mut wake = Wake::Ready;
        for event in self.events.iter() {
            if event.token() == WAKER_TOKEN {
                if self.requested.load(Ordering::SeqCst) {
                    wake = Wake::Shutdown;
                }
                continue;
            }

            ready.push(Ready {
                token: event.token(),
                readiness: Readiness {
                    readable: event.is_readable(),
                    writable: event.is_writable(),
                    closed: event.is_read_closed() || event.is_write_closed(),
                    error: event.is_error(),
                },
            });
        }

        if signal::terminate_requested() {
            wake = Wake::Shutdown;
        }
        Ok(wake)
    }
}
