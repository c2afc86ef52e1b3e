//! Connection state machine and the table of live connections.
//!
//! A connection moves `Accepted -> Readable <-> Flushing -> Closing -> Closed`.
//! The table owns the socket for as long as it is registered with the
//! multiplexer; removing the entry is the only way a socket leaves the
//! interest set.

use crate::runtime::echo::write_nonblocking;
use bytes::{Buf, BytesMut};
use mio::Token;
use slab::Slab;
use std::io::{self, Write};
use std::net::SocketAddr;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted but not yet registered for reads.
    Accepted,
    /// Registered for read readiness; echoes inline.
    Readable,
    /// The kernel refused part of an echo; waiting for write readiness.
    Flushing,
    /// Peer closed or an I/O error occurred; teardown pending.
    Closing,
    /// Socket closed and unregistered. Terminal.
    Closed,
}

/// Why a connection was torn down.
#[derive(Debug)]
pub enum CloseReason {
    /// Zero-length read: the peer performed an orderly shutdown.
    PeerClosed,
    /// Read or write failed.
    Error(io::Error),
    /// The service is stopping.
    Shutdown,
}

/// A single client connection (or datagram peer session).
#[derive(Debug)]
pub struct Connection<S> {
    pub stream: S,
    pub peer: SocketAddr,
    pub state: ConnState,
    /// Echo bytes the kernel has not accepted yet.
    pending: BytesMut,
}

impl<S> Connection<S> {
    pub fn new(stream: S, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::Accepted,
            pending: BytesMut::new(),
        }
    }

    pub fn start_reading(&mut self) {
        self.state = ConnState::Readable;
    }

    /// Queue the unsent tail of an echo and wait for write readiness.
    pub fn start_flushing(&mut self, unsent: &[u8]) {
        self.pending.extend_from_slice(unsent);
        self.state = ConnState::Flushing;
    }

    /// Mark connection for closing.
    pub fn close(&mut self) {
        self.state = ConnState::Closing;
    }

    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Drop `n` bytes the kernel has accepted from the front of the backlog.
    pub fn consume_pending(&mut self, n: usize) {
        self.pending.advance(n);
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

impl<S: Write> Connection<S> {
    /// Push the backlog into the socket until it is empty or would block.
    ///
    /// Returns `true` once nothing is left to send.
    pub fn flush_pending(&mut self) -> io::Result<bool> {
        let n = write_nonblocking(&mut self.stream, &self.pending)?;
        self.consume_pending(n);
        Ok(!self.has_pending())
    }
}

/// Table of live connections keyed by multiplexer token.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionTable<S> {
    connections: Slab<Connection<S>>,
}

impl<S> ConnectionTable<S> {
    pub fn new() -> Self {
        Self {
            connections: Slab::new(),
        }
    }

    /// Insert a connection built for the token it will be stored under.
    ///
    /// `build` runs before anything is stored, so a failure (typically the
    /// multiplexer refusing the registration) leaves the table untouched.
    pub fn insert_with<F>(&mut self, build: F) -> io::Result<Token>
    where
        F: FnOnce(Token) -> io::Result<Connection<S>>,
    {
        let entry = self.connections.vacant_entry();
        let token = Token(entry.key());
        entry.insert(build(token)?);
        Ok(token)
    }

    pub fn insert(&mut self, conn: Connection<S>) -> Token {
        Token(self.connections.insert(conn))
    }

    pub fn get(&self, token: Token) -> Option<&Connection<S>> {
        self.connections.get(token.0)
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut Connection<S>> {
        self.connections.get_mut(token.0)
    }

    pub fn remove(&mut self, token: Token) -> Option<Connection<S>> {
        self.connections.try_remove(token.0)
    }

    pub fn contains(&self, token: Token) -> bool {
        self.connections.contains(token.0)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Tokens of every live connection.
    pub fn tokens(&self) -> Vec<Token> {
        self.connections.iter().map(|(key, _)| Token(key)).collect()
    }
}

impl<S> Default for ConnectionTable<S> {
    fn default() -> Self {
        Self::new()
    }
}
