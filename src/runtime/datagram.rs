//! UDP echo reactor with per-peer pseudo-sessions.
//!
//! The rendezvous socket only sees the first datagram of each peer. That
//! datagram opens a session: a new socket bound to the rendezvous address
//! and connected to the peer, registered with the multiplexer and used to
//! answer. From then on the kernel delivers that peer's datagrams to the
//! connected socket, so each session behaves like a connection in the TCP
//! reactor without an accept step.
//!
//! Datagrams are echoed whole, capped at the buffer size, never reassembled.

use crate::config::Config;
use crate::error::{ServeResult, SetupError};
use crate::runtime::connection::{CloseReason, ConnState, Connection, ConnectionTable};
use crate::runtime::listener;
use crate::runtime::multiplexer::{Multiplexer, Ready, ShutdownHandle, Wake};
use mio::net::UdpSocket;
use mio::{Interest, Token};
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

const RENDEZVOUS_TOKEN: Token = Token(usize::MAX);

enum Drain {
    Idle,
    Deferred,
    Close(CloseReason),
}

pub struct DatagramReactor {
    mux: Multiplexer,
    rendezvous: UdpSocket,
    local_addr: SocketAddr,
    sessions: ConnectionTable<UdpSocket>,
    /// Peer to session, for datagrams that reach the rendezvous socket
    /// before the session socket was connected.
    peers: HashMap<SocketAddr, Token>,
    buf: Vec<u8>,
    read_budget: usize,
    ready: Vec<Ready>,
    deferred: Vec<Token>,
    serviced: HashSet<Token>,
    first_contacts: u64,
    /// Every datagram read from the rendezvous socket, first contact or not.
    rendezvous_receives: u64,
}

impl DatagramReactor {
    pub fn bind(config: &Config) -> Result<Self, SetupError> {
        let socket = listener::bind_rendezvous(config)?;
        let local_addr = socket
            .local_addr()
            .and_then(|addr| socket.set_nonblocking(true).map(|_| addr))
            .map_err(|source| SetupError::Bind {
                addr: format!("{}:{}", config.host, config.port),
                source,
            })?;

        let mut rendezvous = UdpSocket::from_std(socket);
        let mut mux = Multiplexer::new(config.events_capacity).map_err(SetupError::Multiplexer)?;
        mux.register(&mut rendezvous, RENDEZVOUS_TOKEN, Interest::READABLE)
            .map_err(SetupError::Multiplexer)?;

        Ok(Self {
            mux,
            rendezvous,
            local_addr,
            sessions: ConnectionTable::new(),
            peers: HashMap::new(),
            buf: vec![0u8; config.buffer_size],
            read_budget: config.read_budget,
            ready: Vec::with_capacity(config.events_capacity),
            deferred: Vec::new(),
            serviced: HashSet::new(),
            first_contacts: 0,
            rendezvous_receives: 0,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.mux.shutdown_handle()
    }

    pub fn sessions(&self) -> &ConnectionTable<UdpSocket> {
        &self.sessions
    }

    /// Session serving `peer`, if one is open.
    pub fn session_for(&self, peer: &SocketAddr) -> Option<Token> {
        self.peers.get(peer).copied()
    }

    pub fn run(&mut self) -> ServeResult<()> {
        info!(addr = %self.local_addr, trigger = "edge", "Datagram reactor listening");

        while self.turn(None)? == Wake::Ready {}

        let open = self.sessions.len();
        for token in self.sessions.tokens() {
            self.close(token, CloseReason::Shutdown);
        }
        info!(
            closed = open,
            first_contacts = self.first_contacts,
            rendezvous_receives = self.rendezvous_receives,
            "Datagram reactor stopped"
        );
        Ok(())
    }

    pub fn turn(&mut self, timeout: Option<Duration>) -> ServeResult<Wake> {
        let timeout = if self.deferred.is_empty() {
            timeout
        } else {
            Some(Duration::ZERO)
        };

        let mut ready = std::mem::take(&mut self.ready);
        let wake = self.mux.wait(timeout, &mut ready);
        if !matches!(wake, Ok(Wake::Ready)) {
            self.ready = ready;
            return wake;
        }

        let deferred = std::mem::take(&mut self.deferred);
        self.serviced.clear();

        for event in &ready {
            self.service(event.token);
        }
        for token in deferred {
            self.service(token);
        }

        self.ready = ready;
        Ok(Wake::Ready)
    }

    /// Read from `token` once per turn at most, however many times it is woken.
    fn service(&mut self, token: Token) {
        if !self.serviced.insert(token) {
            return;
        }

        if token == RENDEZVOUS_TOKEN {
            self.receive_first_contacts();
        } else if self.sessions.contains(token) {
            self.drain_session(token);
        }
    }

    fn receive_first_contacts(&mut self) {
        for _ in 0..self.read_budget {
            match self.rendezvous.recv_from(&mut self.buf) {
                Ok((n, peer)) => {
                    self.rendezvous_receives += 1;
                    match self.peers.get(&peer).copied() {
                        Some(token) => self.reply_in_session(token, n),
                        None => self.open_session(peer, n),
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Rendezvous receive failed");
                    return;
                }
            }
        }
        self.defer(RENDEZVOUS_TOKEN);
    }

    fn defer(&mut self, token: Token) {
        if !self.deferred.contains(&token) {
            self.deferred.push(token);
        }
    }

    /// Open a dedicated socket for `peer` and answer its first datagram on it.
    fn open_session(&mut self, peer: SocketAddr, len: usize) {
        self.first_contacts += 1;
        trace!(peer = %peer, bytes = len, "First datagram from peer");

        let local = self.local_addr;
        let mux = &mut self.mux;
        let opened = self.sessions.insert_with(move |token| {
            let mut socket = UdpSocket::from_std(listener::peer_socket(local, peer)?);
            mux.register(&mut socket, token, Interest::READABLE)?;
            let mut session = Connection::new(socket, peer);
            session.start_reading();
            Ok(session)
        });

        match opened {
            Ok(token) => {
                self.peers.insert(peer, token);
                info!(conn_id = token.0, peer = %peer, "Peer session opened");
                self.reply_in_session(token, len);
            }
            Err(e) => warn!(peer = %peer, error = %e, "Failed to open peer session"),
        }
    }

    /// Echo the first `len` bytes of the shared buffer through a session socket.
    fn reply_in_session(&mut self, token: Token, len: usize) {
        let Some(session) = self.sessions.get_mut(token) else {
            return;
        };

        match session.stream.send(&self.buf[..len]) {
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!(conn_id = token.0, "Send buffer full, datagram dropped");
            }
            Err(e) => {
                session.close();
                self.close(token, CloseReason::Error(e));
            }
        }
    }

    fn drain_session(&mut self, token: Token) {
        let budget = self.read_budget;
        let mut outcome = Drain::Deferred;

        for _ in 0..budget {
            let Some(session) = self.sessions.get_mut(token) else {
                return;
            };
            match session.stream.recv(&mut self.buf) {
                Ok(n) => {
                    trace!(conn_id = token.0, bytes = n, "Echoing datagram");
                    self.reply_in_session(token, n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    outcome = Drain::Idle;
                    break;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // e.g. ICMP port unreachable reported on the connected socket
                Err(e) => {
                    session.close();
                    outcome = Drain::Close(CloseReason::Error(e));
                    break;
                }
            }
        }

        match outcome {
            Drain::Idle => {}
            Drain::Deferred => {
                if self.sessions.contains(token) {
                    self.defer(token);
                }
            }
            Drain::Close(reason) => self.close(token, reason),
        }
    }

    fn close(&mut self, token: Token, reason: CloseReason) {
        let Some(mut session) = self.sessions.remove(token) else {
            return;
        };

        let _ = self.mux.unregister(&mut session.stream);
        self.peers.remove(&session.peer);
        self.deferred.retain(|t| *t != token);
        session.state = ConnState::Closed;

        match reason {
            CloseReason::Error(e) => {
                warn!(conn_id = token.0, peer = %session.peer, error = %e, "Peer session error")
            }
            CloseReason::PeerClosed | CloseReason::Shutdown => {
                debug!(conn_id = token.0, peer = %session.peer, "Peer session closed")
            }
        }
    }
}
