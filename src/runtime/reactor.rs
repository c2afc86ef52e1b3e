//! Single-threaded TCP echo reactor.
//!
//! Readiness-based model: the multiplexer tells us when sockets are ready,
//! then we perform non-blocking accept/read/write syscalls. Nothing but
//! [`Multiplexer::wait`] ever blocks, so the connection table needs no
//! locking.
//!
//! Delivery is edge-triggered. A readable connection is drained until the
//! kernel reports `WouldBlock`, but at most `read_budget` reads per turn;
//! a connection that still has input after its budget is deferred to the
//! next turn so a busy client cannot starve accepts or other clients.
//! Every source is serviced at most once per turn, whether it was woken by
//! an event, deferred, or both.

use crate::config::Config;
use crate::error::{ServeResult, SetupError};
use crate::runtime::connection::{CloseReason, ConnState, Connection, ConnectionTable};
use crate::runtime::echo::write_nonblocking;
use crate::runtime::listener;
use crate::runtime::multiplexer::{Multiplexer, Readiness, Ready, ShutdownHandle, Wake};
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};
use std::collections::HashSet;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Poll timeout while only a failed accept is waiting to be retried.
const ACCEPT_RETRY: Duration = Duration::from_millis(10);

/// Result of draining one readable connection.
enum Drain {
    /// Kernel buffer empty.
    Idle,
    /// Budget exhausted with input possibly left.
    Deferred,
    /// Part of an echo is waiting for write readiness.
    Flush,
    Close(CloseReason),
}

pub struct Reactor {
    mux: Multiplexer,
    listener: TcpListener,
    local_addr: SocketAddr,
    connections: ConnectionTable<TcpStream>,
    /// Reusable read buffer, one chunk per read.
    buf: Vec<u8>,
    read_budget: usize,
    ready: Vec<Ready>,
    /// Sources to service next turn without waiting for a new edge. No duplicates.
    deferred: Vec<Token>,
    /// Sources already serviced during the current turn.
    serviced: HashSet<Token>,
}

impl Reactor {
    /// Bind the listener and register it with a fresh multiplexer.
    pub fn bind(config: &Config) -> Result<Self, SetupError> {
        let listener = listener::bind_tcp(config)?;
        let local_addr = listener
            .local_addr()
            .and_then(|addr| listener.set_nonblocking(true).map(|_| addr))
            .map_err(|source| SetupError::Listen {
                addr: format!("{}:{}", config.host, config.port),
                source,
            })?;

        let mut listener = TcpListener::from_std(listener);
        let mut mux = Multiplexer::new(config.events_capacity).map_err(SetupError::Multiplexer)?;
        mux.register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(SetupError::Multiplexer)?;

        Ok(Self {
            mux,
            listener,
            local_addr,
            connections: ConnectionTable::new(),
            buf: vec![0u8; config.buffer_size],
            read_budget: config.read_budget,
            ready: Vec::with_capacity(config.events_capacity),
            deferred: Vec::new(),
            serviced: HashSet::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.mux.shutdown_handle()
    }

    pub fn connections(&self) -> &ConnectionTable<TcpStream> {
        &self.connections
    }

    /// Serve until shutdown is requested, then close every connection.
    pub fn run(&mut self) -> ServeResult<()> {
        info!(addr = %self.local_addr, trigger = "edge", "Reactor listening");

        while self.turn(None)? == Wake::Ready {}

        let open = self.connections.len();
        self.close_all();
        info!(closed = open, "Reactor stopped");
        Ok(())
    }

    /// Wait once and process every event the wait returned.
    pub fn turn(&mut self, timeout: Option<Duration>) -> ServeResult<Wake> {
        let timeout = if self.deferred.iter().any(|token| *token != LISTENER_TOKEN) {
            Some(Duration::ZERO)
        } else if self.deferred.is_empty() {
            timeout
        } else {
            // don't spin on a persistent accept failure such as EMFILE
            Some(timeout.map_or(ACCEPT_RETRY, |t| t.min(ACCEPT_RETRY)))
        };

        let mut ready = std::mem::take(&mut self.ready);
        let wake = self.mux.wait(timeout, &mut ready);
        if !matches!(wake, Ok(Wake::Ready)) {
            self.ready = ready;
            return wake;
        }

        // Work deferred by the previous turn runs after this turn's events.
        let deferred = std::mem::take(&mut self.deferred);
        self.serviced.clear();

        for event in &ready {
            self.dispatch(event.token, event.readiness);
        }
        for token in deferred {
            if token == LISTENER_TOKEN {
                self.accept_connections();
            } else if self.connections.contains(token) {
                self.drain(token);
            }
        }

        self.ready = ready;
        Ok(Wake::Ready)
    }

    fn dispatch(&mut self, token: Token, readiness: Readiness) {
        if token == LISTENER_TOKEN {
            self.accept_connections();
            return;
        }

        // Stale events for a connection closed earlier in this batch
        let Some(state) = self.connections.get(token).map(|conn| conn.state) else {
            return;
        };

        match state {
            ConnState::Flushing if readiness.writable || readiness.error => self.flush(token),
            ConnState::Readable if readiness.readable || readiness.closed || readiness.error => {
                self.drain(token)
            }
            _ => {}
        }
    }

    fn accept_connections(&mut self) {
        if !self.serviced.insert(LISTENER_TOKEN) {
            return;
        }

        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let mux = &mut self.mux;
                    let inserted = self.connections.insert_with(move |token| {
                        mux.register(&mut stream, token, Interest::READABLE)?;
                        let mut conn = Connection::new(stream, peer);
                        conn.start_reading();
                        Ok(conn)
                    });

                    match inserted {
                        Ok(token) => info!(conn_id = token.0, peer = %peer, "Client connected"),
                        Err(e) => warn!(peer = %peer, error = %e, "Failed to register connection"),
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue
                }
                // The backlog may still hold connections and no new edge will
                // announce them, so try again next turn.
                Err(e) => {
                    warn!(error = %e, "Accept failed, retrying next turn");
                    self.defer(LISTENER_TOKEN);
                    break;
                }
            }
        }
    }

    fn drain(&mut self, token: Token) {
        let budget = self.read_budget;
        let Some(conn) = self.connections.get_mut(token) else {
            return;
        };
        if conn.state != ConnState::Readable || !self.serviced.insert(token) {
            return;
        }

        let mut reads = 0;
        let outcome = loop {
            if reads == budget {
                break Drain::Deferred;
            }

            let n = match conn.stream.read(&mut self.buf) {
                Ok(0) => {
                    conn.close();
                    break Drain::Close(CloseReason::PeerClosed);
                }
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break Drain::Idle,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    conn.close();
                    break Drain::Close(CloseReason::Error(e));
                }
            };
            reads += 1;
            trace!(conn_id = token.0, bytes = n, "Echoing");

            match write_nonblocking(&mut conn.stream, &self.buf[..n]) {
                Ok(written) if written == n => {}
                Ok(written) => {
                    conn.start_flushing(&self.buf[written..n]);
                    break Drain::Flush;
                }
                Err(e) => {
                    conn.close();
                    break Drain::Close(CloseReason::Error(e));
                }
            }
        };

        match outcome {
            Drain::Idle => {}
            Drain::Deferred => self.defer(token),
            Drain::Flush => {
                debug!(conn_id = token.0, "Echo backlogged, waiting for writable");
                self.set_interest(token, Interest::WRITABLE);
            }
            Drain::Close(reason) => self.close(token, reason),
        }
    }

    fn flush(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(token) else {
            return;
        };

        match conn.flush_pending() {
            Ok(true) => {
                conn.start_reading();
                trace!(conn_id = token.0, "Backlog flushed");
                if self.set_interest(token, Interest::READABLE) {
                    // Input that arrived while reads were paused produced no edge.
                    self.drain(token);
                }
            }
            Ok(false) => {}
            Err(e) => {
                conn.close();
                self.close(token, CloseReason::Error(e));
            }
        }
    }

    fn defer(&mut self, token: Token) {
        if !self.deferred.contains(&token) {
            self.deferred.push(token);
        }
    }

    /// Re-arm `token` with `interest`; a failure tears the connection down.
    fn set_interest(&mut self, token: Token, interest: Interest) -> bool {
        let Some(conn) = self.connections.get_mut(token) else {
            return false;
        };

        match self.mux.reregister(&mut conn.stream, token, interest) {
            Ok(()) => true,
            Err(e) => {
                conn.close();
                self.close(token, CloseReason::Error(e));
                false
            }
        }
    }

    /// Unregister, close and forget a connection in one step.
    fn close(&mut self, token: Token, reason: CloseReason) {
        let Some(mut conn) = self.connections.remove(token) else {
            return;
        };

        let _ = self.mux.unregister(&mut conn.stream);
        self.deferred.retain(|t| *t != token);
        conn.state = ConnState::Closed;

        match reason {
            CloseReason::PeerClosed => info!(conn_id = token.0, peer = %conn.peer, "Client closed"),
            CloseReason::Error(e) => {
                warn!(conn_id = token.0, peer = %conn.peer, error = %e, "Connection error")
            }
            CloseReason::Shutdown => debug!(conn_id = token.0, peer = %conn.peer, "Connection dropped on shutdown"),
        }
        // dropping `conn` closes the descriptor
    }

    fn close_all(&mut self) {
        for token in self.connections.tokens() {
            self.close(token, CloseReason::Shutdown);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;
    use std::io::Write;
    use std::net::TcpStream as StdStream;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    const TICK: Option<Duration> = Some(Duration::from_millis(10));

    fn reactor() -> Reactor {
        Reactor::bind(&Config::loopback(Mode::Reactor)).unwrap()
    }

    fn connect(reactor: &Reactor) -> StdStream {
        let stream = StdStream::connect(reactor.local_addr()).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_millis(10)))
            .unwrap();
        stream
    }

    fn pump_until(reactor: &mut Reactor, done: impl Fn(&Reactor) -> bool) {
        for _ in 0..500 {
            reactor.turn(TICK).unwrap();
            if done(reactor) {
                return;
            }
        }
        panic!("reactor never reached the expected state");
    }

    /// Interleave reactor turns with reads until `len` bytes came back.
    fn read_pumped(reactor: &mut Reactor, client: &mut StdStream, len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        for _ in 0..500 {
            reactor.turn(TICK).unwrap();
            match client.read(&mut buf) {
                Ok(0) => panic!("server closed the connection"),
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(ref e)
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
                Err(e) => panic!("read failed: {e}"),
            }
            if out.len() >= len {
                return out;
            }
        }
        panic!("echo incomplete: {} of {} bytes", out.len(), len);
    }

    fn spawn(config: Config) -> (SocketAddr, ShutdownHandle, thread::JoinHandle<Reactor>) {
        let mut reactor = Reactor::bind(&config).unwrap();
        let addr = reactor.local_addr();
        let handle = reactor.shutdown_handle();
        let join = thread::spawn(move || {
            reactor.run().unwrap();
            reactor
        });
        (addr, handle, join)
    }

    #[test]
    fn test_hello_then_close() {
        let mut reactor = reactor();
        let mut client = connect(&reactor);

        pump_until(&mut reactor, |r| r.connections().len() == 1);
        let token = reactor.connections().tokens()[0];
        assert_eq!(
            reactor.connections().get(token).unwrap().state,
            ConnState::Readable
        );

        client.write_all(b"hello").unwrap();
        assert_eq!(read_pumped(&mut reactor, &mut client, 5), b"hello");

        drop(client);
        pump_until(&mut reactor, |r| r.connections().is_empty());
        assert!(!reactor.connections().contains(token));
        // only the listener is still watched
        assert_eq!(reactor.mux.watched(), 1);
    }

    #[test]
    fn test_multi_chunk_payload_preserves_order() {
        let mut reactor = reactor();
        let mut client = connect(&reactor);

        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        client.write_all(&payload[..1234]).unwrap();
        client.write_all(&payload[1234..]).unwrap();

        assert_eq!(read_pumped(&mut reactor, &mut client, payload.len()), payload);
    }

    #[test]
    fn test_closing_one_leaves_others_working() {
        let mut reactor = reactor();
        let mut a = connect(&reactor);
        let b = connect(&reactor);
        let mut c = connect(&reactor);
        pump_until(&mut reactor, |r| r.connections().len() == 3);

        drop(b);
        pump_until(&mut reactor, |r| r.connections().len() == 2);

        a.write_all(b"from a").unwrap();
        assert_eq!(read_pumped(&mut reactor, &mut a, 6), b"from a");
        c.write_all(b"from c").unwrap();
        assert_eq!(read_pumped(&mut reactor, &mut c, 6), b"from c");
        assert_eq!(reactor.connections().len(), 2);
    }

    #[test]
    fn test_repeated_connect_disconnect_leaks_nothing() {
        let mut reactor = reactor();

        for i in 0..100u8 {
            let mut client = connect(&reactor);
            client.write_all(&[i]).unwrap();
            assert_eq!(read_pumped(&mut reactor, &mut client, 1), [i]);
            drop(client);
            pump_until(&mut reactor, |r| r.connections().is_empty());
        }

        assert_eq!(reactor.mux.watched(), 1);
        assert!(reactor.deferred.is_empty());
    }

    #[test]
    fn test_flooding_client_is_deferred_once_per_turn() {
        let mut config = Config::loopback(Mode::Reactor);
        config.read_budget = 1;
        let mut reactor = Reactor::bind(&config).unwrap();

        let flood = StdStream::connect(reactor.local_addr()).unwrap();
        let mut sink = flood.try_clone().unwrap();
        let stop = Arc::new(AtomicBool::new(false));

        let flooder = {
            let stop = stop.clone();
            thread::spawn(move || {
                let mut flood = flood;
                let chunk = [0xa5; 64 * 1024];
                while !stop.load(Ordering::SeqCst) {
                    if flood.write_all(&chunk).is_err() {
                        break;
                    }
                }
                let _ = flood.shutdown(std::net::Shutdown::Write);
            })
        };
        let sink = thread::spawn(move || {
            let mut buf = vec![0u8; 64 * 1024];
            while matches!(sink.read(&mut buf), Ok(n) if n > 0) {}
        });

        let mut peak = 0;
        for _ in 0..2000 {
            reactor.turn(TICK).unwrap();
            peak = peak.max(reactor.deferred.len());
            assert!(
                reactor.deferred.len() <= reactor.connections().len(),
                "{} deferred entries for {} connection(s)",
                reactor.deferred.len(),
                reactor.connections().len()
            );
        }
        assert_eq!(peak, 1, "the flooding client was never deferred");

        // at one read per turn the queued input takes many turns to drain
        stop.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(30);
        while !(flooder.is_finished() && reactor.connections().is_empty()) {
            assert!(Instant::now() < deadline, "flood never drained");
            reactor.turn(TICK).unwrap();
        }
        flooder.join().unwrap();
        sink.join().unwrap();
        assert!(reactor.deferred.is_empty());
    }

    #[test]
    fn test_listener_retry_accepts_without_new_edge() {
        let mut reactor = reactor();
        let _client = connect(&reactor);

        // take the listener's only edge without accepting
        let mut taken = Vec::new();
        for _ in 0..500 {
            reactor.mux.wait(TICK, &mut taken).unwrap();
            if taken.iter().any(|ready| ready.token == LISTENER_TOKEN) {
                break;
            }
        }
        reactor.turn(TICK).unwrap();
        assert!(reactor.connections().is_empty());

        // what a failed accept leaves behind
        reactor.defer(LISTENER_TOKEN);
        reactor.turn(TICK).unwrap();
        assert_eq!(reactor.connections().len(), 1);
        assert!(reactor.deferred.is_empty());
    }

    #[test]
    fn test_concurrent_clients_get_only_their_bytes() {
        let (addr, shutdown, join) = spawn(Config::loopback(Mode::Reactor));

        let clients: Vec<_> = (0..16u8)
            .map(|id| {
                thread::spawn(move || {
                    let mut stream = StdStream::connect(addr).unwrap();
                    let payload: Vec<u8> = (0..10_000usize)
                        .map(|i| id.wrapping_mul(31).wrapping_add(i as u8))
                        .collect();
                    for chunk in payload.chunks(700) {
                        stream.write_all(chunk).unwrap();
                    }
                    let mut echoed = vec![0u8; payload.len()];
                    stream.read_exact(&mut echoed).unwrap();
                    assert_eq!(echoed, payload, "client {id} got foreign bytes");
                })
            })
            .collect();

        for client in clients {
            client.join().unwrap();
        }

        shutdown.shutdown().unwrap();
        let reactor = join.join().unwrap();
        assert!(reactor.connections().is_empty());
    }

    #[test]
    fn test_large_echo_survives_full_send_buffer() {
        let (addr, shutdown, join) = spawn(Config::loopback(Mode::Reactor));

        let stream = StdStream::connect(addr).unwrap();
        let mut reader = stream.try_clone().unwrap();
        let payload: Vec<u8> = (0..8 * 1024 * 1024usize).map(|i| (i % 253) as u8).collect();
        let expected = payload.clone();

        // the reader starts late so the server's sends hit a full buffer
        let writer = thread::spawn(move || {
            let mut stream = stream;
            stream.write_all(&payload).unwrap();
            stream.shutdown(std::net::Shutdown::Write).unwrap();
        });
        thread::sleep(Duration::from_millis(100));

        let mut echoed = Vec::with_capacity(expected.len());
        reader.read_to_end(&mut echoed).unwrap();
        writer.join().unwrap();
        assert_eq!(echoed.len(), expected.len());
        assert!(echoed == expected);

        shutdown.shutdown().unwrap();
        join.join().unwrap();
    }

    #[test]
    fn test_busy_client_does_not_starve_accept() {
        let mut config = Config::loopback(Mode::Reactor);
        config.read_budget = 1;
        let (addr, shutdown, join) = spawn(config);

        let flood = StdStream::connect(addr).unwrap();
        let mut drain = flood.try_clone().unwrap();
        let stop = Arc::new(AtomicBool::new(false));

        let flooder = {
            let stop = stop.clone();
            thread::spawn(move || {
                let mut flood = flood;
                let chunk = [0x5a; 64 * 1024];
                while !stop.load(Ordering::SeqCst) {
                    if flood.write_all(&chunk).is_err() {
                        break;
                    }
                }
                let _ = flood.shutdown(std::net::Shutdown::Write);
            })
        };
        let sink = thread::spawn(move || {
            let mut buf = vec![0u8; 64 * 1024];
            while matches!(drain.read(&mut buf), Ok(n) if n > 0) {}
        });

        thread::sleep(Duration::from_millis(50));
        let mut late = StdStream::connect(addr).unwrap();
        late.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        late.write_all(b"ping").unwrap();
        let mut echoed = [0u8; 4];
        late.read_exact(&mut echoed).unwrap();
        assert_eq!(&echoed, b"ping");

        stop.store(true, Ordering::SeqCst);
        flooder.join().unwrap();
        sink.join().unwrap();
        shutdown.shutdown().unwrap();
        join.join().unwrap();
    }
}
