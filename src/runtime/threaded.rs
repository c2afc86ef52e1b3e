//! Thread-per-connection model.
//!
//! Same observable behavior as the forking server, with worker threads in
//! place of child processes. Workers announce their end on a channel and
//! the accept loop joins them, which replaces SIGCHLD reaping.

use crate::config::Config;
use crate::error::{ServeError, ServeResult, SetupError};
use crate::runtime::echo::echo_blocking;
use crate::runtime::{listener, signal};
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Completion notice sent by a worker just before it returns.
struct WorkerExit {
    id: u64,
    peer: SocketAddr,
    result: io::Result<u64>,
}

pub struct ThreadServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    buffer_size: usize,
    workers: HashMap<u64, JoinHandle<()>>,
    next_id: u64,
    done_tx: Sender<WorkerExit>,
    done_rx: Receiver<WorkerExit>,
}

impl ThreadServer {
    pub fn bind(config: &Config) -> Result<Self, SetupError> {
        let listener = listener::bind_tcp(config)?;
        let local_addr = listener.local_addr().map_err(|source| SetupError::Listen {
            addr: format!("{}:{}", config.host, config.port),
            source,
        })?;
        let (done_tx, done_rx) = mpsc::channel();

        Ok(Self {
            listener,
            local_addr,
            buffer_size: config.buffer_size,
            workers: HashMap::new(),
            next_id: 0,
            done_tx,
            done_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Workers spawned and not yet joined.
    pub fn active(&self) -> usize {
        self.workers.len()
    }

    /// Accept until termination is requested.
    pub fn run(&mut self) -> ServeResult<()> {
        info!(addr = %self.local_addr, "Threaded server listening");

        loop {
            match self.accept_one() {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                    if signal::terminate_requested() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            }
            self.reap_finished();
        }

        info!(active = self.active(), "Threaded server stopped");
        Ok(())
    }

    /// Block for one connection and hand it to a new worker.
    pub fn accept_one(&mut self) -> io::Result<()> {
        let (stream, peer) = self.listener.accept()?;
        info!(peer = %peer, "Client connected");

        let id = self.next_id;
        self.next_id += 1;
        let done = self.done_tx.clone();
        let buffer_size = self.buffer_size;

        let handle = thread::Builder::new()
            .name(format!("echo-{id}"))
            .spawn(move || worker(id, stream, peer, buffer_size, done))
            .map_err(|e| {
                warn!(peer = %peer, error = %e, "Failed to spawn worker");
                e
            })?;

        self.workers.insert(id, handle);
        Ok(())
    }

    /// Join every worker that has reported completion. Never blocks on a
    /// worker that is still serving.
    pub fn reap_finished(&mut self) -> usize {
        let mut reaped = 0;
        while let Ok(exit) = self.done_rx.try_recv() {
            match exit.result {
                Ok(bytes) => info!(peer = %exit.peer, bytes, "Client closed"),
                Err(e) => warn!(peer = %exit.peer, error = %e, "Connection error"),
            }
            if let Some(handle) = self.workers.remove(&exit.id) {
                if handle.join().is_err() {
                    warn!(worker = exit.id, "Worker panicked");
                }
                reaped += 1;
            }
        }
        if reaped > 0 {
            debug!(reaped, active = self.active(), "Joined workers");
        }
        reaped
    }
}

fn worker(id: u64, mut stream: TcpStream, peer: SocketAddr, buffer_size: usize, done: Sender<WorkerExit>) {
    block_termination_signals();

    let mut buf = vec![0u8; buffer_size];
    let result = echo_blocking(&mut stream, &mut buf);
    drop(stream);

    // the accept loop may already be gone during shutdown
    let _ = done.send(WorkerExit { id, peer, result });
}

/// Keep SIGINT/SIGTERM on the accept thread so they interrupt `accept`.
fn block_termination_signals() {
    // SAFETY: the set is initialised by sigemptyset before use and only
    // this thread's mask is changed.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::sigaddset(&mut set, libc::SIGTERM);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }
}

/// Bind and serve in thread-per-connection mode.
pub fn run(config: &Config) -> ServeResult<()> {
    ThreadServer::bind(config)
        .map_err(ServeError::from)?
        .run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;
    use std::io::{Read, Write};
    use std::time::{Duration, Instant};

    fn reap_until_idle(server: &mut ThreadServer) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while server.active() > 0 && Instant::now() < deadline {
            server.reap_finished();
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(server.active(), 0, "workers left unjoined");
    }

    #[test]
    fn test_worker_echoes_and_is_joined() {
        let mut server = ThreadServer::bind(&Config::loopback(Mode::Thread)).unwrap();
        let mut client = TcpStream::connect(server.local_addr()).unwrap();

        server.accept_one().unwrap();
        assert_eq!(server.active(), 1);

        client.write_all(b"hello").unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).unwrap();
        assert_eq!(&echoed, b"hello");

        drop(client);
        reap_until_idle(&mut server);
    }

    #[test]
    fn test_concurrent_workers() {
        let mut server = ThreadServer::bind(&Config::loopback(Mode::Thread)).unwrap();
        let addr = server.local_addr();

        let clients: Vec<_> = (0..8u8)
            .map(|id| {
                thread::spawn(move || {
                    let mut stream = TcpStream::connect(addr).unwrap();
                    let payload = vec![id; 4096];
                    stream.write_all(&payload).unwrap();
                    let mut echoed = vec![0u8; payload.len()];
                    stream.read_exact(&mut echoed).unwrap();
                    assert_eq!(echoed, payload);
                })
            })
            .collect();

        for _ in 0..8 {
            server.accept_one().unwrap();
        }
        for client in clients {
            client.join().unwrap();
        }
        reap_until_idle(&mut server);
    }

    #[test]
    fn test_repeated_cycles_leave_no_workers() {
        let mut server = ThreadServer::bind(&Config::loopback(Mode::Thread)).unwrap();

        for i in 0..100u8 {
            let mut client = TcpStream::connect(server.local_addr()).unwrap();
            server.accept_one().unwrap();
            client.write_all(&[i]).unwrap();
            let mut echoed = [0u8; 1];
            client.read_exact(&mut echoed).unwrap();
            assert_eq!(echoed[0], i);
            drop(client);
            server.reap_finished();
        }

        reap_until_idle(&mut server);
    }
}
