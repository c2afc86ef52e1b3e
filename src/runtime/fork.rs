//! Process-per-connection model.
//!
//! The parent only accepts. Each accepted connection is handed to a forked
//! child that runs a blocking echo loop and exits when the peer closes.
//! Whichever side does not use a descriptor closes it right after the fork:
//! the parent drops the client socket, the child drops the listener.
//!
//! Terminated children are reaped from the SIGCHLD handler. Notifications
//! coalesce, so the handler drains every finished child, never just one.

use crate::config::Config;
use crate::error::{ServeResult, SetupError};
use crate::runtime::echo::echo_blocking;
use crate::runtime::{listener, signal};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use tracing::{debug, info, warn};

/// Serve the configured port, forking one worker per connection.
///
/// Must be called while the process is single-threaded.
pub fn run(config: &Config) -> ServeResult<()> {
    let listener = listener::bind_tcp(config)?;
    let addr = listener.local_addr().map_err(|source| SetupError::Listen {
        addr: format!("{}:{}", config.host, config.port),
        source,
    })?;
    install_child_reaper()?;

    info!(addr = %addr, "Forking server listening");

    loop {
        match accept_and_fork(&listener, config.buffer_size) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                if signal::terminate_requested() {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "Accept failed"),
        }
    }

    info!("Forking server stopped");
    Ok(())
}

/// Accept one connection and hand it to a new child process.
///
/// Only the parent returns; a failed fork drops the connection.
fn accept_and_fork(listener: &TcpListener, buffer_size: usize) -> io::Result<()> {
    let (stream, peer) = listener.accept()?;
    info!(peer = %peer, "Client connected");

    // SAFETY: the forking server never starts threads, so the child
    // inherits a consistent address space.
    match unsafe { libc::fork() } {
        -1 => {
            warn!(peer = %peer, error = %io::Error::last_os_error(), "Fork failed");
            drop(stream);
        }
        0 => serve_child(listener, stream, peer, buffer_size),
        pid => {
            debug!(pid, peer = %peer, "Spawned worker process");
            drop(stream);
        }
    }
    Ok(())
}

/// Child side of the fork: echo until the peer is gone, then exit.
fn serve_child(listener: &TcpListener, mut stream: TcpStream, peer: SocketAddr, buffer_size: usize) -> ! {
    // SAFETY: this process exits below without unwinding, so the owning
    // TcpListener is never dropped and the descriptor is closed only once.
    unsafe {
        libc::close(listener.as_raw_fd());
    }

    let mut buf = vec![0u8; buffer_size];
    let code = match echo_blocking(&mut stream, &mut buf) {
        Ok(bytes) => {
            info!(peer = %peer, bytes, "Client closed");
            0
        }
        Err(e) => {
            warn!(peer = %peer, error = %e, "Connection error");
            1
        }
    };

    drop(stream);
    std::process::exit(code)
}

/// Reap every child that has already terminated without blocking.
///
/// Returns how many were reaped. Async-signal-safe.
pub fn reap_terminated() -> usize {
    let mut reaped = 0;
    // SAFETY: waitpid with WNOHANG and a null status pointer has no
    // memory-safety preconditions.
    while unsafe { libc::waitpid(-1, std::ptr::null_mut(), libc::WNOHANG) } > 0 {
        reaped += 1;
    }
    reaped
}

extern "C" fn on_child_exit(_signal: libc::c_int) {
    // waitpid clobbers errno on ECHILD; the interrupted code may be reading it
    // SAFETY: errno_location returns this thread's errno slot.
    unsafe {
        let errno = errno_location();
        let saved = *errno;
        reap_terminated();
        *errno = saved;
    }
}

fn install_child_reaper() -> Result<(), SetupError> {
    signal::install(
        libc::SIGCHLD,
        on_child_exit,
        libc::SA_RESTART | libc::SA_NOCLDSTOP,
    )
}

#[cfg(target_os = "linux")]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__errno_location()
}

#[cfg(target_os = "macos")]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__error()
}
