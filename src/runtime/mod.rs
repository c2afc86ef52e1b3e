//! Connection-multiplexing runtimes.
//!
//! Four ways to serve the same echo contract:
//! - `reactor`: single-threaded TCP loop over the readiness multiplexer
//! - `datagram`: the same loop for UDP, with per-peer pseudo-sessions
//! - `fork`: one child process per TCP connection
//! - `threaded`: one worker thread per TCP connection
//!
//! The reactors share common abstractions:
//! - `Multiplexer`: register/unregister/wait over mio
//! - `ConnectionTable`: token-keyed connection state
//! - `echo`: the read/write path

mod connection;
mod datagram;
mod echo;
mod fork;
mod listener;
mod multiplexer;
mod reactor;
mod signal;
mod threaded;

pub use connection::{CloseReason, ConnState, Connection, ConnectionTable};
pub use datagram::DatagramReactor;
pub use echo::{echo_blocking, write_nonblocking};
pub use fork::reap_terminated;
pub use multiplexer::{Multiplexer, Readiness, Ready, ShutdownHandle, Wake};
pub use reactor::Reactor;
pub use threaded::ThreadServer;

use crate::config::{Config, Mode};
use crate::error::ServeResult;

/// Run the service in the configured mode until it is terminated.
pub fn run(config: Config) -> ServeResult<()> {
    signal::install_termination_handlers()?;

    match config.mode {
        Mode::Reactor => Reactor::bind(&config)?.run(),
        Mode::Datagram => DatagramReactor::bind(&config)?.run(),
        Mode::Fork => fork::run(&config),
        Mode::Thread => threaded::run(&config),
    }
}
