//! Error types shared by every serving mode.

use std::io;
use thiserror::Error;

/// Failures while bringing the service up. All of them are fatal.
#[derive(Error, Debug)]
pub enum SetupError {
    /// The configured host/port did not resolve to any address.
    #[error("failed to resolve {addr}: {source}")]
    Resolve {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// No resolved address could be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The bound socket could not be put into listening state.
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The readiness multiplexer could not be created or the listener registered.
    #[error("failed to create multiplexer: {0}")]
    Multiplexer(#[source] io::Error),

    /// A signal handler could not be installed.
    #[error("failed to install handler for signal {signal}: {source}")]
    Signal {
        signal: i32,
        #[source]
        source: io::Error,
    },
}

/// Errors that stop a running service.
#[derive(Error, Debug)]
pub enum ServeError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    /// The OS readiness primitive failed for a reason other than interruption.
    #[error("readiness wait failed: {0}")]
    Wait(#[source] io::Error),
}

pub type ServeResult<T> = Result<T, ServeError>;
