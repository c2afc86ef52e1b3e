//! echo-mux: an echo server built around its connection-multiplexing core.
//!
//! Every byte a client sends is written back to it unchanged. The
//! interesting part is how clients are multiplexed, see [`runtime`].

pub mod config;
pub mod error;
pub mod runtime;
