//! echo-mux: an echo server built around its connection-multiplexing core
//!
//! Every byte a client sends is written back to it unchanged. The server
//! can serve clients in four ways:
//! - a single-threaded TCP reactor (epoll/kqueue)
//! - a single-threaded UDP reactor with per-peer sessions
//! - one forked process per connection
//! - one thread per connection
//!
//! Configuration via CLI arguments or TOML file.

use echo_mux::config::Config;
use echo_mux::runtime;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("echo-mux: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        mode = ?config.mode,
        backlog = config.backlog,
        buffer_size = config.buffer_size,
        read_budget = config.read_budget,
        "Starting echo-mux server"
    );

    match runtime::run(config) {
        Ok(()) => {
            info!("Shut down cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Fatal error");
            ExitCode::FAILURE
        }
    }
}
