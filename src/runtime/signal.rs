//! Process signal plumbing.
//!
//! SIGINT/SIGTERM only raise a flag. Blocking calls that they interrupt
//! (`epoll_wait`, `accept`, `recv`) return `EINTR`, and the caller checks
//! [`terminate_requested`] before retrying.

use crate::error::SetupError;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

static TERMINATE: AtomicBool = AtomicBool::new(false);

extern "C" fn on_terminate(_signal: libc::c_int) {
    TERMINATE.store(true, Ordering::SeqCst);
}

/// Whether SIGINT or SIGTERM has been delivered.
pub fn terminate_requested() -> bool {
    TERMINATE.load(Ordering::SeqCst)
}

/// Install SIGINT/SIGTERM handlers.
///
/// `SA_RESTART` is deliberately left out so blocking calls come back with
/// `EINTR` and the flag gets observed.
pub fn install_termination_handlers() -> Result<(), SetupError> {
    install(libc::SIGINT, on_terminate, 0)?;
    install(libc::SIGTERM, on_terminate, 0)
}

/// Install `handler` for `signal` via `sigaction(2)`.
pub(crate) fn install(
    signal: libc::c_int,
    handler: extern "C" fn(libc::c_int),
    flags: libc::c_int,
) -> Result<(), SetupError> {
    // SAFETY: a zeroed sigaction is a valid starting point; every field we
    // rely on is set below before the struct is handed to the kernel.
    let ret = unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler as libc::sighandler_t;
        action.sa_flags = flags;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(signal, &action, std::ptr::null_mut())
    };

    if ret == -1 {
        return Err(SetupError::Signal {
            signal,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}
