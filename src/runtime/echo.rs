//! The echo path: bytes in, same bytes out.
//!
//! Shared by the reactor (non-blocking sockets) and the worker models
//! (blocking sockets).

use crate::runtime::signal;
use std::io::{self, Read, Write};

/// Write as much of `buf` as the socket accepts right now.
///
/// Returns the number of bytes written; anything short of `buf.len()` means
/// the socket reported `WouldBlock` and the caller owns the remainder.
pub fn write_nonblocking<W: Write + ?Sized>(writer: &mut W, buf: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < buf.len() {
        match writer.write(&buf[written..]) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
            }
            Ok(n) => written += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

/// Blocking read/echo loop used by per-connection workers.
///
/// Runs until the peer closes (returns total bytes echoed), an I/O error
/// occurs, or termination is requested while blocked.
pub fn echo_blocking<S: Read + Write>(stream: &mut S, buf: &mut [u8]) -> io::Result<u64> {
    let mut total = 0u64;
    loop {
        let n = match stream.read(buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                if signal::terminate_requested() {
                    return Ok(total);
                }
                continue;
            }
            Err(e) => return Err(e),
        };

        // write_all retries short writes and EINTR itself
        stream.write_all(&buf[..n])?;
        total += n as u64;
    }
}
