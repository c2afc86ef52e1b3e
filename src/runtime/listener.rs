//! Listening endpoints.
//!
//! Resolves the configured host and tries every candidate address in order
//! until one binds, the same way a passive `getaddrinfo` walk does.

use crate::config::Config;
use crate::error::SetupError;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use tracing::{debug, warn};

/// Resolve `host:port` into candidate bind addresses.
pub fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, SetupError> {
    let addr = format!("{host}:{port}");
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|source| SetupError::Resolve {
            addr: addr.clone(),
            source,
        })?
        .collect();

    if addrs.is_empty() {
        return Err(SetupError::Resolve {
            addr,
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
        });
    }
    Ok(addrs)
}

/// Bind and listen on the first usable address for the configured host.
///
/// The returned listener is blocking; reactor callers switch it to
/// non-blocking themselves.
pub fn bind_tcp(config: &Config) -> Result<std::net::TcpListener, SetupError> {
    let addrs = resolve(&config.host, config.port)?;
    let (socket, addr) = first_bound(&addrs, Type::STREAM, Protocol::TCP, false)?;

    socket
        .listen(config.backlog)
        .map_err(|source| SetupError::Listen {
            addr: addr.to_string(),
            source,
        })?;

    Ok(socket.into())
}

/// Bind the UDP rendezvous socket for the datagram service.
pub fn bind_rendezvous(config: &Config) -> Result<std::net::UdpSocket, SetupError> {
    let addrs = resolve(&config.host, config.port)?;
    let (socket, _) = first_bound(&addrs, Type::DGRAM, Protocol::UDP, true)?;
    Ok(socket.into())
}

/// Create a non-blocking UDP socket sharing `local` with the rendezvous
/// socket and connected to `peer`.
///
/// Once connected, the kernel prefers this socket over the unconnected
/// rendezvous socket for every datagram coming from `peer`.
pub fn peer_socket(local: SocketAddr, peer: SocketAddr) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&local.into())?;
    socket.connect(&peer.into())?;
    Ok(socket.into())
}

fn first_bound(
    addrs: &[SocketAddr],
    ty: Type,
    protocol: Protocol,
    reuse_port: bool,
) -> Result<(Socket, SocketAddr), SetupError> {
    let mut last_err = None;

    for addr in addrs {
        match bind_one(*addr, ty, protocol, reuse_port) {
            Ok(socket) => {
                debug!(addr = %addr, "Bound socket");
                return Ok((socket, *addr));
            }
            Err(e) => {
                warn!(addr = %addr, error = %e, "Bind attempt failed");
                last_err = Some((*addr, e));
            }
        }
    }

    // resolve() never yields an empty list
    let (addr, source) = last_err.unwrap_or_else(|| {
        (
            SocketAddr::from(([0, 0, 0, 0], 0)),
            io::Error::new(io::ErrorKind::AddrNotAvailable, "no candidate address"),
        )
    });
    Err(SetupError::Bind {
        addr: addr.to_string(),
        source,
    })
}

fn bind_one(addr: SocketAddr, ty: Type, protocol: Protocol, reuse_port: bool) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), ty, Some(protocol))?;
    socket.set_reuse_address(true)?;
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.bind(&addr.into())?;
    Ok(socket)
}
