//! Dual-stack, non-blocking listening socket.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

/// Binds a non-blocking listener on `port` for both IPv6 and IPv4 peers.
///
/// An IPv6 wildcard socket with `IPV6_V6ONLY` cleared is tried first. If
/// the host cannot create or bind IPv6 sockets at all, an IPv4 wildcard
/// socket is used instead. Errors that would equally affect IPv4 (address
/// in use, permission denied) are returned as-is.
pub fn bind_dual_stack(port: u16, backlog: i32) -> io::Result<TcpListener> {
    match bind_v6(port, backlog) {
        Ok(listener) => Ok(listener),
        Err(e) if is_family_error(&e) => {
            warn!("IPv6 listener unavailable ({}), falling back to IPv4", e);
            bind_v4(port, backlog)
        }
        Err(e) => Err(e),
    }
}

fn bind_v6(port: u16, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
    if let Err(e) = socket.set_only_v6(false) {
        warn!("Could not disable IPv6-only mode: {}", e);
    }
    finish(socket, SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)), backlog)
}

fn bind_v4(port: u16, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    finish(socket, SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)), backlog)
}

fn finish(socket: Socket, addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    let listener: TcpListener = socket.into();
    debug!("Listening on {}", listener.local_addr()?);
    Ok(listener)
}

fn is_family_error(e: &io::Error) -> bool {
    !matches!(
        e.kind(),
        io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied
    )
}
