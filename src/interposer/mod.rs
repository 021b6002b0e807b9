//! Port interposers: hold a server's port while its Minecraft process is
//! down, answer status/login traffic, and signal the monitor loop when a
//! real player shows up (§4.3, §4.4).

pub mod bedrock;
pub mod java;

use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::error::InterposerError;

/// Bind a listening socket with `SO_REUSEADDR` (and `SO_REUSEPORT` where the
/// platform has it) set before bind, so a release-then-reacquire cycle on
/// the same port never trips over a lingering `TIME_WAIT` entry.
fn bind_reusable(addr: SocketAddr, ty: Type, proto: Protocol) -> Result<Socket, InterposerError> {
    let domain = Domain::for_address(addr);
    let socket =
        Socket::new(domain, ty, Some(proto)).map_err(|source| InterposerError::PortBindFailed {
            addr,
            source,
        })?;

    socket
        .set_reuse_address(true)
        .map_err(|source| InterposerError::PortBindFailed { addr, source })?;
    #[cfg(unix)]
    socket
        .set_reuse_port(true)
        .map_err(|source| InterposerError::PortBindFailed { addr, source })?;

    socket
        .bind(&SockAddr::from(addr))
        .map_err(|source| InterposerError::PortBindFailed { addr, source })?;
    socket
        .set_nonblocking(true)
        .map_err(|source| InterposerError::PortBindFailed { addr, source })?;

    Ok(socket)
}

fn bind_tcp(addr: SocketAddr) -> Result<std::net::TcpListener, InterposerError> {
    let socket = bind_reusable(addr, Type::STREAM, Protocol::TCP)?;
    socket
        .listen(128)
        .map_err(|source| InterposerError::PortBindFailed { addr, source })?;
    Ok(socket.into())
}

fn bind_udp(addr: SocketAddr) -> Result<std::net::UdpSocket, InterposerError> {
    let socket = bind_reusable(addr, Type::DGRAM, Protocol::UDP)?;
    Ok(socket.into())
}

/// How long `release()` waits for in-flight connections to drain before
/// giving up and reporting `DrainTimeout` (§4.3, §4.4).
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Coalescing window: repeated Java login attempts from a server's clients
/// within this window collapse into a single `wake_requested` (§4.3).
pub const WAKE_COALESCE_WINDOW: Duration = Duration::from_secs(2);

/// Bedrock `repeated` wake policy window: a second unconnected ping from the
/// same peer inside this window counts as "repeated" pinging and triggers
/// `wake_requested` (§4.4: "≥ 2 pings from the same peer within 5 s"). This
/// is a distinct parameter from [`WAKE_COALESCE_WINDOW`], not the same 2 s
/// Java login-coalescing window.
pub const BEDROCK_REPEAT_PING_WINDOW: Duration = Duration::from_secs(5);
