//! UDP socket creation.
//!
//! The probe talks to exactly one server, so the socket is bound to an
//! ephemeral local port and connected: the kernel filters out datagrams
//! from other sources and `send`/`recv` need no address.

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;

/// Kernel buffer size requested for both directions.
///
/// Large enough to absorb a burst of retransmissions while the agents are
/// busy; the kernel may clamp it.
pub const SOCKET_BUFFER_SIZE: usize = 1 << 20;

/// Create a non-blocking UDP socket connected to `remote`
///
/// Must be called from within a tokio runtime.
pub fn bind_udp_socket(remote: SocketAddr) -> Result<UdpSocket> {
    let (domain, local) = match remote {
        SocketAddr::V4(_) => (Domain::IPV4, SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))),
        SocketAddr::V6(_) => (Domain::IPV6, SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))),
    };

    let socket =
        Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("creating UDP socket")?;

    if let Err(e) = socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
        tracing::warn!(error = %e, "Failed to enlarge SO_RCVBUF (not critical)");
    }
    if let Err(e) = socket.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
        tracing::warn!(error = %e, "Failed to enlarge SO_SNDBUF (not critical)");
    }

    socket
        .set_nonblocking(true)
        .context("setting socket non-blocking")?;
    socket
        .bind(&local.into())
        .with_context(|| format!("binding UDP socket to {}", local))?;
    socket
        .connect(&remote.into())
        .with_context(|| format!("connecting UDP socket to {}", remote))?;

    let std_socket: std::net::UdpSocket = socket.into();
    let socket = UdpSocket::from_std(std_socket).context("registering socket with the runtime")?;

    tracing::debug!(
        local = ?socket.local_addr().ok(),
        %remote,
        "UDP socket ready"
    );
    Ok(socket)
}
