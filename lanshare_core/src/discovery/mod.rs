//! LAN presence: periodic UDP broadcast announcements and the listener that
//! turns them into a peer table.

pub mod announcer;
pub mod listener;
pub mod registry;

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr};
use tokio::net::UdpSocket;

/// Default UDP port for announcements
pub const DISCOVERY_PORT: u16 = 8512;

/// Seconds between periodic announcements
pub const ANNOUNCE_INTERVAL_SECS: u64 = 5;

/// Name used for peers that announce without one
pub const UNKNOWN_PEER_NAME: &str = "Unknown";

/// Public address used only to pick the outbound route; nothing is sent to it.
const ROUTE_PROBE_ADDR: &str = "8.8.8.8:80";

/// Bind a UDP socket that shares its port with other listeners and may send
/// broadcasts. Must be called from within a tokio runtime.
pub fn bind_discovery_socket(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Address of the interface that routes toward the outside world.
///
/// Connecting a UDP socket sends no packets; it only asks the OS to choose a
/// route. Returns `None` when there is no route.
pub fn outbound_ip() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect(ROUTE_PROBE_ADDR).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    if ip.is_unspecified() { None } else { Some(ip) }
}

/// Best guess at the address peers should use to reach us.
pub fn announce_ip() -> Option<IpAddr> {
    outbound_ip().or_else(|| local_ip_address::local_ip().ok())
}
