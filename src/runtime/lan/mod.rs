//! UDP broadcast protocol engine.
//!
//! ```text
//!  clipboard ──► coordinator ──► outbound queue ──► broadcaster ──► 255.255.255.255:5555
//!                    ▲
//!                    │ SyncEvent::Remote
//!                    │
//!                listener ◄── chunker (reassembly) ◄── datagrams on :5555
//! ```
//!
//! There is no authentication or encryption; anyone on the broadcast domain
//! can read and inject clipboard content.

pub mod broadcaster;
pub mod chunker;
pub mod listener;
pub mod protocol;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

/// Bind a UDP socket with `SO_REUSEADDR` (and `SO_REUSEPORT` where
/// available) so several instances on one machine can share the port.
/// Option failures are logged and ignored; only the bind itself is fatal.
pub fn bind_reusable_udp(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    if let Err(e) = socket.set_reuse_address(true) {
        log::warn!("SO_REUSEADDR failed (non-fatal): {}", e);
    }

    #[cfg(not(target_os = "windows"))]
    {
        if let Err(e) = socket.set_reuse_port(true) {
            log::warn!("SO_REUSEPORT failed (non-fatal): {}", e);
        }
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

/// Addresses of every local interface, loopback included. Used to recognise
/// our own broadcasts when they come back to us.
pub fn local_addresses() -> Vec<IpAddr> {
    let mut addrs: Vec<IpAddr> = match local_ip_address::list_afinet_netifas() {
        Ok(ifaces) => ifaces.into_iter().map(|(_, ip)| ip).collect(),
        Err(e) => {
            log::warn!("could not list network interfaces: {}", e);
            Vec::new()
        }
    };
    for loopback in [IpAddr::V4(Ipv4Addr::LOCALHOST), IpAddr::V6(std::net::Ipv6Addr::LOCALHOST)] {
        if !addrs.contains(&loopback) {
            addrs.push(loopback);
        }
    }
    addrs
}

/// Best guess at this host's LAN address, for labelling local snapshots.
pub fn primary_address() -> IpAddr {
    local_ip_address::local_ip().unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}
