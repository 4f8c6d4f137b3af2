//! Heartbeat networking.
//!
//! One IPv4 UDP socket bound to the heartbeat port carries every heartbeat,
//! broadcast and unicast. Interface discovery and the receive loop run as
//! their own tasks and hand everything to the queue worker.

use std::net::{Ipv4Addr, SocketAddrV4};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};

pub mod heartbeat;
pub mod interfaces;
pub mod listener;

/// Create the broadcast-capable heartbeat socket.
pub fn bind_heartbeat_socket(port: u16) -> Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_broadcast(true).context("SO_BROADCAST")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket
        .bind(&bind_addr.into())
        .with_context(|| format!("bind() to heartbeat port {port}"))?;

    Ok(socket.into())
}
