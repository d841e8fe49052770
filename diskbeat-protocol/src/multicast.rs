//! Connectionless transport for heartbeats
//!
//! Plain UDP handles exposing `send(bytes)` / `receive() -> bytes`; the
//! heartbeat encoding lives in [`crate::heartbeat`] and never touches the socket.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;
use tracing::debug;

/// Largest heartbeat datagram read by the receiver
pub const MAX_DATAGRAM_LEN: usize = 1024;

/// Publishes datagrams to a multicast group (or any IPv4 target)
pub struct MulticastSender {
    socket: UdpSocket,
    target: SocketAddrV4,
}

impl MulticastSender {
    pub async fn bind(group: Ipv4Addr, port: u16, loopback: bool) -> io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        if group.is_multicast() {
            socket.set_multicast_loop_v4(loopback)?;
            socket.set_multicast_ttl_v4(1)?;
        }
        debug!("heartbeat sender bound to {}, target {}:{}", socket.local_addr()?, group, port);
        Ok(Self {
            socket,
            target: SocketAddrV4::new(group, port),
        })
    }

    pub async fn send(&self, bytes: &[u8]) -> io::Result<usize> {
        self.socket.send_to(bytes, self.target).await
    }

    pub fn target(&self) -> SocketAddrV4 {
        self.target
    }
}

/// Listens on a port and, for multicast groups, joins the group on every interface
pub struct MulticastReceiver {
    socket: UdpSocket,
}

impl MulticastReceiver {
    pub async fn join(group: Ipv4Addr, port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        if group.is_multicast() {
            socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
        }
        Ok(Self { socket })
    }

    pub async fn receive(&self) -> io::Result<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        let (len, from) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(len);
        Ok((buf, from))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}
