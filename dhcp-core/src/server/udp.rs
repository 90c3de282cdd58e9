//! Raw-socket slow path: one datagram socket per interface per family,
//! each bound to its device so the kernel tells us which interface a
//! datagram belongs to by construction.
use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    os::unix::prelude::{FromRawFd, IntoRawFd},
    sync::Arc,
};

use pnet::datalink::NetworkInterface;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{net::UdpSocket, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    metrics,
    server::{msg::Message, SocketFamily},
    Error,
};

/// DHCPv4 server port
pub const V4_SERVER_PORT: u16 = 67;
/// DHCPv4 client port
pub const V4_CLIENT_PORT: u16 = 68;
/// DHCPv6 server port
pub const V6_SERVER_PORT: u16 = 547;
/// DHCPv6 client port
pub const V6_CLIENT_PORT: u16 = 546;

/// payload ceiling shared with the fast path
const READ_BUF_LEN: usize = 2048;

pub(crate) fn bind_v4(iface: &NetworkInterface) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.bind_device(Some(iface.name.as_bytes()))?;
    socket.set_broadcast(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, V4_SERVER_PORT));
    socket.bind(&addr.into())?;
    debug!(iface = %iface.name, %addr, "bound v4 ingress socket");
    UdpSocket::from_std(unsafe { std::net::UdpSocket::from_raw_fd(socket.into_raw_fd()) })
}

pub(crate) fn bind_v6(iface: &NetworkInterface) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_only_v6(true)?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.bind_device(Some(iface.name.as_bytes()))?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddr::from((Ipv6Addr::UNSPECIFIED, V6_SERVER_PORT));
    socket.bind(&addr.into())?;
    debug!(iface = %iface.name, %addr, "bound v6 ingress socket");
    UdpSocket::from_std(unsafe { std::net::UdpSocket::from_raw_fd(socket.into_raw_fd()) })
}

/// One reader task per socket. Non-DHCP datagrams are dropped silently;
/// socket errors are fatal for the reader.
pub(crate) fn spawn_reader(
    soc: Arc<UdpSocket>,
    family: SocketFamily,
    iface_idx: u32,
    tx: mpsc::Sender<Message>,
    token: CancellationToken,
) -> JoinHandle<Result<(), Error>> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUF_LEN];
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    trace!(iface_idx, "reader exiting on shutdown");
                    return Ok(());
                }
                res = soc.recv_from(&mut buf) => {
                    let (len, addr) = res?;
                    let msg = match family {
                        SocketFamily::V4 => {
                            Message::from_v4_payload(iface_idx, addr.ip(), addr.port(), &buf[..len])
                        }
                        SocketFamily::V6 => {
                            Message::from_v6_payload(iface_idx, addr.ip(), addr.port(), &buf[..len])
                        }
                    };
                    match msg {
                        Ok(msg) => {
                            if tx.send(msg).await.is_err() {
                                // dispatcher is gone
                                return Ok(());
                            }
                        }
                        Err(err) => {
                            trace!(?err, %addr, "dropping undecodable datagram");
                            metrics::INGRESS_DROPPED.inc();
                        }
                    }
                }
            }
        }
    })
}
