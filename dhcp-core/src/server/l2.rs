//! L2 raw send path. Clients without an IP cannot be reached over UDP, so
//! replies to them are synthesized Ethernet/IPv4/UDP frames pushed out an
//! `AF_PACKET` socket with the destination MAC from the DHCP `chaddr`.
use std::{
    mem,
    net::Ipv4Addr,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
};

use pnet::{
    packet::{
        ethernet::{EtherTypes, MutableEthernetPacket},
        ip::IpNextHeaderProtocols,
        ipv4::{self, MutableIpv4Packet},
        udp::{self, MutableUdpPacket},
    },
    util::MacAddr,
};
use tracing::trace;

use crate::Error;

const ETH_HEADER_LEN: usize = 14;
const IPV4_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;

/// Send-only packet socket shared by all handler tasks; each `sendto` is
/// one atomic frame.
#[derive(Debug)]
pub struct L2Socket {
    fd: OwnedFd,
}

impl L2Socket {
    pub(crate) fn new() -> std::io::Result<Self> {
        // protocol 0: we never receive on this socket
        let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Push one frame out `iface_idx`
    pub fn send(&self, iface_idx: u32, dst_mac: MacAddr, frame: &[u8]) -> std::io::Result<()> {
        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = (libc::ETH_P_IP as u16).to_be();
        addr.sll_ifindex = iface_idx as i32;
        addr.sll_halen = 6;
        addr.sll_addr[..6].copy_from_slice(&dst_mac.octets());
        let rc = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                0,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(std::io::Error::last_os_error());
        }
        trace!(iface_idx, %dst_mac, len = frame.len(), "sent l2 frame");
        Ok(())
    }
}

/// Build an Ethernet+IPv4+UDP frame around a DHCP payload, both checksums
/// computed
pub fn build_frame(
    src_mac: MacAddr,
    dst_mac: MacAddr,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Result<Vec<u8>, Error> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let ip_len = IPV4_HEADER_LEN + udp_len;
    let mut buf = vec![0u8; ETH_HEADER_LEN + ip_len];

    {
        let mut eth = MutableEthernetPacket::new(&mut buf).ok_or(Error::InvalidBuffer)?;
        eth.set_destination(dst_mac);
        eth.set_source(src_mac);
        eth.set_ethertype(EtherTypes::Ipv4);
    }
    {
        let mut ip =
            MutableIpv4Packet::new(&mut buf[ETH_HEADER_LEN..]).ok_or(Error::InvalidBuffer)?;
        ip.set_version(4);
        ip.set_header_length((IPV4_HEADER_LEN / 4) as u8);
        ip.set_total_length(ip_len as u16);
        ip.set_ttl(64);
        ip.set_next_level_protocol(IpNextHeaderProtocols::Udp);
        ip.set_source(src_ip);
        ip.set_destination(dst_ip);
        let checksum = ipv4::checksum(&ip.to_immutable());
        ip.set_checksum(checksum);
    }
    {
        let mut udp = MutableUdpPacket::new(&mut buf[ETH_HEADER_LEN + IPV4_HEADER_LEN..])
            .ok_or(Error::InvalidBuffer)?;
        udp.set_source(src_port);
        udp.set_destination(dst_port);
        udp.set_length(udp_len as u16);
        udp.set_payload(payload);
        let checksum = udp::ipv4_checksum(&udp.to_immutable(), &src_ip, &dst_ip);
        udp.set_checksum(checksum);
    }
    Ok(buf)
}
