//! The unified product of both ingress modes
use std::{fmt, net::IpAddr};

use dhcproto::{v4, v6, Decodable};
use pnet::util::MacAddr;

use crate::Error;

/// Decoded DHCP payload, either family
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    V4(v4::Message),
    V6(v6::Message),
}

/// One inbound frame, decoded. The XDP fast path and the raw-socket slow
/// path both produce this; handlers never know which path delivered it.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    /// kernel index of the receiving interface
    pub iface_idx: u32,
    /// L2 source. The slow path cannot see the frame header and fills
    /// this from `chaddr` (v4) or zeroes (v6).
    pub src_mac: MacAddr,
    pub src_port: u16,
    pub src_ip: IpAddr,
    pub pkt: Packet,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("iface_idx", &self.iface_idx)
            .field("src_mac", &self.src_mac.to_string())
            .field("src_port", &self.src_port)
            .field("src_ip", &self.src_ip)
            .finish()
    }
}

impl Message {
    /// Decode a v4 payload read from a socket
    pub fn from_v4_payload(
        iface_idx: u32,
        src_ip: IpAddr,
        src_port: u16,
        payload: &[u8],
    ) -> Result<Self, Error> {
        let pkt = v4::Message::from_bytes(payload).map_err(|_| Error::NotDhcpV4)?;
        let src_mac = chaddr_mac(&pkt).unwrap_or(MacAddr::zero());
        Ok(Message {
            iface_idx,
            src_mac,
            src_port,
            src_ip,
            pkt: Packet::V4(pkt),
        })
    }

    /// Decode a v6 payload read from a socket
    pub fn from_v6_payload(
        iface_idx: u32,
        src_ip: IpAddr,
        src_port: u16,
        payload: &[u8],
    ) -> Result<Self, Error> {
        let pkt = v6::Message::from_bytes(payload).map_err(|_| Error::NotDhcpV6)?;
        Ok(Message {
            iface_idx,
            src_mac: MacAddr::zero(),
            src_port,
            src_ip,
            pkt: Packet::V6(pkt),
        })
    }

    pub fn v4(&self) -> Result<&v4::Message, Error> {
        match &self.pkt {
            Packet::V4(pkt) => Ok(pkt),
            Packet::V6(_) => Err(Error::NotDhcpV4),
        }
    }

    pub fn v6(&self) -> Result<&v6::Message, Error> {
        match &self.pkt {
            Packet::V6(pkt) => Ok(pkt),
            Packet::V4(_) => Err(Error::NotDhcpV6),
        }
    }
}

/// First six bytes of `chaddr` as a MAC, when the hardware address is
/// ethernet-sized
pub fn chaddr_mac(pkt: &v4::Message) -> Option<MacAddr> {
    let chaddr = pkt.chaddr();
    if chaddr.len() < 6 {
        return None;
    }
    Some(MacAddr::new(
        chaddr[0], chaddr[1], chaddr[2], chaddr[3], chaddr[4], chaddr[5],
    ))
}
