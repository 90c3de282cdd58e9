//! XDP fast path: load the classifier object, attach it to the serving
//! interfaces, and consume its ring buffer on a dedicated OS thread so
//! ring reads never wait on the async scheduler.
//!
//! Attachment is best-effort per interface; the fast path is used when at
//! least one attach succeeds. Record layout (little-endian, fixed header
//! then payload) mirrors `bpf/dhcp_xdp.bpf.c`:
//!
//! ```text
//! u32  ifindex
//! [6]u8 src_mac
//! u16  src_port
//! u16  payload_len
//! [4]u8 src_ip4
//! [16]u8 src_ip6
//! [N]u8 dhcp payload
//! ```
use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    os::fd::AsRawFd,
    path::Path,
    thread,
};

use aya::{
    maps::RingBuf,
    programs::{Xdp, XdpFlags},
    Ebpf,
};
use pnet::{datalink::NetworkInterface, util::MacAddr};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{metrics, server::msg::Message, Error};

/// name of the classifier program inside the object
const PROGRAM: &str = "dhcp_ingress";
/// name of the ring buffer map
const EVENTS_MAP: &str = "EVENTS";
/// fixed record header length
pub(crate) const RECORD_HEADER_LEN: usize = 34;
/// payload bytes the classifier copies at most
pub const MAX_DHCP_PAYLOAD: usize = 1984;
/// how long the reader blocks in poll() before re-checking for shutdown
const POLL_TIMEOUT_MS: i32 = 250;

/// Loaded-and-attached fast path. Dropping it detaches every link and
/// unloads the object.
pub struct XdpIngress {
    bpf: Ebpf,
    attached: Vec<String>,
}

impl std::fmt::Debug for XdpIngress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XdpIngress")
            .field("attached", &self.attached)
            .finish()
    }
}

impl XdpIngress {
    /// Load the object at `path` and attach to every interface we can.
    /// Errors out only when nothing attached; the caller then falls back
    /// to the slow path.
    pub fn load(path: &Path, interfaces: &[NetworkInterface]) -> Result<Self, Error> {
        let mut bpf = Ebpf::load_file(path)?;
        let program: &mut Xdp = bpf
            .program_mut(PROGRAM)
            .ok_or(Error::InvalidBuffer)?
            .try_into()?;
        program.load()?;
        let mut attached = Vec::new();
        for iface in interfaces {
            match program.attach(&iface.name, XdpFlags::default()) {
                Ok(_) => {
                    info!(iface = %iface.name, "attached xdp classifier");
                    attached.push(iface.name.clone());
                }
                Err(err) => {
                    warn!(iface = %iface.name, ?err, "xdp attach failed on interface");
                }
            }
        }
        if attached.is_empty() {
            return Err(Error::NoSocketFound(0));
        }
        Ok(Self { bpf, attached })
    }

    pub fn attached(&self) -> &[String] {
        &self.attached
    }

    /// Consume ring records on a dedicated OS thread until cancelled. The
    /// thread owns the BPF object; links detach when it exits.
    pub fn spawn_reader(
        mut self,
        tx: mpsc::Sender<Message>,
        token: CancellationToken,
    ) -> Result<thread::JoinHandle<()>, Error> {
        let map = self.bpf.take_map(EVENTS_MAP).ok_or(Error::InvalidBuffer)?;
        let mut ring = RingBuf::try_from(map)?;
        let handle = thread::Builder::new()
            .name("dhcp-xdp-reader".into())
            .spawn(move || {
                // keep programs and links alive for the reader's lifetime
                let _ingress = self;
                let fd = ring.as_raw_fd();
                while !token.is_cancelled() {
                    let mut pollfd = libc::pollfd {
                        fd,
                        events: libc::POLLIN,
                        revents: 0,
                    };
                    let rc = unsafe { libc::poll(&mut pollfd, 1, POLL_TIMEOUT_MS) };
                    if rc < 0 {
                        let err = std::io::Error::last_os_error();
                        if err.kind() == std::io::ErrorKind::Interrupted {
                            continue;
                        }
                        warn!(?err, "ring buffer poll failed, fast path reader exiting");
                        return;
                    }
                    while let Some(record) = ring.next() {
                        match decode_record(&record) {
                            Ok(msg) => {
                                if tx.blocking_send(msg).is_err() {
                                    debug!("dispatcher gone, fast path reader exiting");
                                    return;
                                }
                            }
                            Err(err) => {
                                warn!(?err, "dropping malformed ring record");
                                metrics::INGRESS_DROPPED.inc();
                            }
                        }
                    }
                }
                debug!("fast path reader exiting on shutdown");
            })?;
        Ok(handle)
    }
}

/// Decode one ring record into a [`Message`]. The v4 source address being
/// unspecified means the frame was IPv6.
pub(crate) fn decode_record(buf: &[u8]) -> Result<Message, Error> {
    if buf.len() < RECORD_HEADER_LEN {
        return Err(Error::InvalidBuffer);
    }
    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[0..4]);
    let iface_idx = u32::from_le_bytes(word);
    let src_mac = MacAddr::new(buf[4], buf[5], buf[6], buf[7], buf[8], buf[9]);
    let mut half = [0u8; 2];
    half.copy_from_slice(&buf[10..12]);
    let src_port = u16::from_le_bytes(half);
    half.copy_from_slice(&buf[12..14]);
    let payload_len = u16::from_le_bytes(half) as usize;
    let src_ip4 = Ipv4Addr::new(buf[14], buf[15], buf[16], buf[17]);
    let mut v6 = [0u8; 16];
    v6.copy_from_slice(&buf[18..34]);
    let src_ip6 = Ipv6Addr::from(v6);

    let payload = &buf[RECORD_HEADER_LEN..];
    if payload_len > payload.len() || payload_len > MAX_DHCP_PAYLOAD {
        return Err(Error::InvalidBuffer);
    }
    let payload = &payload[..payload_len];

    let mut msg = if !src_ip4.is_unspecified() {
        Message::from_v4_payload(iface_idx, IpAddr::V4(src_ip4), src_port, payload)?
    } else {
        Message::from_v6_payload(iface_idx, IpAddr::V6(src_ip6), src_port, payload)?
    };
    // the fast path saw the frame header, so its MAC wins over chaddr
    msg.src_mac = src_mac;
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use dhcproto::{v4, Encodable};

    use super::*;
    use crate::server::msg::Packet;

    fn record(ifindex: u32, mac: [u8; 6], port: u16, ip4: [u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&ifindex.to_le_bytes());
        buf.extend_from_slice(&mac);
        buf.extend_from_slice(&port.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        buf.extend_from_slice(&ip4);
        buf.extend_from_slice(&[0u8; 16]);
        buf.extend_from_slice(payload);
        buf
    }

    fn discover() -> v4::Message {
        let chaddr = [0xab, 0xcd, 0xef, 0x00, 0x11, 0x22];
        let mut msg = v4::Message::new_with_id(
            0x10,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            &chaddr,
        );
        msg.opts_mut()
            .insert(v4::DhcpOption::MessageType(v4::MessageType::Discover));
        msg
    }

    #[test]
    fn decodes_v4_record() {
        let pkt = discover();
        let payload = pkt.to_vec().unwrap();
        let mac = [0xab, 0xcd, 0xef, 0x00, 0x11, 0x22];
        let buf = record(3, mac, 68, [10, 0, 0, 2], &payload);

        let msg = decode_record(&buf).unwrap();
        assert_eq!(msg.iface_idx, 3);
        assert_eq!(msg.src_port, 68);
        assert_eq!(msg.src_ip, "10.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(msg.src_mac, MacAddr::new(0xab, 0xcd, 0xef, 0x00, 0x11, 0x22));
        match msg.pkt {
            Packet::V4(decoded) => {
                assert_eq!(decoded.opts().msg_type(), Some(v4::MessageType::Discover));
            }
            Packet::V6(_) => panic!("expected v4"),
        }
    }

    #[test]
    fn fixed_size_record_is_sliced_by_payload_len() {
        let pkt = discover();
        let payload = pkt.to_vec().unwrap();
        let mac = [0xab, 0xcd, 0xef, 0x00, 0x11, 0x22];
        let mut buf = record(1, mac, 68, [10, 0, 0, 2], &payload);
        // the classifier reserves fixed records; pad to the max
        buf.resize(RECORD_HEADER_LEN + MAX_DHCP_PAYLOAD, 0);

        let msg = decode_record(&buf).unwrap();
        assert!(matches!(msg.pkt, Packet::V4(_)));
    }

    #[test]
    fn short_record_is_invalid() {
        let err = decode_record(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, Error::InvalidBuffer));
    }

    #[test]
    fn lying_payload_len_is_invalid() {
        let mac = [0; 6];
        let mut buf = record(1, mac, 68, [10, 0, 0, 2], &[]);
        // header claims more payload than the record carries
        buf[12..14].copy_from_slice(&100u16.to_le_bytes());
        let err = decode_record(&buf).unwrap_err();
        assert!(matches!(err, Error::InvalidBuffer));
    }
}
