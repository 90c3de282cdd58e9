//! DHCPv4 state machine
//!
//! | incoming  | outgoing   | side effects                                   |
//! |-----------|------------|------------------------------------------------|
//! | DISCOVER  | OFFER      | allocator offer in one transaction             |
//! | REQUEST   | ACK or NAK | ack, or nack + NAK on non-`NoRows` failure     |
//! | DECLINE   | none       | tolerant release, then conflict-mark the IP    |
//! | RELEASE   | none       | release, `release` notification                |
//! | INFORM    | ACK        | options only, no `yiaddr`                      |
use std::net::{IpAddr, Ipv4Addr};

use dhcproto::{
    v4::{
        self,
        relay::{RelayCode, RelayInfo},
        DhcpOption, OptionCode, UnknownOption,
    },
    Encodable,
};
use pnet::util::MacAddr;
use tracing::{debug, instrument, warn};

use lease_notify::{Action, IpFamily, LeaseNotification, Notifier};
use lease_store::{
    model,
    options::{ResolvedOptions, OPT_ROUTER},
    now_epoch, Allocator, ClientId, Db, StoreError,
};

use crate::{
    metrics,
    server::{
        msg::{chaddr_mac, Message},
        udp::V4_CLIENT_PORT,
        SocketFamily, Transport,
    },
    Error,
};

use super::options;

/// The DHCPv4 protocol engine. Pure with respect to the network: it
/// consumes a [`Message`] and produces an optional reply; sending is the
/// service wrapper's job.
#[derive(Debug)]
pub struct DoraV4 {
    db: Db,
    allocator: Allocator,
    notifier: Notifier,
}

impl DoraV4 {
    pub fn new(db: Db, allocator: Allocator, notifier: Notifier) -> Self {
        Self {
            db,
            allocator,
            notifier,
        }
    }

    /// Dispatch one message. `None` means no reply (DECLINE, RELEASE, or
    /// a silently ignored frame).
    #[instrument(name = "v4", level = "debug", skip_all, fields(iface = msg.iface_idx))]
    pub async fn respond(
        &self,
        msg: &Message,
        server_ip: Ipv4Addr,
    ) -> Result<Option<v4::Message>, Error> {
        let pkt = msg.v4()?;
        if pkt.opcode() != v4::Opcode::BootRequest {
            // replies from other servers are not ours to answer
            return Ok(None);
        }
        let mtype = pkt
            .opts()
            .msg_type()
            .ok_or(Error::InvalidMessageType(0))?;
        metrics::recv_v4(mtype);
        match mtype {
            v4::MessageType::Discover => self.discover(msg, pkt, server_ip).await,
            v4::MessageType::Request => self.request(pkt, server_ip).await,
            v4::MessageType::Decline => self.decline(msg, pkt).await,
            v4::MessageType::Release => self.release(msg, pkt).await,
            v4::MessageType::Inform => self.inform(msg, pkt, server_ip).await,
            other => Err(Error::InvalidMessageType(u8::from(other))),
        }
    }

    async fn discover(
        &self,
        msg: &Message,
        pkt: &v4::Message,
        server_ip: Ipv4Addr,
    ) -> Result<Option<v4::Message>, Error> {
        let client = client_id(pkt)?;
        let hint = relay_hint(pkt);
        let mut tx = self.db.begin().await?;
        let offer = self
            .allocator
            .offer_from_discover(&mut tx, msg.iface_idx, &client, hint)
            .await?;
        tx.commit().await.map_err(StoreError::from)?;

        let IpAddr::V4(yiaddr) = offer.ip else {
            return Err(Error::NotDhcpV4);
        };
        debug!(%yiaddr, "offering");
        let reply = build_reply(
            pkt,
            v4::MessageType::Offer,
            Some(yiaddr),
            server_ip,
            &offer.options,
        )?;
        Ok(Some(reply))
    }

    async fn request(
        &self,
        pkt: &v4::Message,
        server_ip: Ipv4Addr,
    ) -> Result<Option<v4::Message>, Error> {
        let client = client_id(pkt)?;
        match requested_ip(pkt) {
            Some(ip) => {
                let mut tx = self.db.begin().await?;
                match self
                    .allocator
                    .ack_lease(&mut tx, IpAddr::V4(ip), &client)
                    .await
                {
                    Ok((lease, opts)) => {
                        tx.commit().await.map_err(StoreError::from)?;
                        let lease_time = opts.lease_time().map_err(Error::from)?;
                        self.notifier
                            .enqueue(LeaseNotification {
                                action: Action::Commit,
                                ip_family: IpFamily::Ipv4,
                                ip: lease.ip.clone(),
                                mac: client.value().to_owned(),
                                timestamp: lease.updated_at,
                                lease_time: Some(lease_time),
                            })
                            .await?;
                        Ok(Some(build_reply(
                            pkt,
                            v4::MessageType::Ack,
                            Some(ip),
                            server_ip,
                            &opts,
                        )?))
                    }
                    // a stale or foreign REQUEST: nothing to ack, nothing
                    // to nack either
                    Err(StoreError::NoRows) => {
                        drop(tx);
                        Err(Error::Store(StoreError::NoRows))
                    }
                    Err(err) => {
                        drop(tx);
                        warn!(?err, %ip, "cannot ack, sending NAK");
                        let mut tx = self.db.begin().await?;
                        if let Err(err) = self
                            .allocator
                            .nack_lease(&mut tx, IpAddr::V4(pkt.yiaddr()), &client)
                            .await
                        {
                            warn!(?err, "nack cleanup failed");
                        }
                        tx.commit().await.map_err(StoreError::from)?;
                        Ok(Some(build_nak(pkt, server_ip)))
                    }
                }
            }
            // no option 50 but an address of its own: RENEWING
            None if !pkt.ciaddr().is_unspecified() => {
                let ip = pkt.ciaddr();
                let mut tx = self.db.begin().await?;
                self.allocator
                    .update_for_renewal(&mut tx, IpAddr::V4(ip), &client)
                    .await?;
                let lease = model::lease_by_ip_client(&mut tx, &ip.to_string(), &client)
                    .await?
                    .ok_or(StoreError::NoRows)?;
                let opts = lease_store::options::for_lease(&mut tx, &lease, &client).await?;
                tx.commit().await.map_err(StoreError::from)?;
                debug!(%ip, "renewed");
                Ok(Some(build_reply(
                    pkt,
                    v4::MessageType::Ack,
                    Some(ip),
                    server_ip,
                    &opts,
                )?))
            }
            None => Err(Error::NoIpRequested),
        }
    }

    async fn decline(
        &self,
        msg: &Message,
        pkt: &v4::Message,
    ) -> Result<Option<v4::Message>, Error> {
        let client = client_id(pkt)?;
        let declined = requested_ip(pkt).ok_or(Error::NoIpRequested)?;
        let mut tx = self.db.begin().await?;
        match self.allocator.release(&mut tx, msg.iface_idx, &client).await {
            Ok(_) | Err(StoreError::NoRows) => {}
            Err(err) => return Err(err.into()),
        }
        self.allocator
            .mark_conflicted(&mut tx, IpAddr::V4(declined))
            .await?;
        tx.commit().await.map_err(StoreError::from)?;
        // a decline is absorbed silently
        Ok(None)
    }

    async fn release(
        &self,
        msg: &Message,
        pkt: &v4::Message,
    ) -> Result<Option<v4::Message>, Error> {
        let client = client_id(pkt)?;
        let mut tx = self.db.begin().await?;
        match self.allocator.release(&mut tx, msg.iface_idx, &client).await {
            Ok(lease) => {
                tx.commit().await.map_err(StoreError::from)?;
                self.notifier
                    .enqueue(LeaseNotification {
                        action: Action::Release,
                        ip_family: IpFamily::Ipv4,
                        ip: lease.ip.clone(),
                        mac: client.value().to_owned(),
                        timestamp: now_epoch(),
                        lease_time: None,
                    })
                    .await?;
            }
            // nothing to release is benign
            Err(StoreError::NoRows) => drop(tx),
            Err(err) => return Err(err.into()),
        }
        Ok(None)
    }

    async fn inform(
        &self,
        msg: &Message,
        pkt: &v4::Message,
        server_ip: Ipv4Addr,
    ) -> Result<Option<v4::Message>, Error> {
        let requested = requested_ip(pkt).ok_or(Error::NoIpRequested)?;
        // INFORM matches on the frame source, not chaddr
        let client = ClientId::mac(msg.src_mac.to_string());
        let mut tx = self.db.begin().await?;
        let (_, opts) = self
            .allocator
            .ack_lease(&mut tx, IpAddr::V4(requested), &client)
            .await?;
        tx.commit().await.map_err(StoreError::from)?;
        // options only; the client already has its address
        Ok(Some(build_reply(
            pkt,
            v4::MessageType::Ack,
            None,
            server_ip,
            &opts,
        )?))
    }
}

/// lease identity is the ethernet chaddr, lower-cased
fn client_id(pkt: &v4::Message) -> Result<ClientId, Error> {
    let mac = chaddr_mac(pkt).ok_or(Error::NotDhcpV4)?;
    Ok(ClientId::mac(mac.to_string()))
}

/// option 50, when present
fn requested_ip(pkt: &v4::Message) -> Option<Ipv4Addr> {
    match pkt.opts().get(OptionCode::RequestedIpAddress) {
        Some(DhcpOption::RequestedIpAddress(ip)) => Some(*ip),
        _ => None,
    }
}

/// Scope hint for relayed packets: option 82 link selection wins, then
/// `giaddr`
fn relay_hint(pkt: &v4::Message) -> Option<IpAddr> {
    if let Some(DhcpOption::RelayAgentInformation(rai)) =
        pkt.opts().get(OptionCode::RelayAgentInformation)
    {
        if let Some(RelayInfo::LinkSelection(ip)) = rai.get(RelayCode::LinkSelection) {
            return Some(IpAddr::V4(*ip));
        }
    }
    if !pkt.giaddr().is_unspecified() {
        return Some(IpAddr::V4(pkt.giaddr()));
    }
    None
}

/// Where a v4 reply goes on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyPath {
    /// raw frame; the client has no usable IP
    L2 { dst_mac: MacAddr, dst_ip: Ipv4Addr },
    /// normal UDP to `(ciaddr, 68)`
    L3 { dst_ip: Ipv4Addr },
}

/// NAKs always go L2 broadcast; a client with `ciaddr` is reachable over
/// UDP; everything else gets a raw frame addressed to its `chaddr`.
pub fn reply_path(req: &v4::Message, reply: &v4::Message) -> Result<ReplyPath, Error> {
    if reply.opts().msg_type() == Some(v4::MessageType::Nak) {
        return Ok(ReplyPath::L2 {
            dst_mac: MacAddr::broadcast(),
            dst_ip: Ipv4Addr::BROADCAST,
        });
    }
    let ciaddr = req.ciaddr();
    if !ciaddr.is_unspecified() {
        return Ok(ReplyPath::L3 { dst_ip: ciaddr });
    }
    if req.flags().broadcast() {
        return Ok(ReplyPath::L2 {
            dst_mac: MacAddr::broadcast(),
            dst_ip: Ipv4Addr::BROADCAST,
        });
    }
    let dst_mac = chaddr_mac(req).ok_or(Error::NotDhcpV4)?;
    let yiaddr = reply.yiaddr();
    let dst_ip = if yiaddr.is_unspecified() {
        Ipv4Addr::BROADCAST
    } else {
        yiaddr
    };
    Ok(ReplyPath::L2 { dst_mac, dst_ip })
}

/// Send a built reply over the path [`reply_path`] picks
pub(crate) async fn send_reply(
    transport: &Transport,
    msg: &Message,
    reply: &v4::Message,
) -> Result<(), Error> {
    let req = msg.v4()?;
    let bytes = reply.to_vec()?;
    match reply_path(req, reply)? {
        ReplyPath::L2 { dst_mac, dst_ip } => {
            transport.send_l2(msg.iface_idx, dst_mac, dst_ip, &bytes)?;
        }
        ReplyPath::L3 { dst_ip } => {
            transport
                .send_l3(
                    SocketFamily::V4,
                    msg.iface_idx,
                    (IpAddr::V4(dst_ip), V4_CLIENT_PORT).into(),
                    &bytes,
                )
                .await?;
        }
    }
    if let Some(mtype) = reply.opts().msg_type() {
        metrics::sent_v4(mtype);
    }
    Ok(())
}

/// Build an OFFER/ACK: copy identity fields from the request, set
/// `yiaddr`/`siaddr`, and emit every resolved option in numeric order
/// through the marshaller. A Router option also lands in `giaddr`.
pub fn build_reply(
    req: &v4::Message,
    mtype: v4::MessageType,
    yiaddr: Option<Ipv4Addr>,
    server_ip: Ipv4Addr,
    resolved: &ResolvedOptions,
) -> Result<v4::Message, Error> {
    let mut reply = v4::Message::new_with_id(
        req.xid(),
        req.ciaddr(),
        yiaddr.unwrap_or(Ipv4Addr::UNSPECIFIED),
        server_ip,
        req.giaddr(),
        req.chaddr(),
    );
    reply.set_opcode(v4::Opcode::BootReply);
    reply.set_htype(req.htype());
    reply.set_flags(req.flags());

    let opts = reply.opts_mut();
    opts.insert(DhcpOption::MessageType(mtype));
    for (number, value) in resolved.iter() {
        let data = options::marshal(number, value, SocketFamily::V4)?;
        opts.insert(DhcpOption::Unknown(UnknownOption::new(
            OptionCode::from(number as u8),
            data,
        )));
    }
    if let Some(router) = resolved.get(OPT_ROUTER) {
        if let Some(ip) = router
            .split(',')
            .next()
            .and_then(|s| s.trim().parse::<Ipv4Addr>().ok())
        {
            reply.set_giaddr(ip);
        }
    }
    Ok(reply)
}

/// A NAK carries no options beyond its type
pub fn build_nak(req: &v4::Message, server_ip: Ipv4Addr) -> v4::Message {
    let mut reply = v4::Message::new_with_id(
        req.xid(),
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::UNSPECIFIED,
        server_ip,
        req.giaddr(),
        req.chaddr(),
    );
    reply.set_opcode(v4::Opcode::BootReply);
    reply.set_htype(req.htype());
    reply.set_flags(req.flags());
    reply
        .opts_mut()
        .insert(DhcpOption::MessageType(v4::MessageType::Nak));
    reply
}

#[cfg(test)]
mod tests {
    use dhcproto::Decodable;
    use tracing_test::traced_test;

    use super::*;
    use crate::server::msg::Packet;

    type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

    const HOST: &str = "test-host";
    const MAC: [u8; 6] = [0xab, 0xcd, 0xef, 0x00, 0x11, 0x22];
    const SERVER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 100);

    async fn engine() -> Result<(DoraV4, Db, tokio::sync::mpsc::Receiver<LeaseNotification>)> {
        let db = Db::connect("sqlite::memory:").await?;
        let mut tx = db.begin().await?;
        sqlx::query("INSERT INTO vlan (id, vid) VALUES (1, 1)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO iface (id, hostname, idx, vlan_id) VALUES (1, ?1, 1, 1)")
            .bind(HOST)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO subnet (id, cidr, address_family, vlan_id) VALUES (1, '10.0.0.0/24', 4, 1)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO ip_range (id, start_ip, end_ip, size, fully_allocated, dynamic, subnet_id)
             VALUES (1, '10.0.0.2', '10.0.0.22', 21, FALSE, TRUE, 1)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("INSERT INTO dhcp_option (number, value, vlan_id) VALUES (51, '30', 1)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO dhcp_option (number, value, subnet_id) VALUES (3, '10.0.0.1', 1)")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let (notifier, rx) = lease_notify::queue(64);
        let engine = DoraV4::new(db.clone(), Allocator::with_hostname(HOST), notifier);
        Ok((engine, db, rx))
    }

    fn base_request(mtype: v4::MessageType) -> v4::Message {
        let mut pkt = v4::Message::new_with_id(
            0x2134,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            &MAC,
        );
        pkt.opts_mut().insert(DhcpOption::MessageType(mtype));
        pkt
    }

    fn ingress(pkt: v4::Message) -> Message {
        Message {
            iface_idx: 1,
            src_mac: MacAddr::new(MAC[0], MAC[1], MAC[2], MAC[3], MAC[4], MAC[5]),
            src_port: 68,
            src_ip: "0.0.0.0".parse().unwrap(),
            pkt: Packet::V4(pkt),
        }
    }

    fn option_bytes(reply: &v4::Message, code: u8) -> Option<Vec<u8>> {
        // read through a serialize/parse cycle so typed and unknown
        // options compare the same way
        let bytes = reply.to_vec().unwrap();
        let parsed = v4::Message::from_bytes(&bytes).unwrap();
        match parsed.opts().get(OptionCode::from(code)) {
            Some(DhcpOption::Unknown(opt)) => Some(opt.data().to_vec()),
            Some(DhcpOption::AddressLeaseTime(secs)) => Some(secs.to_be_bytes().to_vec()),
            Some(DhcpOption::Router(ips)) => Some(
                ips.iter()
                    .flat_map(|ip| ip.octets())
                    .collect(),
            ),
            _ => None,
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn discover_offer_on_empty_range() -> Result<()> {
        let (engine, _db, _rx) = engine().await?;
        let msg = ingress(base_request(v4::MessageType::Discover));
        let reply = engine.respond(&msg, SERVER_IP).await?.expect("an offer");

        assert_eq!(reply.opcode(), v4::Opcode::BootReply);
        assert_eq!(reply.opts().msg_type(), Some(v4::MessageType::Offer));
        assert_eq!(reply.yiaddr(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(reply.siaddr(), SERVER_IP);
        // router option also lands in giaddr
        assert_eq!(reply.giaddr(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(option_bytes(&reply, 51), Some(vec![0, 0, 0, 0x1e]));
        assert_eq!(option_bytes(&reply, 3), Some(vec![10, 0, 0, 1]));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn fast_path_record_drives_the_same_flow() -> Result<()> {
        // a ring record and a socket read must be interchangeable inputs
        let (engine, _db, _rx) = engine().await?;
        let pkt = base_request(v4::MessageType::Discover);
        let payload = pkt.to_vec()?;
        let mut record = Vec::new();
        record.extend_from_slice(&1u32.to_le_bytes());
        record.extend_from_slice(&MAC);
        record.extend_from_slice(&68u16.to_le_bytes());
        record.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        record.extend_from_slice(&[10, 0, 0, 50]);
        record.extend_from_slice(&[0u8; 16]);
        record.extend_from_slice(&payload);

        let msg = crate::server::xdp::decode_record(&record)?;
        let reply = engine.respond(&msg, SERVER_IP).await?.expect("an offer");
        assert_eq!(reply.opts().msg_type(), Some(v4::MessageType::Offer));
        assert_eq!(reply.yiaddr(), Ipv4Addr::new(10, 0, 0, 2));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn request_acks_offered_lease_and_notifies() -> Result<()> {
        let (engine, _db, mut rx) = engine().await?;
        let offer_reply = engine
            .respond(&ingress(base_request(v4::MessageType::Discover)), SERVER_IP)
            .await?
            .unwrap();
        let offered = offer_reply.yiaddr();

        let mut req = base_request(v4::MessageType::Request);
        req.opts_mut()
            .insert(DhcpOption::RequestedIpAddress(offered));
        let reply = engine
            .respond(&ingress(req), SERVER_IP)
            .await?
            .expect("an ack");

        assert_eq!(reply.opts().msg_type(), Some(v4::MessageType::Ack));
        assert_eq!(reply.yiaddr(), offered);

        let note = rx.try_recv()?;
        assert_eq!(note.action, Action::Commit);
        assert_eq!(note.ip, offered.to_string());
        assert_eq!(note.mac, "ab:cd:ef:00:11:22");
        assert_eq!(note.lease_time, Some(30));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn request_for_unknown_lease_is_norows() -> Result<()> {
        let (engine, _db, _rx) = engine().await?;
        let mut req = base_request(v4::MessageType::Request);
        req.opts_mut()
            .insert(DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 0, 0, 2)));
        let err = engine.respond(&ingress(req), SERVER_IP).await.unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::NoRows)));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn request_without_ip_or_ciaddr_is_rejected() -> Result<()> {
        let (engine, _db, _rx) = engine().await?;
        let err = engine
            .respond(&ingress(base_request(v4::MessageType::Request)), SERVER_IP)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoIpRequested));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn renewal_refreshes_acked_lease() -> Result<()> {
        let (engine, db, _rx) = engine().await?;
        // walk the client through discover + request first
        let offer = engine
            .respond(&ingress(base_request(v4::MessageType::Discover)), SERVER_IP)
            .await?
            .unwrap();
        let ip = offer.yiaddr();
        let mut req = base_request(v4::MessageType::Request);
        req.opts_mut().insert(DhcpOption::RequestedIpAddress(ip));
        engine.respond(&ingress(req), SERVER_IP).await?.unwrap();

        // age it, then renew with ciaddr only
        let mut tx = db.begin().await?;
        sqlx::query("UPDATE lease SET updated_at = updated_at - 100")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let mut renew = base_request(v4::MessageType::Request);
        renew.set_ciaddr(ip);
        let reply = engine
            .respond(&ingress(renew), SERVER_IP)
            .await?
            .expect("an ack");
        assert_eq!(reply.opts().msg_type(), Some(v4::MessageType::Ack));

        let mut tx = db.begin().await?;
        let lease = model::lease_by_ip(&mut tx, &ip.to_string()).await?.unwrap();
        assert!(now_epoch() - lease.updated_at < 5);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn decline_marks_requested_ip_conflicted() -> Result<()> {
        let (engine, db, _rx) = engine().await?;
        // acked lease first
        let offer = engine
            .respond(&ingress(base_request(v4::MessageType::Discover)), SERVER_IP)
            .await?
            .unwrap();
        let mut req = base_request(v4::MessageType::Request);
        req.opts_mut()
            .insert(DhcpOption::RequestedIpAddress(offer.yiaddr()));
        engine.respond(&ingress(req), SERVER_IP).await?.unwrap();

        let declined = Ipv4Addr::new(10, 0, 0, 3);
        let mut decline = base_request(v4::MessageType::Decline);
        decline
            .opts_mut()
            .insert(DhcpOption::RequestedIpAddress(declined));
        let reply = engine.respond(&ingress(decline), SERVER_IP).await?;
        assert!(reply.is_none());

        let mut tx = db.begin().await?;
        // the client's lease is gone
        assert!(model::lease_by_ip(&mut tx, &offer.yiaddr().to_string())
            .await?
            .is_none());
        // the conflict marker exists
        let marker = model::lease_by_ip(&mut tx, "10.0.0.3").await?.unwrap();
        assert!(marker.is_conflict_marker());
        assert_eq!(marker.range_id, model::NO_RANGE);
        drop(tx);

        // another client must not be offered the marked address
        let mut other = base_request(v4::MessageType::Discover);
        other.set_chaddr(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        let reply = engine.respond(&ingress(other), SERVER_IP).await?.unwrap();
        assert_ne!(reply.yiaddr(), declined);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn release_emits_notification_and_expiration() -> Result<()> {
        let (engine, db, mut rx) = engine().await?;
        let offer = engine
            .respond(&ingress(base_request(v4::MessageType::Discover)), SERVER_IP)
            .await?
            .unwrap();
        let ip = offer.yiaddr();
        let mut req = base_request(v4::MessageType::Request);
        req.opts_mut().insert(DhcpOption::RequestedIpAddress(ip));
        engine.respond(&ingress(req), SERVER_IP).await?.unwrap();
        let _commit = rx.try_recv()?;

        let reply = engine
            .respond(&ingress(base_request(v4::MessageType::Release)), SERVER_IP)
            .await?;
        assert!(reply.is_none());

        let note = rx.try_recv()?;
        assert_eq!(note.action, Action::Release);
        assert_eq!(note.ip, ip.to_string());

        let mut tx = db.begin().await?;
        let exp: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM expiration WHERE ip = ?1")
            .bind(ip.to_string())
            .fetch_one(&mut *tx)
            .await?;
        assert_eq!(exp.0, 1);

        // releasing again is benign and emits nothing
        drop(tx);
        engine
            .respond(&ingress(base_request(v4::MessageType::Release)), SERVER_IP)
            .await?;
        assert!(rx.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn inform_returns_options_without_yiaddr() -> Result<()> {
        let (engine, _db, _rx) = engine().await?;
        let offer = engine
            .respond(&ingress(base_request(v4::MessageType::Discover)), SERVER_IP)
            .await?
            .unwrap();
        let ip = offer.yiaddr();
        let mut req = base_request(v4::MessageType::Request);
        req.opts_mut().insert(DhcpOption::RequestedIpAddress(ip));
        engine.respond(&ingress(req), SERVER_IP).await?.unwrap();

        let mut inform = base_request(v4::MessageType::Inform);
        inform.opts_mut().insert(DhcpOption::RequestedIpAddress(ip));
        let reply = engine
            .respond(&ingress(inform), SERVER_IP)
            .await?
            .expect("an ack");
        assert_eq!(reply.opts().msg_type(), Some(v4::MessageType::Ack));
        assert_eq!(reply.yiaddr(), Ipv4Addr::UNSPECIFIED);
        assert!(option_bytes(&reply, 51).is_some());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn unhandled_message_type_is_invalid() -> Result<()> {
        let (engine, _db, _rx) = engine().await?;
        let err = engine
            .respond(&ingress(base_request(v4::MessageType::Offer)), SERVER_IP)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidMessageType(2)));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn parse_serialize_roundtrip() -> Result<()> {
        for mtype in [
            v4::MessageType::Discover,
            v4::MessageType::Request,
            v4::MessageType::Decline,
            v4::MessageType::Release,
            v4::MessageType::Inform,
        ] {
            let mut pkt = base_request(mtype);
            pkt.opts_mut()
                .insert(DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 0, 0, 2)));
            let bytes = pkt.to_vec()?;
            let parsed = v4::Message::from_bytes(&bytes)?;
            assert_eq!(parsed.opts().msg_type(), Some(mtype));
            assert_eq!(&parsed.chaddr()[..6], &MAC);
        }
        Ok(())
    }

    #[test]
    fn reply_path_selection() {
        let req = base_request(v4::MessageType::Request);
        let resolved = ResolvedOptions::default();

        // no ciaddr: raw frame to chaddr
        let reply =
            build_reply(&req, v4::MessageType::Ack, Some("10.0.0.2".parse().unwrap()), SERVER_IP, &resolved)
                .unwrap();
        assert_eq!(
            reply_path(&req, &reply).unwrap(),
            ReplyPath::L2 {
                dst_mac: MacAddr::new(MAC[0], MAC[1], MAC[2], MAC[3], MAC[4], MAC[5]),
                dst_ip: "10.0.0.2".parse().unwrap(),
            }
        );

        // ciaddr set: plain UDP
        let mut renewing = base_request(v4::MessageType::Request);
        renewing.set_ciaddr(Ipv4Addr::new(10, 0, 0, 2));
        let reply = build_reply(
            &renewing,
            v4::MessageType::Ack,
            Some("10.0.0.2".parse().unwrap()),
            SERVER_IP,
            &resolved,
        )
        .unwrap();
        assert_eq!(
            reply_path(&renewing, &reply).unwrap(),
            ReplyPath::L3 {
                dst_ip: "10.0.0.2".parse().unwrap()
            }
        );

        // NAK: always broadcast raw
        let nak = build_nak(&req, SERVER_IP);
        assert_eq!(
            reply_path(&req, &nak).unwrap(),
            ReplyPath::L2 {
                dst_mac: MacAddr::broadcast(),
                dst_ip: Ipv4Addr::BROADCAST,
            }
        );
    }
}
