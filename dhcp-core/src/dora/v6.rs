//! DHCPv6 leasing subset: SOLICIT → ADVERTISE, REQUEST/RENEW → REPLY,
//! RELEASE → REPLY. Clients are keyed by DUID; no prefix delegation.
use std::net::{IpAddr, Ipv6Addr};

use dhcproto::{
    v6::{self, DhcpOption, DhcpOptions, IAAddr, OptionCode, IANA},
    Encodable,
};
use tracing::{debug, instrument};

use lease_notify::{Action, IpFamily, LeaseNotification, Notifier};
use lease_store::{model, now_epoch, Allocator, ClientId, Db, StoreError};

use crate::{
    metrics,
    server::{
        msg::Message,
        udp::V6_CLIENT_PORT,
        SocketFamily, Transport,
    },
    Error,
};

/// The DHCPv6 protocol engine
#[derive(Debug)]
pub struct DoraV6 {
    db: Db,
    allocator: Allocator,
    notifier: Notifier,
    /// our DUID, echoed in every reply
    server_duid: Vec<u8>,
}

impl DoraV6 {
    pub fn new(db: Db, allocator: Allocator, notifier: Notifier, server_duid: Vec<u8>) -> Self {
        Self {
            db,
            allocator,
            notifier,
            server_duid,
        }
    }

    /// Dispatch one message; `None` means no reply
    #[instrument(name = "v6", level = "debug", skip_all, fields(iface = msg.iface_idx))]
    pub async fn respond(&self, msg: &Message) -> Result<Option<v6::Message>, Error> {
        let pkt = msg.v6()?;
        let mtype = pkt.msg_type();
        metrics::recv_v6(mtype);
        match mtype {
            v6::MessageType::Solicit => self.solicit(msg, pkt).await,
            v6::MessageType::Request => self.request(msg, pkt).await,
            v6::MessageType::Renew => self.renew(msg, pkt).await,
            v6::MessageType::Release => self.release(msg, pkt).await,
            other => Err(Error::InvalidMessageType(u8::from(other))),
        }
    }

    async fn solicit(
        &self,
        msg: &Message,
        pkt: &v6::Message,
    ) -> Result<Option<v6::Message>, Error> {
        let (client, duid_bytes) = client_duid(pkt)?;
        let mut tx = self.db.begin().await?;
        let offer = self
            .allocator
            .offer_from_discover(&mut tx, msg.iface_idx, &client, None)
            .await?;
        tx.commit().await.map_err(StoreError::from)?;

        let IpAddr::V6(addr) = offer.ip else {
            return Err(Error::NotDhcpV6);
        };
        debug!(%addr, "advertising");
        Ok(Some(self.build_reply(
            pkt,
            v6::MessageType::Advertise,
            Some((addr, offer.lease_time)),
            duid_bytes,
        )))
    }

    async fn request(
        &self,
        _msg: &Message,
        pkt: &v6::Message,
    ) -> Result<Option<v6::Message>, Error> {
        let (client, duid_bytes) = client_duid(pkt)?;
        let addr = requested_addr(pkt).ok_or(Error::NoIpRequested)?;
        let mut tx = self.db.begin().await?;
        let (lease, opts) = self
            .allocator
            .ack_lease(&mut tx, IpAddr::V6(addr), &client)
            .await?;
        tx.commit().await.map_err(StoreError::from)?;
        let lease_time = opts.lease_time().map_err(Error::from)?;
        self.notifier
            .enqueue(LeaseNotification {
                action: Action::Commit,
                ip_family: IpFamily::Ipv6,
                ip: lease.ip.clone(),
                mac: client.value().to_owned(),
                timestamp: lease.updated_at,
                lease_time: Some(lease_time),
            })
            .await?;
        Ok(Some(self.build_reply(
            pkt,
            v6::MessageType::Reply,
            Some((addr, lease_time)),
            duid_bytes,
        )))
    }

    async fn renew(
        &self,
        _msg: &Message,
        pkt: &v6::Message,
    ) -> Result<Option<v6::Message>, Error> {
        let (client, duid_bytes) = client_duid(pkt)?;
        let addr = requested_addr(pkt).ok_or(Error::NoIpRequested)?;
        let mut tx = self.db.begin().await?;
        self.allocator
            .update_for_renewal(&mut tx, IpAddr::V6(addr), &client)
            .await?;
        let lease = model::lease_by_ip_client(&mut tx, &addr.to_string(), &client)
            .await?
            .ok_or(StoreError::NoRows)?;
        let opts = lease_store::options::for_lease(&mut tx, &lease, &client).await?;
        tx.commit().await.map_err(StoreError::from)?;
        let lease_time = opts.lease_time().map_err(Error::from)?;
        Ok(Some(self.build_reply(
            pkt,
            v6::MessageType::Reply,
            Some((addr, lease_time)),
            duid_bytes,
        )))
    }

    async fn release(
        &self,
        msg: &Message,
        pkt: &v6::Message,
    ) -> Result<Option<v6::Message>, Error> {
        let (client, duid_bytes) = client_duid(pkt)?;
        let mut tx = self.db.begin().await?;
        match self.allocator.release(&mut tx, msg.iface_idx, &client).await {
            Ok(lease) => {
                tx.commit().await.map_err(StoreError::from)?;
                self.notifier
                    .enqueue(LeaseNotification {
                        action: Action::Release,
                        ip_family: IpFamily::Ipv6,
                        ip: lease.ip.clone(),
                        mac: client.value().to_owned(),
                        timestamp: now_epoch(),
                        lease_time: None,
                    })
                    .await?;
            }
            Err(StoreError::NoRows) => drop(tx),
            Err(err) => return Err(err.into()),
        }
        Ok(Some(self.build_reply(
            pkt,
            v6::MessageType::Reply,
            None,
            duid_bytes,
        )))
    }

    fn build_reply(
        &self,
        req: &v6::Message,
        mtype: v6::MessageType,
        binding: Option<(Ipv6Addr, u32)>,
        client_duid: Vec<u8>,
    ) -> v6::Message {
        let mut reply = v6::Message::new_with_id(mtype, req.xid());
        let opts = reply.opts_mut();
        if let Some((addr, lease_time)) = binding {
            let mut ia_opts = DhcpOptions::new();
            ia_opts.insert(DhcpOption::IAAddr(IAAddr {
                addr,
                preferred_life: lease_time,
                valid_life: lease_time,
                opts: DhcpOptions::new(),
            }));
            opts.insert(DhcpOption::IANA(IANA {
                id: iaid(req),
                t1: lease_time / 2,
                t2: lease_time * 4 / 5,
                opts: ia_opts,
            }));
        }
        opts.insert(DhcpOption::ServerId(self.server_duid.clone()));
        opts.insert(DhcpOption::ClientId(client_duid));
        reply
    }
}

/// lease identity is the client DUID, rendered as colon-hex
fn client_duid(pkt: &v6::Message) -> Result<(ClientId, Vec<u8>), Error> {
    match pkt.opts().get(OptionCode::ClientId) {
        Some(DhcpOption::ClientId(duid)) if !duid.is_empty() => {
            let hex = duid
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<Vec<_>>()
                .join(":");
            Ok((ClientId::duid(hex), duid.clone()))
        }
        _ => Err(Error::NotDhcpV6),
    }
}

/// address the client asks for, from IA_NA → IAADDR
fn requested_addr(pkt: &v6::Message) -> Option<Ipv6Addr> {
    match pkt.opts().get(OptionCode::IANA) {
        Some(DhcpOption::IANA(iana)) => match iana.opts.get(OptionCode::IAAddr) {
            Some(DhcpOption::IAAddr(ia_addr)) => Some(ia_addr.addr),
            _ => None,
        },
        _ => None,
    }
}

/// IAID echoed from the request, zero when absent
fn iaid(pkt: &v6::Message) -> u32 {
    match pkt.opts().get(OptionCode::IANA) {
        Some(DhcpOption::IANA(iana)) => iana.id,
        _ => 0,
    }
}

/// v6 replies unicast back to the source of the request
pub(crate) async fn send_reply(
    transport: &Transport,
    msg: &Message,
    reply: &v6::Message,
) -> Result<(), Error> {
    let bytes = reply.to_vec()?;
    let port = if msg.src_port == 0 {
        V6_CLIENT_PORT
    } else {
        msg.src_port
    };
    transport
        .send_l3(
            SocketFamily::V6,
            msg.iface_idx,
            (msg.src_ip, port).into(),
            &bytes,
        )
        .await?;
    metrics::sent_v6(reply.msg_type());
    Ok(())
}

#[cfg(test)]
mod tests {
    use pnet::util::MacAddr;
    use tracing_test::traced_test;

    use super::*;
    use crate::server::msg::Packet;

    type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

    const HOST: &str = "test-host";
    const DUID: [u8; 8] = [0x00, 0x03, 0x00, 0x01, 0xaa, 0xbb, 0xcc, 0xdd];

    async fn engine() -> Result<(DoraV6, Db, tokio::sync::mpsc::Receiver<LeaseNotification>)> {
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
            "INSERT INTO subnet (id, cidr, address_family, vlan_id) VALUES (1, 'fd00::/64', 6, 1)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO ip_range (id, start_ip, end_ip, size, fully_allocated, dynamic, subnet_id)
             VALUES (1, 'fd00::10', 'fd00::ff', 240, FALSE, TRUE, 1)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("INSERT INTO dhcp_option (number, value, vlan_id) VALUES (51, '120', 1)")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let (notifier, rx) = lease_notify::queue(64);
        let engine = DoraV6::new(
            db.clone(),
            Allocator::with_hostname(HOST),
            notifier,
            vec![0, 1, 2, 3],
        );
        Ok((engine, db, rx))
    }

    fn base(mtype: v6::MessageType) -> v6::Message {
        let mut pkt = v6::Message::new_with_id(mtype, [1, 2, 3]);
        pkt.opts_mut()
            .insert(DhcpOption::ClientId(DUID.to_vec()));
        pkt
    }

    fn with_iana(mut pkt: v6::Message, addr: Option<Ipv6Addr>) -> v6::Message {
        let mut ia_opts = DhcpOptions::new();
        if let Some(addr) = addr {
            ia_opts.insert(DhcpOption::IAAddr(IAAddr {
                addr,
                preferred_life: 0,
                valid_life: 0,
                opts: DhcpOptions::new(),
            }));
        }
        pkt.opts_mut().insert(DhcpOption::IANA(IANA {
            id: 7,
            t1: 0,
            t2: 0,
            opts: ia_opts,
        }));
        pkt
    }

    fn ingress(pkt: v6::Message) -> Message {
        Message {
            iface_idx: 1,
            src_mac: MacAddr::zero(),
            src_port: V6_CLIENT_PORT,
            src_ip: "fe80::1".parse().unwrap(),
            pkt: Packet::V6(pkt),
        }
    }

    fn advertised(reply: &v6::Message) -> Option<Ipv6Addr> {
        requested_addr(reply)
    }

    #[tokio::test]
    #[traced_test]
    async fn solicit_advertises_address_in_range() -> Result<()> {
        let (engine, _db, _rx) = engine().await?;
        let reply = engine
            .respond(&ingress(with_iana(base(v6::MessageType::Solicit), None)))
            .await?
            .expect("an advertise");
        assert_eq!(reply.msg_type(), v6::MessageType::Advertise);
        let addr = advertised(&reply).expect("an IA_NA binding");
        let n = u128::from(addr);
        assert!(n >= u128::from("fd00::10".parse::<Ipv6Addr>()?));
        assert!(n <= u128::from("fd00::ff".parse::<Ipv6Addr>()?));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn request_acks_and_notifies() -> Result<()> {
        let (engine, db, mut rx) = engine().await?;
        let advertise = engine
            .respond(&ingress(with_iana(base(v6::MessageType::Solicit), None)))
            .await?
            .unwrap();
        let addr = advertised(&advertise).unwrap();

        let reply = engine
            .respond(&ingress(with_iana(
                base(v6::MessageType::Request),
                Some(addr),
            )))
            .await?
            .expect("a reply");
        assert_eq!(reply.msg_type(), v6::MessageType::Reply);
        assert_eq!(advertised(&reply), Some(addr));

        let note = rx.try_recv()?;
        assert_eq!(note.action, Action::Commit);
        assert_eq!(note.ip_family, IpFamily::Ipv6);
        assert_eq!(note.lease_time, Some(120));

        let mut tx = db.begin().await?;
        let lease = model::lease_by_ip(&mut tx, &addr.to_string()).await?.unwrap();
        assert_eq!(lease.state, model::STATE_ACKED);
        assert!(lease.duid.is_some());
        assert!(lease.mac_address.is_none());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn release_drops_binding() -> Result<()> {
        let (engine, db, mut rx) = engine().await?;
        let advertise = engine
            .respond(&ingress(with_iana(base(v6::MessageType::Solicit), None)))
            .await?
            .unwrap();
        let addr = advertised(&advertise).unwrap();
        engine
            .respond(&ingress(with_iana(
                base(v6::MessageType::Request),
                Some(addr),
            )))
            .await?
            .unwrap();
        let _commit = rx.try_recv()?;

        let reply = engine
            .respond(&ingress(base(v6::MessageType::Release)))
            .await?
            .expect("a reply");
        assert_eq!(reply.msg_type(), v6::MessageType::Reply);
        assert_eq!(rx.try_recv()?.action, Action::Release);

        let mut tx = db.begin().await?;
        assert!(model::lease_by_ip(&mut tx, &addr.to_string()).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn unhandled_type_is_invalid() -> Result<()> {
        let (engine, _db, _rx) = engine().await?;
        let err = engine
            .respond(&ingress(base(v6::MessageType::Reply)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidMessageType(_)));
        Ok(())
    }
}
