//! Transactional lease allocation.
//!
//! Every operation here runs inside a caller-supplied transaction; the SQL
//! layer's serialization is the only ordering guarantee. Operations are
//! idempotent under client retries that re-present the same message type.
use std::{
    collections::HashSet,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use chrono::{DateTime, SecondsFormat, Utc};
use rand::{seq::SliceRandom, Rng};
use sqlx::sqlite::SqliteConnection;
use tracing::{debug, trace, warn};

use crate::{
    local_hostname, model,
    model::{IpRange, Lease, Vlan, NO_RANGE, STATE_ACKED, STATE_OFFERED},
    now_epoch,
    options::{self, OptionChain, ResolvedOptions},
    ClientId, StoreError,
};

/// Conflict markers are synthetic acked leases that live for 30 seconds of
/// lifetime (stored in ms); the sweep predicate turns that into a bounded
/// re-allocation block.
pub const CONFLICT_LIFETIME_MS: i64 = 30_000;

/// Cap on probe attempts inside a v6 range, which can never be exhausted
/// by walking
const MAX_V6_PROBES: u128 = 1 << 16;

/// A proposed lease, returned for DISCOVER
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    pub ip: IpAddr,
    /// option 51, seconds
    pub lease_time: u32,
    pub options: ResolvedOptions,
}

/// The lease allocator. Stateless apart from the cached agent hostname
/// (the `iface` table is keyed on `(hostname, idx)` and a syscall per
/// DISCOVER is avoidable).
#[derive(Debug, Clone)]
pub struct Allocator {
    hostname: String,
}

impl Allocator {
    pub fn new() -> Result<Self, StoreError> {
        Ok(Self {
            hostname: local_hostname()?,
        })
    }

    /// Used by tests and callers that already know the hostname
    pub fn with_hostname(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// VLAN a message is scoped to. A relay hint (option 82 link/subnet
    /// selection, or `giaddr`) overrides the receiving interface: the
    /// subnet containing the hint names the target VLAN. Without a hint
    /// the interface's own VLAN is used.
    async fn target_vlan(
        &self,
        tx: &mut SqliteConnection,
        iface_idx: u32,
        relay_hint: Option<IpAddr>,
    ) -> Result<Vlan, StoreError> {
        if let Some(hint) = relay_hint {
            return match model::subnet_containing(tx, hint).await? {
                Some(subnet) => {
                    let vlan = model::vlan_by_id(tx, subnet.vlan_id)
                        .await?
                        .ok_or(StoreError::NoMatchingVlan(iface_idx))?;
                    if vlan.relay_vlan_id.is_some() {
                        trace!(vlan = vlan.id, "relay-reachable VLAN selected via hint");
                    }
                    Ok(vlan)
                }
                None => {
                    debug!(%hint, "relay hint is not in any managed subnet");
                    Err(StoreError::NoMatchingVlan(iface_idx))
                }
            };
        }
        model::vlan_for_interface(tx, &self.hostname, iface_idx)
            .await?
            .ok_or(StoreError::NoMatchingVlan(iface_idx))
    }

    /// DISCOVER entry point. Attempts, in order: the client's existing
    /// lease on the VLAN, a host reservation, then dynamic range
    /// allocation (random range order, first free address).
    pub async fn offer_from_discover(
        &self,
        tx: &mut SqliteConnection,
        iface_idx: u32,
        client: &ClientId,
        relay_hint: Option<IpAddr>,
    ) -> Result<Offer, StoreError> {
        let vlan = self.target_vlan(tx, iface_idx, relay_hint).await?;

        // existing lease: idempotent re-DISCOVER, no new row
        if let Some(lease) = model::lease_for_client_on_vlan(tx, vlan.id, client).await? {
            let opts = options::for_lease(tx, &lease, client).await?;
            let lease_time = opts.lease_time()?;
            debug!(ip = %lease.ip, "client already holds a lease, re-offering");
            return Ok(Offer {
                ip: lease.ip_addr()?,
                lease_time,
                options: opts,
            });
        }

        // host reservation
        if let Some(reservation) = model::reservation_for_client(tx, vlan.id, client).await? {
            match model::lease_by_ip(tx, &reservation.ip_address).await? {
                None => {
                    let chain = OptionChain::for_reservation(tx, &reservation).await?;
                    let opts = options::resolve(tx, chain).await?;
                    let lease_time = opts.lease_time()?;
                    let ip = model::parse_ip(&reservation.ip_address)?;
                    model::insert_lease(
                        tx,
                        &ip,
                        client,
                        now_epoch(),
                        i64::from(lease_time) * 1000,
                        STATE_OFFERED,
                        true,
                        reservation.range_id.unwrap_or(NO_RANGE),
                    )
                    .await?;
                    debug!(
                        %ip,
                        reservation = reservation.id,
                        expires_at = %expiry_rfc3339(lease_time),
                        "offering reserved address"
                    );
                    return Ok(Offer {
                        ip,
                        lease_time,
                        options: opts,
                    });
                }
                Some(lease)
                    if client.matches(lease.mac_address.as_deref(), lease.duid.as_deref()) =>
                {
                    let opts = options::for_lease(tx, &lease, client).await?;
                    let lease_time = opts.lease_time()?;
                    return Ok(Offer {
                        ip: lease.ip_addr()?,
                        lease_time,
                        options: opts,
                    });
                }
                Some(lease) => {
                    // reserved address is currently held by someone else;
                    // fall back to dynamic allocation
                    warn!(
                        ip = %reservation.ip_address,
                        holder = ?lease.mac_address,
                        "reserved address leased to another client"
                    );
                }
            }
        }

        // dynamic ranges, random order, first free address
        let mut ranges: Vec<IpRange> =
            model::ranges_for_vlan(tx, vlan.id, client.address_family())
                .await?
                .into_iter()
                .filter(|r| r.dynamic && !r.fully_allocated)
                .collect();
        ranges.shuffle(&mut rand::thread_rng());
        let allocated = model::allocated_ips(tx).await?;
        for range in ranges {
            match self.scan_range(tx, &range, &allocated).await {
                Ok(ip) => {
                    let chain = OptionChain::for_range(tx, range.id).await?;
                    let opts = options::resolve(tx, chain).await?;
                    let lease_time = opts.lease_time()?;
                    model::insert_lease(
                        tx,
                        &ip,
                        client,
                        now_epoch(),
                        i64::from(lease_time) * 1000,
                        STATE_OFFERED,
                        true,
                        range.id,
                    )
                    .await?;
                    debug!(
                        %ip,
                        range = range.id,
                        expires_at = %expiry_rfc3339(lease_time),
                        "offering dynamic address"
                    );
                    return Ok(Offer {
                        ip,
                        lease_time,
                        options: opts,
                    });
                }
                Err(StoreError::RangeFull { range_id }) => {
                    debug!(range = range_id, "range exhausted, trying next");
                    model::set_fully_allocated(tx, range_id, true).await?;
                }
                Err(err) => return Err(err),
            }
        }
        Err(StoreError::NoAvailableIp { vlan_id: vlan.id })
    }

    /// First free address in a range: start just past the last allocated
    /// lease (v4) or at a random point (v6), walk forward, wrap once.
    async fn scan_range(
        &self,
        tx: &mut SqliteConnection,
        range: &IpRange,
        allocated: &HashSet<IpAddr>,
    ) -> Result<IpAddr, StoreError> {
        let start = range.start()?;
        let end = range.end()?;
        let v4 = start.is_ipv4();
        let (start_n, end_n) = (ip_to_u128(start), ip_to_u128(end));
        if start_n > end_n || v4 != end.is_ipv4() {
            return Err(StoreError::InvalidIp(range.start_ip.clone()));
        }
        let total = end_n - start_n + 1;

        let begin = if v4 {
            match model::last_lease_in_range(tx, range.id).await? {
                Some(last) => match last.ip_addr()? {
                    IpAddr::V4(ip) => increment_v4(ip)
                        .map(|next| ip_to_u128(next.into()))
                        .filter(|n| (start_n..=end_n).contains(n))
                        .unwrap_or(start_n),
                    IpAddr::V6(_) => start_n,
                },
                None => start_n,
            }
        } else {
            // randomize the host bits within the range
            start_n + rand::thread_rng().gen_range(0..total)
        };

        let limit = if v4 { total } else { total.min(MAX_V6_PROBES) };
        for i in 0..limit {
            let n = start_n + (begin - start_n + i) % total;
            let ip = u128_to_ip(n, v4);
            if !allocated.contains(&ip) {
                return Ok(ip);
            }
        }
        Err(StoreError::RangeFull { range_id: range.id })
    }

    /// Move a lease to ACKED and return it with freshly resolved options.
    /// `NoRows` when `(ip, client)` matches nothing; `created_at` is left
    /// untouched so re-REQUESTs are idempotent.
    pub async fn ack_lease(
        &self,
        tx: &mut SqliteConnection,
        ip: IpAddr,
        client: &ClientId,
    ) -> Result<(Lease, ResolvedOptions), StoreError> {
        let lease = model::lease_by_ip_client(tx, &ip.to_string(), client)
            .await?
            .ok_or(StoreError::NoRows)?;
        let now = now_epoch();
        sqlx::query("UPDATE lease SET state = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(lease.id)
            .bind(STATE_ACKED)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        let lease = Lease {
            state: STATE_ACKED,
            updated_at: now,
            ..lease
        };
        let opts = options::for_lease(tx, &lease, client).await?;
        // acked leases must carry a lease time
        opts.lease_time()?;
        debug!(ip = %lease.ip, "lease acked");
        Ok((lease, opts))
    }

    /// Drop the lease row for `(ip, client)`. No expiration row is
    /// written; a NAK'd client never held the address.
    pub async fn nack_lease(
        &self,
        tx: &mut SqliteConnection,
        ip: IpAddr,
        client: &ClientId,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "DELETE FROM lease WHERE ip = ?1 AND {} = ?2",
            client.column()
        );
        sqlx::query(&sql)
            .bind(ip.to_string())
            .bind(client.value())
            .execute(tx)
            .await?;
        Ok(())
    }

    /// Refresh `updated_at` for a renewing client
    pub async fn update_for_renewal(
        &self,
        tx: &mut SqliteConnection,
        ip: IpAddr,
        client: &ClientId,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE lease SET updated_at = ?3 WHERE ip = ?1 AND {} = ?2",
            client.column()
        );
        let affected = sqlx::query(&sql)
            .bind(ip.to_string())
            .bind(client.value())
            .bind(now_epoch())
            .execute(tx)
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(StoreError::NoRows);
        }
        Ok(())
    }

    /// Drop the client's lease on the interface's VLAN. Releasing an ACKED
    /// lease writes exactly one expiration row; an OFFERED one writes
    /// none. `NoRows` when the client holds nothing, which callers treat
    /// as benign.
    pub async fn release(
        &self,
        tx: &mut SqliteConnection,
        iface_idx: u32,
        client: &ClientId,
    ) -> Result<Lease, StoreError> {
        let vlan = model::vlan_for_interface(tx, &self.hostname, iface_idx)
            .await?
            .ok_or(StoreError::NoMatchingVlan(iface_idx))?;
        let lease = model::lease_for_client_on_vlan(tx, vlan.id, client)
            .await?
            .ok_or(StoreError::NoRows)?;
        if lease.is_acked() {
            model::insert_expiration(
                tx,
                &lease.ip,
                lease.mac_address.as_deref(),
                lease.duid.as_deref(),
                now_epoch(),
            )
            .await?;
        }
        model::delete_lease(tx, lease.id).await?;
        debug!(ip = %lease.ip, acked = lease.is_acked(), "lease released");
        Ok(lease)
    }

    /// Block an IP a client declined. The marker is a synthetic acked
    /// lease keyed only by IP; the sweeper removes it through the normal
    /// expiry path.
    pub async fn mark_conflicted(
        &self,
        tx: &mut SqliteConnection,
        ip: IpAddr,
    ) -> Result<(), StoreError> {
        let now = now_epoch();
        sqlx::query(
            "INSERT INTO lease (ip, mac_address, duid, created_at, updated_at, lifetime, state, needs_sync, range_id)
             VALUES (?1, NULL, NULL, ?2, ?2, ?3, ?4, FALSE, ?5)
             ON CONFLICT (ip) DO UPDATE SET
                mac_address = NULL, duid = NULL, updated_at = ?2,
                lifetime = ?3, state = ?4, needs_sync = FALSE, range_id = ?5",
        )
        .bind(ip.to_string())
        .bind(now)
        .bind(CONFLICT_LIFETIME_MS)
        .bind(STATE_ACKED)
        .bind(NO_RANGE)
        .execute(tx)
        .await?;
        warn!(%ip, "address marked conflicted");
        Ok(())
    }
}

/// rendered expiry for lease logs
fn expiry_rfc3339(lease_time: u32) -> String {
    DateTime::<Utc>::from_timestamp(now_epoch() + i64::from(lease_time), 0)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

/// Successor of a v4 address with big-endian carry; `None` past
/// 255.255.255.255
pub fn increment_v4(ip: Ipv4Addr) -> Option<Ipv4Addr> {
    let mut octets = ip.octets();
    for byte in octets.iter_mut().rev() {
        let (next, carry) = byte.overflowing_add(1);
        *byte = next;
        if !carry {
            return Some(Ipv4Addr::from(octets));
        }
    }
    None
}

fn ip_to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn u128_to_ip(n: u128, v4: bool) -> IpAddr {
    if v4 {
        IpAddr::V4(Ipv4Addr::from(n as u32))
    } else {
        IpAddr::V6(Ipv6Addr::from(n))
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;
    use crate::Db;

    type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

    const HOST: &str = "test-host";

    /// vlan 1 / iface idx 1 / subnet 10.0.0.0/24 / dynamic range
    /// 10.0.0.2..=10.0.0.22 with lease time 30 and router 10.0.0.1
    async fn seed(db: &Db) -> Result<()> {
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
        Ok(())
    }

    fn client(mac: &str) -> ClientId {
        ClientId::mac(mac)
    }

    #[tokio::test]
    #[traced_test]
    async fn discover_offers_first_free() -> Result<()> {
        let db = Db::connect("sqlite::memory:").await?;
        seed(&db).await?;
        let alloc = Allocator::with_hostname(HOST);
        let mut tx = db.begin().await?;
        let offer = alloc
            .offer_from_discover(&mut tx, 1, &client("ab:cd:ef:00:11:22"), None)
            .await?;
        tx.commit().await?;

        assert_eq!(offer.ip, "10.0.0.2".parse::<IpAddr>()?);
        assert_eq!(offer.lease_time, 30);
        assert_eq!(offer.options.get(3), Some("10.0.0.1"));

        let mut tx = db.begin().await?;
        let lease = model::lease_by_ip(&mut tx, "10.0.0.2").await?.unwrap();
        assert_eq!(lease.state, STATE_OFFERED);
        assert_eq!(lease.lifetime, 30_000);
        assert!(lease.needs_sync);
        assert_eq!(lease.mac_address.as_deref(), Some("ab:cd:ef:00:11:22"));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn rediscover_returns_same_address() -> Result<()> {
        let db = Db::connect("sqlite::memory:").await?;
        seed(&db).await?;
        let alloc = Allocator::with_hostname(HOST);
        let mac = client("ab:cd:ef:00:11:22");

        let mut tx = db.begin().await?;
        let first = alloc.offer_from_discover(&mut tx, 1, &mac, None).await?;
        tx.commit().await?;
        let mut tx = db.begin().await?;
        let second = alloc.offer_from_discover(&mut tx, 1, &mac, None).await?;
        tx.commit().await?;

        assert_eq!(first.ip, second.ip);
        let mut tx = db.begin().await?;
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM lease")
            .fetch_one(&mut *tx)
            .await?;
        assert_eq!(count.0, 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn scan_walks_past_allocated_addresses() -> Result<()> {
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
             VALUES (1, '10.0.0.1', '10.0.0.5', 5, FALSE, TRUE, 1)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("INSERT INTO dhcp_option (number, value, vlan_id) VALUES (51, '30', 1)")
            .execute(&mut *tx)
            .await?;
        let alloc = Allocator::with_hostname(HOST);
        for (i, ip) in ["10.0.0.1", "10.0.0.2", "10.0.0.4", "10.0.0.5"]
            .iter()
            .enumerate()
        {
            model::insert_lease(
                &mut tx,
                &ip.parse()?,
                &client(&format!("aa:00:00:00:00:{i:02x}")),
                now_epoch(),
                30_000,
                STATE_ACKED,
                true,
                1,
            )
            .await?;
        }
        tx.commit().await?;

        let mut tx = db.begin().await?;
        let offer = alloc
            .offer_from_discover(&mut tx, 1, &client("ab:cd:ef:00:11:22"), None)
            .await?;
        assert_eq!(offer.ip, "10.0.0.3".parse::<IpAddr>()?);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn exhausted_range_is_flagged() -> Result<()> {
        let db = Db::connect("sqlite::memory:").await?;
        seed(&db).await?;
        let mut tx = db.begin().await?;
        sqlx::query("UPDATE ip_range SET end_ip = '10.0.0.3', size = 2 WHERE id = 1")
            .execute(&mut *tx)
            .await?;
        let alloc = Allocator::with_hostname(HOST);
        for (ip, mac) in [("10.0.0.2", "aa:00:00:00:00:01"), ("10.0.0.3", "aa:00:00:00:00:02")] {
            model::insert_lease(
                &mut tx,
                &ip.parse()?,
                &client(mac),
                now_epoch(),
                30_000,
                STATE_ACKED,
                true,
                1,
            )
            .await?;
        }
        tx.commit().await?;

        let mut tx = db.begin().await?;
        let err = alloc
            .offer_from_discover(&mut tx, 1, &client("ab:cd:ef:00:11:22"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NoAvailableIp { vlan_id: 1 }));
        tx.commit().await?;

        let mut tx = db.begin().await?;
        let range = model::range_by_id(&mut tx, 1).await?.unwrap();
        assert!(range.fully_allocated);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn reservation_takes_priority() -> Result<()> {
        let db = Db::connect("sqlite::memory:").await?;
        seed(&db).await?;
        let mut tx = db.begin().await?;
        sqlx::query(
            "INSERT INTO host_reservation (id, ip_address, mac_address, subnet_id)
             VALUES (1, '10.0.0.50', 'ab:cd:ef:00:11:22', 1)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO dhcp_option (number, value, host_reservation_id) VALUES (12, 'node1', 1)",
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let alloc = Allocator::with_hostname(HOST);
        let mut tx = db.begin().await?;
        let offer = alloc
            .offer_from_discover(&mut tx, 1, &client("AB:CD:EF:00:11:22"), None)
            .await?;
        assert_eq!(offer.ip, "10.0.0.50".parse::<IpAddr>()?);
        // reservation options layered on top of the broader levels
        assert_eq!(offer.options.get(12), Some("node1"));
        assert_eq!(offer.options.get(3), Some("10.0.0.1"));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn ack_release_roundtrip() -> Result<()> {
        let db = Db::connect("sqlite::memory:").await?;
        seed(&db).await?;
        let alloc = Allocator::with_hostname(HOST);
        let mac = client("ab:cd:ef:00:11:22");

        let mut tx = db.begin().await?;
        let offer = alloc.offer_from_discover(&mut tx, 1, &mac, None).await?;
        tx.commit().await?;

        let mut tx = db.begin().await?;
        let (lease, opts) = alloc.ack_lease(&mut tx, offer.ip, &mac).await?;
        tx.commit().await?;
        assert_eq!(lease.state, STATE_ACKED);
        assert_eq!(opts.lease_time()?, 30);

        // re-REQUEST leaves created_at untouched
        let mut tx = db.begin().await?;
        let (again, _) = alloc.ack_lease(&mut tx, offer.ip, &mac).await?;
        tx.commit().await?;
        assert_eq!(again.created_at, lease.created_at);

        let mut tx = db.begin().await?;
        let released = alloc.release(&mut tx, 1, &mac).await?;
        tx.commit().await?;
        assert_eq!(released.ip, offer.ip.to_string());

        let mut tx = db.begin().await?;
        assert!(model::lease_by_ip(&mut tx, &released.ip).await?.is_none());
        let exp: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM expiration WHERE ip = ?1")
            .bind(&released.ip)
            .fetch_one(&mut *tx)
            .await?;
        assert_eq!(exp.0, 1);
        drop(tx);

        // releasing again finds nothing
        let mut tx = db.begin().await?;
        let err = alloc.release(&mut tx, 1, &mac).await.unwrap_err();
        assert!(matches!(err, StoreError::NoRows));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn release_of_offered_writes_no_expiration() -> Result<()> {
        let db = Db::connect("sqlite::memory:").await?;
        seed(&db).await?;
        let alloc = Allocator::with_hostname(HOST);
        let mac = client("ab:cd:ef:00:11:22");

        let mut tx = db.begin().await?;
        alloc.offer_from_discover(&mut tx, 1, &mac, None).await?;
        alloc.release(&mut tx, 1, &mac).await?;
        let exp: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM expiration")
            .fetch_one(&mut *tx)
            .await?;
        assert_eq!(exp.0, 0);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn ack_for_unknown_lease_is_norows() -> Result<()> {
        let db = Db::connect("sqlite::memory:").await?;
        seed(&db).await?;
        let alloc = Allocator::with_hostname(HOST);
        let mut tx = db.begin().await?;
        let err = alloc
            .ack_lease(&mut tx, "10.0.0.2".parse()?, &client("ab:cd:ef:00:11:22"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NoRows));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn renewal_requires_existing_lease() -> Result<()> {
        let db = Db::connect("sqlite::memory:").await?;
        seed(&db).await?;
        let alloc = Allocator::with_hostname(HOST);
        let mac = client("ab:cd:ef:00:11:22");

        let mut tx = db.begin().await?;
        let err = alloc
            .update_for_renewal(&mut tx, "10.0.0.2".parse()?, &mac)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NoRows));
        drop(tx);

        let mut tx = db.begin().await?;
        let offer = alloc.offer_from_discover(&mut tx, 1, &mac, None).await?;
        alloc.update_for_renewal(&mut tx, offer.ip, &mac).await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn conflict_marker_blocks_allocation() -> Result<()> {
        let db = Db::connect("sqlite::memory:").await?;
        seed(&db).await?;
        let alloc = Allocator::with_hostname(HOST);

        let mut tx = db.begin().await?;
        alloc.mark_conflicted(&mut tx, "10.0.0.2".parse()?).await?;
        tx.commit().await?;

        let mut tx = db.begin().await?;
        let marker = model::lease_by_ip(&mut tx, "10.0.0.2").await?.unwrap();
        assert!(marker.is_conflict_marker());
        assert_eq!(marker.range_id, NO_RANGE);
        assert_eq!(marker.state, STATE_ACKED);
        assert_eq!(marker.lifetime, CONFLICT_LIFETIME_MS);
        drop(tx);

        let mut tx = db.begin().await?;
        let offer = alloc
            .offer_from_discover(&mut tx, 1, &client("ab:cd:ef:00:11:22"), None)
            .await?;
        assert_eq!(offer.ip, "10.0.0.3".parse::<IpAddr>()?);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn missing_lease_time_option_fails() -> Result<()> {
        let db = Db::connect("sqlite::memory:").await?;
        seed(&db).await?;
        let mut tx = db.begin().await?;
        sqlx::query("DELETE FROM dhcp_option WHERE number = 51")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let alloc = Allocator::with_hostname(HOST);
        let mut tx = db.begin().await?;
        let err = alloc
            .offer_from_discover(&mut tx, 1, &client("ab:cd:ef:00:11:22"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingOption(51)));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn unknown_interface_has_no_vlan() -> Result<()> {
        let db = Db::connect("sqlite::memory:").await?;
        seed(&db).await?;
        let alloc = Allocator::with_hostname(HOST);
        let mut tx = db.begin().await?;
        let err = alloc
            .offer_from_discover(&mut tx, 9, &client("ab:cd:ef:00:11:22"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NoMatchingVlan(9)));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn relay_hint_selects_target_vlan() -> Result<()> {
        let db = Db::connect("sqlite::memory:").await?;
        seed(&db).await?;
        let mut tx = db.begin().await?;
        // second vlan reachable only through a relay on vlan 1
        sqlx::query("INSERT INTO vlan (id, vid, relay_vlan_id) VALUES (2, 2, 1)")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO subnet (id, cidr, address_family, vlan_id) VALUES (2, '10.1.0.0/24', 4, 2)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO ip_range (id, start_ip, end_ip, size, fully_allocated, dynamic, subnet_id)
             VALUES (2, '10.1.0.10', '10.1.0.20', 11, FALSE, TRUE, 2)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("INSERT INTO dhcp_option (number, value, vlan_id) VALUES (51, '60', 2)")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let alloc = Allocator::with_hostname(HOST);
        let mut tx = db.begin().await?;
        let offer = alloc
            .offer_from_discover(
                &mut tx,
                1,
                &client("ab:cd:ef:00:11:22"),
                Some("10.1.0.1".parse()?),
            )
            .await?;
        assert_eq!(offer.ip, "10.1.0.10".parse::<IpAddr>()?);
        assert_eq!(offer.lease_time, 60);
        Ok(())
    }

    #[test]
    fn increment_carries_across_octets() {
        assert_eq!(
            increment_v4("10.0.0.1".parse().unwrap()),
            Some("10.0.0.2".parse().unwrap())
        );
        assert_eq!(
            increment_v4("10.0.0.255".parse().unwrap()),
            Some("10.0.1.0".parse().unwrap())
        );
        assert_eq!(
            increment_v4("10.255.255.255".parse().unwrap()),
            Some("11.0.0.0".parse().unwrap())
        );
        assert_eq!(increment_v4("255.255.255.255".parse().unwrap()), None);
    }

    #[test]
    fn increment_preserves_order() {
        let mut ip: Ipv4Addr = "192.168.0.250".parse().unwrap();
        for _ in 0..20 {
            let next = increment_v4(ip).unwrap();
            assert!(u32::from(next) == u32::from(ip) + 1);
            ip = next;
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn mac_lookup_is_case_insensitive() -> Result<()> {
        let db = Db::connect("sqlite::memory:").await?;
        seed(&db).await?;
        let alloc = Allocator::with_hostname(HOST);

        let mut tx = db.begin().await?;
        let offer = alloc
            .offer_from_discover(&mut tx, 1, &client("AB:CD:EF:00:11:22"), None)
            .await?;
        tx.commit().await?;

        let mut tx = db.begin().await?;
        let (lease, _) = alloc
            .ack_lease(&mut tx, offer.ip, &client("ab:cd:ef:00:11:22"))
            .await?;
        assert_eq!(lease.mac_address.as_deref(), Some("ab:cd:ef:00:11:22"));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn v6_allocation_stays_in_range() -> Result<()> {
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

        let alloc = Allocator::with_hostname(HOST);
        let duid = ClientId::duid("00:01:00:01:aa:bb:cc:dd");
        let mut tx = db.begin().await?;
        let offer = alloc.offer_from_discover(&mut tx, 1, &duid, None).await?;
        tx.commit().await?;

        let start: u128 = u128::from("fd00::10".parse::<Ipv6Addr>()?);
        let end: u128 = u128::from("fd00::ff".parse::<Ipv6Addr>()?);
        match offer.ip {
            IpAddr::V6(ip) => {
                let n = u128::from(ip);
                assert!(n >= start && n <= end);
            }
            IpAddr::V4(_) => panic!("expected a v6 address"),
        }
        // idempotent for the same DUID
        let mut tx = db.begin().await?;
        let again = alloc.offer_from_discover(&mut tx, 1, &duid, None).await?;
        assert_eq!(offer.ip, again.ip);
        Ok(())
    }
}
