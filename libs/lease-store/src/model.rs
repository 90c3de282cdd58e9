//! Row types and loaders for the core schema. Loaders take a plain
//! connection so they compose inside whatever transaction the caller holds.
use std::{
    collections::HashSet,
    net::IpAddr,
    str::FromStr,
};

use ipnet::IpNet;
use sqlx::{sqlite::SqliteConnection, FromRow};

use crate::{ClientId, StoreError};

/// lease.state value for an offer that has not been acknowledged
pub const STATE_OFFERED: i64 = 0;
/// lease.state value for an acknowledged lease
pub const STATE_ACKED: i64 = 1;

/// range_id used by synthetic rows (conflict markers, reservations
/// without a range)
pub const NO_RANGE: i64 = 0;

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Vlan {
    pub id: i64,
    pub vid: i64,
    pub relay_vlan_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Subnet {
    pub id: i64,
    pub cidr: String,
    pub address_family: i64,
    pub vlan_id: i64,
}

impl Subnet {
    pub fn net(&self) -> Result<IpNet, StoreError> {
        IpNet::from_str(&self.cidr).map_err(|_| StoreError::InvalidIp(self.cidr.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct IpRange {
    pub id: i64,
    pub start_ip: String,
    pub end_ip: String,
    pub size: i64,
    pub fully_allocated: bool,
    pub dynamic: bool,
    pub subnet_id: i64,
}

impl IpRange {
    pub fn start(&self) -> Result<IpAddr, StoreError> {
        parse_ip(&self.start_ip)
    }

    pub fn end(&self) -> Result<IpAddr, StoreError> {
        parse_ip(&self.end_ip)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct HostReservation {
    pub id: i64,
    pub ip_address: String,
    pub mac_address: Option<String>,
    pub duid: Option<String>,
    pub range_id: Option<i64>,
    pub subnet_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Lease {
    pub id: i64,
    pub ip: String,
    pub mac_address: Option<String>,
    pub duid: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    /// milliseconds; keeps the expiry predicate integer-only
    pub lifetime: i64,
    pub state: i64,
    pub needs_sync: bool,
    pub range_id: i64,
}

impl Lease {
    pub fn ip_addr(&self) -> Result<IpAddr, StoreError> {
        parse_ip(&self.ip)
    }

    pub fn is_acked(&self) -> bool {
        self.state == STATE_ACKED
    }

    /// conflict markers carry no client identity
    pub fn is_conflict_marker(&self) -> bool {
        self.mac_address.is_none() && self.duid.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Expiration {
    pub id: i64,
    pub ip: String,
    pub mac_address: Option<String>,
    pub duid: Option<String>,
    pub created_at: i64,
}

pub(crate) fn parse_ip(s: &str) -> Result<IpAddr, StoreError> {
    IpAddr::from_str(s).map_err(|_| StoreError::InvalidIp(s.to_owned()))
}

/// VLAN the interface `(hostname, idx)` belongs to
pub async fn vlan_for_interface(
    conn: &mut SqliteConnection,
    hostname: &str,
    idx: u32,
) -> Result<Option<Vlan>, StoreError> {
    Ok(sqlx::query_as::<_, Vlan>(
        "SELECT v.id, v.vid, v.relay_vlan_id
         FROM vlan v JOIN iface i ON i.vlan_id = v.id
         WHERE i.hostname = ?1 AND i.idx = ?2",
    )
    .bind(hostname)
    .bind(idx as i64)
    .fetch_optional(conn)
    .await?)
}

pub async fn vlan_by_id(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<Vlan>, StoreError> {
    Ok(
        sqlx::query_as::<_, Vlan>("SELECT id, vid, relay_vlan_id FROM vlan WHERE id = ?1")
            .bind(id)
            .fetch_optional(conn)
            .await?,
    )
}

pub async fn subnet_by_id(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<Subnet>, StoreError> {
    Ok(sqlx::query_as::<_, Subnet>(
        "SELECT id, cidr, address_family, vlan_id FROM subnet WHERE id = ?1",
    )
    .bind(id)
    .fetch_optional(conn)
    .await?)
}

/// Subnet whose CIDR contains `ip`. CIDRs are parsed in code; the subnet
/// table is small and read-mostly.
pub async fn subnet_containing(
    conn: &mut SqliteConnection,
    ip: IpAddr,
) -> Result<Option<Subnet>, StoreError> {
    let subnets = sqlx::query_as::<_, Subnet>(
        "SELECT id, cidr, address_family, vlan_id FROM subnet",
    )
    .fetch_all(conn)
    .await?;
    for subnet in subnets {
        if subnet.net()?.contains(&ip) {
            return Ok(Some(subnet));
        }
    }
    Ok(None)
}

pub async fn subnets_for_vlan(
    conn: &mut SqliteConnection,
    vlan_id: i64,
) -> Result<Vec<Subnet>, StoreError> {
    Ok(sqlx::query_as::<_, Subnet>(
        "SELECT id, cidr, address_family, vlan_id FROM subnet WHERE vlan_id = ?1",
    )
    .bind(vlan_id)
    .fetch_all(conn)
    .await?)
}

/// Ranges on a VLAN for one address family
pub async fn ranges_for_vlan(
    conn: &mut SqliteConnection,
    vlan_id: i64,
    address_family: i64,
) -> Result<Vec<IpRange>, StoreError> {
    Ok(sqlx::query_as::<_, IpRange>(
        "SELECT r.id, r.start_ip, r.end_ip, r.size, r.fully_allocated, r.dynamic, r.subnet_id
         FROM ip_range r JOIN subnet s ON r.subnet_id = s.id
         WHERE s.vlan_id = ?1 AND s.address_family = ?2",
    )
    .bind(vlan_id)
    .bind(address_family)
    .fetch_all(conn)
    .await?)
}

pub async fn range_by_id(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<IpRange>, StoreError> {
    Ok(sqlx::query_as::<_, IpRange>(
        "SELECT id, start_ip, end_ip, size, fully_allocated, dynamic, subnet_id
         FROM ip_range WHERE id = ?1",
    )
    .bind(id)
    .fetch_optional(conn)
    .await?)
}

pub async fn set_fully_allocated(
    conn: &mut SqliteConnection,
    range_id: i64,
    value: bool,
) -> Result<(), StoreError> {
    sqlx::query("UPDATE ip_range SET fully_allocated = ?2 WHERE id = ?1")
        .bind(range_id)
        .bind(value)
        .execute(conn)
        .await?;
    Ok(())
}

/// Reservation matching a client identity on a VLAN
pub async fn reservation_for_client(
    conn: &mut SqliteConnection,
    vlan_id: i64,
    client: &ClientId,
) -> Result<Option<HostReservation>, StoreError> {
    let sql = format!(
        "SELECT hr.id, hr.ip_address, hr.mac_address, hr.duid, hr.range_id, hr.subnet_id
         FROM host_reservation hr JOIN subnet s ON hr.subnet_id = s.id
         WHERE s.vlan_id = ?1 AND hr.{} = ?2",
        client.column()
    );
    Ok(sqlx::query_as::<_, HostReservation>(&sql)
        .bind(vlan_id)
        .bind(client.value())
        .fetch_optional(conn)
        .await?)
}

pub async fn reservation_for_ip(
    conn: &mut SqliteConnection,
    ip: &str,
) -> Result<Option<HostReservation>, StoreError> {
    Ok(sqlx::query_as::<_, HostReservation>(
        "SELECT id, ip_address, mac_address, duid, range_id, subnet_id
         FROM host_reservation WHERE ip_address = ?1",
    )
    .bind(ip)
    .fetch_optional(conn)
    .await?)
}

pub async fn lease_by_ip(
    conn: &mut SqliteConnection,
    ip: &str,
) -> Result<Option<Lease>, StoreError> {
    Ok(sqlx::query_as::<_, Lease>("SELECT * FROM lease WHERE ip = ?1")
        .bind(ip)
        .fetch_optional(conn)
        .await?)
}

pub async fn lease_by_ip_client(
    conn: &mut SqliteConnection,
    ip: &str,
    client: &ClientId,
) -> Result<Option<Lease>, StoreError> {
    let sql = format!("SELECT * FROM lease WHERE ip = ?1 AND {} = ?2", client.column());
    Ok(sqlx::query_as::<_, Lease>(&sql)
        .bind(ip)
        .bind(client.value())
        .fetch_optional(conn)
        .await?)
}

/// Lease held by `client` on `vlan`. Resolved through the lease's range
/// when it has one, otherwise by checking the lease IP against the VLAN's
/// subnets (reservation-only leases carry no range).
pub async fn lease_for_client_on_vlan(
    conn: &mut SqliteConnection,
    vlan_id: i64,
    client: &ClientId,
) -> Result<Option<Lease>, StoreError> {
    let sql = format!(
        "SELECT l.* FROM lease l
         JOIN ip_range r ON l.range_id = r.id
         JOIN subnet s ON r.subnet_id = s.id
         WHERE s.vlan_id = ?1 AND l.{} = ?2",
        client.column()
    );
    if let Some(lease) = sqlx::query_as::<_, Lease>(&sql)
        .bind(vlan_id)
        .bind(client.value())
        .fetch_optional(&mut *conn)
        .await?
    {
        return Ok(Some(lease));
    }
    // leases without a range: scope by subnet membership instead
    let sql = format!(
        "SELECT * FROM lease WHERE range_id = ?1 AND {} = ?2",
        client.column()
    );
    let unranged = sqlx::query_as::<_, Lease>(&sql)
        .bind(NO_RANGE)
        .bind(client.value())
        .fetch_all(&mut *conn)
        .await?;
    if unranged.is_empty() {
        return Ok(None);
    }
    let subnets = subnets_for_vlan(conn, vlan_id).await?;
    for lease in unranged {
        let ip = lease.ip_addr()?;
        for subnet in &subnets {
            if subnet.net()?.contains(&ip) {
                return Ok(Some(lease));
            }
        }
    }
    Ok(None)
}

/// Most recently written lease in a range, the scan start hint
pub async fn last_lease_in_range(
    conn: &mut SqliteConnection,
    range_id: i64,
) -> Result<Option<Lease>, StoreError> {
    Ok(sqlx::query_as::<_, Lease>(
        "SELECT * FROM lease WHERE range_id = ?1 ORDER BY id DESC LIMIT 1",
    )
    .bind(range_id)
    .fetch_optional(conn)
    .await?)
}

/// Every IP that must not be offered: any lease row (any state, including
/// conflict markers) and any expiration row.
pub async fn allocated_ips(
    conn: &mut SqliteConnection,
) -> Result<HashSet<IpAddr>, StoreError> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT ip FROM lease UNION SELECT ip FROM expiration")
            .fetch_all(conn)
            .await?;
    rows.into_iter().map(|(ip,)| parse_ip(&ip)).collect()
}

pub async fn insert_lease(
    conn: &mut SqliteConnection,
    ip: &IpAddr,
    client: &ClientId,
    now: i64,
    lifetime_ms: i64,
    state: i64,
    needs_sync: bool,
    range_id: i64,
) -> Result<(), StoreError> {
    let (mac, duid) = match client {
        ClientId::Mac(v) => (Some(v.as_str()), None),
        ClientId::Duid(v) => (None, Some(v.as_str())),
    };
    sqlx::query(
        "INSERT INTO lease (ip, mac_address, duid, created_at, updated_at, lifetime, state, needs_sync, range_id)
         VALUES (?1, ?2, ?3, ?4, ?4, ?5, ?6, ?7, ?8)",
    )
    .bind(ip.to_string())
    .bind(mac)
    .bind(duid)
    .bind(now)
    .bind(lifetime_ms)
    .bind(state)
    .bind(needs_sync)
    .bind(range_id)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn delete_lease(conn: &mut SqliteConnection, id: i64) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM lease WHERE id = ?1")
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Record an expiration event. `UNIQUE(ip, mac_address)` keeps it to one
/// row per event, so re-inserts are ignored.
pub async fn insert_expiration(
    conn: &mut SqliteConnection,
    ip: &str,
    mac: Option<&str>,
    duid: Option<&str>,
    now: i64,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT OR IGNORE INTO expiration (ip, mac_address, duid, created_at)
         VALUES (?1, ?2, ?3, ?4)",
    )
    .bind(ip)
    .bind(mac)
    .bind(duid)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(())
}
