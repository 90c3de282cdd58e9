//! Hierarchical option resolution.
//!
//! Options live in a single table with exactly one owner level per row.
//! Resolving the options for a lease walks VLAN → Subnet → IPRange →
//! HostReservation, each level overwriting broader ones by option number.
//! Values stay text here; the reply marshaller decides encoding.
use std::collections::BTreeMap;

use sqlx::sqlite::SqliteConnection;

use crate::{
    model::{self, Lease},
    ClientId, StoreError,
};

/// Subnet Mask
pub const OPT_SUBNET_MASK: i64 = 1;
/// Router
pub const OPT_ROUTER: i64 = 3;
/// Domain Name Server
pub const OPT_DOMAIN_NAME_SERVER: i64 = 6;
/// Host Name
pub const OPT_HOST_NAME: i64 = 12;
/// Domain Name
pub const OPT_DOMAIN_NAME: i64 = 15;
/// Interface MTU
pub const OPT_INTERFACE_MTU: i64 = 26;
/// NTP Servers
pub const OPT_NTP_SERVERS: i64 = 42;
/// IP Address Lease Time
pub const OPT_LEASE_TIME: i64 = 51;
/// Domain Search List
pub const OPT_DOMAIN_SEARCH: i64 = 119;

/// Option numbers to text values, ordered by number
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedOptions(BTreeMap<i64, String>);

impl ResolvedOptions {
    pub fn get(&self, number: i64) -> Option<&str> {
        self.0.get(&number).map(String::as_str)
    }

    pub fn insert(&mut self, number: i64, value: impl Into<String>) {
        self.0.insert(number, value.into());
    }

    /// numeric order, which is also reply emission order
    pub fn iter(&self) -> impl Iterator<Item = (i64, &str)> {
        self.0.iter().map(|(k, v)| (*k, v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The lease-time option is mandatory for any offered or acked lease.
    pub fn lease_time(&self) -> Result<u32, StoreError> {
        let value = self
            .get(OPT_LEASE_TIME)
            .ok_or(StoreError::MissingOption(OPT_LEASE_TIME))?;
        value
            .trim()
            .parse::<u32>()
            .map_err(|_| StoreError::InvalidOptionValue {
                number: OPT_LEASE_TIME,
                value: value.to_owned(),
            })
    }
}

/// The owner ids making up one inheritance walk. Missing levels are
/// skipped without error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptionChain {
    pub vlan_id: Option<i64>,
    pub subnet_id: Option<i64>,
    pub range_id: Option<i64>,
    pub reservation_id: Option<i64>,
}

impl OptionChain {
    /// Chain ending at a range: range → subnet → vlan
    pub async fn for_range(
        conn: &mut SqliteConnection,
        range_id: i64,
    ) -> Result<OptionChain, StoreError> {
        let range = model::range_by_id(conn, range_id)
            .await?
            .ok_or(StoreError::NoRows)?;
        let subnet = model::subnet_by_id(conn, range.subnet_id)
            .await?
            .ok_or(StoreError::NoRows)?;
        Ok(OptionChain {
            vlan_id: Some(subnet.vlan_id),
            subnet_id: Some(subnet.id),
            range_id: Some(range.id),
            reservation_id: None,
        })
    }

    /// Chain ending at a reservation: the reservation's subnet and (when
    /// set) range, topped by the reservation itself.
    pub async fn for_reservation(
        conn: &mut SqliteConnection,
        reservation: &model::HostReservation,
    ) -> Result<OptionChain, StoreError> {
        let subnet = model::subnet_by_id(conn, reservation.subnet_id)
            .await?
            .ok_or(StoreError::NoRows)?;
        Ok(OptionChain {
            vlan_id: Some(subnet.vlan_id),
            subnet_id: Some(subnet.id),
            range_id: reservation.range_id,
            reservation_id: Some(reservation.id),
        })
    }
}

async fn options_at(
    conn: &mut SqliteConnection,
    column: &str,
    id: i64,
) -> Result<Vec<(i64, String)>, StoreError> {
    let sql = format!("SELECT number, value FROM dhcp_option WHERE {column} = ?1");
    Ok(sqlx::query_as(&sql).bind(id).fetch_all(conn).await?)
}

/// Merge the chain's levels, most specific last
pub async fn resolve(
    conn: &mut SqliteConnection,
    chain: OptionChain,
) -> Result<ResolvedOptions, StoreError> {
    let mut resolved = ResolvedOptions::default();
    let levels = [
        ("vlan_id", chain.vlan_id),
        ("subnet_id", chain.subnet_id),
        ("range_id", chain.range_id),
        ("host_reservation_id", chain.reservation_id),
    ];
    for (column, id) in levels {
        let Some(id) = id else { continue };
        for (number, value) in options_at(conn, column, id).await? {
            resolved.insert(number, value);
        }
    }
    Ok(resolved)
}

/// Options applicable to a lease. When a reservation matches the lease's
/// `(ip, client)` the reservation path wins; otherwise the lease's range
/// chain is used. Conflict markers resolve to the empty set.
pub async fn for_lease(
    conn: &mut SqliteConnection,
    lease: &Lease,
    client: &ClientId,
) -> Result<ResolvedOptions, StoreError> {
    let reservation = model::reservation_for_ip(conn, &lease.ip)
        .await?
        .filter(|r| client.matches(r.mac_address.as_deref(), r.duid.as_deref()));
    let chain = if let Some(reservation) = &reservation {
        OptionChain::for_reservation(conn, reservation).await?
    } else if lease.range_id != model::NO_RANGE {
        OptionChain::for_range(conn, lease.range_id).await?
    } else {
        OptionChain::default()
    };
    resolve(conn, chain).await
}
