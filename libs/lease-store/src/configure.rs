//! The configuration activity: upserts the network topology handed down
//! from the region into the store under one transaction and regenerates
//! the option rows derived from it.
//!
//! Re-running with the same parameter is a no-op; rows are keyed on the
//! region-assigned ids.
use std::{collections::HashMap, net::IpAddr};

use ipnet::IpNet;
use serde::Deserialize;
use sqlx::sqlite::SqliteConnection;
use tracing::{debug, instrument, warn};

use crate::{
    options::{
        OPT_DOMAIN_NAME, OPT_DOMAIN_NAME_SERVER, OPT_DOMAIN_SEARCH, OPT_HOST_NAME,
        OPT_INTERFACE_MTU, OPT_LEASE_TIME, OPT_NTP_SERVERS, OPT_ROUTER, OPT_SUBNET_MASK,
    },
    StoreError,
};

fn default_lease_time() -> u32 {
    600
}

fn default_allow_dns() -> bool {
    true
}

/// Everything the region pushes down in one configuration pass
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigParam {
    #[serde(default)]
    pub vlans: Vec<VlanParam>,
    #[serde(default)]
    pub subnets: Vec<SubnetParam>,
    #[serde(default)]
    pub interfaces: Vec<InterfaceParam>,
    #[serde(default)]
    pub ip_ranges: Vec<IpRangeParam>,
    #[serde(default)]
    pub host_reservations: Vec<HostReservationParam>,
    #[serde(default)]
    pub default_dns_servers: Vec<IpAddr>,
    #[serde(default)]
    pub ntp_servers: Vec<IpAddr>,
    #[serde(default = "default_lease_time")]
    pub default_lease_time: u32,
}

impl Default for ConfigParam {
    fn default() -> Self {
        Self {
            vlans: Vec::new(),
            subnets: Vec::new(),
            interfaces: Vec::new(),
            ip_ranges: Vec::new(),
            host_reservations: Vec::new(),
            default_dns_servers: Vec::new(),
            ntp_servers: Vec::new(),
            default_lease_time: default_lease_time(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VlanParam {
    pub id: i64,
    pub vid: u16,
    #[serde(default)]
    pub relay_vlan_id: Option<i64>,
    #[serde(default)]
    pub mtu: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubnetParam {
    pub id: i64,
    pub cidr: IpNet,
    pub vlan_id: i64,
    #[serde(default)]
    pub gateway_ip: Option<IpAddr>,
    #[serde(default)]
    pub dns_servers: Vec<IpAddr>,
    #[serde(default = "default_allow_dns")]
    pub allow_dns: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InterfaceParam {
    pub id: i64,
    /// kernel interface name; resolved to an index by the caller
    pub name: String,
    pub vlan_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IpRangeParam {
    pub id: i64,
    pub start_ip: IpAddr,
    pub end_ip: IpAddr,
    pub dynamic: bool,
    pub subnet_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostReservationParam {
    pub id: i64,
    pub ip_address: IpAddr,
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub duid: Option<String>,
    #[serde(default)]
    pub range_id: Option<i64>,
    pub subnet_id: i64,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub domain_search: Vec<String>,
}

fn family_of(net: &IpNet) -> i64 {
    match net {
        IpNet::V4(_) => 4,
        IpNet::V6(_) => 6,
    }
}

fn csv(ips: impl IntoIterator<Item = IpAddr>) -> String {
    ips.into_iter()
        .map(|ip| ip.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

async fn replace_options(
    tx: &mut SqliteConnection,
    column: &str,
    id: i64,
    options: &[(i64, String)],
) -> Result<(), StoreError> {
    let sql = format!("DELETE FROM dhcp_option WHERE {column} = ?1");
    sqlx::query(&sql).bind(id).execute(&mut *tx).await?;
    let sql = format!("INSERT INTO dhcp_option (number, value, {column}) VALUES (?1, ?2, ?3)");
    for (number, value) in options {
        sqlx::query(&sql)
            .bind(number)
            .bind(value)
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    Ok(())
}

/// Upsert the whole parameter under the caller's transaction.
/// `ifindexes` maps local interface names to kernel indices; interfaces
/// that do not exist on this host are skipped.
#[instrument(level = "debug", skip_all, fields(hostname = %hostname))]
pub async fn configure(
    tx: &mut SqliteConnection,
    param: &ConfigParam,
    ifindexes: &HashMap<String, u32>,
    hostname: &str,
) -> Result<(), StoreError> {
    for vlan in &param.vlans {
        sqlx::query(
            "INSERT INTO vlan (id, vid, relay_vlan_id) VALUES (?1, ?2, ?3)
             ON CONFLICT (id) DO UPDATE SET vid = ?2, relay_vlan_id = ?3",
        )
        .bind(vlan.id)
        .bind(i64::from(vlan.vid))
        .bind(vlan.relay_vlan_id)
        .execute(&mut *tx)
        .await?;

        let mut opts = vec![(OPT_LEASE_TIME, param.default_lease_time.to_string())];
        if let Some(mtu) = vlan.mtu {
            opts.push((OPT_INTERFACE_MTU, mtu.to_string()));
        }
        if !param.ntp_servers.is_empty() {
            opts.push((OPT_NTP_SERVERS, csv(param.ntp_servers.iter().copied())));
        }
        replace_options(tx, "vlan_id", vlan.id, &opts).await?;
    }

    for iface in &param.interfaces {
        let Some(idx) = ifindexes.get(&iface.name) else {
            warn!(name = %iface.name, "interface not present on this host, skipping");
            continue;
        };
        sqlx::query(
            "INSERT INTO iface (id, hostname, idx, vlan_id) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (id) DO UPDATE SET hostname = ?2, idx = ?3, vlan_id = ?4",
        )
        .bind(iface.id)
        .bind(hostname)
        .bind(*idx as i64)
        .bind(iface.vlan_id)
        .execute(&mut *tx)
        .await?;
    }

    for subnet in &param.subnets {
        let family = family_of(&subnet.cidr);
        sqlx::query(
            "INSERT INTO subnet (id, cidr, address_family, vlan_id) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (id) DO UPDATE SET cidr = ?2, address_family = ?3, vlan_id = ?4",
        )
        .bind(subnet.id)
        .bind(subnet.cidr.to_string())
        .bind(family)
        .bind(subnet.vlan_id)
        .execute(&mut *tx)
        .await?;

        let mut opts = Vec::new();
        if let IpNet::V4(net) = subnet.cidr {
            // mask travels as 4-byte hex text, decoded by the marshaller
            let mask = net.netmask().octets();
            opts.push((
                OPT_SUBNET_MASK,
                format!("{:02x}{:02x}{:02x}{:02x}", mask[0], mask[1], mask[2], mask[3]),
            ));
        }
        if let Some(gateway) = subnet.gateway_ip {
            opts.push((OPT_ROUTER, gateway.to_string()));
        }
        if subnet.allow_dns {
            // default servers first, then subnet-specific, same family only
            let servers: Vec<IpAddr> = param
                .default_dns_servers
                .iter()
                .chain(subnet.dns_servers.iter())
                .copied()
                .filter(|ip| (ip.is_ipv4() && family == 4) || (ip.is_ipv6() && family == 6))
                .collect();
            if !servers.is_empty() {
                opts.push((OPT_DOMAIN_NAME_SERVER, csv(servers)));
            }
        }
        replace_options(tx, "subnet_id", subnet.id, &opts).await?;
    }

    for range in &param.ip_ranges {
        let size = range_size(range.start_ip, range.end_ip);
        sqlx::query(
            "INSERT INTO ip_range (id, start_ip, end_ip, size, fully_allocated, dynamic, subnet_id)
             VALUES (?1, ?2, ?3, ?4, FALSE, ?5, ?6)
             ON CONFLICT (id) DO UPDATE SET
                start_ip = ?2, end_ip = ?3, size = ?4, fully_allocated = FALSE,
                dynamic = ?5, subnet_id = ?6",
        )
        .bind(range.id)
        .bind(range.start_ip.to_string())
        .bind(range.end_ip.to_string())
        .bind(size)
        .bind(range.dynamic)
        .bind(range.subnet_id)
        .execute(&mut *tx)
        .await?;
    }

    for reservation in &param.host_reservations {
        sqlx::query(
            "INSERT INTO host_reservation (id, ip_address, mac_address, duid, range_id, subnet_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (id) DO UPDATE SET
                ip_address = ?2, mac_address = ?3, duid = ?4, range_id = ?5, subnet_id = ?6",
        )
        .bind(reservation.id)
        .bind(reservation.ip_address.to_string())
        .bind(
            reservation
                .mac_address
                .as_deref()
                .map(|m| m.trim().to_ascii_lowercase()),
        )
        .bind(
            reservation
                .duid
                .as_deref()
                .map(|d| d.trim().to_ascii_lowercase()),
        )
        .bind(reservation.range_id)
        .bind(reservation.subnet_id)
        .execute(&mut *tx)
        .await?;

        let mut opts = Vec::new();
        if let Some(hostname) = &reservation.hostname {
            opts.push((OPT_HOST_NAME, hostname.clone()));
        }
        if let Some(domain) = &reservation.domain {
            opts.push((OPT_DOMAIN_NAME, domain.clone()));
        }
        if !reservation.domain_search.is_empty() {
            opts.push((OPT_DOMAIN_SEARCH, reservation.domain_search.join(",")));
        }
        replace_options(tx, "host_reservation_id", reservation.id, &opts).await?;
    }

    debug!(
        vlans = param.vlans.len(),
        subnets = param.subnets.len(),
        ranges = param.ip_ranges.len(),
        reservations = param.host_reservations.len(),
        "configuration applied"
    );
    Ok(())
}

fn range_size(start: IpAddr, end: IpAddr) -> i64 {
    let to_n = |ip: IpAddr| -> u128 {
        match ip {
            IpAddr::V4(v4) => u128::from(u32::from(v4)),
            IpAddr::V6(v6) => u128::from(v6),
        }
    };
    let span = to_n(end).saturating_sub(to_n(start)).saturating_add(1);
    i64::try_from(span).unwrap_or(i64::MAX)
}
