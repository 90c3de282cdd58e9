#![allow(clippy::too_many_arguments)]

//! # lease-store
//!
//! `lease-store` owns everything that touches the SQL schema: the network
//! topology tables (VLANs, interfaces, subnets, ranges, reservations), the
//! lease and expiration tables, hierarchical option resolution, the
//! transactional lease [`Allocator`], and the expiration [`Sweeper`].
//!
//! All state mutation goes through a [`Db`] transaction. Entity structs
//! loaded inside a transaction are scoped to it and never cached across
//! requests; the only cached value is the agent hostname held by the
//! allocator.
//!
//! [`Allocator`]: crate::allocator::Allocator
//! [`Sweeper`]: crate::sweeper::Sweeper
use std::{
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool},
    ConnectOptions, Sqlite, Transaction,
};
use thiserror::Error;

pub mod allocator;
pub mod configure;
pub mod model;
pub mod options;
pub mod sweeper;

pub use allocator::{Allocator, Offer};
pub use sweeper::Sweeper;

/// Errors surfaced by store operations. These are semantic kinds, not
/// transport codes; callers decide per-operation whether a kind is benign
/// (e.g. `NoRows` on RELEASE) or fatal.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("interface index {0} is not mapped to any VLAN")]
    NoMatchingVlan(u32),
    #[error("no available IP in any dynamic range on VLAN {vlan_id}")]
    NoAvailableIp { vlan_id: i64 },
    #[error("range {range_id} is fully allocated")]
    RangeFull { range_id: i64 },
    #[error("required option {0} missing from resolved set")]
    MissingOption(i64),
    #[error("invalid value {value:?} for option {number}")]
    InvalidOptionValue { number: i64, value: String },
    #[error("expected row was not found")]
    NoRows,
    #[error("stored address {0:?} failed to parse")]
    InvalidIp(String),
    #[error("notification enqueue failed")]
    Notify(#[from] lease_notify::NotifyError),
    #[error("io error")]
    Io(#[from] std::io::Error),
    #[error("database error")]
    Db(sqlx::Error),
    #[error("migration error")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NoRows,
            err => StoreError::Db(err),
        }
    }
}

/// Client identity a lease is keyed on: MAC for DHCPv4, DUID for DHCPv6.
/// Both are canonicalized to lower case on construction so lookups and
/// stored rows always compare equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientId {
    Mac(String),
    Duid(String),
}

impl ClientId {
    pub fn mac(mac: impl AsRef<str>) -> Self {
        ClientId::Mac(mac.as_ref().trim().to_ascii_lowercase())
    }

    pub fn duid(duid: impl AsRef<str>) -> Self {
        ClientId::Duid(duid.as_ref().trim().to_ascii_lowercase())
    }

    /// lease/reservation column this identity matches on
    pub fn column(&self) -> &'static str {
        match self {
            ClientId::Mac(_) => "mac_address",
            ClientId::Duid(_) => "duid",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            ClientId::Mac(v) | ClientId::Duid(v) => v,
        }
    }

    /// address family this identity allocates from
    pub fn address_family(&self) -> i64 {
        match self {
            ClientId::Mac(_) => 4,
            ClientId::Duid(_) => 6,
        }
    }

    pub fn matches(&self, mac: Option<&str>, duid: Option<&str>) -> bool {
        match self {
            ClientId::Mac(v) => mac.map(|m| m.eq_ignore_ascii_case(v)).unwrap_or(false),
            ClientId::Duid(v) => duid.map(|d| d.eq_ignore_ascii_case(v)).unwrap_or(false),
        }
    }
}

/// Seconds since the epoch, the time base for `created_at`/`updated_at`
pub fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

/// Pool handle over the lease database. Cloning shares the pool.
#[derive(Debug, Clone)]
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    /// Open (creating if missing) and migrate the database at `uri`.
    /// Use `sqlite::memory:` for an in-memory store.
    pub async fn connect(uri: impl AsRef<str>) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::from_str(uri.as_ref())
            .map_err(sqlx::Error::from)?
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true)
            // keep statement logging out of `info` level logs
            .log_statements(tracing::log::LevelFilter::Trace);
        // an in-memory sqlite db lives and dies with its connection, so pin
        // the pool to one connection that never closes
        let pool = if uri.as_ref().contains("memory") {
            sqlx::sqlite::SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(opts)
                .await
                .map_err(StoreError::from)?
        } else {
            SqlitePool::connect_with(opts).await.map_err(StoreError::from)?
        };
        sqlx::migrate!("../../migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Begin a transaction. Every allocator and sweeper operation runs
    /// inside one of these.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, StoreError> {
        Ok(self.pool.begin().await.map_err(StoreError::from)?)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Hostname of this agent, used to scope the `iface` table to the local
/// host. Read once and cached by the allocator.
pub fn local_hostname() -> Result<String, StoreError> {
    let mut buf = [0u8; 256];
    // SAFETY: buf outlives the call and the size is passed alongside
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return Err(StoreError::Io(std::io::Error::last_os_error()));
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}
