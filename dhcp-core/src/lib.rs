//! # dhcp-core
//!
//! The wire-facing half of the rack DHCP service: packet ingress (XDP fast
//! path and raw-socket slow path), the DORA protocol handlers, the reply
//! send paths, and the server supervisor that ties them together.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]
pub use anyhow;
pub use async_trait::async_trait;
pub use dhcproto;
pub use pnet;
pub use tokio;
pub use tracing;

pub use crate::server::Server;

pub mod config;
pub mod dora;
pub mod env;
pub mod handler;
pub mod metrics;
pub mod server;

use thiserror::Error;

/// Error kinds for the pipeline and handlers. Most are recoverable at the
/// message level (DHCP is best-effort: log and drop); `InvalidBuffer` and
/// `NoSocketFound` indicate a broken reader invariant and are fatal for
/// the reader task.
#[derive(Error, Debug)]
pub enum Error {
    #[error("not a DHCPv4 message")]
    NotDhcpV4,
    #[error("not a DHCPv6 message")]
    NotDhcpV6,
    #[error("message type {0} is outside the handled set")]
    InvalidMessageType(u8),
    #[error("no requested IP address in message")]
    NoIpRequested,
    #[error("no IPv4 address on receiving interface {0}")]
    NoSuitableServerIp(u32),
    #[error("no socket bound for interface {0}")]
    NoSocketFound(u32),
    #[error("short or malformed ingress buffer")]
    InvalidBuffer,
    #[error("invalid value {value:?} for option {number}")]
    InvalidOptionValue { number: i64, value: String },
    #[error(transparent)]
    Store(#[from] lease_store::StoreError),
    #[error(transparent)]
    Notify(#[from] lease_notify::NotifyError),
    #[error("io error")]
    Io(#[from] std::io::Error),
    #[error("encode error")]
    Encode(#[from] dhcproto::error::EncodeError),
    #[error("decode error")]
    Decode(#[from] dhcproto::error::DecodeError),
    #[error("bpf load error")]
    Bpf(#[from] aya::EbpfError),
    #[error("bpf program error")]
    BpfProgram(#[from] aya::programs::ProgramError),
    #[error("bpf map error")]
    BpfMap(#[from] aya::maps::MapError),
}
