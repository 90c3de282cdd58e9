//! # Server
//!
//! The supervisor: binds per-interface sockets, attaches the XDP fast
//! path when possible, and drives every received [`Message`] through the
//! registered handler under a bounded in-flight budget.
use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use pnet::datalink::NetworkInterface;
use tokio::{
    net::UdpSocket,
    sync::{mpsc, Semaphore},
    task::JoinHandle,
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod l2;
pub mod msg;
pub(crate) mod udp;
pub mod xdp;

use crate::{
    config::cli::{DEFAULT_CHANNEL_SIZE, DEFAULT_HANDLER_TIMEOUT, DEFAULT_MAX_INFLIGHT},
    env,
    handler::MessageHandler,
    metrics,
    server::{l2::L2Socket, msg::Message},
    Error,
};

/// Address family a socket serves
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SocketFamily {
    V4,
    V6,
}

/// Supervisor tunables
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// interface names to serve on
    pub interfaces: Vec<String>,
    /// compiled XDP classifier; `None` means slow path only
    pub bpf_object: Option<PathBuf>,
    /// concurrent handler bound
    pub max_inflight: usize,
    /// ingress channel depth
    pub channel_size: usize,
    /// per-message handler deadline
    pub handler_timeout: Duration,
}

impl ServerConfig {
    pub fn new(interfaces: Vec<String>) -> Self {
        Self {
            interfaces,
            bpf_object: Some(env::default_bpf_object()),
            max_inflight: DEFAULT_MAX_INFLIGHT,
            channel_size: DEFAULT_CHANNEL_SIZE,
            handler_timeout: Duration::from_secs(DEFAULT_HANDLER_TIMEOUT),
        }
    }
}

/// Reply-side plumbing handed to handlers: the ingress sockets (L3
/// replies go out the socket the request family came in on) and the raw
/// L2 socket for clients that have no IP yet.
#[derive(Debug)]
pub struct Transport {
    sockets: HashMap<(SocketFamily, u32), Arc<UdpSocket>>,
    l2: L2Socket,
    interfaces: Vec<NetworkInterface>,
}

impl Transport {
    /// Socket bound to `(family, iface_idx)`
    pub fn socket_for(&self, family: SocketFamily, iface_idx: u32) -> Result<&Arc<UdpSocket>, Error> {
        self.sockets
            .get(&(family, iface_idx))
            .ok_or(Error::NoSocketFound(iface_idx))
    }

    pub fn interface(&self, iface_idx: u32) -> Option<&NetworkInterface> {
        self.interfaces.iter().find(|i| i.index == iface_idx)
    }

    /// Every interface this transport serves
    pub fn interfaces(&self) -> &[NetworkInterface] {
        &self.interfaces
    }

    /// Our IPv4 address on the receiving interface, used as `siaddr`
    pub fn server_ipv4(&self, iface_idx: u32) -> Result<Ipv4Addr, Error> {
        self.interface(iface_idx)
            .and_then(|iface| {
                iface.ips.iter().find_map(|net| match net.ip() {
                    IpAddr::V4(ip) => Some(ip),
                    IpAddr::V6(_) => None,
                })
            })
            .ok_or(Error::NoSuitableServerIp(iface_idx))
    }

    /// MAC of the receiving interface, used as the L2 source
    pub fn server_mac(&self, iface_idx: u32) -> Result<pnet::util::MacAddr, Error> {
        self.interface(iface_idx)
            .and_then(|iface| iface.mac)
            .ok_or(Error::NoSuitableServerIp(iface_idx))
    }

    /// L3 reply through the ingress socket for the interface
    pub async fn send_l3(
        &self,
        family: SocketFamily,
        iface_idx: u32,
        dst: SocketAddr,
        payload: &[u8],
    ) -> Result<(), Error> {
        let soc = self.socket_for(family, iface_idx)?;
        soc.send_to(payload, dst).await?;
        Ok(())
    }

    /// L2 reply: synthesize the frame and push it out raw
    pub fn send_l2(
        &self,
        iface_idx: u32,
        dst_mac: pnet::util::MacAddr,
        dst_ip: Ipv4Addr,
        payload: &[u8],
    ) -> Result<(), Error> {
        let src_mac = self.server_mac(iface_idx)?;
        let src_ip = self.server_ipv4(iface_idx)?;
        let frame = l2::build_frame(
            src_mac,
            dst_mac,
            src_ip,
            dst_ip,
            udp::V4_SERVER_PORT,
            udp::V4_CLIENT_PORT,
            payload,
        )?;
        self.l2.send(iface_idx, dst_mac, &frame)?;
        Ok(())
    }
}

/// The bound server, ready to serve
#[derive(Debug)]
pub struct Server {
    cfg: ServerConfig,
    transport: Arc<Transport>,
    interfaces: Vec<NetworkInterface>,
}

impl Server {
    /// Resolve the configured interface names and bind one socket per
    /// present address family on each.
    pub fn bind(cfg: ServerConfig) -> Result<Self> {
        let all = pnet::datalink::interfaces();
        let mut interfaces = Vec::new();
        for name in &cfg.interfaces {
            let iface = all
                .iter()
                .find(|iface| &iface.name == name)
                .cloned()
                .with_context(|| format!("interface {name} not found"))?;
            interfaces.push(iface);
        }

        let mut sockets = HashMap::new();
        for iface in &interfaces {
            if iface.ips.iter().any(|net| net.is_ipv4()) {
                let soc = udp::bind_v4(iface)
                    .with_context(|| format!("binding v4 socket on {}", iface.name))?;
                sockets.insert((SocketFamily::V4, iface.index), Arc::new(soc));
            }
            if iface.ips.iter().any(|net| net.is_ipv6()) {
                let soc = udp::bind_v6(iface)
                    .with_context(|| format!("binding v6 socket on {}", iface.name))?;
                sockets.insert((SocketFamily::V6, iface.index), Arc::new(soc));
            }
        }
        if sockets.is_empty() {
            anyhow::bail!("no addressed interfaces to serve on");
        }

        let transport = Arc::new(Transport {
            sockets,
            l2: L2Socket::new().context("opening AF_PACKET send socket")?,
            interfaces: interfaces.clone(),
        });
        Ok(Self {
            cfg,
            transport,
            interfaces,
        })
    }

    /// Reply-side plumbing for handler construction
    pub fn transport(&self) -> Arc<Transport> {
        Arc::clone(&self.transport)
    }

    /// `name -> kernel index` for the interfaces we serve, used by the
    /// configure activity
    pub fn ifindex_map(&self) -> HashMap<String, u32> {
        self.interfaces
            .iter()
            .map(|iface| (iface.name.clone(), iface.index))
            .collect()
    }

    /// Serve until the token cancels. Selects the fast path when a BPF
    /// object is configured, loads, and attaches somewhere; otherwise
    /// falls back to per-socket readers. Either way every message lands
    /// on the same channel and is dispatched to `handler` on its own task
    /// holding one in-flight permit.
    pub async fn serve(
        self,
        handler: Arc<dyn MessageHandler>,
        token: CancellationToken,
    ) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<Message>(self.cfg.channel_size);

        let mut xdp_reader = None;
        if env::xdp_disabled() {
            info!("xdp disabled by environment, using slow path");
        } else if let Some(path) = &self.cfg.bpf_object {
            match xdp::XdpIngress::load(path, &self.interfaces) {
                Ok(ingress) => {
                    info!(attached = ?ingress.attached(), "fast path active");
                    xdp_reader = Some(ingress.spawn_reader(tx.clone(), token.clone())?);
                }
                Err(err) => {
                    warn!(?err, path = %path.display(), "fast path unavailable, using slow path");
                }
            }
        }

        let mut readers: Vec<JoinHandle<Result<(), Error>>> = Vec::new();
        if xdp_reader.is_none() {
            for ((family, iface_idx), soc) in &self.transport.sockets {
                readers.push(udp::spawn_reader(
                    Arc::clone(soc),
                    *family,
                    *iface_idx,
                    tx.clone(),
                    token.clone(),
                ));
            }
        }
        drop(tx);

        let semaphore = Arc::new(Semaphore::new(self.cfg.max_inflight));
        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                maybe = rx.recv() => {
                    let Some(message) = maybe else { break };
                    // suspends until a handler slot frees up
                    let permit = tokio::select! {
                        _ = token.cancelled() => break,
                        permit = Arc::clone(&semaphore).acquire_owned() => {
                            permit.expect("semaphore never closed")
                        }
                    };
                    metrics::IN_FLIGHT.inc();
                    let handler = Arc::clone(&handler);
                    let done = done_tx.clone();
                    let timeout = self.cfg.handler_timeout;
                    tokio::spawn(async move {
                        let _permit = permit;
                        let _done = done;
                        match time::timeout(timeout, handler.handle(message)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(err)) => {
                                // best-effort protocol: log and drop
                                debug!(?err, "handler dropped message");
                            }
                            Err(_) => warn!("handler timed out"),
                        }
                        metrics::IN_FLIGHT.dec();
                    });
                }
            }
        }

        info!("notifying tasks of shutdown...");
        // in-flight handlers finish naturally; when the last clone drops
        // the recv below completes
        drop(done_tx);
        if time::timeout(Duration::from_secs(3), done_rx.recv())
            .await
            .is_err()
        {
            error!("handlers did not finish within 3 seconds, exiting anyway");
        } else {
            debug!("all handlers finished cleanly");
        }

        for reader in readers {
            match reader.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(?err, "ingress reader failed"),
                Err(err) => warn!(?err, "ingress reader panicked"),
            }
        }
        if let Some(handle) = xdp_reader {
            // the reader owns the BPF object; joining it tears down the
            // links, then the sockets drop with self
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
        info!("server stopped");
        Ok(())
    }
}
