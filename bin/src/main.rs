#![allow(clippy::cognitive_complexity)]
use std::{process::ExitCode, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};

use dhcp_core::{
    config::{cli, cli::Parser, file, trace},
    dora::{DhcpService, DoraV4, DoraV6},
    server::{Server, ServerConfig},
    tokio::{self, runtime::Builder, signal, task::JoinHandle},
    tracing::*,
};
use lease_notify::{Notifier, NotifyConfig};
use lease_store::{configure::configure, now_epoch, Allocator, Db, Sweeper};
use tokio_util::sync::CancellationToken;

/// each configuration activity gets this long
const CONFIGURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors before the server loop starts exit 2; anything after exits 1
enum RunError {
    Startup(anyhow::Error),
    Fatal(anyhow::Error),
}

trait StartupContext<T> {
    fn startup(self) -> Result<T, RunError>;
}

impl<T, E: Into<anyhow::Error>> StartupContext<T> for Result<T, E> {
    fn startup(self) -> Result<T, RunError> {
        self.map_err(|err| RunError::Startup(err.into()))
    }
}

fn main() -> ExitCode {
    // parses from cli or environment var
    let config = cli::Config::parse();
    if let Err(err) = trace::init(&config) {
        eprintln!("failed to initialize logging: {err:#}");
        return ExitCode::from(2);
    }
    debug!(?config);

    let agent_cfg = match file::load(&config.config_path) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(?err, "invalid configuration");
            return ExitCode::from(2);
        }
    };

    let rt = match Builder::new_multi_thread()
        .thread_name("rackdhcp-worker")
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            error!(?err, "failed to build runtime");
            return ExitCode::from(1);
        }
    };

    match rt.block_on(run(config, agent_cfg)) {
        Ok(()) => {
            info!("clean shutdown");
            ExitCode::SUCCESS
        }
        Err(RunError::Startup(err)) => {
            error!(?err, "startup failed");
            ExitCode::from(2)
        }
        Err(RunError::Fatal(err)) => {
            error!(?err, "exited with error");
            ExitCode::from(1)
        }
    }
}

async fn run(config: cli::Config, agent_cfg: file::AgentConfig) -> Result<(), RunError> {
    let started_at = now_epoch();
    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))
        .startup()?;
    let db_path = data_dir.join("leases.db");
    info!(path = %db_path.display(), "opening lease database");
    let db = Db::connect(format!("sqlite://{}", db_path.display()))
        .await
        .startup()?;

    let mut server_cfg = ServerConfig::new(agent_cfg.interfaces.clone());
    if let Some(path) = &agent_cfg.bpf_object {
        server_cfg.bpf_object = Some(path.clone());
    }
    let server = Server::bind(server_cfg).startup()?;

    // push the configuration into the store before serving
    let hostname = lease_store::local_hostname().startup()?;
    let ifindexes = server.ifindex_map();
    {
        let mut tx = db.begin().await.startup()?;
        tokio::time::timeout(
            CONFIGURE_TIMEOUT,
            configure(&mut tx, &agent_cfg.network, &ifindexes, &hostname),
        )
        .await
        .map_err(|_| anyhow!("configure activity timed out"))
        .startup()?
        .startup()?;
        tx.commit().await.startup()?;
    }
    info!("configuration applied");

    let token = CancellationToken::new();

    // lease notifications only flow when a controller is configured
    let (notifier, flusher_task) =
        start_reporter(&config, &agent_cfg, token.clone()).startup()?;

    let allocator = Allocator::with_hostname(hostname.clone());
    let sweeper = Sweeper::new(db.clone(), notifier.clone())
        .with_interval(agent_cfg.sweep_interval())
        .with_retention(agent_cfg.expiration_retention());
    let sweeper_task = tokio::spawn(sweeper.run(token.clone()));

    let transport = server.transport();
    let server_duid = server_duid(&transport);
    let service = Arc::new(DhcpService::new(
        DoraV4::new(db.clone(), allocator.clone(), notifier.clone()),
        DoraV6::new(db, allocator, notifier, server_duid),
        transport,
    ));

    let mut serve_task = tokio::spawn(server.serve(service, token.clone()));
    let result = tokio::select! {
        res = shutdown_signal() => {
            info!("caught shutdown signal");
            token.cancel();
            let _ = (&mut serve_task).await;
            res.map_err(RunError::Fatal)
        }
        res = &mut serve_task => {
            token.cancel();
            match res {
                Ok(Ok(())) => Err(RunError::Fatal(anyhow!("server stopped unexpectedly"))),
                Ok(Err(err)) => Err(RunError::Fatal(err)),
                Err(err) => Err(RunError::Fatal(anyhow!(err))),
            }
        }
    };

    join_background("sweeper", sweeper_task).await;
    if let Some(task) = flusher_task {
        join_background("reporter", task).await;
    }
    if let Err(err) = write_report(&config, started_at) {
        warn!(?err, "failed to write run report");
    }
    result
}

/// Build the notifier and, when a controller is configured, its flusher
fn start_reporter(
    config: &cli::Config,
    agent_cfg: &file::AgentConfig,
    token: CancellationToken,
) -> Result<(Notifier, Option<JoinHandle<()>>)> {
    match &agent_cfg.controller_url {
        Some(url) => {
            let endpoint = format!(
                "{}/agents/{}/leases",
                url.trim_end_matches('/'),
                config.system_id
            );
            info!(%endpoint, "lease notifications enabled");
            let mut notify_cfg = NotifyConfig::new(endpoint);
            notify_cfg.flush_interval = agent_cfg.flush_interval();
            let (notifier, flusher) = lease_notify::channel(notify_cfg)?;
            Ok((notifier, Some(tokio::spawn(flusher.run(token)))))
        }
        None => {
            warn!("no controller_url configured, lease notifications are dropped");
            let (notifier, mut rx) = lease_notify::queue(lease_notify::DEFAULT_QUEUE_SIZE);
            let drain = tokio::spawn(async move {
                while let Some(note) = rx.recv().await {
                    debug!(?note, "dropping notification (no controller)");
                }
            });
            Ok((notifier, Some(drain)))
        }
    }
}

/// DUID-LL derived from the first serving interface's MAC
fn server_duid(transport: &dhcp_core::server::Transport) -> Vec<u8> {
    let mut duid = vec![0x00, 0x03, 0x00, 0x01];
    let mac = transport
        .interfaces()
        .iter()
        .find_map(|iface| iface.mac)
        .unwrap_or(dhcp_core::pnet::util::MacAddr::zero());
    duid.extend_from_slice(&mac.octets());
    duid
}

async fn join_background(name: &str, task: JoinHandle<()>) {
    if let Err(err) = tokio::time::timeout(Duration::from_secs(3), task).await {
        warn!(?err, name, "background task did not stop in time");
    }
}

/// Small JSON summary for the test harness, written when `-r` is set
fn write_report(config: &cli::Config, started_at: i64) -> Result<()> {
    let Some(dir) = &config.report_dir else {
        return Ok(());
    };
    std::fs::create_dir_all(dir)?;
    let report = serde_json::json!({
        "system_id": config.system_id,
        "started_at": started_at,
        "stopped_at": now_epoch(),
        "v4_received": counter_sum("recv_type_counts"),
        "v4_sent": counter_sum("sent_type_counts"),
        "v6_received": counter_sum("v6_recv_type_counts"),
        "v6_sent": counter_sum("v6_sent_type_counts"),
    });
    let path = dir.join("rackdhcpd-report.json");
    std::fs::write(&path, serde_json::to_vec_pretty(&report)?)?;
    info!(path = %path.display(), "wrote run report");
    Ok(())
}

/// Sum one counter family from the default registry
fn counter_sum(name: &str) -> u64 {
    prometheus_sum(name).unwrap_or(0)
}

fn prometheus_sum(name: &str) -> Option<u64> {
    dhcp_core::metrics::RECV_TYPE_COUNT.discover.get(); // ensure registration
    let families = prometheus::gather();
    let family = families.iter().find(|f| f.get_name() == name)?;
    Some(
        family
            .get_metric()
            .iter()
            .map(|m| m.get_counter().get_value() as u64)
            .sum(),
    )
}

async fn shutdown_signal() -> Result<()> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::select! {
        res = signal::ctrl_c() => res.map_err(|err| anyhow!(err)),
        _ = sigterm.recv() => Ok(()),
    }
}
