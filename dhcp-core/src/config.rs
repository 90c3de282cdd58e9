//! service configuration: CLI flags, tracing setup, and the config file
//! handed to the configure activity

pub mod cli {
    //! Parse from either cli or env var

    /// default log level, any RUST_LOG-style directive is accepted
    pub const DEFAULT_LOG_LEVEL: &str = "info";
    /// default system identifier reported upstream
    pub const DEFAULT_SYSTEM_ID: &str = "rackdhcp";
    /// bound on concurrently processing handlers
    pub const DEFAULT_MAX_INFLIGHT: usize = 1024;
    /// default ingress channel size
    pub const DEFAULT_CHANNEL_SIZE: usize = 10_000;
    /// a handler must finish within this many seconds or its message is
    /// dropped
    pub const DEFAULT_HANDLER_TIMEOUT: u64 = 3;

    use std::path::PathBuf;

    pub use clap::Parser;

    /// parses from cli & environment
    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "rackdhcpd", bin_name = "rackdhcpd", about, long_about = None)]
    pub struct Config {
        /// path to the service config (YAML or JSON, by extension)
        #[clap(short = 'f', long = "config", env = "RACKDHCP_CONFIG", value_parser)]
        pub config_path: PathBuf,
        /// log destination; stdout when omitted
        #[clap(short = 'o', long = "log-output", env = "RACKDHCP_LOG_OUTPUT", value_parser)]
        pub log_output: Option<PathBuf>,
        /// log level (debug|info|warn|error)
        #[clap(short = 'l', long = "log-level", env = "RACKDHCP_LOG_LEVEL", default_value = DEFAULT_LOG_LEVEL)]
        pub log_level: String,
        /// colorize log output
        #[clap(short = 'c', long = "color", env = "RACKDHCP_LOG_COLOR")]
        pub color: bool,
        /// data directory; the lease database lives here
        #[clap(short = 'd', long = "data-dir", env = "RACKDHCP_DATA_DIR", value_parser)]
        pub data_dir: Option<PathBuf>,
        /// system identifier used in upstream URLs
        #[clap(short = 'i', long = "system-id", env = "RACKDHCP_SYSTEM_ID", default_value = DEFAULT_SYSTEM_ID)]
        pub system_id: String,
        /// directory the shutdown run report is written to
        #[clap(short = 'r', long = "report-dir", env = "RACKDHCP_REPORT_DIR", value_parser)]
        pub report_dir: Option<PathBuf>,
    }

    impl Config {
        /// data dir from the flag, falling back to the packaged default
        pub fn data_dir(&self) -> PathBuf {
            self.data_dir
                .clone()
                .unwrap_or_else(crate::env::default_data_dir)
        }
    }
}

pub mod trace {
    //! tracing configuration honoring `-o`, `-l` and `-c`
    use std::{fs::OpenOptions, sync::Arc};

    use anyhow::{Context, Result};
    use tracing_subscriber::{
        filter::EnvFilter, fmt, prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    use super::cli;

    /// Install the global subscriber. Files get no ANSI regardless of `-c`.
    pub fn init(config: &cli::Config) -> Result<()> {
        let filter = EnvFilter::try_new(&config.log_level)
            .or_else(|_| EnvFilter::try_new(cli::DEFAULT_LOG_LEVEL))?;
        match &config.log_output {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("opening log output {}", path.display()))?;
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
                    .init();
            }
            None => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().with_ansi(config.color))
                    .init();
            }
        }
        Ok(())
    }
}

pub mod file {
    //! the on-disk service config: serving interfaces, upstream endpoint,
    //! task tunables, and the network topology parameter

    use std::{path::Path, path::PathBuf, time::Duration};

    use anyhow::{bail, Context, Result};
    use lease_store::configure::ConfigParam;
    use serde::Deserialize;

    fn default_sweep_interval() -> u64 {
        10
    }

    fn default_expiration_retention() -> u64 {
        900
    }

    fn default_flush_interval() -> u64 {
        1
    }

    /// Top-level config file layout
    #[derive(Debug, Deserialize)]
    pub struct AgentConfig {
        /// interface names to serve on
        pub interfaces: Vec<String>,
        /// region controller base URL; lease notifications go to
        /// `{controller_url}/agents/{system_id}/leases`
        #[serde(default)]
        pub controller_url: Option<String>,
        /// path of the compiled XDP classifier; packaged default when
        /// omitted
        #[serde(default)]
        pub bpf_object: Option<PathBuf>,
        /// seconds between expiry sweeps
        #[serde(default = "default_sweep_interval")]
        pub sweep_interval_secs: u64,
        /// seconds expiration rows are retained
        #[serde(default = "default_expiration_retention")]
        pub expiration_retention_secs: u64,
        /// seconds between notification flushes
        #[serde(default = "default_flush_interval")]
        pub flush_interval_secs: u64,
        /// network topology pushed into the store at startup
        #[serde(default)]
        pub network: ConfigParam,
    }

    impl AgentConfig {
        pub fn sweep_interval(&self) -> Duration {
            Duration::from_secs(self.sweep_interval_secs)
        }

        pub fn expiration_retention(&self) -> Duration {
            Duration::from_secs(self.expiration_retention_secs)
        }

        pub fn flush_interval(&self) -> Duration {
            Duration::from_secs(self.flush_interval_secs)
        }
    }

    /// Load and parse by extension
    pub fn load(path: &Path) -> Result<AgentConfig> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&raw)?,
            Some("json") => serde_json::from_str(&raw)?,
            other => bail!("unsupported config extension {other:?} (want yaml or json)"),
        };
        Ok(cfg)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn parses_minimal_yaml() {
            let cfg: AgentConfig = serde_yaml::from_str(
                r#"
                interfaces: [eth0, eth1]
                controller_url: https://region.example:5240
                network:
                  vlans:
                    - id: 1
                      vid: 0
                "#,
            )
            .unwrap();
            assert_eq!(cfg.interfaces, vec!["eth0", "eth1"]);
            assert_eq!(cfg.sweep_interval_secs, 10);
            assert_eq!(cfg.network.vlans.len(), 1);
            assert_eq!(cfg.network.default_lease_time, 600);
        }
    }
}
