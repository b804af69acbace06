//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use swarmlink_core::directory::DirectoryConfig;
use tracing::warn;

use crate::network::NetworkConfig;
use crate::poller::{PollStrategy, PollerConfig};
use crate::send::{Quorum, SendConfig};

pub const DEFAULT_SEED_NODES: [&str; 3] = [
    "https://storage.seed1.loki.network:4433",
    "https://storage.seed3.loki.network:4433",
    "https://public.loki.foundation:4433",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollMode {
    Long,
    Short,
}

/// `all`, `majority` or a node count.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum QuorumSetting {
    Count(usize),
    Name(String),
}

impl QuorumSetting {
    pub fn quorum(&self) -> Quorum {
        match self {
            QuorumSetting::Count(n) => Quorum::AtLeast(*n),
            QuorumSetting::Name(name) => match name.as_str() {
                "all" => Quorum::All,
                "majority" => Quorum::Majority,
                other => {
                    warn!(value = other, "unknown replication_quorum, using all");
                    Quorum::All
                }
            },
        }
    }
}

/// Daemon configuration. File: ~/.config/swarmlink/config.toml or /etc/swarmlink/config.toml.
/// Env overrides: SWARMLINK_P2P_PORT, SWARMLINK_ONION_REQUESTS, SWARMLINK_POLL_MODE,
/// SWARMLINK_DATA_DIR, SWARMLINK_LOG.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Direct P2P listen port (default 8081).
    #[serde(default = "default_p2p_port")]
    pub p2p_port: u16,
    /// Address advertised to contacts for direct delivery, scheme included.
    #[serde(default = "default_advertised_address")]
    pub advertised_address: String,
    /// Route storage RPCs through onion paths (default true).
    #[serde(default = "default_onion_requests")]
    pub onion_requests: bool,
    #[serde(default = "default_poll_mode")]
    pub poll_mode: PollMode,
    /// Concurrent polling sessions (default 3).
    #[serde(default = "default_poll_sessions")]
    pub poll_sessions: usize,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_seed_nodes")]
    pub seed_nodes: Vec<String>,
    #[serde(default = "default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,
    #[serde(default = "default_check_timeout_secs")]
    pub check_timeout_secs: u64,
    #[serde(default = "default_long_poll_timeout_secs")]
    pub long_poll_timeout_secs: u64,
    #[serde(default = "default_replication_quorum")]
    pub replication_quorum: QuorumSetting,
    /// Contacts whose presence is tracked (public identities).
    #[serde(default)]
    pub contacts: Vec<String>,
    /// Log filter used when RUST_LOG is unset (default "info").
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_p2p_port() -> u16 {
    8081
}
fn default_advertised_address() -> String {
    "http://127.0.0.1".to_string()
}
fn default_onion_requests() -> bool {
    true
}
fn default_poll_mode() -> PollMode {
    PollMode::Long
}
fn default_poll_sessions() -> usize {
    3
}
fn default_data_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join(".local/share/swarmlink"),
        None => PathBuf::from("/var/lib/swarmlink"),
    }
}
fn default_seed_nodes() -> Vec<String> {
    DEFAULT_SEED_NODES.iter().map(|s| s.to_string()).collect()
}
fn default_rpc_timeout_secs() -> u64 {
    20
}
fn default_check_timeout_secs() -> u64 {
    3
}
fn default_long_poll_timeout_secs() -> u64 {
    40
}
fn default_replication_quorum() -> QuorumSetting {
    QuorumSetting::Name("all".to_string())
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            p2p_port: default_p2p_port(),
            advertised_address: default_advertised_address(),
            onion_requests: default_onion_requests(),
            poll_mode: default_poll_mode(),
            poll_sessions: default_poll_sessions(),
            data_dir: default_data_dir(),
            seed_nodes: default_seed_nodes(),
            rpc_timeout_secs: default_rpc_timeout_secs(),
            check_timeout_secs: default_check_timeout_secs(),
            long_poll_timeout_secs: default_long_poll_timeout_secs(),
            replication_quorum: default_replication_quorum(),
            contacts: Vec::new(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    pub fn network(&self) -> NetworkConfig {
        NetworkConfig {
            seed_nodes: self.seed_nodes.clone(),
            onion_requests: self.onion_requests,
            rpc_timeout: Duration::from_secs(self.rpc_timeout_secs),
            check_timeout: Duration::from_secs(self.check_timeout_secs),
            long_poll_timeout: Duration::from_secs(self.long_poll_timeout_secs),
            directory: DirectoryConfig::default(),
            ..NetworkConfig::default()
        }
    }

    pub fn poller(&self) -> PollerConfig {
        let strategy = match self.poll_mode {
            PollMode::Long => PollStrategy::Long,
            PollMode::Short => PollStrategy::short(),
        };
        PollerConfig {
            strategy,
            sessions: self.poll_sessions.max(1),
            ..PollerConfig::default()
        }
    }

    pub fn send(&self) -> SendConfig {
        SendConfig {
            quorum: self.replication_quorum.quorum(),
            ..SendConfig::default()
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let c = load_file().unwrap_or_default();
    apply_env(c, |k| std::env::var(k).ok())
}

fn apply_env(mut c: Config, var: impl Fn(&str) -> Option<String>) -> Config {
    if let Some(s) = var("SWARMLINK_P2P_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.p2p_port = p;
        }
    }
    if let Some(s) = var("SWARMLINK_ONION_REQUESTS") {
        match s.as_str() {
            "1" | "true" => c.onion_requests = true,
            "0" | "false" => c.onion_requests = false,
            _ => {}
        }
    }
    if let Some(s) = var("SWARMLINK_POLL_MODE") {
        match s.as_str() {
            "long" => c.poll_mode = PollMode::Long,
            "short" => c.poll_mode = PollMode::Short,
            _ => {}
        }
    }
    if let Some(s) = var("SWARMLINK_DATA_DIR") {
        c.data_dir = PathBuf::from(s);
    }
    if let Some(s) = var("SWARMLINK_LOG") {
        c.log_level = s;
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/swarmlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/swarmlink/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => warn!(path = %p.display(), error = %e, "invalid config file, using defaults"),
                },
                Err(e) => warn!(path = %p.display(), error = %e, "cannot read config file"),
            }
            break;
        }
    }
    None
}
