#[cfg(feature = "http-rpc")]
use crate::rpc::HttpConfig;
#[cfg(feature = "http-rpc")]
use crate::storage::MemoryStorage;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::time::Duration;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Left empty in files that only carry settings; the command line fills it in.
    #[serde(default)]
    pub id: String,
    /// `host:port` this node is reachable at; peers identify it by this address.
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub consistency: Consistency,
    #[serde(default)]
    pub rpc: RPCConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct TimingConfig {
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub backoff_multiplier: f64,
    pub heartbeat_interval_ms: u64,
    pub max_failed_heartbeats: u32,
    pub shutdown_delay_ms: u64,
    /// How long an outbound RPC may take before it counts as failed.
    pub rpc_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            election_timeout_min_ms: 400,
            election_timeout_max_ms: 800,
            backoff_multiplier: 1.0,
            heartbeat_interval_ms: 100,
            max_failed_heartbeats: 10,
            shutdown_delay_ms: 100,
            rpc_timeout_ms: 200,
        }
    }
}

/// When a mutating client command is answered.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Consistency {
    /// After the command has been committed and applied on the leader.
    #[default]
    Committed,
    /// As soon as the command is in the leader's log.
    Immediate,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RPCConfig {
    #[cfg(feature = "http-rpc")]
    pub http: Option<HttpConfig>,
}

impl Config {
    pub fn new(id: &str, address: &str) -> Config {
        Config {
            id: id.to_string(),
            address: address.to_string(),
            peers: Vec::new(),
            timing: TimingConfig::default(),
            consistency: Consistency::default(),
            rpc: RPCConfig::default(),
        }
    }

    pub fn from_toml(contents: &str) -> io::Result<Config> {
        toml::from_str(contents).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> io::Result<Config> {
        let contents = std::fs::read_to_string(path)?;
        Config::from_toml(&contents)
    }

    /// Peers as configured, minus this node's own address and duplicates.
    pub fn peer_addresses(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .peers
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty() && *p != self.address)
            .collect();
        peers.sort();
        peers.dedup();
        peers
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.timing.heartbeat_interval_ms)
    }

    pub fn shutdown_delay(&self) -> Duration {
        Duration::from_millis(self.timing.shutdown_delay_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.timing.rpc_timeout_ms)
    }

    /// Draws a fresh election timeout, uniformly within the configured range and scaled
    /// by `backoff`.
    pub fn election_timeout(&self, backoff: f64) -> Duration {
        let min = self.timing.election_timeout_min_ms;
        let max = self.timing.election_timeout_max_ms.max(min);
        let millis = rand::thread_rng().gen_range(min..=max);
        Duration::from_millis(millis).mul_f64(backoff.max(0.0))
    }

    /// Runs this node with in-memory storage on the configured transport until it shuts down.
    pub async fn spawn_server(&self) -> io::Result<()> {
        let running = self.rpc.start(self.clone())?;
        running.wait().await
    }
}

impl RPCConfig {
    #[cfg(feature = "http-rpc")]
    fn start(&self, config: Config) -> io::Result<crate::protocol::Running> {
        let http = self.http.clone().unwrap_or_default();
        crate::protocol::start(config, MemoryStorage::new(), &http)
    }

    #[cfg(not(feature = "http-rpc"))]
    fn start(&self, _config: Config) -> io::Result<crate::protocol::Running> {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "No valid RPC configuration",
        ))
    }
}
