#![allow(dead_code)]

use async_channel::Receiver;
use raftnode::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, NodeStatus, RPCBuilder, RaftServer,
    RequestVoteRequest, RequestVoteResponse, RPC,
};
use raftnode::storage::MemoryStorage;
use raftnode::{Config, ProtocolState, Running};
use std::collections::HashMap;
use std::error::Error;
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

pub fn setup() {
    let _ = env_logger::builder()
        .filter_module("raftnode", log::LevelFilter::Info)
        .is_test(true)
        .try_init();
}

/// An in-process transport: every node registers its server under its address, and
/// requests are handed straight to the target's server.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    servers: Arc<Mutex<HashMap<String, RaftServer>>>,
}

impl LocalNetwork {
    pub fn new() -> LocalNetwork {
        LocalNetwork::default()
    }

    pub fn disconnect(&self, address: &str) {
        self.servers.lock().unwrap().remove(address);
    }

    fn server(&self, address: &str) -> Result<RaftServer, String> {
        self.servers
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .ok_or_else(|| format!("{} is unreachable", address))
    }
}

impl RPCBuilder for LocalNetwork {
    fn build(
        &self,
        config: &Config,
        server: RaftServer,
        shutdown: Receiver<()>,
    ) -> io::Result<(Arc<dyn RPC>, JoinHandle<()>)> {
        self.servers
            .lock()
            .unwrap()
            .insert(config.address.clone(), server);
        let network = self.clone();
        let address = config.address.clone();
        let handle = tokio::spawn(async move {
            let _ = shutdown.recv().await;
            network.disconnect(&address);
        });
        Ok((Arc::new(self.clone()), handle))
    }
}

#[async_trait::async_trait]
impl RPC for LocalNetwork {
    async fn append_entries(
        &self,
        peer_address: String,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, Box<dyn Error + Send + Sync>> {
        let server = self.server(&peer_address)?;
        Ok(server.append_entries(request).await?)
    }

    async fn request_vote(
        &self,
        peer_address: String,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, Box<dyn Error + Send + Sync>> {
        let server = self.server(&peer_address)?;
        Ok(server.request_vote(request).await?)
    }

    async fn shutdown(&self, peer_address: String) -> Result<(), Box<dyn Error + Send + Sync>> {
        let server = self.server(&peer_address)?;
        Ok(server.shutdown().await?)
    }
}

pub fn test_config(address: &str, peers: &[&str]) -> Config {
    let mut config = Config::new(address, address);
    config.peers = peers.iter().map(|p| p.to_string()).collect();
    config.timing.election_timeout_min_ms = 100;
    config.timing.election_timeout_max_ms = 200;
    config.timing.heartbeat_interval_ms = 20;
    config.timing.shutdown_delay_ms = 10;
    config
}

/// Starts one node per address, each configured with all the others as peers.
pub fn start_cluster(network: &LocalNetwork, addresses: &[&str]) -> Vec<Running> {
    addresses
        .iter()
        .map(|address| {
            let peers: Vec<&str> = addresses
                .iter()
                .copied()
                .filter(|peer| peer != address)
                .collect();
            raftnode::start(test_config(address, &peers), MemoryStorage::new(), network)
                .unwrap()
        })
        .collect()
}

/// Polls `check` until it yields a value, giving up after five seconds.
pub async fn eventually<T, F, Fut>(mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for _ in 0..500 {
        if let Some(value) = check().await {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Timeout reached waiting for the cluster");
}

/// Status of every node still running, with its index into `servers`.
pub async fn statuses(servers: &[RaftServer]) -> Vec<(usize, NodeStatus)> {
    let mut statuses = Vec::new();
    for (index, server) in servers.iter().enumerate() {
        if let Ok(status) = server.status().await {
            statuses.push((index, status));
        }
    }
    statuses
}

/// Index into `servers` of the leader, once every running node follows it in its term.
pub async fn agreed_leader(servers: &[RaftServer]) -> usize {
    eventually(move || async move {
        let statuses = statuses(servers).await;
        let (index, leader) = statuses
            .iter()
            .find(|(_, s)| s.role == ProtocolState::Leader)?;
        let agreed = statuses.iter().all(|(_, s)| {
            s.term == leader.term && s.leader_address.as_ref() == Some(&leader.self_address)
        });
        if agreed {
            Some(*index)
        } else {
            None
        }
    })
    .await
}
