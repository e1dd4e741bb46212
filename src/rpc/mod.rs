use crate::config::Config;
use crate::configuration::ConfigStage;
use crate::error::RaftError;
use crate::protocol::{Event, ProtocolState};
use crate::storage::{LogEntry, LogIndex, Term};
use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: String,
    pub candidate_address: String,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestVoteResponse {
    pub vote_granted: bool,
    #[serde(default)]
    pub term: Term,
}

impl RequestVoteResponse {
    pub fn granted(term: Term) -> RequestVoteResponse {
        RequestVoteResponse {
            vote_granted: true,
            term,
        }
    }
    pub fn denied(term: Term) -> RequestVoteResponse {
        RequestVoteResponse {
            vote_granted: false,
            term,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: String,
    pub leader_address: String,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppendEntriesResponse {
    pub success: bool,
    #[serde(default)]
    pub term: Term,
}

impl AppendEntriesResponse {
    pub fn failed(term: Term) -> AppendEntriesResponse {
        AppendEntriesResponse {
            success: false,
            term,
        }
    }
    pub fn succeeded(term: Term) -> AppendEntriesResponse {
        AppendEntriesResponse {
            success: true,
            term,
        }
    }
}

/// A client command: `set`, `get`, `del`, `append` or `strlen`.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub command: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct ExecuteResponse {
    pub result: ExecuteResult,
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(untagged)]
pub enum ExecuteResult {
    Length(usize),
    Text(String),
}

impl ExecuteResponse {
    pub fn text<T: Into<String>>(text: T) -> ExecuteResponse {
        ExecuteResponse {
            result: ExecuteResult::Text(text.into()),
        }
    }
    pub fn length(length: usize) -> ExecuteResponse {
        ExecuteResponse {
            result: ExecuteResult::Length(length),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MembershipRequest {
    pub address: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct VisibilityRequest {
    pub visibility: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Ack {
    pub success: bool,
}

/// Body of every error response. `leader` and `address` point at the current leader when a
/// request reached a follower.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default)]
    pub leader: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

impl From<&RaftError> for ErrorBody {
    fn from(e: &RaftError) -> Self {
        let (leader, address) = match e {
            RaftError::NotLeader {
                leader_id,
                leader_address,
            } => (leader_id.clone(), leader_address.clone()),
            _ => (None, None),
        };
        ErrorBody {
            error: e.to_string(),
            leader,
            address,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub id: String,
    pub role: ProtocolState,
    pub term: Term,
    pub leader: Option<String>,
    pub leader_address: Option<String>,
    pub self_address: String,
    pub peers: Vec<String>,
    pub logs: Vec<LogEntry>,
    pub store: BTreeMap<String, String>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub config_stage: ConfigStage,
    pub failed_heartbeats: BTreeMap<String, u32>,
}

/// Builds the transport for one node.
///
/// The transport serves `server` until `shutdown` is closed, and returns the outbound
/// [`RPC`] the node uses to reach its peers together with the task serving requests.
pub trait RPCBuilder {
    fn build(
        &self,
        config: &Config,
        server: RaftServer,
        shutdown: Receiver<()>,
    ) -> std::io::Result<(Arc<dyn RPC>, JoinHandle<()>)>;
}

#[async_trait]
pub trait RPC: Send + Sync {
    async fn append_entries(
        &self,
        peer_address: String,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, Box<dyn StdError + Send + Sync>>;

    async fn request_vote(
        &self,
        peer_address: String,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, Box<dyn StdError + Send + Sync>>;

    /// Asks a member that was removed from the cluster to terminate.
    async fn shutdown(&self, peer_address: String) -> Result<(), Box<dyn StdError + Send + Sync>>;
}

/// Handle through which a transport calls into a running node.
#[derive(Clone)]
pub struct RaftServer {
    events: Sender<Event>,
}

impl RaftServer {
    pub(crate) fn new(events: Sender<Event>) -> RaftServer {
        RaftServer { events }
    }

    async fn call<T, F>(&self, event: F) -> Result<T, RaftError>
    where
        F: FnOnce(Sender<T>) -> Event,
    {
        let (tx, rx) = async_channel::bounded(1);
        self.events
            .send(event(tx))
            .await
            .map_err(|_| RaftError::ProtocolTerminated)?;
        rx.recv().await.map_err(|_| RaftError::ProtocolTerminated)
    }

    async fn notify(&self, event: Event) -> Result<(), RaftError> {
        self.events
            .send(event)
            .await
            .map_err(|_| RaftError::ProtocolTerminated)
    }

    pub async fn request_vote(
        &self,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, RaftError> {
        self.call(|tx| Event::RequestVote(request, tx)).await
    }

    pub async fn append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, RaftError> {
        self.call(|tx| Event::AppendEntries(request, tx)).await
    }

    pub async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResponse, RaftError> {
        self.call(|tx| Event::Execute(request, tx)).await?
    }

    pub async fn join_cluster(&self, address: String) -> Result<(), RaftError> {
        self.call(|tx| Event::JoinCluster(address, tx)).await?
    }

    pub async fn remove_member(&self, address: String) -> Result<(), RaftError> {
        self.call(|tx| Event::RemoveMember(address, tx)).await?
    }

    pub async fn status(&self) -> Result<NodeStatus, RaftError> {
        self.call(Event::Status).await
    }

    pub async fn ping(&self) -> Result<String, RaftError> {
        self.call(Event::Ping).await??;
        Ok("PONG".to_string())
    }

    pub async fn set_heartbeat_visibility(&self, visibility: bool) -> Result<(), RaftError> {
        self.notify(Event::HeartbeatVisibility(visibility)).await
    }

    pub async fn shutdown(&self) -> Result<(), RaftError> {
        self.notify(Event::Shutdown).await
    }

    pub fn is_terminated(&self) -> bool {
        self.events.is_closed()
    }
}

#[cfg(feature = "http-rpc")]
mod http;

#[cfg(feature = "http-rpc")]
pub(crate) use http::{send_get, send_request};
#[cfg(feature = "http-rpc")]
pub use http::{HttpConfig, HttpRPC};
