//! The consensus core.
//!
//! A [`RaftNode`] owns all Raft state and is driven by a single task: incoming RPCs,
//! admin requests, timer expiries and the results of outbound RPCs are all folded into
//! the node one [`Event`] at a time, so no handler ever observes another one half-way.
//! Outbound RPCs run on their own tasks and report back through the same event channel.

use crate::command::Command;
use crate::config::Config;
use crate::configuration::Membership;
use crate::error::RaftError;
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, ExecuteRequest, ExecuteResponse, NodeStatus,
    RPCBuilder, RaftServer, RequestVoteRequest, RequestVoteResponse, RPC,
};
use crate::state::KeyValueStore;
use crate::storage::{LogEntry, LogIndex, Storage, Term};
use async_channel::{Receiver, Sender};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::sync::Arc;
use tokio::select;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

mod election;
mod execute;
mod membership;
mod replication;


#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProtocolState {
    Follower,
    Candidate,
    Leader,
    Shutdown,
}

pub(crate) enum Event {
    RequestVote(RequestVoteRequest, Sender<RequestVoteResponse>),
    AppendEntries(AppendEntriesRequest, Sender<AppendEntriesResponse>),
    Execute(ExecuteRequest, Sender<Result<ExecuteResponse, RaftError>>),
    JoinCluster(String, Sender<Result<(), RaftError>>),
    RemoveMember(String, Sender<Result<(), RaftError>>),
    Status(Sender<NodeStatus>),
    HeartbeatVisibility(bool),
    Ping(Sender<Result<(), RaftError>>),
    Shutdown,
    ElectionComplete(ElectionResult),
    AppendEntriesComplete(AppendResult),
}

/// Outcome of one round of RequestVote calls, tallied off the core task.
pub(crate) struct ElectionResult {
    term: Term,
    peer_count: usize,
    /// Includes the candidate's own vote.
    granted: usize,
    highest_term: Term,
}

pub(crate) struct AppendResult {
    peer: String,
    term: Term,
    next_index: LogIndex,
    sent: LogIndex,
    result: Result<AppendEntriesResponse, String>,
}

/// A client command waiting for its entry to be applied.
struct Waiter {
    index: LogIndex,
    term: Term,
    response: ExecuteResponse,
    reply: Sender<Result<ExecuteResponse, RaftError>>,
}

/// A node started by [`start`]: the handle used to talk to it, plus its tasks.
pub struct Running {
    server: RaftServer,
    node: JoinHandle<()>,
    transport: JoinHandle<()>,
}

impl Running {
    pub fn server(&self) -> RaftServer {
        self.server.clone()
    }

    /// Resolves once the node has shut down and its transport has stopped serving.
    pub async fn wait(self) -> io::Result<()> {
        self.node
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.transport
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

/// Spawns a node for `config` on the current tokio runtime, wired to the transport built by
/// `rpc_config`.
pub fn start<S, B>(config: Config, storage: S, rpc_config: &B) -> io::Result<Running>
where
    S: Storage,
    B: RPCBuilder,
{
    let (events_tx, events_rx) = async_channel::unbounded();
    let (shutdown_tx, shutdown_rx) = async_channel::bounded::<()>(1);
    let server = RaftServer::new(events_tx.clone());

    let (rpc, transport) = rpc_config.build(&config, server.clone(), shutdown_rx)?;
    let mut node = RaftNode::new(config, storage, rpc, events_tx, events_rx);

    let node = tokio::spawn(async move {
        node.run().await;
        // Closing the channel tells the transport to stop accepting requests.
        drop(shutdown_tx);
    });

    Ok(Running {
        server,
        node,
        transport,
    })
}

pub(crate) struct RaftNode<S: Storage> {
    id: String,
    address: String,
    config: Config,
    state: ProtocolState,
    storage: S,
    state_machine: KeyValueStore,
    commit_index: LogIndex,
    last_applied: LogIndex,
    leader_id: Option<String>,
    leader_address: Option<String>,
    peers: BTreeSet<String>,
    next_index: HashMap<String, LogIndex>,
    match_index: HashMap<String, LogIndex>,
    failed_heartbeats: HashMap<String, u32>,
    membership: Membership,
    /// Whether the local log came from a leader, or has led a cluster with peers. Until
    /// then bootstrap entries written locally may share index and term with different
    /// entries elsewhere, so only a reset from the leader is accepted.
    log_adopted: bool,
    backoff: f64,
    election_deadline: Option<Instant>,
    heartbeat_deadline: Option<Instant>,
    show_heartbeat: bool,
    waiters: Vec<Waiter>,
    rpc: Arc<dyn RPC>,
    events_tx: Sender<Event>,
    events_rx: Receiver<Event>,
}

impl<S: Storage> RaftNode<S> {
    pub(crate) fn new(
        config: Config,
        storage: S,
        rpc: Arc<dyn RPC>,
        events_tx: Sender<Event>,
        events_rx: Receiver<Event>,
    ) -> RaftNode<S> {
        let mut node = RaftNode {
            id: config.id.clone(),
            address: config.address.clone(),
            backoff: config.timing.backoff_multiplier,
            config,
            state: ProtocolState::Follower,
            storage,
            state_machine: KeyValueStore::new(),
            commit_index: -1,
            last_applied: -1,
            leader_id: None,
            leader_address: None,
            peers: BTreeSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            failed_heartbeats: HashMap::new(),
            membership: Membership::default(),
            log_adopted: false,
            election_deadline: None,
            heartbeat_deadline: None,
            show_heartbeat: false,
            waiters: Vec::new(),
            rpc,
            events_tx,
            events_rx,
        };
        node.bootstrap();
        node.reset_election_timer();
        node
    }

    /// Seeds the log with a joint+new configuration pair naming the configured cluster.
    /// Without peers there is nobody to agree with, so the pair is committed and applied
    /// right away.
    fn bootstrap(&mut self) {
        let peers = self.config.peer_addresses();
        let mut members: BTreeSet<String> = peers.iter().cloned().collect();
        members.insert(self.address.clone());
        let members: Vec<String> = members.into_iter().collect();

        let term = self.storage.current_term();
        self.storage.append_entry(LogEntry::new(
            term,
            Command::ConfigJoint {
                combined: members.clone(),
                new: members.clone(),
            },
        ));
        let last = self.storage.append_entry(LogEntry::new(
            term,
            Command::ConfigNew { members },
        ));

        if peers.is_empty() {
            info!(
                "[{}] Bootstrapping {} as a single-node cluster",
                self.id, self.address
            );
            self.commit_index = last;
            self.apply_committed();
        } else {
            info!("[{}] Starting with peers {:?}", self.id, peers);
            let next_index = self.storage.last_index() + 1;
            for peer in peers {
                self.track_peer(&peer, next_index);
                self.peers.insert(peer);
            }
        }
    }

    pub(crate) async fn run(&mut self) {
        info!(
            "[{}] Running at {} as {:?} in term {}",
            self.id,
            self.address,
            self.state,
            self.storage.current_term()
        );
        let events = self.events_rx.clone();
        while self.state != ProtocolState::Shutdown {
            let election = self.election_deadline;
            let heartbeat = self.heartbeat_deadline;
            select! {
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(event),
                    Err(_) => self.shutdown(),
                },
                _ = sleep_until(election.unwrap_or_else(Instant::now)), if election.is_some() => {
                    self.election_timeout()
                }
                _ = sleep_until(heartbeat.unwrap_or_else(Instant::now)), if heartbeat.is_some() => {
                    self.send_heartbeats()
                }
            }
        }
        info!("[{}] Raft protocol stopped", self.id);
    }

    pub(crate) fn handle_event(&mut self, event: Event) {
        match event {
            Event::RequestVote(request, reply) => {
                let response = self.receive_vote_request(request);
                let _ = reply.try_send(response);
            }
            Event::AppendEntries(request, reply) => {
                let response = self.receive_append_entries(request);
                let _ = reply.try_send(response);
            }
            Event::Execute(request, reply) => self.execute(request, reply),
            Event::JoinCluster(address, reply) => {
                let _ = reply.try_send(self.join_cluster(&address));
            }
            Event::RemoveMember(address, reply) => {
                let _ = reply.try_send(self.remove_member(&address));
            }
            Event::Status(reply) => {
                let _ = reply.try_send(self.status());
            }
            Event::HeartbeatVisibility(visibility) => {
                info!("[{}] Heartbeat logging visible: {}", self.id, visibility);
                self.show_heartbeat = visibility;
            }
            Event::Ping(reply) => {
                let _ = reply.try_send(self.ensure_leader());
            }
            Event::Shutdown => self.shutdown(),
            Event::ElectionComplete(result) => self.handle_election_result(result),
            Event::AppendEntriesComplete(result) => self.handle_append_result(result),
        }
    }

    fn reset_election_timer(&mut self) {
        let timeout = self.config.election_timeout(self.backoff);
        self.election_deadline = Some(Instant::now() + timeout);
    }

    /// Adopts `term` if it is newer than ours, reverting to follower. Returns whether the
    /// term changed.
    fn observe_term(&mut self, term: Term) -> bool {
        if term <= self.storage.current_term() {
            return false;
        }
        info!(
            "[{}] Observed newer term {} (was {})",
            self.id,
            term,
            self.storage.current_term()
        );
        self.storage.set_current_term(term);
        self.become_follower();
        true
    }

    fn become_follower(&mut self) {
        let previous = self.state;
        match previous {
            ProtocolState::Follower => {}
            ProtocolState::Shutdown => return,
            ProtocolState::Candidate | ProtocolState::Leader => {
                info!(
                    "[{}] Converting from {:?} to follower in term {}",
                    self.id,
                    previous,
                    self.storage.current_term()
                );
            }
        }
        self.state = ProtocolState::Follower;
        self.heartbeat_deadline = None;
        if previous != ProtocolState::Follower || self.election_deadline.is_none() {
            self.reset_election_timer();
        }
        if previous == ProtocolState::Leader {
            self.leader_id = None;
            self.leader_address = None;
            let not_leader = self.not_leader();
            self.fail_waiters(not_leader);
        }
    }

    fn shutdown(&mut self) {
        if self.state == ProtocolState::Shutdown {
            return;
        }
        info!("[{}] Shutting down", self.id);
        self.state = ProtocolState::Shutdown;
        self.election_deadline = None;
        self.heartbeat_deadline = None;
        self.fail_waiters(RaftError::ProtocolTerminated);
    }

    fn ensure_leader(&self) -> Result<(), RaftError> {
        match self.state {
            ProtocolState::Leader => Ok(()),
            ProtocolState::Shutdown => Err(RaftError::ProtocolTerminated),
            ProtocolState::Follower | ProtocolState::Candidate => Err(self.not_leader()),
        }
    }

    fn not_leader(&self) -> RaftError {
        RaftError::NotLeader {
            leader_id: self.leader_id.clone(),
            leader_address: self.leader_address.clone(),
        }
    }

    fn track_peer(&mut self, peer: &str, next_index: LogIndex) {
        self.next_index.insert(peer.to_string(), next_index);
        self.match_index.insert(peer.to_string(), -1);
        self.failed_heartbeats.insert(peer.to_string(), 0);
    }

    fn forget_peer(&mut self, peer: &str) {
        self.next_index.remove(peer);
        self.match_index.remove(peer);
        self.failed_heartbeats.remove(peer);
    }

    /// Answers every waiter whose entry has been applied, and fails those whose entry was
    /// replaced by another term's entry.
    fn notify_waiters(&mut self) {
        let last_applied = self.last_applied;
        let (ready, pending): (Vec<Waiter>, Vec<Waiter>) = std::mem::take(&mut self.waiters)
            .into_iter()
            .partition(|w| w.index <= last_applied);
        self.waiters = pending;
        for waiter in ready {
            let result = if self.storage.get_term(waiter.index) == Some(waiter.term) {
                Ok(waiter.response)
            } else {
                warn!(
                    "[{}] Entry {} was overwritten before it was applied",
                    self.id, waiter.index
                );
                Err(self.not_leader())
            };
            let _ = waiter.reply.try_send(result);
        }
    }

    fn fail_waiters(&mut self, error: RaftError) {
        if !self.waiters.is_empty() {
            debug!(
                "[{}] Failing {} pending client commands: {}",
                self.id,
                self.waiters.len(),
                error
            );
        }
        for waiter in self.waiters.drain(..) {
            let _ = waiter.reply.try_send(Err(error.clone()));
        }
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id.clone(),
            role: self.state,
            term: self.storage.current_term(),
            leader: self.leader_id.clone(),
            leader_address: self.leader_address.clone(),
            self_address: self.address.clone(),
            peers: self.peers.iter().cloned().collect(),
            logs: self.storage.entries().to_vec(),
            store: self.state_machine.snapshot(),
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            config_stage: self.membership.stage,
            failed_heartbeats: self
                .failed_heartbeats
                .iter()
                .map(|(peer, count)| (peer.clone(), *count))
                .collect(),
        }
    }
}
