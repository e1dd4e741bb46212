use super::{ElectionResult, Event, ProtocolState, RaftNode};
use crate::command::Command;
use crate::rpc::{RequestVoteRequest, RequestVoteResponse};
use crate::storage::Storage;
use futures::future::join_all;
use log::{debug, info};
use tokio::time::Instant;

/// Votes needed to win among `peer_count` peers plus the candidate itself.
pub(super) fn majority(peer_count: usize) -> usize {
    (peer_count + 1) / 2 + 1
}

impl<S: Storage> RaftNode<S> {
    pub(super) fn election_timeout(&mut self) {
        info!(
            "[{}] Election timeout reached; assuming the leader is gone",
            self.id
        );
        self.state = ProtocolState::Candidate;
        let term = self.storage.current_term() + 1;
        self.storage.set_current_term(term);
        self.storage.set_voted_for(Some(self.id.clone()));
        self.leader_id = None;
        self.leader_address = None;
        self.reset_election_timer();

        if self.peers.is_empty() {
            info!("[{}] No peers to ask; won term {} unopposed", self.id, term);
            self.backoff = self.config.timing.backoff_multiplier;
            self.become_leader();
            return;
        }

        let request = RequestVoteRequest {
            term,
            candidate_id: self.id.clone(),
            candidate_address: self.address.clone(),
            last_log_index: self.storage.last_index(),
            last_log_term: self.storage.last_term(),
        };
        info!(
            "[{}] Starting election for term {} with peers {:?}",
            self.id, term, self.peers
        );

        let peers: Vec<String> = self.peers.iter().cloned().collect();
        let rpc = self.rpc.clone();
        let events = self.events_tx.clone();
        let id = self.id.clone();
        tokio::spawn(async move {
            let votes = join_all(peers.iter().map(|peer| {
                let rpc = rpc.clone();
                let request = request.clone();
                async move { (peer, rpc.request_vote(peer.clone(), request).await) }
            }))
            .await;

            let mut granted = 1;
            let mut highest_term = term;
            for (peer, vote) in votes {
                match vote {
                    Ok(RequestVoteResponse {
                        vote_granted,
                        term: peer_term,
                    }) => {
                        highest_term = highest_term.max(peer_term);
                        if vote_granted {
                            debug!("[{}] Received vote from {} in term {}", id, peer, term);
                            granted += 1;
                        } else {
                            debug!("[{}] {} denied its vote in term {}", id, peer, term);
                        }
                    }
                    Err(e) => info!(
                        "[{}] Vote request to {} failed in term {}: {}",
                        id, peer, term, e
                    ),
                }
            }
            let result = ElectionResult {
                term,
                peer_count: peers.len(),
                granted,
                highest_term,
            };
            let _ = events.send(Event::ElectionComplete(result)).await;
        });
    }

    pub(super) fn handle_election_result(&mut self, result: ElectionResult) {
        if self.observe_term(result.highest_term) {
            return;
        }
        if self.state != ProtocolState::Candidate || self.storage.current_term() != result.term {
            debug!(
                "[{}] Discarding election result for term {}; now {:?} in term {}",
                self.id,
                result.term,
                self.state,
                self.storage.current_term()
            );
            return;
        }

        let needed = majority(result.peer_count);
        if result.granted >= needed {
            info!(
                "[{}] Won election for term {} with {} of {} votes",
                self.id,
                result.term,
                result.granted,
                result.peer_count + 1
            );
            self.backoff = self.config.timing.backoff_multiplier;
            self.become_leader();
        } else {
            info!(
                "[{}] Lost election for term {}: {} votes, {} needed",
                self.id, result.term, result.granted, needed
            );
            self.become_follower();
        }
    }

    pub(super) fn receive_vote_request(
        &mut self,
        request: RequestVoteRequest,
    ) -> RequestVoteResponse {
        let current_term = self.storage.current_term();
        if !self.peers.contains(&request.candidate_address) {
            debug!(
                "[{}] Rejecting vote for {}: {} is not a known peer",
                self.id, request.candidate_id, request.candidate_address
            );
            return RequestVoteResponse::denied(current_term);
        }
        if request.term < current_term {
            debug!(
                "[{}] Rejecting vote for {}: stale term {} < {}",
                self.id, request.candidate_id, request.term, current_term
            );
            return RequestVoteResponse::denied(current_term);
        }
        self.observe_term(request.term);

        let last_log_term = self.storage.last_term();
        let last_log_index = self.storage.last_index();
        let log_ok = request.last_log_term > last_log_term
            || (request.last_log_term == last_log_term && request.last_log_index >= last_log_index);
        let vote_free = self
            .storage
            .voted_for()
            .map(|c| c == request.candidate_id)
            .unwrap_or(true);
        debug!(
            "[{}] Vote request from {} for term {}: candidate log ({}, {}), \
             local log ({}, {}), voted for {:?}",
            self.id,
            request.candidate_id,
            request.term,
            request.last_log_term,
            request.last_log_index,
            last_log_term,
            last_log_index,
            self.storage.voted_for()
        );

        if log_ok && vote_free {
            self.storage.set_voted_for(Some(request.candidate_id.clone()));
            self.reset_election_timer();
            info!(
                "[{}] Voted for {} in term {}",
                self.id, request.candidate_id, request.term
            );
            RequestVoteResponse::granted(request.term)
        } else {
            RequestVoteResponse::denied(self.storage.current_term())
        }
    }

    pub(super) fn become_leader(&mut self) {
        info!(
            "[{}] Became leader for term {}",
            self.id,
            self.storage.current_term()
        );
        self.state = ProtocolState::Leader;
        self.leader_id = Some(self.id.clone());
        self.leader_address = Some(self.address.clone());

        let next_index = self.storage.last_index() + 1;
        if !self.peers.is_empty() {
            self.log_adopted = true;
        }
        let peers: Vec<String> = self.peers.iter().cloned().collect();
        for peer in peers {
            self.track_peer(&peer, next_index);
        }

        self.election_deadline = None;
        self.heartbeat_deadline = Some(Instant::now() + self.config.heartbeat_interval());

        self.propose(Command::NoOp);
        self.finish_pending_joint();
    }
}
