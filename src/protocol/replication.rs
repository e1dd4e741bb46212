use super::{AppendResult, Event, ProtocolState, RaftNode};
use crate::command::Command;
use crate::configuration::Membership;
use crate::rpc::{AppendEntriesRequest, AppendEntriesResponse};
use crate::storage::{LogEntry, LogIndex, Storage};
use log::{debug, error, info, trace, warn};
use tokio::time::Instant;

impl<S: Storage> RaftNode<S> {
    pub(super) fn send_heartbeats(&mut self) {
        self.heartbeat_deadline = Some(Instant::now() + self.config.heartbeat_interval());
        self.broadcast_append_entries();
    }

    /// Sends every peer the entries it is missing, or an empty heartbeat if it has them all.
    pub(super) fn broadcast_append_entries(&mut self) {
        if self.state != ProtocolState::Leader {
            return;
        }
        let peers: Vec<String> = self.peers.iter().cloned().collect();
        for peer in peers {
            self.send_append_entries(peer);
        }
    }

    fn send_append_entries(&mut self, peer: String) {
        let term = self.storage.current_term();
        let next_index = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or_else(|| self.storage.last_index() + 1);
        let prev_log_index = next_index - 1;
        let prev_log_term = self.storage.get_term(prev_log_index).unwrap_or(0);
        let entries = self.storage.entries_from(next_index);
        let sent = entries.len() as LogIndex;

        if entries.is_empty() {
            if self.show_heartbeat {
                info!("[{}] Heartbeat: No new entries to send to {}", self.id, peer);
            } else {
                trace!("[{}] Heartbeat: No new entries to send to {}", self.id, peer);
            }
        } else {
            debug!(
                "[{}] Sending {} entries starting at {} to {}",
                self.id, sent, next_index, peer
            );
        }

        let request = AppendEntriesRequest {
            term,
            leader_id: self.id.clone(),
            leader_address: self.address.clone(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        };
        let rpc = self.rpc.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = rpc
                .append_entries(peer.clone(), request)
                .await
                .map_err(|e| e.to_string());
            let result = AppendResult {
                peer,
                term,
                next_index,
                sent,
                result,
            };
            let _ = events.send(Event::AppendEntriesComplete(result)).await;
        });
    }

    pub(super) fn handle_append_result(&mut self, result: AppendResult) {
        let AppendResult {
            peer,
            term,
            next_index,
            sent,
            result,
        } = result;

        if let Ok(response) = &result {
            if self.observe_term(response.term) {
                return;
            }
        }
        if self.state != ProtocolState::Leader
            || self.storage.current_term() != term
            || !self.peers.contains(&peer)
        {
            trace!(
                "[{}] Discarding append entries result from {} for term {}",
                self.id,
                peer,
                term
            );
            return;
        }

        match result {
            Ok(AppendEntriesResponse { success: true, .. }) => {
                self.failed_heartbeats.insert(peer.clone(), 0);
                let next = next_index + sent;
                self.next_index.insert(peer.clone(), next);
                let matched = self.match_index.entry(peer.clone()).or_insert(-1);
                *matched = (*matched).max(next - 1);
                if sent > 0 {
                    debug!("[{}] {} has replicated up to {}", self.id, peer, next - 1);
                }
                self.check_commit();
            }
            Ok(AppendEntriesResponse { success: false, .. }) => {
                let next = (next_index - 1).max(0);
                debug!(
                    "[{}] {} rejected entries after {}; retrying from {}",
                    self.id,
                    peer,
                    next_index - 1,
                    next
                );
                self.failed_heartbeats.insert(peer.clone(), 0);
                self.next_index.insert(peer, next);
            }
            Err(e) => {
                let failures = self.failed_heartbeats.entry(peer.clone()).or_insert(0);
                *failures += 1;
                let failures = *failures;
                if failures == self.config.timing.max_failed_heartbeats {
                    warn!(
                        "[{}] Peer {} is likely down (missed {} heartbeats): {}",
                        self.id, peer, failures, e
                    );
                } else {
                    trace!(
                        "[{}] Append entries to {} failed ({} in a row): {}",
                        self.id,
                        peer,
                        failures,
                        e
                    );
                }
            }
        }
    }

    /// Advances the commit index to the highest index a majority holds, as long as that
    /// entry belongs to the current term.
    pub(super) fn check_commit(&mut self) {
        let mut indices: Vec<LogIndex> = self
            .peers
            .iter()
            .map(|peer| self.match_index.get(peer).copied().unwrap_or(-1))
            .collect();
        indices.push(self.storage.last_index());
        indices.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = indices[indices.len() / 2];

        if candidate <= self.commit_index {
            return;
        }
        let current_term = self.storage.current_term();
        match self.storage.get_term(candidate) {
            Some(term) if term == current_term => {
                info!(
                    "[{}] Advancing commit index from {} to {}",
                    self.id, self.commit_index, candidate
                );
                self.commit_index = candidate;
                self.apply_committed();
            }
            Some(term) => debug!(
                "[{}] A majority holds index {} from old term {}; not committing",
                self.id, candidate, term
            ),
            None => error!(
                "[{}] Majority index {} is missing from the local log",
                self.id, candidate
            ),
        }
    }

    /// Applies every committed entry not yet applied, in log order.
    pub(super) fn apply_committed(&mut self) {
        let mut finish_joint = None;
        while self.last_applied < self.commit_index {
            self.last_applied += 1;
            let index = self.last_applied;
            let entry = match self.storage.get_entry(index) {
                Some(entry) => entry.clone(),
                None => {
                    error!("[{}] Committed entry {} is missing", self.id, index);
                    self.last_applied -= 1;
                    break;
                }
            };
            match entry.command.parse::<Command>() {
                Ok(command) => {
                    if let Command::ConfigJoint { new, .. } = &command {
                        if self.state == ProtocolState::Leader && !self.has_config_after(index) {
                            finish_joint = Some(new.clone());
                        }
                    }
                    self.apply_command(index, command);
                }
                Err(e) => warn!(
                    "[{}] Skipping malformed entry {} ({:?}): {}",
                    self.id, index, entry.command, e
                ),
            }
        }
        self.notify_waiters();

        if let Some(members) = finish_joint {
            info!(
                "[{}] Joint configuration committed; moving to {:?}",
                self.id, members
            );
            self.membership.enter_new();
            self.propose(Command::ConfigNew { members });
        }
    }

    fn apply_command(&mut self, index: LogIndex, command: Command) {
        match command {
            Command::Set { key, value } => {
                self.state_machine.set(&key, &value);
                info!("[{}] Applied {}: set {} = {:?}", self.id, index, key, value);
            }
            Command::Del { key } => {
                let previous = self.state_machine.del(&key);
                info!(
                    "[{}] Applied {}: del {} (was {:?})",
                    self.id, index, key, previous
                );
            }
            Command::Append { key, value } => {
                self.state_machine.append(&key, &value);
                info!(
                    "[{}] Applied {}: append {:?} to {}",
                    self.id, index, value, key
                );
            }
            Command::ConfigJoint { combined, new } => {
                self.apply_joint_configuration(index, &combined, &new)
            }
            Command::ConfigNew { members } => self.apply_new_configuration(index, &members),
            Command::NoOp => debug!("[{}] Applied {}: no-op", self.id, index),
        }
    }

    pub(super) fn receive_append_entries(
        &mut self,
        request: AppendEntriesRequest,
    ) -> AppendEntriesResponse {
        let current_term = self.storage.current_term();
        if request.term < current_term {
            debug!(
                "[{}] Rejecting append entries from {}: stale term {} < {}",
                self.id, request.leader_id, request.term, current_term
            );
            return AppendEntriesResponse::failed(current_term);
        }
        self.reset_election_timer();

        if request.prev_log_index == -1 {
            self.reset_to_follow(&request.leader_id);
        }
        self.observe_term(request.term);
        self.become_follower();
        if self.leader_id.as_deref() != Some(request.leader_id.as_str()) {
            info!(
                "[{}] Following leader {} at {} in term {}",
                self.id, request.leader_id, request.leader_address, request.term
            );
        }
        self.leader_id = Some(request.leader_id.clone());
        self.leader_address = Some(request.leader_address.clone());

        if request.prev_log_index >= 0 && !self.log_adopted {
            debug!(
                "[{}] Log was never taken from a leader; asking {} to resend it from the start",
                self.id, request.leader_id
            );
            return AppendEntriesResponse::failed(self.storage.current_term());
        }
        if request.prev_log_index >= 0 {
            let local = self.storage.get_term(request.prev_log_index);
            if local != Some(request.prev_log_term) {
                debug!(
                    "[{}] Log mismatch at {}: local term {:?}, leader term {}",
                    self.id, request.prev_log_index, local, request.prev_log_term
                );
                return AppendEntriesResponse::failed(self.storage.current_term());
            }
        }

        let count = request.entries.len() as LogIndex;
        self.merge_entries(request.prev_log_index, request.entries);

        let last_new_index = request.prev_log_index + count;
        let new_commit = request.leader_commit.min(last_new_index);
        if new_commit > self.commit_index {
            info!(
                "[{}] Committed log up to index {}",
                self.id, new_commit
            );
            self.commit_index = new_commit;
            self.apply_committed();
        }
        AppendEntriesResponse::succeeded(self.storage.current_term())
    }

    /// Writes `entries` after `prev_log_index`, truncating only from the first entry whose
    /// term differs from ours.
    fn merge_entries(&mut self, prev_log_index: LogIndex, entries: Vec<LogEntry>) {
        let mut index = prev_log_index;
        for entry in entries {
            index += 1;
            match self.storage.get_term(index) {
                Some(term) if term == entry.term => continue,
                Some(term) => {
                    debug!(
                        "[{}] Conflict at {} (local term {}, leader term {}); truncating",
                        self.id, index, term, entry.term
                    );
                    self.storage.remove_entries_starting_at(index);
                }
                None => {}
            }
            self.storage.append_entry(entry);
        }
    }

    /// Forgets everything local so the leader's log can be adopted from scratch.
    fn reset_to_follow(&mut self, leader_id: &str) {
        self.storage.reset();
        self.state_machine.clear();
        self.commit_index = -1;
        self.last_applied = -1;
        self.next_index.clear();
        self.match_index.clear();
        self.failed_heartbeats.clear();
        // Peers stay until the replayed configuration replaces them.
        self.membership = Membership::default();
        self.log_adopted = true;
        info!(
            "[{}] Local state reset to follow leader {}",
            self.id, leader_id
        );
    }
}
