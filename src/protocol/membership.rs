use super::{Event, ProtocolState, RaftNode};
use crate::command::Command;
use crate::configuration::{ConfigStage, ConfigurationChange};
use crate::error::RaftError;
use crate::storage::{LogIndex, Storage};
use log::{info, warn};
use std::collections::BTreeSet;

impl<S: Storage> RaftNode<S> {
    pub(super) fn join_cluster(&mut self, address: &str) -> Result<(), RaftError> {
        self.change_membership(ConfigurationChange::Join(address))
    }

    pub(super) fn remove_member(&mut self, address: &str) -> Result<(), RaftError> {
        if address != self.address && !self.peers.contains(address) {
            return Err(RaftError::InvalidCommand(format!(
                "{} is not a member of the cluster",
                address
            )));
        }
        self.change_membership(ConfigurationChange::Remove(address))
    }

    fn change_membership(&mut self, change: ConfigurationChange<'_>) -> Result<(), RaftError> {
        self.ensure_leader()?;
        let address = match change {
            ConfigurationChange::Join(address) | ConfigurationChange::Remove(address) => address,
        };
        if address.is_empty() || address.contains(&[',', '|'][..]) {
            return Err(RaftError::InvalidCommand(format!(
                "invalid member address {:?}",
                address
            )));
        }
        if self.membership_change_pending() {
            return Err(RaftError::MembershipChangeInProgress);
        }

        let command = change.joint_command(&self.peers, &self.address);
        info!("[{}] Starting membership change: {}", self.id, command);
        self.propose(command);
        Ok(())
    }

    /// Whether a configuration entry is uncommitted or a joint change has not been finalized.
    pub(super) fn membership_change_pending(&self) -> bool {
        self.membership.stage != ConfigStage::Stable
            || self
                .last_config_entry()
                .map(|(index, _)| index > self.commit_index)
                .unwrap_or(false)
    }

    fn last_config_entry(&self) -> Option<(LogIndex, Command)> {
        self.storage
            .entries()
            .iter()
            .enumerate()
            .rev()
            .filter_map(|(index, entry)| {
                entry
                    .command
                    .parse::<Command>()
                    .ok()
                    .filter(Command::is_config)
                    .map(|command| (index as LogIndex, command))
            })
            .next()
    }

    pub(super) fn has_config_after(&self, index: LogIndex) -> bool {
        self.last_config_entry()
            .map(|(last, _)| last > index)
            .unwrap_or(false)
    }

    /// Issues the `config:new` half of a joint change that an earlier leader applied but
    /// never finished.
    pub(super) fn finish_pending_joint(&mut self) {
        if self.membership.stage != ConfigStage::Joint {
            return;
        }
        if let Some((_, Command::ConfigJoint { new, .. })) = self.last_config_entry() {
            info!(
                "[{}] Finishing interrupted membership change to {:?}",
                self.id, new
            );
            self.membership.enter_new();
            self.propose(Command::ConfigNew { members: new });
        }
    }

    pub(super) fn apply_joint_configuration(
        &mut self,
        index: LogIndex,
        combined: &[String],
        new: &[String],
    ) {
        self.membership.enter_joint(combined, new);
        let peers: BTreeSet<String> = combined
            .iter()
            .filter(|member| **member != self.address)
            .cloned()
            .collect();
        for peer in peers.difference(&self.peers).cloned().collect::<Vec<_>>() {
            // Unknown peers get the whole log, starting with a reset.
            self.track_peer(&peer, 0);
        }
        self.peers = peers;
        info!(
            "[{}] Applied {}: entering joint configuration {:?} -> {:?}",
            self.id, index, combined, new
        );
    }

    pub(super) fn apply_new_configuration(&mut self, index: LogIndex, members: &[String]) {
        let was_member = self.membership.joint.contains(&self.address);
        let removed = self.membership.finalize(members);
        let peers: BTreeSet<String> = members
            .iter()
            .filter(|member| **member != self.address)
            .cloned()
            .collect();
        for peer in self.peers.difference(&peers).cloned().collect::<Vec<_>>() {
            self.forget_peer(&peer);
        }
        self.peers = peers;
        info!(
            "[{}] Applied {}: configuration is now {:?}",
            self.id, index, members
        );

        if self.state == ProtocolState::Leader {
            for address in removed.into_iter().filter(|a| *a != self.address) {
                info!("[{}] Asking removed member {} to shut down", self.id, address);
                let rpc = self.rpc.clone();
                let id = self.id.clone();
                tokio::spawn(async move {
                    if let Err(e) = rpc.shutdown(address.clone()).await {
                        warn!("[{}] Could not shut down {}: {}", id, address, e);
                    }
                });
            }
        }

        let removed_self = was_member && !members.contains(&self.address);
        if removed_self && self.last_applied == self.commit_index {
            let delay = self.config.shutdown_delay();
            info!(
                "[{}] Removed from the cluster; shutting down in {:?}",
                self.id, delay
            );
            let events = self.events_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = events.send(Event::Shutdown).await;
            });
        }
    }
}
