use crate::command::Command;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Where a node is in the two-phase membership protocol.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConfigStage {
    #[default]
    Stable,
    Joint,
    New,
}

pub enum ConfigurationChange<'a> {
    Join(&'a str),
    Remove(&'a str),
}

#[derive(Debug, Clone, Default)]
pub struct Membership {
    pub stage: ConfigStage,
    /// Old ∪ new members while a change is in flight.
    pub joint: BTreeSet<String>,
    /// Target membership of the change in flight.
    pub new: BTreeSet<String>,
}

impl Membership {
    pub fn enter_joint(&mut self, combined: &[String], new: &[String]) {
        self.stage = ConfigStage::Joint;
        self.joint = combined.iter().cloned().collect();
        self.new = new.iter().cloned().collect();
    }

    pub fn enter_new(&mut self) {
        self.stage = ConfigStage::New;
    }

    /// Adopts `members` as the final configuration and returns the addresses that were
    /// part of the joint configuration but are not members anymore.
    pub fn finalize(&mut self, members: &[String]) -> BTreeSet<String> {
        let members: BTreeSet<String> = members.iter().cloned().collect();
        let removed = self.joint.difference(&members).cloned().collect();
        self.stage = ConfigStage::Stable;
        self.joint = members.clone();
        self.new = members;
        removed
    }
}

impl ConfigurationChange<'_> {
    /// Builds the `config:joint` entry that starts this change on top of the current peers.
    pub fn joint_command(&self, peers: &BTreeSet<String>, self_address: &str) -> Command {
        let mut combined = peers.clone();
        combined.insert(self_address.to_string());
        let new = match self {
            ConfigurationChange::Join(address) => {
                combined.insert(address.to_string());
                combined.clone()
            }
            ConfigurationChange::Remove(address) => {
                combined.insert(address.to_string());
                let mut new = combined.clone();
                new.remove(*address);
                new
            }
        };
        Command::ConfigJoint {
            combined: combined.into_iter().collect(),
            new: new.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(p: &[&str]) -> BTreeSet<String> {
        p.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn join_adds_to_both_sets() {
        let cmd = ConfigurationChange::Join("c:3").joint_command(&peers(&["b:2"]), "a:1");
        assert_eq!(cmd.to_string(), "config:joint:a:1,b:2,c:3|a:1,b:2,c:3");
    }

    #[test]
    fn remove_keeps_the_member_in_the_combined_set() {
        let cmd = ConfigurationChange::Remove("b:2").joint_command(&peers(&["b:2", "c:3"]), "a:1");
        assert_eq!(cmd.to_string(), "config:joint:a:1,b:2,c:3|a:1,c:3");
    }

    #[test]
    fn finalize_reports_removed_members() {
        let mut membership = Membership::default();
        membership.enter_joint(
            &["a".to_string(), "b".to_string(), "c".to_string()],
            &["a".to_string(), "c".to_string()],
        );
        assert_eq!(membership.stage, ConfigStage::Joint);
        membership.enter_new();
        assert_eq!(membership.stage, ConfigStage::New);

        let removed = membership.finalize(&["a".to_string(), "c".to_string()]);
        assert_eq!(removed, peers(&["b"]));
        assert_eq!(membership.stage, ConfigStage::Stable);
        assert_eq!(membership.new, peers(&["a", "c"]));
    }
}
