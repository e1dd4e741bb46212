use thiserror::Error;

/// Failures of the leader-only operations a node exposes to clients and operators.
#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum RaftError {
    /// Carries the last known leader so callers can retry against it.
    #[error("this node is not the leader (leader: {leader_id:?} at {leader_address:?})")]
    NotLeader {
        leader_id: Option<String>,
        leader_address: Option<String>,
    },
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("a membership change is already in progress")]
    MembershipChangeInProgress,
    #[error("the raft protocol has been terminated")]
    ProtocolTerminated,
}
