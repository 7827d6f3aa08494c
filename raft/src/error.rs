use thiserror::Error;

/// Failure taxonomy for a [`crate::RaftNode`] client call (§7: "Not leader", "Partition",
/// "Timeout — replication").
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RaftError {
    #[error("not the leader (known leader: {leader:?})")]
    NotLeader { leader: Option<String> },

    #[error("partition detected, refusing new replications")]
    Partition,

    #[error("replication timed out waiting for commit")]
    ReplicationTimeout,
}
