//! The crate-wide failure taxonomy (SPEC_FULL.md §7). One variant per *kind* of failure, not per
//! call site -- callers match on these to decide redirect-vs-retry-vs-4xx at the HTTP boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("peer {peer} unreachable or timed out")]
    Transport { peer: String },

    #[error("not the leader (known leader: {leader:?})")]
    NotLeader { leader: Option<String> },

    #[error("partition detected, refusing new replications")]
    Partition,

    #[error("replication timed out waiting for commit")]
    ReplicationTimeout,

    /// A lock's lease deadline passed and the reaper released it automatically (SPEC_FULL.md §7:
    /// "the prior holder observes no error but subsequent operations will find the lock gone").
    /// Never returned from a facade handler -- kept here so the taxonomy names the kind, even
    /// though `storage::LockStateMachine`'s timeout reaper only ever logs it, never surfaces it
    /// as a caller-facing failure.
    #[error("lock lease expired")]
    LeaseTimeout,

    #[error("state violation: {0}")]
    StateViolation(String),

    #[error("wal recovery error: {0}")]
    RecoveryError(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("environment variable {name} has an invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}
