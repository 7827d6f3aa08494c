//! A hand-rolled Raft consensus core.
//!
//! This crate implements leader election, log replication, batched client-command replication,
//! and leader-side partition detection. It does not persist state to disk (see SPEC_FULL.md §9,
//! "Open question -- Raft persistence": resolved to match the source and stay in-memory only),
//! and it does not know anything about the command type it replicates beyond the bounds needed
//! to store and serialize it -- that is supplied by the service layering on top (the lock state
//! machine, in this workspace).

mod error;
mod log;
mod node;
mod rpc;
mod state;
mod types;

pub use error::RaftError;
pub use log::RaftLog;
pub use node::{Applier, RaftConfig, RaftNode, RaftTransport};
pub use rpc::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};
pub use state::Role;
pub use types::{LogEntry, LogIndex, Term};
