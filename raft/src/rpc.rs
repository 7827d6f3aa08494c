//! Wire types for the two Raft RPCs, matching the flat JSON envelope of `/internal/message`.

use serde::{Deserialize, Serialize};

use crate::types::{LogEntry, LogIndex, Term};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: String,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest<C> {
    pub term: Term,
    pub leader_id: String,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry<C>>,
    pub leader_commit: LogIndex,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// Index of the last log entry the responder's log is now known to match on, used by the
    /// leader to advance `matchIndex` in one round instead of backing off one entry at a time.
    pub match_index: LogIndex,
    pub last_log_index: LogIndex,
}
