//! Leadership state for a single Raft node: the Follower/Candidate/Leader split from the Raft
//! paper, kept as a plain enum rather than three cooperating objects so the node's main loop can
//! match on "what am I right now" in one place.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use crate::types::LogIndex;

pub enum Role {
    Follower(FollowerState),
    Candidate(CandidateState),
    Leader(LeaderState),
}

impl Role {
    pub fn label(&self) -> &'static str {
        match self {
            Role::Follower(_) => "follower",
            Role::Candidate(_) => "candidate",
            Role::Leader(_) => "leader",
        }
    }
}

#[derive(Default)]
pub struct FollowerState {
    /// Best known current leader, for `not leader` redirects. `None` right after an election
    /// starts or before the first leader of the cluster's lifetime is known.
    pub leader: Option<String>,
}

#[derive(Default)]
pub struct CandidateState {
    pub votes_granted: HashSet<String>,
}

pub struct LeaderState {
    /// `nextIndex[peer]`: optimistic guess of the next log entry to send to each peer.
    pub next_index: HashMap<String, LogIndex>,
    /// `matchIndex[peer]`: highest index known to be replicated on each peer.
    pub match_index: HashMap<String, LogIndex>,
    /// Peers that acknowledged the most recent heartbeat round.
    pub connected_peers: HashSet<String>,
    pub partition_detected: bool,
    pub last_heartbeat_sent: Instant,
}

impl LeaderState {
    pub fn new(peers: &[String], last_log_index: LogIndex, now: Instant) -> Self {
        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();
        for peer in peers {
            next_index.insert(peer.clone(), last_log_index + 1);
            match_index.insert(peer.clone(), LogIndex(0));
        }
        Self {
            next_index,
            match_index,
            connected_peers: HashSet::new(),
            partition_detected: false,
            last_heartbeat_sent: now,
        }
    }
}
