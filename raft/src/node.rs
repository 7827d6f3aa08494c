//! The Raft node: election, replication, batching, and partition detection in one place.
//!
//! # Timers
//!
//! Election timeout is randomized per node in `[election_timeout_min, election_timeout_max]`
//! (50-100ms by default) to avoid split votes; the heartbeat interval is fixed (15ms by default).
//! Both are driven by a single `tokio::select!` loop in [`RaftNode::run`].
//!
//! # Message delivery
//!
//! [`RaftTransport`] mirrors PeerTransport's contract: a call either returns a reply or `None`.
//! Raft does not retry a lost RPC itself -- the next heartbeat or election round carries the
//! same information again.
//!
//! # Locking
//!
//! All mutable node state lives behind one [`parking_lot::Mutex`]. It is taken only for
//! CPU-bound state transitions and is never held across a `.await` -- every network call in this
//! module happens with the lock released, per SPEC_FULL.md §5.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;

use crate::error::RaftError;
use crate::log::RaftLog;
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};
use crate::state::{CandidateState, FollowerState, LeaderState, Role};
use crate::types::{LogEntry, LogIndex, Term};

/// Tuning knobs. Defaults match SPEC_FULL.md §4.3 exactly.
#[derive(Clone, Debug)]
pub struct RaftConfig {
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    pub max_batch: usize,
    pub batch_timeout: Duration,
    pub replicate_timeout: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(50),
            election_timeout_max: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(15),
            max_batch: 50,
            batch_timeout: Duration::from_millis(10),
            replicate_timeout: Duration::from_secs(1),
        }
    }
}

/// Applies a committed command to a service's state machine. Implemented once per service
/// (the lock state machine); called by the apply loop in commit order on every node.
#[async_trait]
pub trait Applier<C>: Send + Sync {
    async fn apply(&self, command: &C);
}

/// Sends the two Raft RPCs to a named peer, returning `None` on any transport failure or
/// timeout -- a reply is never fabricated.
#[async_trait]
pub trait RaftTransport<C>: Send + Sync {
    async fn request_vote(
        &self,
        peer: &str,
        request: RequestVoteRequest,
    ) -> Option<RequestVoteResponse>;

    async fn append_entries(
        &self,
        peer: &str,
        request: AppendEntriesRequest<C>,
    ) -> Option<AppendEntriesResponse>;
}

struct AwaitingCommit {
    notify: oneshot::Sender<bool>,
}

struct Shared<C> {
    current_term: Term,
    voted_for: Option<String>,
    log: RaftLog<C>,
    commit_index: LogIndex,
    last_applied: LogIndex,
    last_heartbeat: Instant,
    role: Role,
    awaiting_commit: HashMap<LogIndex, AwaitingCommit>,
}

/// A single Raft participant. Generic over the opaque command type `C` it replicates; a cluster
/// hosting only the lock service instantiates this once with `C = LockCommand`.
pub struct RaftNode<C, T, A> {
    pub node_id: String,
    pub peers: Vec<String>,
    config: RaftConfig,
    shared: Mutex<Shared<C>>,
    transport: Arc<T>,
    applier: Arc<A>,
    apply_notify: Notify,
    pending_tx: mpsc::UnboundedSender<(C, oneshot::Sender<bool>)>,
    pending_rx: Mutex<Option<mpsc::UnboundedReceiver<(C, oneshot::Sender<bool>)>>>,
    shutdown: AtomicBool,
}

impl<C, T, A> RaftNode<C, T, A>
where
    C: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
    T: RaftTransport<C> + Send + Sync + 'static,
    A: Applier<C> + Send + Sync + 'static,
{
    pub fn new(
        node_id: impl Into<String>,
        peers: Vec<String>,
        config: RaftConfig,
        transport: Arc<T>,
        applier: Arc<A>,
    ) -> Arc<Self> {
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            node_id: node_id.into(),
            peers,
            config,
            shared: Mutex::new(Shared {
                current_term: Term(0),
                voted_for: None,
                log: RaftLog::new(),
                commit_index: LogIndex(0),
                last_applied: LogIndex(0),
                last_heartbeat: Instant::now(),
                role: Role::Follower(FollowerState::default()),
                awaiting_commit: HashMap::new(),
            }),
            transport,
            applier,
            apply_notify: Notify::new(),
            pending_tx,
            pending_rx: Mutex::new(Some(pending_rx)),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.shared.lock().role, Role::Leader(_))
    }

    pub fn current_term(&self) -> Term {
        self.shared.lock().current_term
    }

    pub fn current_leader_hint(&self) -> Option<String> {
        let guard = self.shared.lock();
        match &guard.role {
            Role::Leader(_) => Some(self.node_id.clone()),
            Role::Follower(f) => f.leader.clone(),
            Role::Candidate(_) => None,
        }
    }

    pub fn partition_detected(&self) -> bool {
        match &self.shared.lock().role {
            Role::Leader(l) => l.partition_detected,
            _ => false,
        }
    }

    fn majority(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    fn random_election_timeout(&self) -> Duration {
        let min = self.config.election_timeout_min.as_millis() as u64;
        let max = self.config.election_timeout_max.as_millis() as u64;
        let millis = rand::thread_rng().gen_range(min..=max);
        Duration::from_millis(millis)
    }

    /// Spawns the three cooperating background tasks (§5): the election/heartbeat loop, the
    /// apply loop, and the command batcher. Returns their join handles so a caller can await
    /// clean shutdown.
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(3);
        handles.push(tokio::spawn(Self::run_election_loop(Arc::clone(self))));
        handles.push(tokio::spawn(Self::run_apply_loop(Arc::clone(self))));
        handles.push(tokio::spawn(Self::run_batcher_loop(Arc::clone(self))));
        handles
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, AtomicOrdering::Relaxed);
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown.load(AtomicOrdering::Relaxed)
    }

    // ---------------------------------------------------------------
    // Client-facing API
    // ---------------------------------------------------------------

    /// Submits `command` for replication. Resolves once the entry commits (`Ok(true)`), is
    /// superseded by a later leader before committing (`Ok(false)`), or the wait exceeds
    /// `replicate_timeout` (`Err(ReplicationTimeout)`) -- per §7, callers must then treat the
    /// outcome as unknown and retry idempotently, since the entry may still commit later.
    pub async fn replicate(&self, command: C) -> Result<bool, RaftError> {
        {
            let guard = self.shared.lock();
            match &guard.role {
                Role::Leader(leader) => {
                    if leader.partition_detected {
                        return Err(RaftError::Partition);
                    }
                }
                Role::Follower(f) => {
                    return Err(RaftError::NotLeader {
                        leader: f.leader.clone(),
                    })
                }
                Role::Candidate(_) => return Err(RaftError::NotLeader { leader: None }),
            }
        }

        let (tx, rx) = oneshot::channel();
        self.pending_tx
            .send((command, tx))
            .map_err(|_| RaftError::Partition)?;

        match tokio::time::timeout(self.config.replicate_timeout, rx).await {
            Ok(Ok(committed)) => Ok(committed),
            _ => Err(RaftError::ReplicationTimeout),
        }
    }

    // ---------------------------------------------------------------
    // RPC handlers -- called directly by the HTTP facade's `/internal/message` dispatch.
    // ---------------------------------------------------------------

    pub async fn handle_request_vote(&self, req: RequestVoteRequest) -> RequestVoteResponse {
        let mut guard = self.shared.lock();
        self.adopt_term_if_newer(&mut guard, req.term);

        if req.term < guard.current_term {
            return RequestVoteResponse {
                term: guard.current_term,
                vote_granted: false,
            };
        }

        let log_ok = req.last_log_term > guard.log.last_term()
            || (req.last_log_term == guard.log.last_term()
                && req.last_log_index >= guard.log.last_index());

        let can_vote = matches!(&guard.voted_for, None) || guard.voted_for.as_deref() == Some(req.candidate_id.as_str());

        let vote_granted = can_vote && log_ok;
        if vote_granted {
            guard.voted_for = Some(req.candidate_id.clone());
            guard.last_heartbeat = Instant::now();
        }

        RequestVoteResponse {
            term: guard.current_term,
            vote_granted,
        }
    }

    pub async fn handle_append_entries(
        &self,
        req: AppendEntriesRequest<C>,
    ) -> AppendEntriesResponse {
        let mut guard = self.shared.lock();
        self.adopt_term_if_newer(&mut guard, req.term);

        if req.term < guard.current_term {
            return AppendEntriesResponse {
                term: guard.current_term,
                success: false,
                match_index: LogIndex(0),
                last_log_index: guard.log.last_index(),
            };
        }

        // A valid AppendEntries for the current term always means: become/stay Follower,
        // remember the leader, reset the election clock.
        guard.role = Role::Follower(FollowerState {
            leader: Some(req.leader_id.clone()),
        });
        guard.last_heartbeat = Instant::now();

        if req.prev_log_index.0 > 0 {
            match guard.log.term_at(req.prev_log_index) {
                Some(term) if term == req.prev_log_term => {}
                _ => {
                    return AppendEntriesResponse {
                        term: guard.current_term,
                        success: false,
                        match_index: LogIndex(0),
                        last_log_index: guard.log.last_index(),
                    };
                }
            }
        }

        guard.log.truncate_from(req.prev_log_index + 1);
        for entry in req.entries {
            guard.log.append(entry);
        }

        let last_log_index = guard.log.last_index();
        if req.leader_commit > guard.commit_index {
            guard.commit_index = req.leader_commit.min(last_log_index);
            self.apply_notify.notify_one();
        }

        AppendEntriesResponse {
            term: guard.current_term,
            success: true,
            match_index: last_log_index,
            last_log_index,
        }
    }

    fn adopt_term_if_newer(&self, guard: &mut Shared<C>, term: Term) {
        if term > guard.current_term {
            guard.current_term = term;
            guard.voted_for = None;
            guard.role = Role::Follower(FollowerState::default());
        }
    }

    // ---------------------------------------------------------------
    // Election / heartbeat loop
    // ---------------------------------------------------------------

    async fn run_election_loop(self: Arc<Self>) {
        loop {
            if self.is_shutting_down() {
                return;
            }

            let (is_leader, deadline) = {
                let guard = self.shared.lock();
                match &guard.role {
                    Role::Leader(_) => (true, self.config.heartbeat_interval),
                    _ => {
                        let elapsed = guard.last_heartbeat.elapsed();
                        let timeout = self.random_election_timeout();
                        (false, timeout.saturating_sub(elapsed))
                    }
                }
            };

            tokio::time::sleep(deadline).await;
            if self.is_shutting_down() {
                return;
            }

            if is_leader {
                self.send_heartbeat_round().await;
            } else {
                let needs_election = {
                    let guard = self.shared.lock();
                    !matches!(guard.role, Role::Leader(_))
                        && guard.last_heartbeat.elapsed() >= self.config.election_timeout_min
                };
                if needs_election {
                    self.start_election().await;
                }
            }
        }
    }

    async fn start_election(self: &Arc<Self>) {
        let (term, last_log_index, last_log_term) = {
            let mut guard = self.shared.lock();
            guard.current_term += 1;
            guard.voted_for = Some(self.node_id.clone());
            guard.last_heartbeat = Instant::now();
            let mut votes = std::collections::HashSet::new();
            votes.insert(self.node_id.clone());
            guard.role = Role::Candidate(CandidateState {
                votes_granted: votes,
            });
            (guard.current_term, guard.log.last_index(), guard.log.last_term())
        };

        tracing::debug!(node = %self.node_id, %term, "starting election");

        let requests = self.peers.iter().map(|peer| {
            let peer = peer.clone();
            let req = RequestVoteRequest {
                term,
                candidate_id: self.node_id.clone(),
                last_log_index,
                last_log_term,
            };
            let transport = Arc::clone(&self.transport);
            async move { (peer.clone(), transport.request_vote(&peer, req).await) }
        });

        let replies = futures::future::join_all(requests).await;

        let mut guard = self.shared.lock();
        if guard.current_term != term || !matches!(guard.role, Role::Candidate(_)) {
            // Overtaken by a higher term or already resolved while we waited on the network.
            return;
        }

        for (peer, reply) in replies {
            let Some(reply) = reply else { continue };
            if reply.term > guard.current_term {
                self.adopt_term_if_newer(&mut guard, reply.term);
                return;
            }
            if reply.vote_granted {
                if let Role::Candidate(candidate) = &mut guard.role {
                    candidate.votes_granted.insert(peer);
                }
            }
        }

        let granted = match &guard.role {
            Role::Candidate(candidate) => candidate.votes_granted.len(),
            _ => return,
        };

        if granted >= self.majority() {
            tracing::info!(node = %self.node_id, %term, "elected leader");
            guard.role = Role::Leader(LeaderState::new(
                &self.peers,
                guard.log.last_index(),
                Instant::now(),
            ));
        }
        // Otherwise: stay Candidate until the next election-timer tick re-triggers a new term,
        // matching "election timer elapses without majority -> Follower, new random timeout"
        // (the next loop iteration observes last_heartbeat is still stale and starts over).
    }

    async fn send_heartbeat_round(self: &Arc<Self>) {
        let (term, commit_index, requests) = {
            let guard = self.shared.lock();
            let Role::Leader(leader) = &guard.role else {
                return;
            };
            let mut requests = Vec::with_capacity(self.peers.len());
            for peer in &self.peers {
                let next_index = *leader.next_index.get(peer).unwrap_or(&LogIndex(1));
                let prev_log_index = next_index - 1;
                let prev_log_term = guard.log.term_at(prev_log_index).unwrap_or_default();
                let entries = guard.log.entries_from(next_index);
                requests.push((
                    peer.clone(),
                    AppendEntriesRequest {
                        term: guard.current_term,
                        leader_id: self.node_id.clone(),
                        prev_log_index,
                        prev_log_term,
                        entries,
                        leader_commit: guard.commit_index,
                    },
                ));
            }
            (guard.current_term, guard.commit_index, requests)
        };

        let transport = Arc::clone(&self.transport);
        let futs = requests.into_iter().map(|(peer, req)| {
            let transport = Arc::clone(&transport);
            async move {
                let reply = transport.append_entries(&peer, req).await;
                (peer, reply)
            }
        });
        let replies = futures::future::join_all(futs).await;

        let mut guard = self.shared.lock();
        if guard.current_term != term || !matches!(guard.role, Role::Leader(_)) {
            return;
        }

        let mut reachable = 1usize; // self
        for (peer, reply) in replies {
            let Some(reply) = reply else { continue };
            if reply.term > guard.current_term {
                self.adopt_term_if_newer(&mut guard, reply.term);
                return;
            }
            reachable += 1;
            let Role::Leader(leader) = &mut guard.role else {
                return;
            };
            leader.connected_peers.insert(peer.clone());
            if reply.success {
                leader.match_index.insert(peer.clone(), reply.match_index);
                leader
                    .next_index
                    .insert(peer.clone(), reply.last_log_index + 1);
            } else {
                // Back off nextIndex by one and retry next round.
                let next = leader.next_index.entry(peer.clone()).or_insert(LogIndex(1));
                *next = next.checked_sub(1).unwrap_or(LogIndex(1));
            }
        }

        let majority = self.majority();
        if let Role::Leader(leader) = &mut guard.role {
            leader.partition_detected = reachable < majority;
            leader.last_heartbeat_sent = Instant::now();
        }

        // Commit advance: highest N with log[N].term == currentTerm and a majority at >= N.
        let last_index = guard.log.last_index();
        let mut n = last_index.0;
        while n > commit_index.0 {
            let idx = LogIndex(n);
            if guard.log.term_at(idx) == Some(term) {
                let mut acked = 1usize; // self
                if let Role::Leader(leader) = &guard.role {
                    for m in leader.match_index.values() {
                        if *m >= idx {
                            acked += 1;
                        }
                    }
                }
                if acked >= majority {
                    guard.commit_index = idx;
                    self.apply_notify.notify_one();
                    break;
                }
            }
            n -= 1;
        }
    }

    // ---------------------------------------------------------------
    // Apply loop
    // ---------------------------------------------------------------

    async fn run_apply_loop(self: Arc<Self>) {
        loop {
            if self.is_shutting_down() {
                return;
            }
            let wait = tokio::time::sleep(Duration::from_millis(20));
            tokio::select! {
                _ = self.apply_notify.notified() => {}
                _ = wait => {}
            }

            loop {
                let next = {
                    let guard = self.shared.lock();
                    if guard.last_applied >= guard.commit_index {
                        None
                    } else {
                        let idx = guard.last_applied + 1;
                        let entry = guard.log.entry_at(idx);
                        debug_assert!(
                            entry.is_some(),
                            "commit_index {:?} advanced past the end of the log (len {}) -- byzantine peer or a broken invariant",
                            guard.commit_index,
                            guard.log.len()
                        );
                        entry.map(|e| (idx, e.command.clone()))
                    }
                };
                let Some((idx, command)) = next else { break };
                self.applier.apply(&command).await;

                let mut guard = self.shared.lock();
                guard.last_applied = idx;
                if let Some(awaiting) = guard.awaiting_commit.remove(&idx) {
                    let _ = awaiting.notify.send(true);
                }
            }
        }
    }

    // ---------------------------------------------------------------
    // Batcher loop
    // ---------------------------------------------------------------

    async fn run_batcher_loop(self: Arc<Self>) {
        let mut rx = self
            .pending_rx
            .lock()
            .take()
            .expect("batcher loop started twice");

        loop {
            if self.is_shutting_down() {
                return;
            }
            let mut batch = Vec::with_capacity(self.config.max_batch);
            let deadline = tokio::time::sleep(self.config.batch_timeout);
            tokio::pin!(deadline);

            let first = tokio::select! {
                item = rx.recv() => item,
                _ = &mut deadline => None,
            };
            if let Some(item) = first {
                batch.push(item);
            } else if batch.is_empty() {
                continue;
            }

            while batch.len() < self.config.max_batch {
                match rx.try_recv() {
                    Ok(item) => batch.push(item),
                    Err(_) => break,
                }
            }

            if batch.is_empty() {
                continue;
            }

            let mut guard = self.shared.lock();
            let term = guard.current_term;
            let is_leader_and_open = match &guard.role {
                Role::Leader(l) => !l.partition_detected,
                _ => false,
            };

            if !is_leader_and_open {
                for (_, notify) in batch {
                    let _ = notify.send(false);
                }
                continue;
            }

            for (command, notify) in batch {
                let index = guard.log.last_index() + 1;
                guard.log.append(LogEntry {
                    term,
                    index,
                    command,
                    timestamp: now_millis(),
                });
                guard.awaiting_commit.insert(index, AwaitingCommit { notify });
            }
        }
    }
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
