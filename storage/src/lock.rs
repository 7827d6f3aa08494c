//! The distributed lock state machine, layered on [`raft::RaftNode`] (SPEC_FULL.md §4.4).
//!
//! Two kinds of state live here, deliberately not treated the same way:
//!
//! - `locks` (who holds what) is replicated: every node applies committed `LockCommand`s in
//!   commit order, so it is consistent cluster-wide and survives a leadership change.
//! - `wait_queue`, `timeouts`, and the wait-for graph derived from them are **leader-only** and
//!   live only in memory. SPEC_FULL.md §9 resolves the "replication of lock timeouts" open
//!   question as (a): this is an accepted limitation, not an oversight -- a leader change drops
//!   queued waiters and pending deadlines, exactly as in the source. Encoding that as two
//!   separate mutex-guarded structs makes the limitation visible in the type signatures rather
//!   than a comment someone can miss.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use raft::{Applier, RaftConfig, RaftNode, RaftTransport};

pub const DEADLOCK_DETECTION_INTERVAL: Duration = Duration::from_secs(5);
pub const TIMEOUT_REAPER_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockRequest {
    pub resource: String,
    pub mode: LockMode,
    pub client_id: String,
    pub requested_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "operation")]
pub enum LockCommand {
    #[serde(rename = "acquire_lock")]
    AcquireLock { request: LockRequest },
    #[serde(rename = "release_lock")]
    ReleaseLock { resource: String, client_id: String },
}

pub struct LockEntry {
    pub mode: LockMode,
    pub holders: HashSet<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AcquireOutcome {
    Granted { lock_id: String },
    Queued { position: usize },
    NotLeader { leader: Option<String> },
    Partition,
    ReplicationFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReleaseOutcome {
    Released,
    NotLeader { leader: Option<String> },
    NotHolder,
    ReplicationFailed,
}

/// The replicated half of lock state: applied identically, in commit order, on every node.
#[derive(Default)]
struct ReplicatedLocks {
    locks: HashMap<String, LockEntry>,
}

impl ReplicatedLocks {
    fn can_acquire(&self, resource: &str, mode: LockMode, client: &str) -> bool {
        match self.locks.get(resource) {
            None => true,
            Some(entry) if entry.holders.contains(client) => true,
            Some(entry) => mode == LockMode::Shared && entry.mode == LockMode::Shared,
        }
    }

    fn apply_acquire(&mut self, request: &LockRequest) {
        let entry = self
            .locks
            .entry(request.resource.clone())
            .or_insert_with(|| LockEntry {
                mode: request.mode,
                holders: HashSet::new(),
                timestamp: request.requested_at,
            });
        entry.holders.insert(request.client_id.clone());
    }

    /// Returns `true` if the resource's holder set became empty (the caller must then drain the
    /// leader-side wait queue).
    fn apply_release(&mut self, resource: &str, client: &str) -> bool {
        let Some(entry) = self.locks.get_mut(resource) else {
            return false;
        };
        entry.holders.remove(client);
        if entry.holders.is_empty() {
            self.locks.remove(resource);
            true
        } else {
            false
        }
    }
}

/// Leader-only bookkeeping: fair wait queues, absolute lock deadlines, and the deadlock metric.
/// Never touched by [`LockApplier`] -- only by [`LockStateMachine`]'s client-facing calls and its
/// two leader-only background tasks.
#[derive(Default)]
struct LeaderSide {
    wait_queue: HashMap<String, VecDeque<LockRequest>>,
    timeouts: HashMap<String, HashMap<String, DateTime<Utc>>>,
    deadlock_count: u64,
}

struct LockApplier {
    replicated: Arc<Mutex<ReplicatedLocks>>,
}

#[async_trait]
impl Applier<LockCommand> for LockApplier {
    async fn apply(&self, command: &LockCommand) {
        match command {
            LockCommand::AcquireLock { request } => {
                self.replicated.lock().apply_acquire(request);
            }
            LockCommand::ReleaseLock { resource, client_id } => {
                self.replicated.lock().apply_release(resource, client_id);
            }
        }
    }
}

pub struct LockStateMachine<T> {
    raft: Arc<RaftNode<LockCommand, T, LockApplier>>,
    replicated: Arc<Mutex<ReplicatedLocks>>,
    leader_side: Mutex<LeaderSide>,
}

impl<T> LockStateMachine<T>
where
    T: RaftTransport<LockCommand> + Send + Sync + 'static,
{
    pub fn new(
        node_id: impl Into<String>,
        peers: Vec<String>,
        config: RaftConfig,
        transport: Arc<T>,
    ) -> Arc<Self> {
        let replicated = Arc::new(Mutex::new(ReplicatedLocks::default()));
        let applier = Arc::new(LockApplier {
            replicated: Arc::clone(&replicated),
        });
        let raft = RaftNode::new(node_id, peers, config, transport, applier);

        Arc::new(Self {
            raft,
            replicated,
            leader_side: Mutex::new(LeaderSide::default()),
        })
    }

    pub fn raft(&self) -> &Arc<RaftNode<LockCommand, T, LockApplier>> {
        &self.raft
    }

    pub fn spawn(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = self.raft.spawn();
        handles.push(tokio::spawn(Arc::clone(self).run_deadlock_detector()));
        handles.push(tokio::spawn(Arc::clone(self).run_timeout_reaper()));
        handles
    }

    pub async fn acquire(
        &self,
        resource: &str,
        mode: LockMode,
        client: &str,
        timeout_seconds: Option<f64>,
    ) -> AcquireOutcome {
        if !self.raft.is_leader() {
            return AcquireOutcome::NotLeader {
                leader: self.raft.current_leader_hint(),
            };
        }
        if self.raft.partition_detected() {
            return AcquireOutcome::Partition;
        }

        let now = Utc::now();
        let request = LockRequest {
            resource: resource.to_string(),
            mode,
            client_id: client.to_string(),
            requested_at: now,
            deadline: timeout_seconds
                .map(|secs| now + chrono::Duration::milliseconds((secs * 1000.0) as i64)),
        };

        let can_acquire = self.replicated.lock().can_acquire(resource, mode, client);

        if can_acquire {
            match self
                .raft
                .replicate(LockCommand::AcquireLock {
                    request: request.clone(),
                })
                .await
            {
                Ok(true) => {
                    if let Some(deadline) = request.deadline {
                        self.leader_side
                            .lock()
                            .timeouts
                            .entry(resource.to_string())
                            .or_default()
                            .insert(client.to_string(), deadline);
                    }
                    AcquireOutcome::Granted {
                        lock_id: format!("{resource}:{client}"),
                    }
                }
                _ => AcquireOutcome::ReplicationFailed,
            }
        } else {
            let mut leader_side = self.leader_side.lock();
            let queue = leader_side.wait_queue.entry(resource.to_string()).or_default();
            queue.push_back(request);
            AcquireOutcome::Queued {
                position: queue.len(),
            }
        }
    }

    pub async fn release(&self, resource: &str, client: &str) -> ReleaseOutcome {
        if !self.raft.is_leader() {
            return ReleaseOutcome::NotLeader {
                leader: self.raft.current_leader_hint(),
            };
        }

        let holds_lock = self
            .replicated
            .lock()
            .locks
            .get(resource)
            .map(|e| e.holders.contains(client))
            .unwrap_or(false);
        if !holds_lock {
            return ReleaseOutcome::NotHolder;
        }

        match self
            .raft
            .replicate(LockCommand::ReleaseLock {
                resource: resource.to_string(),
                client_id: client.to_string(),
            })
            .await
        {
            Ok(true) => {
                self.leader_side
                    .lock()
                    .timeouts
                    .get_mut(resource)
                    .map(|m| m.remove(client));
                self.drain_wait_queue(resource).await;
                ReleaseOutcome::Released
            }
            _ => ReleaseOutcome::ReplicationFailed,
        }
    }

    /// Grants contiguous compatible waiters after a release, stopping at the first exclusive
    /// grant (SPEC_FULL.md §4.4: "a Shared request may grant-through ... but never jump past an
    /// Exclusive request ahead of it").
    async fn drain_wait_queue(&self, resource: &str) {
        loop {
            let next = {
                let mut leader_side = self.leader_side.lock();
                let Some(queue) = leader_side.wait_queue.get_mut(resource) else {
                    return;
                };
                let Some(front) = queue.front() else {
                    return;
                };
                let can_acquire = self
                    .replicated
                    .lock()
                    .can_acquire(resource, front.mode, &front.client_id);
                if !can_acquire {
                    return;
                }
                queue.pop_front()
            };
            let Some(request) = next else { return };
            let is_exclusive = request.mode == LockMode::Exclusive;

            let _ = self
                .raft
                .replicate(LockCommand::AcquireLock { request })
                .await;

            if is_exclusive {
                return;
            }
        }
    }

    pub fn active_lock_count(&self) -> usize {
        self.replicated.lock().locks.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.leader_side
            .lock()
            .wait_queue
            .values()
            .map(VecDeque::len)
            .sum()
    }

    pub fn deadlock_count(&self) -> u64 {
        self.leader_side.lock().deadlock_count
    }

    pub fn holders_of(&self, resource: &str) -> Vec<String> {
        self.replicated
            .lock()
            .locks
            .get(resource)
            .map(|e| e.holders.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Builds the wait-for graph on demand (client -> set of clients it waits on), per
    /// SPEC_FULL.md §9: it is a derived index, never maintained transactionally.
    fn wait_for_graph(leader_side: &LeaderSide, replicated: &ReplicatedLocks) -> HashMap<String, HashSet<String>> {
        let mut graph: HashMap<String, HashSet<String>> = HashMap::new();
        for (resource, queue) in &leader_side.wait_queue {
            let Some(entry) = replicated.locks.get(resource) else {
                continue;
            };
            for waiter in queue {
                graph
                    .entry(waiter.client_id.clone())
                    .or_default()
                    .extend(entry.holders.iter().cloned());
            }
        }
        graph
    }

    /// Iterative DFS with on-stack marking, detecting cycles of length >= 2 in the wait-for
    /// graph.
    fn detect_cycles(graph: &HashMap<String, HashSet<String>>) -> Vec<Vec<String>> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut cycles = Vec::new();

        for start in graph.keys() {
            if visited.contains(start) {
                continue;
            }
            let mut path: Vec<String> = Vec::new();
            let mut on_stack: HashSet<String> = HashSet::new();
            let mut stack: Vec<(String, std::vec::IntoIter<String>)> = Vec::new();

            let neighbors: Vec<String> = graph.get(start).cloned().unwrap_or_default().into_iter().collect();
            path.push(start.clone());
            on_stack.insert(start.clone());
            stack.push((start.clone(), neighbors.into_iter()));

            while let Some((node, iter)) = stack.last_mut() {
                let node = node.clone();
                if let Some(neighbor) = iter.next() {
                    if on_stack.contains(&neighbor) {
                        let cycle_start = path.iter().position(|n| n == &neighbor).unwrap();
                        cycles.push(path[cycle_start..].to_vec());
                    } else if !visited.contains(&neighbor) {
                        let next_neighbors: Vec<String> =
                            graph.get(&neighbor).cloned().unwrap_or_default().into_iter().collect();
                        path.push(neighbor.clone());
                        on_stack.insert(neighbor.clone());
                        stack.push((neighbor, next_neighbors.into_iter()));
                    }
                } else {
                    on_stack.remove(&node);
                    visited.insert(node);
                    path.pop();
                    stack.pop();
                }
            }
        }

        cycles
    }

    /// Youngest-waits-longest: the victim is the cycle member whose earliest wait-queue entry has
    /// the latest `requested_at`.
    fn pick_victim(leader_side: &LeaderSide, cycle: &[String]) -> Option<String> {
        let mut victim = None;
        let mut latest: Option<DateTime<Utc>> = None;
        for queue in leader_side.wait_queue.values() {
            for waiter in queue {
                if cycle.contains(&waiter.client_id)
                    && latest.map(|l| waiter.requested_at > l).unwrap_or(true)
                {
                    latest = Some(waiter.requested_at);
                    victim = Some(waiter.client_id.clone());
                }
            }
        }
        victim
    }

    /// Runs one round of cycle detection and victim abort over the current wait-for graph.
    /// Split out of the periodic task so an operator tool (or a test) can trigger a pass directly
    /// rather than waiting for the next 5s tick.
    pub fn resolve_deadlocks_once(&self) -> usize {
        if !self.raft.is_leader() {
            return 0;
        }

        let mut leader_side = self.leader_side.lock();
        let graph = Self::wait_for_graph(&leader_side, &self.replicated.lock());
        let cycles = Self::detect_cycles(&graph);
        let resolved = cycles.len();

        for cycle in &cycles {
            let Some(victim) = Self::pick_victim(&leader_side, cycle) else {
                continue;
            };
            for queue in leader_side.wait_queue.values_mut() {
                queue.retain(|r| r.client_id != victim);
            }
            leader_side.deadlock_count += 1;
            tracing::warn!(victim = %victim, cycle = ?cycle, "deadlock resolved, victim aborted");
        }

        resolved
    }

    async fn run_deadlock_detector(self: Arc<Self>) {
        let mut interval = tokio::time::interval(DEADLOCK_DETECTION_INTERVAL);
        loop {
            interval.tick().await;
            self.resolve_deadlocks_once();
        }
    }

    async fn run_timeout_reaper(self: Arc<Self>) {
        let mut interval = tokio::time::interval(TIMEOUT_REAPER_INTERVAL);
        loop {
            interval.tick().await;
            if !self.raft.is_leader() {
                continue;
            }

            let now = Utc::now();
            let expired: Vec<(String, String)> = {
                let leader_side = self.leader_side.lock();
                leader_side
                    .timeouts
                    .iter()
                    .flat_map(|(resource, clients)| {
                        clients
                            .iter()
                            .filter(|(_, deadline)| **deadline < now)
                            .map(move |(client, _)| (resource.clone(), client.clone()))
                    })
                    .collect()
            };

            for (resource, client) in expired {
                tracing::info!(%resource, %client, "lock lease expired, releasing");
                let _ = self.release(&resource, &client).await;
            }
        }
    }
}
