//! In-process cluster tests for the lock state machine, using a loopback Raft transport (same
//! pattern as `raft`'s own election tests: dispatch straight to the peer's handler, no socket).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use raft::{AppendEntriesRequest, AppendEntriesResponse, RaftConfig, RaftTransport, RequestVoteRequest, RequestVoteResponse};
use storage::{AcquireOutcome, LockCommand, LockMode, LockStateMachine, ReleaseOutcome};

struct LoopbackTransport {
    nodes: Mutex<HashMap<String, Arc<LockStateMachine<LoopbackTransport>>>>,
}

impl LoopbackTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: Mutex::new(HashMap::new()),
        })
    }

    fn register(&self, id: String, node: Arc<LockStateMachine<LoopbackTransport>>) {
        self.nodes.lock().insert(id, node);
    }
}

#[async_trait]
impl RaftTransport<LockCommand> for LoopbackTransport {
    async fn request_vote(&self, peer: &str, request: RequestVoteRequest) -> Option<RequestVoteResponse> {
        let node = self.nodes.lock().get(peer).cloned()?;
        Some(node.raft().handle_request_vote(request).await)
    }

    async fn append_entries(
        &self,
        peer: &str,
        request: AppendEntriesRequest<LockCommand>,
    ) -> Option<AppendEntriesResponse> {
        let node = self.nodes.lock().get(peer).cloned()?;
        Some(node.raft().handle_append_entries(request).await)
    }
}

fn build_cluster(ids: &[&str]) -> (Arc<LoopbackTransport>, Vec<Arc<LockStateMachine<LoopbackTransport>>>) {
    let transport = LoopbackTransport::new();
    let mut nodes = Vec::new();
    for id in ids {
        let peers = ids.iter().filter(|o| *o != id).map(|s| s.to_string()).collect();
        let node = LockStateMachine::new(
            id.to_string(),
            peers,
            RaftConfig {
                election_timeout_min: Duration::from_millis(60),
                election_timeout_max: Duration::from_millis(120),
                ..RaftConfig::default()
            },
            Arc::clone(&transport),
        );
        transport.register(id.to_string(), Arc::clone(&node));
        nodes.push(node);
    }
    (transport, nodes)
}

async fn await_leader(nodes: &[Arc<LockStateMachine<LoopbackTransport>>]) -> Arc<LockStateMachine<LoopbackTransport>> {
    tokio::time::sleep(Duration::from_millis(400)).await;
    nodes
        .iter()
        .find(|n| n.raft().is_leader())
        .cloned()
        .expect("a leader must have emerged")
}

#[tokio::test(flavor = "multi_thread")]
async fn exclusive_lock_is_granted_then_conflicting_request_queues() {
    let (_transport, nodes) = build_cluster(&["n0", "n1", "n2"]);
    for node in &nodes {
        node.spawn();
    }
    let leader = await_leader(&nodes).await;

    let granted = leader.acquire("res-a", LockMode::Exclusive, "client-1", None).await;
    assert!(matches!(granted, AcquireOutcome::Granted { .. }));

    let queued = leader.acquire("res-a", LockMode::Exclusive, "client-2", None).await;
    assert!(matches!(queued, AcquireOutcome::Queued { position: 1 }));
    assert_eq!(leader.holders_of("res-a"), vec!["client-1".to_string()]);

    for node in &nodes {
        node.raft().shutdown();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn releasing_a_lock_grants_the_next_waiter() {
    let (_transport, nodes) = build_cluster(&["n0", "n1", "n2"]);
    for node in &nodes {
        node.spawn();
    }
    let leader = await_leader(&nodes).await;

    leader.acquire("res-b", LockMode::Exclusive, "client-1", None).await;
    leader.acquire("res-b", LockMode::Exclusive, "client-2", None).await;

    let released = leader.release("res-b", "client-1").await;
    assert_eq!(released, ReleaseOutcome::Released);

    // The drain happens synchronously as part of release(), so client-2 should now hold it.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(leader.holders_of("res-b"), vec!["client-2".to_string()]);
    assert_eq!(leader.waiting_count(), 0);

    for node in &nodes {
        node.raft().shutdown();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn shared_locks_are_compatible_with_each_other() {
    let (_transport, nodes) = build_cluster(&["n0", "n1", "n2"]);
    for node in &nodes {
        node.spawn();
    }
    let leader = await_leader(&nodes).await;

    let first = leader.acquire("res-c", LockMode::Shared, "reader-1", None).await;
    let second = leader.acquire("res-c", LockMode::Shared, "reader-2", None).await;
    assert!(matches!(first, AcquireOutcome::Granted { .. }));
    assert!(matches!(second, AcquireOutcome::Granted { .. }));

    let mut holders = leader.holders_of("res-c");
    holders.sort();
    assert_eq!(holders, vec!["reader-1".to_string(), "reader-2".to_string()]);

    for node in &nodes {
        node.raft().shutdown();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn follower_cannot_acquire_or_release() {
    let (_transport, nodes) = build_cluster(&["n0", "n1", "n2"]);
    for node in &nodes {
        node.spawn();
    }
    tokio::time::sleep(Duration::from_millis(400)).await;

    let follower = nodes
        .iter()
        .find(|n| !n.raft().is_leader())
        .expect("at least one follower");

    let result = follower.acquire("res-d", LockMode::Exclusive, "client-1", None).await;
    assert!(matches!(result, AcquireOutcome::NotLeader { .. }));

    let result = follower.release("res-d", "client-1").await;
    assert!(matches!(result, ReleaseOutcome::NotLeader { .. }));

    for node in &nodes {
        node.raft().shutdown();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn deadlock_cycle_is_broken_by_aborting_the_youngest_waiter() {
    let (_transport, nodes) = build_cluster(&["n0", "n1", "n2"]);
    for node in &nodes {
        node.spawn();
    }
    let leader = await_leader(&nodes).await;

    // client-a holds res-1 and waits on res-2; client-b holds res-2 and waits on res-1: a cycle.
    leader.acquire("res-1", LockMode::Exclusive, "client-a", None).await;
    leader.acquire("res-2", LockMode::Exclusive, "client-b", None).await;

    let queued_a = leader.acquire("res-2", LockMode::Exclusive, "client-a", None).await;
    assert!(matches!(queued_a, AcquireOutcome::Queued { .. }));
    tokio::time::sleep(Duration::from_millis(20)).await;
    let queued_b = leader.acquire("res-1", LockMode::Exclusive, "client-b", None).await;
    assert!(matches!(queued_b, AcquireOutcome::Queued { .. }));

    let resolved = leader.resolve_deadlocks_once();
    assert_eq!(resolved, 1);
    assert_eq!(leader.deadlock_count(), 1);
    // One of the two waiters (the younger one) was aborted, breaking the cycle.
    assert_eq!(leader.waiting_count(), 1);

    for node in &nodes {
        node.raft().shutdown();
    }
}
