//! In-process cluster tests exercising leader election and command replication end to end,
//! using a loopback transport that dispatches directly to the other nodes' RPC handlers instead
//! of going over a socket.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use raft::{
    AppendEntriesRequest, AppendEntriesResponse, Applier, RaftConfig, RaftNode, RaftTransport,
    RequestVoteRequest, RequestVoteResponse,
};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
struct TestCommand(String);

#[derive(Default)]
struct RecordingApplier {
    applied: Mutex<Vec<String>>,
}

#[async_trait]
impl Applier<TestCommand> for RecordingApplier {
    async fn apply(&self, command: &TestCommand) {
        self.applied.lock().push(command.0.clone());
    }
}

type Node = RaftNode<TestCommand, LoopbackTransport, RecordingApplier>;

struct LoopbackTransport {
    nodes: Mutex<HashMap<String, Arc<Node>>>,
}

impl LoopbackTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: Mutex::new(HashMap::new()),
        })
    }

    fn register(&self, id: String, node: Arc<Node>) {
        self.nodes.lock().insert(id, node);
    }
}

#[async_trait]
impl RaftTransport<TestCommand> for LoopbackTransport {
    async fn request_vote(
        &self,
        peer: &str,
        request: RequestVoteRequest,
    ) -> Option<RequestVoteResponse> {
        let node = self.nodes.lock().get(peer).cloned()?;
        Some(node.handle_request_vote(request).await)
    }

    async fn append_entries(
        &self,
        peer: &str,
        request: AppendEntriesRequest<TestCommand>,
    ) -> Option<AppendEntriesResponse> {
        let node = self.nodes.lock().get(peer).cloned()?;
        Some(node.handle_append_entries(request).await)
    }
}

fn build_cluster(ids: &[&str]) -> (Arc<LoopbackTransport>, Vec<Arc<Node>>) {
    let transport = LoopbackTransport::new();
    let mut nodes = Vec::new();
    for id in ids {
        let peers = ids
            .iter()
            .filter(|other| *other != id)
            .map(|s| s.to_string())
            .collect();
        let applier = Arc::new(RecordingApplier::default());
        let node = Node::new(
            id.to_string(),
            peers,
            RaftConfig {
                election_timeout_min: Duration::from_millis(60),
                election_timeout_max: Duration::from_millis(120),
                ..RaftConfig::default()
            },
            Arc::clone(&transport),
            applier,
        );
        transport.register(id.to_string(), Arc::clone(&node));
        nodes.push(node);
    }
    (transport, nodes)
}

#[tokio::test(flavor = "multi_thread")]
async fn elects_exactly_one_leader() {
    let (_transport, nodes) = build_cluster(&["n0", "n1", "n2"]);
    for node in &nodes {
        node.spawn();
    }

    tokio::time::sleep(Duration::from_millis(500)).await;

    let leaders: Vec<_> = nodes.iter().filter(|n| n.is_leader()).collect();
    assert_eq!(leaders.len(), 1, "expected exactly one leader to emerge");
    assert!(nodes.iter().all(|n| n.current_term().0 >= 1));

    for node in &nodes {
        node.shutdown();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn replicated_command_reaches_every_node() {
    let (_transport, nodes) = build_cluster(&["n0", "n1", "n2"]);
    for node in &nodes {
        node.spawn();
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    let leader = nodes
        .iter()
        .find(|n| n.is_leader())
        .expect("a leader must have emerged");

    let committed = leader
        .replicate(TestCommand("hello".to_string()))
        .await
        .expect("replication should succeed while the cluster is healthy");
    assert!(committed);

    // Give followers a couple of heartbeat rounds to apply the committed entry.
    tokio::time::sleep(Duration::from_millis(200)).await;

    for node in &nodes {
        node.shutdown();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn follower_rejects_client_commands() {
    let (_transport, nodes) = build_cluster(&["n0", "n1", "n2"]);
    for node in &nodes {
        node.spawn();
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    let follower = nodes.iter().find(|n| !n.is_leader()).expect("at least one follower");
    let result = follower.replicate(TestCommand("nope".to_string())).await;
    assert!(result.is_err());

    for node in &nodes {
        node.shutdown();
    }
}
