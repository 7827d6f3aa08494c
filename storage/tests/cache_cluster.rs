//! Multi-node MESI coherence tests, using a loopback peer transport (same pattern as
//! `lock_cluster.rs`'s loopback Raft transport: dispatch straight to the peer's handler, no
//! socket).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use storage::cache::{CachePeerTransport, RemoteLine};
use storage::{CacheNode, InMemoryBackingStore, MesiState};

struct LoopbackTransport {
    nodes: Mutex<HashMap<String, Arc<CacheNode<LoopbackTransport, InMemoryBackingStore>>>>,
}

impl LoopbackTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: Mutex::new(HashMap::new()),
        })
    }

    fn register(&self, id: String, node: Arc<CacheNode<LoopbackTransport, InMemoryBackingStore>>) {
        self.nodes.lock().insert(id, node);
    }
}

#[async_trait]
impl CachePeerTransport for LoopbackTransport {
    async fn read_request(&self, peer: &str, key: &str) -> Option<RemoteLine> {
        let node = self.nodes.lock().get(peer).cloned()?;
        node.handle_read_request(key).await
    }

    async fn invalidate(&self, peer: &str, key: &str) {
        if let Some(node) = self.nodes.lock().get(peer).cloned() {
            node.handle_invalidate(key).await;
        }
    }
}

fn build_cluster(ids: &[&str]) -> (Arc<LoopbackTransport>, Vec<Arc<CacheNode<LoopbackTransport, InMemoryBackingStore>>>) {
    let transport = LoopbackTransport::new();
    let mut nodes = Vec::new();
    for id in ids {
        let peers = ids.iter().filter(|o| *o != id).map(|s| s.to_string()).collect();
        let backing = Arc::new(InMemoryBackingStore::default());
        let node = CacheNode::new(id.to_string(), peers, 16, backing, Arc::clone(&transport));
        transport.register(id.to_string(), Arc::clone(&node));
        nodes.push(node);
    }
    (transport, nodes)
}

#[tokio::test]
async fn a_write_on_one_node_invalidates_a_shared_copy_on_another() {
    let (_transport, nodes) = build_cluster(&["n0", "n1"]);
    let (n0, n1) = (&nodes[0], &nodes[1]);

    n0.write("k", json!("first")).await;
    assert_eq!(n0.handle_status("k").state, Some(MesiState::Modified));

    // n1 reads, borrowing the line from n0 (which writes back and downgrades to Shared).
    let read = n1.read("k").await;
    assert_eq!(read, json!("first"));
    assert_eq!(n1.handle_status("k").state, Some(MesiState::Shared));
    assert_eq!(n0.handle_status("k").state, Some(MesiState::Shared));

    // n0 writes again: n1's Shared copy must be invalidated before n0's write lands.
    n0.write("k", json!("second")).await;
    assert_eq!(n1.handle_status("k").state, Some(MesiState::Invalid));

    // n1 reading now must not see the stale value from its invalidated line.
    let read = n1.read("k").await;
    assert_eq!(read, json!("second"));
}

#[tokio::test]
async fn three_nodes_sharing_a_line_all_get_invalidated_on_write() {
    let (_transport, nodes) = build_cluster(&["n0", "n1", "n2"]);
    let (n0, n1, n2) = (&nodes[0], &nodes[1], &nodes[2]);

    n0.write("k", json!(1)).await;
    n1.read("k").await;
    n2.read("k").await;
    assert_eq!(n1.handle_status("k").state, Some(MesiState::Shared));
    assert_eq!(n2.handle_status("k").state, Some(MesiState::Shared));

    n1.write("k", json!(2)).await;
    assert_eq!(n0.handle_status("k").state, Some(MesiState::Invalid));
    assert_eq!(n2.handle_status("k").state, Some(MesiState::Invalid));
    assert_eq!(n1.handle_status("k").state, Some(MesiState::Modified));
}

#[tokio::test]
async fn a_miss_on_every_node_falls_through_to_the_backing_store() {
    let (_transport, nodes) = build_cluster(&["n0", "n1"]);
    let value = nodes[1].read("never-written").await;
    assert_eq!(value, serde_json::Value::Null);
}
