//! MESI-coherent, per-node cache with LRU eviction (SPEC_FULL.md §4.6).
//!
//! Coherence is maintained the usual MESI way: a write invalidates every peer's copy before it
//! takes effect locally, and a read miss either borrows a clean copy from a peer (downgrading that
//! peer's line to `Shared`) or falls through to the backing store. Only `Modified` lines are ever
//! written back -- `Exclusive` and `Shared` lines are, by construction, already consistent with
//! the backing store.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MesiState {
    Modified,
    Exclusive,
    Shared,
    Invalid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheLine {
    pub data: serde_json::Value,
    pub state: MesiState,
    pub last_access: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// What a peer hands back in response to a read-request: a clean copy of the line, downgraded to
/// `Shared` on the responder's side as part of answering.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteLine {
    pub data: serde_json::Value,
    pub state: MesiState,
}

#[async_trait]
pub trait CachePeerTransport: Send + Sync {
    async fn read_request(&self, peer: &str, key: &str) -> Option<RemoteLine>;
    async fn invalidate(&self, peer: &str, key: &str);
}

#[async_trait]
pub trait BackingStore: Send + Sync {
    async fn load(&self, key: &str) -> Option<serde_json::Value>;
    async fn store(&self, key: &str, value: serde_json::Value);
}

/// A plain in-process backing store, used when a node has no durable storage of its own and the
/// cache is the only copy (tests, and single-process demos).
#[derive(Default)]
pub struct InMemoryBackingStore {
    data: Mutex<HashMap<String, serde_json::Value>>,
}

#[async_trait]
impl BackingStore for InMemoryBackingStore {
    async fn load(&self, key: &str) -> Option<serde_json::Value> {
        self.data.lock().get(key).cloned()
    }

    async fn store(&self, key: &str, value: serde_json::Value) {
        self.data.lock().insert(key.to_string(), value);
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    invalidations_sent: AtomicU64,
    invalidations_received: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyStatus {
    pub exists: bool,
    pub state: Option<MesiState>,
    pub last_access: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub node_id: String,
    pub line_count: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub reads: u64,
    pub writes: u64,
    pub invalidations_sent: u64,
    pub invalidations_received: u64,
}

pub struct CacheNode<P, B> {
    node_id: String,
    peers: Vec<String>,
    lines: Mutex<LruCache<String, CacheLine>>,
    backing: Arc<B>,
    peer_transport: Arc<P>,
    counters: Counters,
}

impl<P, B> CacheNode<P, B>
where
    P: CachePeerTransport,
    B: BackingStore,
{
    pub fn new(node_id: impl Into<String>, peers: Vec<String>, capacity: usize, backing: Arc<B>, peer_transport: Arc<P>) -> Arc<Self> {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Arc::new(Self {
            node_id: node_id.into(),
            peers,
            lines: Mutex::new(LruCache::new(capacity)),
            backing,
            peer_transport,
            counters: Counters::default(),
        })
    }

    /// Reads `key`: a hit on a non-`Invalid` local line, a borrow from a peer (which downgrades
    /// that peer to `Shared`), or a load from the backing store.
    pub async fn read(&self, key: &str) -> serde_json::Value {
        self.counters.reads.fetch_add(1, Ordering::Relaxed);

        if let Some(data) = self.try_local_hit(key) {
            return data;
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let mut borrowed_from_peer = false;
        let data = match self.fetch_from_peers(key).await {
            Some(data) => {
                borrowed_from_peer = true;
                data
            }
            None => self.backing.load(key).await.unwrap_or(serde_json::Value::Null),
        };

        let state = if borrowed_from_peer {
            MesiState::Shared
        } else {
            MesiState::Exclusive
        };
        self.insert_line(key, data.clone(), state).await;
        data
    }

    fn try_local_hit(&self, key: &str) -> Option<serde_json::Value> {
        let mut lines = self.lines.lock();
        let line = lines.get_mut(key)?;
        if line.state == MesiState::Invalid {
            return None;
        }
        line.last_access = Utc::now();
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        Some(line.data.clone())
    }

    /// Broadcasts `read-request{key}` to every peer in parallel (SPEC_FULL.md §4.6, §5: "one
    /// concurrent call per peer per broadcast") and takes the first peer that has the data,
    /// in peer-list order among those that replied.
    async fn fetch_from_peers(&self, key: &str) -> Option<serde_json::Value> {
        let requests = self
            .peers
            .iter()
            .map(|peer| self.peer_transport.read_request(peer, key));
        let replies = futures::future::join_all(requests).await;
        replies.into_iter().flatten().next().map(|remote| remote.data)
    }

    /// Writes `key`, invalidating every peer's copy first so no stale `Shared`/`Exclusive` line
    /// can survive the write (SPEC_FULL.md §4.6: "invalidate-before-write"). Invalidations are
    /// broadcast in parallel (§5) rather than one peer at a time, so one slow or unreachable peer
    /// can't stall the write by the full per-call transport timeout.
    pub async fn write(&self, key: &str, value: serde_json::Value) {
        self.counters.writes.fetch_add(1, Ordering::Relaxed);

        self.counters
            .invalidations_sent
            .fetch_add(self.peers.len() as u64, Ordering::Relaxed);
        let invalidations = self.peers.iter().map(|peer| self.peer_transport.invalidate(peer, key));
        futures::future::join_all(invalidations).await;

        self.insert_line(key, value, MesiState::Modified).await;
    }

    async fn insert_line(&self, key: &str, data: serde_json::Value, state: MesiState) {
        let now = Utc::now();
        let line = CacheLine {
            data,
            state,
            last_access: now,
            created_at: now,
        };

        let evicted = self.lines.lock().push(key.to_string(), line);
        if let Some((evicted_key, evicted_line)) = evicted {
            if evicted_key != key {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                if evicted_line.state == MesiState::Modified {
                    self.backing.store(&evicted_key, evicted_line.data).await;
                }
            }
        }
    }

    /// Remote handler for a peer's read-request: hands back a clean copy and downgrades this
    /// node's line to `Shared`, writing back first if it was `Modified`.
    pub async fn handle_read_request(&self, key: &str) -> Option<RemoteLine> {
        let (data, needs_writeback) = {
            let mut lines = self.lines.lock();
            let line = lines.get_mut(key)?;
            if line.state == MesiState::Invalid {
                return None;
            }
            let needs_writeback = line.state == MesiState::Modified;
            line.state = MesiState::Shared;
            (line.data.clone(), needs_writeback)
        };

        if needs_writeback {
            self.backing.store(key, data.clone()).await;
        }

        Some(RemoteLine {
            data,
            state: MesiState::Shared,
        })
    }

    /// Remote handler for a peer's `status{key}` query: reports local presence and state without
    /// touching coherence (SPEC_FULL.md §4.6).
    pub fn handle_status(&self, key: &str) -> KeyStatus {
        match self.lines.lock().peek(key) {
            Some(line) => KeyStatus {
                exists: true,
                state: Some(line.state),
                last_access: Some(line.last_access),
            },
            None => KeyStatus {
                exists: false,
                state: None,
                last_access: None,
            },
        }
    }

    /// Remote handler for a peer's invalidate broadcast.
    pub async fn handle_invalidate(&self, key: &str) {
        self.counters.invalidations_received.fetch_add(1, Ordering::Relaxed);
        let mut lines = self.lines.lock();
        if let Some(line) = lines.get_mut(key) {
            line.state = MesiState::Invalid;
        }
    }

    pub fn status(&self) -> CacheStatus {
        CacheStatus {
            node_id: self.node_id.clone(),
            line_count: self.lines.lock().len(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            reads: self.counters.reads.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            invalidations_sent: self.counters.invalidations_sent.load(Ordering::Relaxed),
            invalidations_received: self.counters.invalidations_received.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    pub(crate) fn line_state(&self, key: &str) -> Option<MesiState> {
        self.lines.lock().peek(key).map(|l| l.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoPeers;

    #[async_trait]
    impl CachePeerTransport for NoPeers {
        async fn read_request(&self, _peer: &str, _key: &str) -> Option<RemoteLine> {
            None
        }
        async fn invalidate(&self, _peer: &str, _key: &str) {}
    }

    #[tokio::test]
    async fn miss_then_hit_goes_exclusive() {
        let backing = Arc::new(InMemoryBackingStore::default());
        backing.store("k", serde_json::json!(1)).await;
        let node = CacheNode::new("n0", vec![], 10, backing, Arc::new(NoPeers));

        let v = node.read("k").await;
        assert_eq!(v, serde_json::json!(1));
        assert_eq!(node.line_state("k"), Some(MesiState::Exclusive));

        let v2 = node.read("k").await;
        assert_eq!(v2, serde_json::json!(1));
        assert_eq!(node.status().hits, 1);
        assert_eq!(node.status().misses, 1);
    }

    #[tokio::test]
    async fn write_goes_modified_and_evicts_with_writeback() {
        let backing = Arc::new(InMemoryBackingStore::default());
        let node = CacheNode::new("n0", vec![], 1, Arc::clone(&backing), Arc::new(NoPeers));

        node.write("a", serde_json::json!("first")).await;
        assert_eq!(node.line_state("a"), Some(MesiState::Modified));

        node.write("b", serde_json::json!("second")).await;
        assert_eq!(node.line_state("b"), Some(MesiState::Modified));
        assert_eq!(node.status().evictions, 1);
        assert_eq!(backing.load("a").await, Some(serde_json::json!("first")));
    }

    #[tokio::test]
    async fn invalidate_forces_a_miss_on_next_read() {
        let backing = Arc::new(InMemoryBackingStore::default());
        backing.store("k", serde_json::json!(42)).await;
        let node = CacheNode::new("n0", vec![], 10, backing, Arc::new(NoPeers));

        node.read("k").await;
        node.handle_invalidate("k").await;
        assert_eq!(node.line_state("k"), Some(MesiState::Invalid));

        let v = node.read("k").await;
        assert_eq!(v, serde_json::json!(42));
        assert_eq!(node.status().misses, 2);
    }
}
