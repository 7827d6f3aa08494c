//! Replicated and per-node state machines for the cluster: the distributed lock (replicated via
//! [`raft`]), the partitioned WAL-backed queue, and the MESI cache.

pub mod cache;
pub mod lock;
pub mod queue;
pub mod ring;
pub mod wal;

pub use cache::{BackingStore, CacheNode, CachePeerTransport, CacheStatus, InMemoryBackingStore, KeyStatus, MesiState, RemoteLine};
pub use lock::{AcquireOutcome, LockCommand, LockMode, LockRequest, LockStateMachine, ReleaseOutcome};
pub use queue::{InFlightMessage, Message, QueueError, QueueShard};
pub use ring::ConsistentHashRing;
pub use wal::{Wal, WalError};
