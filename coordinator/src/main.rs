//! Process bootstrap: load configuration, build the cluster's cores, wire up logging, and serve
//! the HTTP facades. Everything here is ambient connective tissue (SPEC_FULL.md §1) around the
//! three cores in `storage` and `raft` -- the cores themselves never depend on this binary.

mod config;
mod errors;
mod facade;
mod failure_detector;
mod transport;

use std::sync::Arc;

use raft::RaftConfig;
use storage::{CacheNode, ConsistentHashRing, InMemoryBackingStore, LockStateMachine, QueueShard};

use crate::config::ClusterConfig;
use crate::errors::CoreError;
use crate::facade::AppState;
use crate::transport::PeerTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = ClusterConfig::from_env().map_err(|err| {
        let err = CoreError::from(err);
        tracing::error!(%err, "configuration error, refusing to start");
        err
    })?;

    tracing::info!(node_id = %config.node_id, peers = ?config.peer_ids(), "starting node");

    let transport = Arc::new(PeerTransport::new(config.node_id.clone(), &config.peers));
    let failure_detector = Arc::new(failure_detector::FailureDetectorRegistry::new(&config.peer_ids()));

    let lock = LockStateMachine::new(
        config.node_id.clone(),
        config.peer_ids(),
        RaftConfig::default(),
        Arc::clone(&transport),
    );
    lock.spawn();

    let mut ring_members = config.peer_ids();
    ring_members.push(config.node_id.clone());
    let ring = ConsistentHashRing::new(ring_members);

    let wal_path = std::path::PathBuf::from("logs").join(format!("{}_queue.log", config.node_id));
    let queue = QueueShard::new(config.node_id.clone(), wal_path, false)
        .await
        .map_err(|err| {
            let err = CoreError::RecoveryError(err.to_string());
            tracing::error!(%err, "wal recovery failed, refusing to start");
            err
        })?;
    queue.spawn_background_tasks();

    let backing = Arc::new(InMemoryBackingStore::default());
    let cache = CacheNode::new(
        config.node_id.clone(),
        config.peer_ids(),
        config.cache_capacity,
        backing,
        Arc::clone(&transport),
    );

    let state = Arc::new(AppState {
        node_id: config.node_id.clone(),
        lock,
        queue,
        cache,
        ring,
        transport,
        failure_detector,
    });

    let router = facade::build_router(state);
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
