//! Environment-driven node/cluster configuration (SPEC_FULL.md §4.8 / §6.1).
//!
//! Fails closed: a missing or malformed required variable aborts startup before any socket opens,
//! rather than silently defaulting an identity or address.

use std::net::ToSocketAddrs;

use crate::errors::ConfigError;

#[derive(Debug, Clone)]
pub struct PeerAddr {
    pub node_id: String,
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub peers: Vec<PeerAddr>,
    pub cache_capacity: usize,
}

const DEFAULT_CACHE_CAPACITY: usize = 100;

impl ClusterConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let node_id = require_env("NODE_ID")?;
        if node_id.trim().is_empty() {
            return Err(ConfigError::Invalid {
                name: "NODE_ID",
                value: node_id,
                reason: "must not be empty".to_string(),
            });
        }

        let host = require_env("NODE_HOST")?;
        let port = parse_port("NODE_PORT", &require_env("NODE_PORT")?)?;

        if format!("{host}:{port}").to_socket_addrs().is_err() {
            return Err(ConfigError::Invalid {
                name: "NODE_HOST",
                value: host,
                reason: "does not resolve with NODE_PORT".to_string(),
            });
        }

        let peers = match std::env::var("PEER_NODES") {
            Ok(raw) if !raw.trim().is_empty() => parse_peers(&raw)?,
            _ => Vec::new(),
        };

        if peers.iter().any(|p| p.node_id == node_id) {
            return Err(ConfigError::Invalid {
                name: "PEER_NODES",
                value: node_id.clone(),
                reason: "a peer id must not equal this node's own NODE_ID".to_string(),
            });
        }

        let cache_capacity = match std::env::var("CACHE_CAPACITY") {
            Ok(raw) => raw.parse::<usize>().map_err(|_| ConfigError::Invalid {
                name: "CACHE_CAPACITY",
                value: raw.clone(),
                reason: "must be a positive integer".to_string(),
            })?,
            Err(_) => DEFAULT_CACHE_CAPACITY,
        };

        Ok(Self {
            node_id,
            host,
            port,
            peers,
            cache_capacity,
        })
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.peers.iter().map(|p| p.node_id.clone()).collect()
    }
}

fn require_env(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn parse_port(name: &'static str, raw: &str) -> Result<u16, ConfigError> {
    raw.parse::<u16>().map_err(|_| ConfigError::Invalid {
        name,
        value: raw.to_string(),
        reason: "must be a 16-bit port number".to_string(),
    })
}

fn parse_peers(raw: &str) -> Result<Vec<PeerAddr>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let mut parts = entry.splitn(3, ':');
            let (Some(node_id), Some(host), Some(port)) = (parts.next(), parts.next(), parts.next()) else {
                return Err(ConfigError::Invalid {
                    name: "PEER_NODES",
                    value: entry.to_string(),
                    reason: "expected \"<id>:<host>:<port>\"".to_string(),
                });
            };
            Ok(PeerAddr {
                node_id: node_id.to_string(),
                host: host.to_string(),
                port: parse_port("PEER_NODES", port)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_well_formed_peer_list() {
        let peers = parse_peers("n1:10.0.0.2:8080, n2:10.0.0.3:8080").unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].node_id, "n1");
        assert_eq!(peers[1].port, 8080);
    }

    #[test]
    fn rejects_a_malformed_peer_entry() {
        assert!(parse_peers("not-a-valid-entry").is_err());
    }
}
