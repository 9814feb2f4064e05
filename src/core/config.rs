use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::error::Result;
use crate::core::types::NodeId;

/// Engine-level knobs for one shard's index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub storage_path: PathBuf,
    pub max_documents: usize,
    pub cache_byte_budget: usize,

    // Merge scheduling: whichever threshold fires first triggers a merge.
    pub merge_every_n_seconds: u64,
    pub merge_every_m_writes: usize,
    pub merge_workers: usize,

    // Histogram statistics refresh for the optimiser.
    pub histogram_every_p_merges: usize,
    pub histogram_every_q_writes: usize,

    // Two-phase search: hard cap applied when a get-all-results estimate
    // exceeds it.
    pub get_all_results_cap: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            storage_path: PathBuf::from("./data"),
            max_documents: 15_000_000,
            cache_byte_budget: 64 * 1024 * 1024,
            merge_every_n_seconds: 10,
            merge_every_m_writes: 100,
            merge_workers: num_cpus::get().min(4),
            histogram_every_p_merges: 10,
            histogram_every_q_writes: 1000,
            get_all_results_cap: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: NodeId,
    pub address: SocketAddr,
}

/// Cluster identity and topology for one process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub node_id: NodeId,
    pub listen_address: SocketAddr,
    /// Known peers to contact at boot. Empty for the first node.
    pub peers: Vec<PeerConfig>,
    pub cluster_shard_count: u32,
    pub replica_count: u32,

    /// Seconds between state-machine periodic rounds (bounced-notification
    /// retries, load probes, heartbeats).
    pub periodic_interval_secs: u64,
    /// Unanswered heartbeats before a peer is declared failed.
    pub failure_after_misses: u32,
    /// Load imbalance ratio beyond which a shard move is scheduled.
    pub load_balance_threshold: f64,
    /// Request/reply timeout for transport RPCs, in milliseconds.
    pub rpc_timeout_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            node_id: NodeId(0),
            listen_address: "127.0.0.1:7087".parse().unwrap(),
            peers: Vec::new(),
            cluster_shard_count: 8,
            replica_count: 1,
            periodic_interval_secs: 2,
            failure_after_misses: 3,
            load_balance_threshold: 0.2,
            rpc_timeout_ms: 5_000,
        }
    }
}

impl ClusterConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn to_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

/// Opaque key/value lookup backing `config_look_up` for connectors. The real
/// configuration file reader lives outside the core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigLookup {
    entries: std::collections::HashMap<String, String>,
}

impl ConfigLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|s| s.as_str())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.json");

        let mut config = ClusterConfig::default();
        config.node_id = NodeId(3);
        config.peers.push(PeerConfig {
            id: NodeId(1),
            address: "127.0.0.1:7088".parse().unwrap(),
        });
        config.to_path(&path).unwrap();

        let loaded = ClusterConfig::from_path(&path).unwrap();
        assert_eq!(loaded.node_id, NodeId(3));
        assert_eq!(loaded.peers.len(), 1);
    }

    #[test]
    fn config_lookup() {
        let mut lookup = ConfigLookup::new();
        lookup.set("listenerWaitTime", "2");
        assert_eq!(lookup.get_u64("listenerWaitTime"), Some(2));
        assert_eq!(lookup.get("missing"), None);
    }
}
