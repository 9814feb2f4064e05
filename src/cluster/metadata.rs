use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{NodeId, ShardId};
use crate::server::ShardSearchServer;
use crate::storage::archive::{load_archive, save_archive};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Joining,
    Arrived,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub id: NodeId,
    pub address: SocketAddr,
    pub state: NodeState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardAssignment {
    pub shard: ShardId,
    pub node: NodeId,
    pub load: u64,
    pub acl_enabled: bool,
}

/// Immutable snapshot of the cluster topology. Operations capture one at
/// start and use it throughout; cross-snapshot observation order is not
/// guaranteed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterReadView {
    pub version: u64,
    pub nodes: HashMap<NodeId, NodeDescriptor>,
    pub assignments: HashMap<ShardId, ShardAssignment>,
}

impl ClusterReadView {
    pub fn live_nodes(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes.values().filter(|n| n.state == NodeState::Arrived)
    }

    pub fn is_alive(&self, node: NodeId) -> bool {
        self.nodes
            .get(&node)
            .map(|n| n.state == NodeState::Arrived)
            .unwrap_or(false)
    }

    pub fn shards_of(&self, node: NodeId) -> Vec<ShardId> {
        self.assignments
            .values()
            .filter(|a| a.node == node)
            .map(|a| a.shard)
            .collect()
    }

    pub fn node_load(&self, node: NodeId) -> u64 {
        self.assignments
            .values()
            .filter(|a| a.node == node)
            .map(|a| a.load)
            .sum()
    }

    pub fn address_of(&self, node: NodeId) -> Option<SocketAddr> {
        self.nodes.get(&node).map(|n| n.address)
    }

    /// A live replica holder for a shard other than the failed node.
    pub fn replica_for(&self, shard: ShardId, not: NodeId) -> Option<NodeId> {
        self.assignments
            .get(&shard)
            .filter(|a| a.node != not && self.is_alive(a.node))
            .map(|a| a.node)
    }
}

/// One typed mutation of the writeview, applied under the global mutex and
/// invisible to readers until `commit_cluster_metadata`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MetadataChange {
    AddNode(NodeDescriptor),
    SetNodeState { node: NodeId, state: NodeState },
    AssignShard { shard: ShardId, node: NodeId },
    UnassignShard { shard: ShardId },
    TransferShard { shard: ShardId, from: NodeId, to: NodeId },
    ReportLoad { shard: ShardId, load: u64 },
}

#[derive(Default)]
struct WriteView {
    version: u64,
    nodes: HashMap<NodeId, NodeDescriptor>,
    assignments: HashMap<ShardId, ShardAssignment>,
    local_shards: HashMap<ShardId, Arc<ShardSearchServer>>,
    dirty: bool,
}

/// The cluster metadata of one process: a single-writer writeview behind the
/// global mutex and an atomically replaceable readview.
pub struct MetadataManager {
    writeview: Mutex<WriteView>,
    readview: RwLock<Arc<ClusterReadView>>,
}

impl Default for MetadataManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataManager {
    pub fn new() -> Self {
        MetadataManager {
            writeview: Mutex::new(WriteView::default()),
            readview: RwLock::new(Arc::new(ClusterReadView::default())),
        }
    }

    pub fn readview(&self) -> Arc<ClusterReadView> {
        Arc::clone(&self.readview.read())
    }

    pub fn apply(&self, change: MetadataChange) -> Result<()> {
        let mut view = self.writeview.lock();
        match change {
            MetadataChange::AddNode(descriptor) => {
                view.nodes.insert(descriptor.id, descriptor);
            }
            MetadataChange::SetNodeState { node, state } => {
                let descriptor = view
                    .nodes
                    .get_mut(&node)
                    .ok_or_else(|| Error::not_found(format!("{} not in writeview", node)))?;
                descriptor.state = state;
            }
            MetadataChange::AssignShard { shard, node } => {
                view.assignments.insert(
                    shard,
                    ShardAssignment {
                        shard,
                        node,
                        load: 0,
                        acl_enabled: false,
                    },
                );
            }
            MetadataChange::UnassignShard { shard } => {
                view.assignments.remove(&shard);
            }
            MetadataChange::TransferShard { shard, from, to } => {
                let assignment = view
                    .assignments
                    .get_mut(&shard)
                    .ok_or_else(|| Error::not_found(format!("{} unassigned", shard)))?;
                if assignment.node != from {
                    return Err(Error::new(
                        ErrorKind::InvalidState,
                        format!("{} is not held by {}", shard, from),
                    ));
                }
                assignment.node = to;
            }
            MetadataChange::ReportLoad { shard, load } => {
                if let Some(assignment) = view.assignments.get_mut(&shard) {
                    assignment.load = load;
                }
            }
        }
        view.dirty = true;
        Ok(())
    }

    /// Publish every change applied since the last commit as a new readview.
    pub fn commit_cluster_metadata(&self) -> Arc<ClusterReadView> {
        let mut view = self.writeview.lock();
        view.version += 1;
        view.dirty = false;
        let snapshot = Arc::new(ClusterReadView {
            version: view.version,
            nodes: view.nodes.clone(),
            assignments: view.assignments.clone(),
        });
        *self.readview.write() = Arc::clone(&snapshot);
        snapshot
    }

    /// Replace the whole writeview with a peer's snapshot (node join path)
    /// and commit it.
    pub fn adopt(&self, snapshot: &ClusterReadView) -> Arc<ClusterReadView> {
        {
            let mut view = self.writeview.lock();
            view.nodes = snapshot.nodes.clone();
            view.assignments = snapshot.assignments.clone();
            view.version = snapshot.version;
        }
        self.commit_cluster_metadata()
    }

    pub fn register_local_shard(&self, shard: ShardId, server: Arc<ShardSearchServer>) {
        self.writeview.lock().local_shards.insert(shard, server);
    }

    pub fn unregister_local_shard(&self, shard: ShardId) -> Option<Arc<ShardSearchServer>> {
        self.writeview.lock().local_shards.remove(&shard)
    }

    pub fn local_shard(&self, shard: ShardId) -> Option<Arc<ShardSearchServer>> {
        self.writeview.lock().local_shards.get(&shard).cloned()
    }

    pub fn local_shards(&self) -> Vec<(ShardId, Arc<ShardSearchServer>)> {
        self.writeview
            .lock()
            .local_shards
            .iter()
            .map(|(id, server)| (*id, Arc::clone(server)))
            .collect()
    }

    /// Persist the committed metadata; the archive layer writes to a temp
    /// file and renames, so the swap is atomic on disk as well.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let snapshot = self.commit_cluster_metadata();
        save_archive(path.as_ref(), snapshot.as_ref())?;
        info!(version = snapshot.version, "saved cluster metadata");
        Ok(())
    }

    pub fn load(&self, path: impl AsRef<Path>) -> Result<Arc<ClusterReadView>> {
        let snapshot: ClusterReadView = load_archive(path.as_ref())?;
        Ok(self.adopt(&snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: u32) -> NodeDescriptor {
        NodeDescriptor {
            id: NodeId(id),
            address: format!("127.0.0.1:{}", 7000 + id).parse().unwrap(),
            state: NodeState::Arrived,
        }
    }

    #[test]
    fn changes_invisible_before_commit() {
        let manager = MetadataManager::new();
        manager.apply(MetadataChange::AddNode(descriptor(1))).unwrap();

        assert!(manager.readview().nodes.is_empty());
        let committed = manager.commit_cluster_metadata();
        assert_eq!(committed.nodes.len(), 1);
        assert_eq!(manager.readview().nodes.len(), 1);
    }

    #[test]
    fn old_readview_stays_stable_across_commits() {
        let manager = MetadataManager::new();
        manager.apply(MetadataChange::AddNode(descriptor(1))).unwrap();
        manager.commit_cluster_metadata();
        let old = manager.readview();

        manager.apply(MetadataChange::AddNode(descriptor(2))).unwrap();
        manager.commit_cluster_metadata();

        assert_eq!(old.nodes.len(), 1);
        assert_eq!(manager.readview().nodes.len(), 2);
    }

    #[test]
    fn transfer_requires_current_holder() {
        let manager = MetadataManager::new();
        manager
            .apply(MetadataChange::AssignShard {
                shard: ShardId(0),
                node: NodeId(1),
            })
            .unwrap();
        let err = manager
            .apply(MetadataChange::TransferShard {
                shard: ShardId(0),
                from: NodeId(9),
                to: NodeId(2),
            })
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);

        manager
            .apply(MetadataChange::TransferShard {
                shard: ShardId(0),
                from: NodeId(1),
                to: NodeId(2),
            })
            .unwrap();
        let view = manager.commit_cluster_metadata();
        assert_eq!(view.assignments[&ShardId(0)].node, NodeId(2));
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster-metadata.bin");

        let manager = MetadataManager::new();
        manager.apply(MetadataChange::AddNode(descriptor(1))).unwrap();
        manager
            .apply(MetadataChange::AssignShard {
                shard: ShardId(3),
                node: NodeId(1),
            })
            .unwrap();
        manager.save(&path).unwrap();

        let fresh = MetadataManager::new();
        let loaded = fresh.load(&path).unwrap();
        assert_eq!(loaded.assignments[&ShardId(3)].node, NodeId(1));
        assert!(fresh.readview().is_alive(NodeId(1)));
    }
}
