use serde::{Deserialize, Serialize};

use crate::cluster::lock_manager::LockRequest;
use crate::cluster::metadata::{ClusterReadView, MetadataChange};
use crate::core::types::{NodeId, OperationId, ShardId};

/// Typed message consumed by the cluster state machine. `source` names the
/// sending operation, `destination` the operation the notification is for;
/// a notification for a node that has not joined yet comes back with the
/// `bounced` flag set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub source: OperationId,
    pub destination: OperationId,
    pub bounced: bool,
    pub payload: NotificationPayload,
}

impl Notification {
    pub fn new(
        source: OperationId,
        destination: OperationId,
        payload: NotificationPayload,
    ) -> Self {
        Notification {
            source,
            destination,
            bounced: false,
            payload,
        }
    }

    /// Swap the endpoints and mark the notification bounced, for return to
    /// its sender.
    pub fn bounce(mut self) -> Self {
        std::mem::swap(&mut self.source, &mut self.destination);
        self.bounced = true;
        self
    }

    pub fn destination_node(&self) -> NodeId {
        self.destination.node
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NotificationPayload {
    // Node join.
    MetadataRequest,
    MetadataReply(ClusterReadView),

    // Distributed locking.
    LockRequestBatch {
        requests: Vec<LockRequest>,
        blocking: bool,
    },
    LockGranted,
    LockDenied,
    LockReleased,

    // Shard move (destination-driven).
    /// Ask a node to start pulling a shard from `source`.
    StartMove {
        shard: ShardId,
        source: NodeId,
    },
    MoveToMe {
        shard: ShardId,
    },
    MoveAck {
        shard: ShardId,
    },
    MoveAbort {
        shard: ShardId,
    },
    MoveFinish {
        shard: ShardId,
    },
    MoveCleanup {
        shard: ShardId,
    },

    // Load balancing.
    LoadReportRequest,
    LoadReport {
        node: NodeId,
        load: u64,
    },

    // Cluster-wide save and shutdown.
    SaveData,
    SaveDataAck,
    SaveMetadata,
    SaveMetadataAck,
    Shutdown,

    // Index merge broadcast.
    MergeRequest,
    MergeAck,

    // Metadata commit protocol.
    CommitChange(MetadataChange),
    CommitAck,

    // Failure propagation.
    NodeFailure {
        node: NodeId,
    },
}

impl NotificationPayload {
    pub fn kind_name(&self) -> &'static str {
        match self {
            NotificationPayload::MetadataRequest => "metadata-request",
            NotificationPayload::MetadataReply(_) => "metadata-reply",
            NotificationPayload::LockRequestBatch { .. } => "lock-request",
            NotificationPayload::LockGranted => "lock-granted",
            NotificationPayload::LockDenied => "lock-denied",
            NotificationPayload::LockReleased => "lock-released",
            NotificationPayload::StartMove { .. } => "start-move",
            NotificationPayload::MoveToMe { .. } => "move-to-me",
            NotificationPayload::MoveAck { .. } => "move-ack",
            NotificationPayload::MoveAbort { .. } => "move-abort",
            NotificationPayload::MoveFinish { .. } => "move-finish",
            NotificationPayload::MoveCleanup { .. } => "move-cleanup",
            NotificationPayload::LoadReportRequest => "load-report-request",
            NotificationPayload::LoadReport { .. } => "load-report",
            NotificationPayload::SaveData => "save-data",
            NotificationPayload::SaveDataAck => "save-data-ack",
            NotificationPayload::SaveMetadata => "save-metadata",
            NotificationPayload::SaveMetadataAck => "save-metadata-ack",
            NotificationPayload::Shutdown => "shutdown",
            NotificationPayload::MergeRequest => "merge-request",
            NotificationPayload::MergeAck => "merge-ack",
            NotificationPayload::CommitChange(_) => "commit-change",
            NotificationPayload::CommitAck => "commit-ack",
            NotificationPayload::NodeFailure { .. } => "node-failure",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounce_swaps_endpoints() {
        let n = Notification::new(
            OperationId::new(NodeId(1), 4),
            OperationId::new(NodeId(2), 9),
            NotificationPayload::MetadataRequest,
        );
        let bounced = n.bounce();
        assert!(bounced.bounced);
        assert_eq!(bounced.source, OperationId::new(NodeId(2), 9));
        assert_eq!(bounced.destination, OperationId::new(NodeId(1), 4));
    }
}
