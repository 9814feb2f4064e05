use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cluster::metadata::MetadataManager;
use crate::core::types::NodeId;
use crate::transport::manager::TransportManager;
use crate::transport::message::{Message, MessageKind};

/// Heartbeat-driven failure detector: pings every live peer each round and
/// declares a node failed after the configured number of consecutive
/// misses. Detected failures are pushed to the channel the cluster node
/// drains.
pub struct SyncManager {
    transport: Arc<TransportManager>,
    metadata: Arc<MetadataManager>,
    interval: Duration,
    failure_after_misses: u32,
    failures: mpsc::Sender<NodeId>,
}

impl SyncManager {
    pub fn new(
        transport: Arc<TransportManager>,
        metadata: Arc<MetadataManager>,
        interval: Duration,
        failure_after_misses: u32,
    ) -> (Self, mpsc::Receiver<NodeId>) {
        let (failures, receiver) = mpsc::channel(16);
        (
            SyncManager {
                transport,
                metadata,
                interval,
                failure_after_misses,
                failures,
            },
            receiver,
        )
    }

    /// Run until the failure channel's consumer goes away.
    pub async fn run(self) {
        let mut misses: HashMap<NodeId, u32> = HashMap::new();
        let mut declared: HashMap<NodeId, bool> = HashMap::new();
        loop {
            tokio::time::sleep(self.interval).await;
            let view = self.metadata.readview();
            for peer in view.live_nodes() {
                if peer.id == self.transport.node_id() {
                    continue;
                }
                if *declared.get(&peer.id).unwrap_or(&false) {
                    continue;
                }
                let ping = Message::new(MessageKind::GetInfoCommand, Bytes::new());
                match self
                    .transport
                    .request(peer.id, ping, self.interval)
                    .await
                {
                    Ok(_) => {
                        misses.insert(peer.id, 0);
                    }
                    Err(err) => {
                        let count = misses.entry(peer.id).or_insert(0);
                        *count += 1;
                        debug!(peer = %peer.id, misses = *count, error = %err, "heartbeat miss");
                        if *count >= self.failure_after_misses {
                            warn!(peer = %peer.id, "declaring node failed");
                            declared.insert(peer.id, true);
                            if self.failures.send(peer.id).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}
