use std::collections::HashSet;

use tracing::info;

use crate::cluster::notifications::{Notification, NotificationPayload};
use crate::cluster::state_machine::{
    responder, ClusterOperation, EngineAction, OperationContext, OperationStatus,
};
use crate::core::error::Result;
use crate::core::types::{NodeId, OperationId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SavePhase {
    SavingData,
    SavingMetadata,
}

/// Cluster-wide save: broadcast save-data, collect acks, then broadcast
/// save-metadata and collect acks. With `shutdown_after`, a shutdown
/// broadcast follows the final ack (the cluster-shutdown operation is this
/// operation with the flag set).
pub struct ClusterSaveOperation {
    id: OperationId,
    shutdown_after: bool,
    phase: SavePhase,
    awaiting: HashSet<NodeId>,
}

impl ClusterSaveOperation {
    pub fn save(id: OperationId) -> Self {
        Self::new(id, false)
    }

    pub fn shutdown(id: OperationId) -> Self {
        Self::new(id, true)
    }

    fn new(id: OperationId, shutdown_after: bool) -> Self {
        ClusterSaveOperation {
            id,
            shutdown_after,
            phase: SavePhase::SavingData,
            awaiting: HashSet::new(),
        }
    }

    fn broadcast(&mut self, ctx: &mut OperationContext, payload: NotificationPayload) {
        let view = ctx.metadata.readview();
        self.awaiting.clear();
        for node in view.live_nodes() {
            if node.id == ctx.node_id {
                continue;
            }
            self.awaiting.insert(node.id);
            ctx.send(Notification::new(
                self.id,
                responder(node.id),
                payload.clone(),
            ));
        }
    }

    fn finish_phase(&mut self, ctx: &mut OperationContext) -> Result<OperationStatus> {
        match self.phase {
            SavePhase::SavingData => {
                ctx.actions.push(EngineAction::SaveMetadata);
                self.phase = SavePhase::SavingMetadata;
                self.broadcast(ctx, NotificationPayload::SaveMetadata);
                if self.awaiting.is_empty() {
                    return self.finish_phase(ctx);
                }
                Ok(OperationStatus::InProgress)
            }
            SavePhase::SavingMetadata => {
                info!(shutdown = self.shutdown_after, "cluster save complete");
                if self.shutdown_after {
                    let view = ctx.metadata.readview();
                    for node in view.live_nodes() {
                        if node.id == ctx.node_id {
                            continue;
                        }
                        ctx.send(Notification::new(
                            self.id,
                            responder(node.id),
                            NotificationPayload::Shutdown,
                        ));
                    }
                    ctx.actions.push(EngineAction::ShutdownProcess);
                }
                Ok(OperationStatus::Done)
            }
        }
    }
}

impl ClusterOperation for ClusterSaveOperation {
    fn id(&self) -> OperationId {
        self.id
    }

    fn kind(&self) -> &'static str {
        if self.shutdown_after {
            "cluster-shutdown"
        } else {
            "cluster-save"
        }
    }

    fn start(&mut self, ctx: &mut OperationContext) -> Result<OperationStatus> {
        ctx.actions.push(EngineAction::SaveLocalShards);
        self.phase = SavePhase::SavingData;
        self.broadcast(ctx, NotificationPayload::SaveData);
        if self.awaiting.is_empty() {
            return self.finish_phase(ctx);
        }
        Ok(OperationStatus::InProgress)
    }

    fn handle(
        &mut self,
        ctx: &mut OperationContext,
        notification: Notification,
    ) -> Result<OperationStatus> {
        let acked = matches!(
            (self.phase, &notification.payload),
            (SavePhase::SavingData, NotificationPayload::SaveDataAck)
                | (SavePhase::SavingMetadata, NotificationPayload::SaveMetadataAck)
        );
        if acked {
            self.awaiting.remove(&notification.source.node);
            if self.awaiting.is_empty() {
                return self.finish_phase(ctx);
            }
        }
        Ok(OperationStatus::InProgress)
    }

    fn on_node_failure(
        &mut self,
        ctx: &mut OperationContext,
        node: NodeId,
    ) -> Result<OperationStatus> {
        self.awaiting.remove(&node);
        if self.awaiting.is_empty() {
            return self.finish_phase(ctx);
        }
        Ok(OperationStatus::InProgress)
    }
}
