use std::collections::HashSet;

use crate::cluster::metadata::MetadataChange;
use crate::cluster::notifications::{Notification, NotificationPayload};
use crate::cluster::state_machine::{
    responder, ClusterOperation, OperationContext, OperationStatus,
};
use crate::core::error::Result;
use crate::core::types::{NodeId, OperationId};

/// Apply one typed metadata change locally, invalidate the readview by
/// committing, and broadcast the change to every live peer, waiting for
/// their acks.
pub struct CommitMetadataChange {
    id: OperationId,
    change: MetadataChange,
    awaiting: HashSet<NodeId>,
}

impl CommitMetadataChange {
    pub fn new(id: OperationId, change: MetadataChange) -> Self {
        CommitMetadataChange {
            id,
            change,
            awaiting: HashSet::new(),
        }
    }
}

impl ClusterOperation for CommitMetadataChange {
    fn id(&self) -> OperationId {
        self.id
    }

    fn kind(&self) -> &'static str {
        "commit-metadata-change"
    }

    fn start(&mut self, ctx: &mut OperationContext) -> Result<OperationStatus> {
        ctx.metadata.apply(self.change.clone())?;
        let view = ctx.metadata.commit_cluster_metadata();
        for node in view.live_nodes() {
            if node.id == ctx.node_id {
                continue;
            }
            self.awaiting.insert(node.id);
            ctx.send(Notification::new(
                self.id,
                responder(node.id),
                NotificationPayload::CommitChange(self.change.clone()),
            ));
        }
        if self.awaiting.is_empty() {
            return Ok(OperationStatus::Done);
        }
        Ok(OperationStatus::InProgress)
    }

    fn handle(
        &mut self,
        _ctx: &mut OperationContext,
        notification: Notification,
    ) -> Result<OperationStatus> {
        if matches!(notification.payload, NotificationPayload::CommitAck) {
            self.awaiting.remove(&notification.source.node);
        }
        if self.awaiting.is_empty() {
            return Ok(OperationStatus::Done);
        }
        Ok(OperationStatus::InProgress)
    }

    fn on_node_failure(
        &mut self,
        _ctx: &mut OperationContext,
        node: NodeId,
    ) -> Result<OperationStatus> {
        self.awaiting.remove(&node);
        if self.awaiting.is_empty() {
            return Ok(OperationStatus::Done);
        }
        Ok(OperationStatus::InProgress)
    }
}
