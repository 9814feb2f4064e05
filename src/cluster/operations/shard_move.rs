use tracing::info;

use crate::cluster::lock_manager::{LockMode, LockRequest, Resource};
use crate::cluster::metadata::MetadataChange;
use crate::cluster::notifications::{Notification, NotificationPayload};
use crate::cluster::state_machine::{
    responder, AbortCode, ClusterOperation, OperationContext, OperationStatus,
};
use crate::core::error::Result;
use crate::core::types::{NodeId, OperationId, ShardId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MoveState {
    AcquiringSourceLock,
    WaitingForData,
    Done,
}

/// Destination side of a shard move. The destination locks the shard here
/// and at the source, asks the source to stream the shard over, commits the
/// new assignment cluster-wide on arrival, and releases the locks.
///
/// The source side needs no dedicated operation: its state machine answers
/// `MoveToMe` by starting a migration, and `MoveCleanup` by dropping its
/// copy.
pub struct ShardMoveOperation {
    id: OperationId,
    shard: ShardId,
    source: NodeId,
    state: MoveState,
}

impl ShardMoveOperation {
    pub fn new(id: OperationId, shard: ShardId, source: NodeId) -> Self {
        ShardMoveOperation {
            id,
            shard,
            source,
            state: MoveState::AcquiringSourceLock,
        }
    }

    fn lock_batch(&self) -> Vec<LockRequest> {
        vec![LockRequest {
            resource: Resource::Shard(self.shard),
            mode: LockMode::Exclusive,
        }]
    }

    fn finish(&mut self, ctx: &mut OperationContext) -> Result<OperationStatus> {
        // Commit the transfer locally and broadcast it to every live node.
        ctx.metadata.apply(MetadataChange::TransferShard {
            shard: self.shard,
            from: self.source,
            to: ctx.node_id,
        })?;
        let view = ctx.metadata.commit_cluster_metadata();
        for node in view.live_nodes() {
            if node.id == ctx.node_id {
                continue;
            }
            ctx.outbox.push(Notification::new(
                self.id,
                responder(node.id),
                NotificationPayload::CommitChange(MetadataChange::TransferShard {
                    shard: self.shard,
                    from: self.source,
                    to: ctx.node_id,
                }),
            ));
        }

        // Release both sides' locks and let the source clean up its copy.
        ctx.locks.release_all(self.id);
        ctx.send(Notification::new(
            self.id,
            responder(self.source),
            NotificationPayload::LockReleased,
        ));
        ctx.send(Notification::new(
            self.id,
            responder(self.source),
            NotificationPayload::MoveCleanup { shard: self.shard },
        ));
        self.state = MoveState::Done;
        info!(shard = %self.shard, from = %self.source, to = %ctx.node_id, "shard move committed");
        Ok(OperationStatus::Done)
    }
}

impl ClusterOperation for ShardMoveOperation {
    fn id(&self) -> OperationId {
        self.id
    }

    fn kind(&self) -> &'static str {
        "shard-move"
    }

    fn start(&mut self, ctx: &mut OperationContext) -> Result<OperationStatus> {
        // Local lock first, then mirror it at the source.
        ctx.locks.acquire_batch(self.id, self.lock_batch(), true)?;
        ctx.send(Notification::new(
            self.id,
            responder(self.source),
            NotificationPayload::LockRequestBatch {
                requests: self.lock_batch(),
                blocking: true,
            },
        ));
        self.state = MoveState::AcquiringSourceLock;
        Ok(OperationStatus::InProgress)
    }

    fn handle(
        &mut self,
        ctx: &mut OperationContext,
        notification: Notification,
    ) -> Result<OperationStatus> {
        match (self.state, notification.payload) {
            (MoveState::AcquiringSourceLock, NotificationPayload::LockGranted) => {
                ctx.send(Notification::new(
                    self.id,
                    responder(self.source),
                    NotificationPayload::MoveToMe { shard: self.shard },
                ));
                self.state = MoveState::WaitingForData;
                Ok(OperationStatus::InProgress)
            }
            (_, NotificationPayload::LockDenied) => {
                ctx.locks.release_all(self.id);
                Ok(OperationStatus::Aborted(AbortCode::Timeout))
            }
            (MoveState::WaitingForData, NotificationPayload::MoveAck { .. }) => {
                // The source accepted; the migration stream is under way.
                Ok(OperationStatus::InProgress)
            }
            (MoveState::WaitingForData, NotificationPayload::MoveFinish { shard })
                if shard == self.shard =>
            {
                self.finish(ctx)
            }
            (_, NotificationPayload::MoveAbort { .. }) => {
                ctx.locks.release_all(self.id);
                ctx.send(Notification::new(
                    self.id,
                    responder(self.source),
                    NotificationPayload::LockReleased,
                ));
                Ok(OperationStatus::Aborted(AbortCode::NodeFailure))
            }
            _ => Ok(OperationStatus::InProgress),
        }
    }

    fn on_node_failure(
        &mut self,
        ctx: &mut OperationContext,
        node: NodeId,
    ) -> Result<OperationStatus> {
        if node == self.source && self.state != MoveState::Done {
            ctx.locks.release_all(self.id);
            return Ok(OperationStatus::Aborted(AbortCode::NodeFailure));
        }
        Ok(OperationStatus::InProgress)
    }
}
