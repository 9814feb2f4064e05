use tracing::info;

use crate::cluster::metadata::{MetadataChange, NodeDescriptor, NodeState};
use crate::cluster::notifications::{Notification, NotificationPayload};
use crate::cluster::state_machine::{
    responder, AbortCode, ClusterOperation, OperationContext, OperationStatus,
};
use crate::core::error::Result;
use crate::core::types::{NodeId, OperationId, ShardId};

enum JoinState {
    RequestingMetadata { peer: NodeId },
    Done,
}

/// Joining the cluster: a fresh node either bootstraps the cluster alone or
/// pulls the metadata from a peer, applies it, announces itself and flips
/// its joined flag.
pub struct NewNodeJoin {
    id: OperationId,
    descriptor: NodeDescriptor,
    peers: Vec<NodeId>,
    cluster_shard_count: u32,
    state: JoinState,
}

impl NewNodeJoin {
    pub fn new(
        id: OperationId,
        descriptor: NodeDescriptor,
        peers: Vec<NodeId>,
        cluster_shard_count: u32,
    ) -> Self {
        NewNodeJoin {
            id,
            descriptor,
            peers,
            cluster_shard_count,
            state: JoinState::Done,
        }
    }

    fn bootstrap(&self, ctx: &mut OperationContext) -> Result<()> {
        let mut descriptor = self.descriptor.clone();
        descriptor.state = NodeState::Arrived;
        ctx.metadata.apply(MetadataChange::AddNode(descriptor))?;
        for shard in 0..self.cluster_shard_count {
            ctx.metadata.apply(MetadataChange::AssignShard {
                shard: ShardId(shard),
                node: ctx.node_id,
            })?;
        }
        ctx.metadata.commit_cluster_metadata();
        ctx.set_joined();
        info!(node = %ctx.node_id, shards = self.cluster_shard_count, "bootstrapped cluster");
        Ok(())
    }

    fn announce(&self, ctx: &mut OperationContext) {
        let view = ctx.metadata.readview();
        let mut descriptor = self.descriptor.clone();
        descriptor.state = NodeState::Arrived;
        for node in view.live_nodes() {
            if node.id == ctx.node_id {
                continue;
            }
            ctx.outbox.push(Notification::new(
                self.id,
                responder(node.id),
                NotificationPayload::CommitChange(MetadataChange::AddNode(descriptor.clone())),
            ));
        }
    }
}

impl ClusterOperation for NewNodeJoin {
    fn id(&self) -> OperationId {
        self.id
    }

    fn kind(&self) -> &'static str {
        "new-node-join"
    }

    fn start(&mut self, ctx: &mut OperationContext) -> Result<OperationStatus> {
        let Some(&peer) = self.peers.first() else {
            self.bootstrap(ctx)?;
            return Ok(OperationStatus::Done);
        };
        ctx.send(Notification::new(
            self.id,
            responder(peer),
            NotificationPayload::MetadataRequest,
        ));
        self.state = JoinState::RequestingMetadata { peer };
        Ok(OperationStatus::InProgress)
    }

    fn handle(
        &mut self,
        ctx: &mut OperationContext,
        notification: Notification,
    ) -> Result<OperationStatus> {
        match notification.payload {
            NotificationPayload::MetadataReply(view) => {
                ctx.metadata.adopt(&view);
                let mut descriptor = self.descriptor.clone();
                descriptor.state = NodeState::Arrived;
                ctx.metadata.apply(MetadataChange::AddNode(descriptor))?;
                ctx.metadata.commit_cluster_metadata();
                ctx.set_joined();
                self.announce(ctx);
                self.state = JoinState::Done;
                info!(node = %ctx.node_id, version = view.version, "joined cluster");
                Ok(OperationStatus::Done)
            }
            _ => Ok(OperationStatus::InProgress),
        }
    }

    fn on_node_failure(
        &mut self,
        ctx: &mut OperationContext,
        node: NodeId,
    ) -> Result<OperationStatus> {
        match &self.state {
            JoinState::RequestingMetadata { peer } if *peer == node => {
                // Re-target the next known peer, or give up cleanly.
                self.peers.retain(|&p| p != node);
                match self.peers.first() {
                    Some(&next) => {
                        ctx.send(Notification::new(
                            self.id,
                            responder(next),
                            NotificationPayload::MetadataRequest,
                        ));
                        self.state = JoinState::RequestingMetadata { peer: next };
                        Ok(OperationStatus::InProgress)
                    }
                    None => Ok(OperationStatus::Aborted(AbortCode::NodeFailure)),
                }
            }
            _ => Ok(OperationStatus::InProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::lock_manager::LockManager;
    use crate::cluster::metadata::{ClusterReadView, MetadataManager};
    use crate::cluster::state_machine::ClusterStateMachine;
    use std::sync::Arc;

    fn machine(node: u32) -> ClusterStateMachine {
        ClusterStateMachine::new(
            NodeId(node),
            Arc::new(MetadataManager::new()),
            Arc::new(LockManager::new()),
        )
    }

    fn descriptor(id: u32) -> NodeDescriptor {
        NodeDescriptor {
            id: NodeId(id),
            address: format!("127.0.0.1:{}", 7400 + id).parse().unwrap(),
            state: NodeState::Joining,
        }
    }

    #[test]
    fn first_node_bootstraps_alone() {
        let machine = machine(1);
        let join = NewNodeJoin::new(machine.next_operation_id(), descriptor(1), vec![], 8);
        let output = machine.register(Box::new(join)).unwrap();

        assert!(output.notifications.is_empty());
        assert!(machine.is_joined());
        assert_eq!(machine.active_operation_count(), 0);
    }

    #[test]
    fn joining_node_requests_metadata_then_announces() {
        let machine = machine(2);
        let op_id = machine.next_operation_id();
        let join = NewNodeJoin::new(op_id, descriptor(2), vec![NodeId(1)], 8);
        let output = machine.register(Box::new(join)).unwrap();

        assert_eq!(output.notifications.len(), 1);
        assert!(matches!(
            output.notifications[0].payload,
            NotificationPayload::MetadataRequest
        ));
        assert!(!machine.is_joined());

        // A peer's snapshot arrives: one node, all shards assigned to it.
        let mut snapshot = ClusterReadView::default();
        snapshot.version = 5;
        let mut peer = descriptor(1);
        peer.state = NodeState::Arrived;
        snapshot.nodes.insert(NodeId(1), peer);
        let reply = Notification::new(
            OperationId::new(NodeId(1), 0),
            op_id,
            NotificationPayload::MetadataReply(snapshot),
        );
        let output = machine.dispatch(reply).unwrap();

        assert!(machine.is_joined());
        // The announcement goes to the one live peer.
        assert_eq!(output.notifications.len(), 1);
        assert!(matches!(
            output.notifications[0].payload,
            NotificationPayload::CommitChange(MetadataChange::AddNode(_))
        ));
        assert_eq!(machine.active_operation_count(), 0);
    }

    #[test]
    fn peer_failure_retargets_next_peer() {
        let machine = machine(3);
        let op_id = machine.next_operation_id();
        let join = NewNodeJoin::new(op_id, descriptor(3), vec![NodeId(1), NodeId(2)], 8);
        machine.register(Box::new(join)).unwrap();

        let output = machine.node_failure(NodeId(1)).unwrap();
        let retargeted: Vec<_> = output
            .notifications
            .iter()
            .filter(|n| matches!(n.payload, NotificationPayload::MetadataRequest))
            .collect();
        assert_eq!(retargeted.len(), 1);
        assert_eq!(retargeted[0].destination_node(), NodeId(2));
        assert_eq!(machine.active_operation_count(), 1);
    }
}
