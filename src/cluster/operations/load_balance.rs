use std::collections::HashMap;

use tracing::{debug, info};

use crate::cluster::notifications::{Notification, NotificationPayload};
use crate::cluster::state_machine::{
    responder, ClusterOperation, EngineAction, OperationContext, OperationStatus,
};
use crate::core::error::Result;
use crate::core::types::{NodeId, OperationId};

/// One balancing round: probe every live node for its load and, when the
/// spread exceeds the threshold, schedule a move of one shard from the most
/// to the least loaded node.
pub struct LoadBalancingStart {
    id: OperationId,
    threshold: f64,
    pending: usize,
    reports: HashMap<NodeId, u64>,
}

impl LoadBalancingStart {
    pub fn new(id: OperationId, threshold: f64) -> Self {
        LoadBalancingStart {
            id,
            threshold,
            pending: 0,
            reports: HashMap::new(),
        }
    }

    fn decide(&self, ctx: &mut OperationContext) {
        let Some((&max_node, &max_load)) = self.reports.iter().max_by_key(|(_, &l)| l) else {
            return;
        };
        let Some((&min_node, &min_load)) = self.reports.iter().min_by_key(|(_, &l)| l) else {
            return;
        };
        if max_node == min_node || max_load == 0 {
            return;
        }
        let imbalance = (max_load - min_load) as f64 / max_load as f64;
        if imbalance <= self.threshold {
            debug!(imbalance, "cluster load within threshold");
            return;
        }

        let view = ctx.metadata.readview();
        let Some(shard) = view.shards_of(max_node).into_iter().next() else {
            return;
        };
        info!(
            %shard, from = %max_node, to = %min_node, imbalance,
            "scheduling shard move"
        );
        if min_node == ctx.node_id {
            ctx.actions.push(EngineAction::StartShardMove {
                shard,
                source: max_node,
            });
        } else {
            // The destination drives a move, so hand it the assignment.
            ctx.send(Notification::new(
                self.id,
                responder(min_node),
                NotificationPayload::StartMove {
                    shard,
                    source: max_node,
                },
            ));
        }
    }
}

impl ClusterOperation for LoadBalancingStart {
    fn id(&self) -> OperationId {
        self.id
    }

    fn kind(&self) -> &'static str {
        "load-balancing"
    }

    fn start(&mut self, ctx: &mut OperationContext) -> Result<OperationStatus> {
        let view = ctx.metadata.readview();
        for node in view.live_nodes() {
            self.pending += 1;
            ctx.send(Notification::new(
                self.id,
                responder(node.id),
                NotificationPayload::LoadReportRequest,
            ));
        }
        if self.pending == 0 {
            return Ok(OperationStatus::Done);
        }
        Ok(OperationStatus::InProgress)
    }

    fn handle(
        &mut self,
        ctx: &mut OperationContext,
        notification: Notification,
    ) -> Result<OperationStatus> {
        if let NotificationPayload::LoadReport { node, load } = notification.payload {
            self.reports.insert(node, load);
            self.pending = self.pending.saturating_sub(1);
            if self.pending == 0 {
                self.decide(ctx);
                return Ok(OperationStatus::Done);
            }
        }
        Ok(OperationStatus::InProgress)
    }

    fn on_node_failure(
        &mut self,
        ctx: &mut OperationContext,
        node: NodeId,
    ) -> Result<OperationStatus> {
        // Stop waiting for the dead node's report.
        if self.reports.remove(&node).is_none() && self.pending > 0 {
            self.pending -= 1;
        }
        if self.pending == 0 {
            self.decide(ctx);
            return Ok(OperationStatus::Done);
        }
        Ok(OperationStatus::InProgress)
    }
}
