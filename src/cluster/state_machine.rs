use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cluster::lock_manager::{LockManager, LockOutcome};
use crate::cluster::metadata::{MetadataChange, MetadataManager, NodeState};
use crate::cluster::notifications::{Notification, NotificationPayload};
use crate::core::error::Result;
use crate::core::types::{NodeId, OperationId, ShardId};

/// Sequence number addressing a node's state machine itself rather than a
/// registered operation.
pub const RESPONDER_SEQ: u64 = 0;

pub fn responder(node: NodeId) -> OperationId {
    OperationId::new(node, RESPONDER_SEQ)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortCode {
    NodeFailure,
    Shutdown,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    InProgress,
    Done,
    Aborted(AbortCode),
}

/// Side effects an operation asks the hosting engine to perform; the engine
/// executes them outside the state-machine lock.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineAction {
    StartMigration {
        shard: ShardId,
        destination: NodeId,
        owner: OperationId,
    },
    StartShardMove {
        shard: ShardId,
        source: NodeId,
    },
    SaveLocalShards,
    SaveMetadata,
    MergeLocalShards,
    ShutdownProcess,
}

/// Everything an operation may touch while handling a notification. Sends
/// and engine actions are collected and performed after the handler returns,
/// so no lock is held while talking to the network.
pub struct OperationContext<'a> {
    pub node_id: NodeId,
    pub metadata: &'a MetadataManager,
    pub locks: &'a LockManager,
    pub joined: &'a AtomicBool,
    pub outbox: Vec<Notification>,
    pub actions: Vec<EngineAction>,
}

impl<'a> OperationContext<'a> {
    pub fn send(&mut self, notification: Notification) {
        self.outbox.push(notification);
    }

    pub fn set_joined(&self) {
        self.joined.store(true, Ordering::SeqCst);
    }

    pub fn is_joined(&self) -> bool {
        self.joined.load(Ordering::SeqCst)
    }
}

/// A long-lived cluster operation: a finite state automaton consuming typed
/// notifications.
pub trait ClusterOperation: Send {
    fn id(&self) -> OperationId;
    fn kind(&self) -> &'static str;

    fn start(&mut self, ctx: &mut OperationContext) -> Result<OperationStatus>;

    fn handle(
        &mut self,
        ctx: &mut OperationContext,
        notification: Notification,
    ) -> Result<OperationStatus>;

    /// A node died. Operations waiting on it re-target, finish, or abort.
    fn on_node_failure(
        &mut self,
        _ctx: &mut OperationContext,
        _node: NodeId,
    ) -> Result<OperationStatus> {
        Ok(OperationStatus::InProgress)
    }

    /// Abort must leave no locks behind.
    fn abort(&mut self, ctx: &mut OperationContext, _code: AbortCode) {
        ctx.locks.release_all(self.id());
    }
}

/// Output of one state-machine step: notifications to put on the wire and
/// actions for the engine.
#[derive(Debug, Default)]
pub struct StepOutput {
    pub notifications: Vec<Notification>,
    pub actions: Vec<EngineAction>,
}

impl StepOutput {
    fn absorb(&mut self, ctx: OperationContext) {
        self.notifications.extend(ctx.outbox);
        self.actions.extend(ctx.actions);
    }
}

/// Per-node driver of cluster operations: registers them, routes incoming
/// notifications by destination operation id, bounces what cannot be
/// delivered yet, and fans node failures out to every subsystem.
pub struct ClusterStateMachine {
    node_id: NodeId,
    op_counter: AtomicU64,
    joined: AtomicBool,
    metadata: Arc<MetadataManager>,
    locks: Arc<LockManager>,
    operations: Mutex<HashMap<OperationId, Box<dyn ClusterOperation>>>,
    /// Notifications returned to us with the bounced flag, retried by the
    /// periodic worker.
    bounced: Mutex<Vec<Notification>>,
}

impl ClusterStateMachine {
    pub fn new(node_id: NodeId, metadata: Arc<MetadataManager>, locks: Arc<LockManager>) -> Self {
        ClusterStateMachine {
            node_id,
            op_counter: AtomicU64::new(RESPONDER_SEQ + 1),
            joined: AtomicBool::new(false),
            metadata,
            locks,
            operations: Mutex::new(HashMap::new()),
            bounced: Mutex::new(Vec::new()),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn is_joined(&self) -> bool {
        self.joined.load(Ordering::SeqCst)
    }

    pub fn next_operation_id(&self) -> OperationId {
        OperationId::new(self.node_id, self.op_counter.fetch_add(1, Ordering::SeqCst))
    }

    pub fn active_operation_count(&self) -> usize {
        self.operations.lock().len()
    }

    fn context(&self) -> OperationContext<'_> {
        OperationContext {
            node_id: self.node_id,
            metadata: &self.metadata,
            locks: &self.locks,
            joined: &self.joined,
            outbox: Vec::new(),
            actions: Vec::new(),
        }
    }

    /// Register and start an operation. A still-running operation stays in
    /// the registry to receive its notifications.
    pub fn register(&self, mut operation: Box<dyn ClusterOperation>) -> Result<StepOutput> {
        let mut output = StepOutput::default();
        let mut ctx = self.context();
        let status = operation.start(&mut ctx)?;
        debug!(
            op = %operation.id(),
            kind = operation.kind(),
            ?status,
            "operation started"
        );
        if status == OperationStatus::InProgress {
            self.operations.lock().insert(operation.id(), operation);
        }
        output.absorb(ctx);
        Ok(output)
    }

    /// Route one incoming notification.
    pub fn dispatch(&self, notification: Notification) -> Result<StepOutput> {
        let mut output = StepOutput::default();

        if notification.bounced {
            // Our own notification came back: park it for the periodic
            // retry instead of resending immediately.
            debug!(kind = notification.payload.kind_name(), "notification bounced back");
            self.bounced.lock().push(notification);
            return Ok(output);
        }

        if notification.destination.seq == RESPONDER_SEQ {
            if !self.is_joined() {
                // Not part of the cluster yet; return to sender.
                output.notifications.push(notification.bounce());
                return Ok(output);
            }
            return self.respond(notification);
        }

        let mut operations = self.operations.lock();
        let Some(operation) = operations.get_mut(&notification.destination) else {
            warn!(
                destination = %notification.destination,
                kind = notification.payload.kind_name(),
                "notification for unknown operation dropped"
            );
            return Ok(output);
        };
        let mut ctx = self.context();
        let status = operation.handle(&mut ctx, notification)?;
        let id = operation.id();
        if status != OperationStatus::InProgress {
            operations.remove(&id);
            debug!(op = %id, ?status, "operation finished");
        }
        drop(operations);
        output.absorb(ctx);
        Ok(output)
    }

    /// Node-level requests addressed to the state machine itself.
    fn respond(&self, notification: Notification) -> Result<StepOutput> {
        let mut output = StepOutput::default();
        let reply_to = notification.source;
        let me = responder(self.node_id);
        let reply = |payload: NotificationPayload| Notification::new(me, reply_to, payload);

        match notification.payload {
            NotificationPayload::MetadataRequest => {
                let view = self.metadata.readview();
                output
                    .notifications
                    .push(reply(NotificationPayload::MetadataReply((*view).clone())));
            }
            NotificationPayload::LockRequestBatch { requests, blocking } => {
                match self.locks.acquire_batch(reply_to, requests, blocking)? {
                    LockOutcome::Granted => {
                        output.notifications.push(reply(NotificationPayload::LockGranted))
                    }
                    LockOutcome::Denied => {
                        output.notifications.push(reply(NotificationPayload::LockDenied))
                    }
                    LockOutcome::Queued => {}
                }
            }
            NotificationPayload::LockReleased => {
                for granted in self.locks.release_all(reply_to) {
                    output.notifications.push(Notification::new(
                        me,
                        granted,
                        NotificationPayload::LockGranted,
                    ));
                }
            }
            NotificationPayload::StartMove { shard, source } => {
                output
                    .actions
                    .push(EngineAction::StartShardMove { shard, source });
            }
            NotificationPayload::MoveToMe { shard } => {
                if self.metadata.local_shard(shard).is_some() {
                    output.actions.push(EngineAction::StartMigration {
                        shard,
                        destination: reply_to.node,
                        owner: reply_to,
                    });
                    output
                        .notifications
                        .push(reply(NotificationPayload::MoveAck { shard }));
                } else {
                    output
                        .notifications
                        .push(reply(NotificationPayload::MoveAbort { shard }));
                }
            }
            NotificationPayload::MoveCleanup { shard } => {
                if self.metadata.unregister_local_shard(shard).is_some() {
                    info!(%shard, "dropped local copy after move");
                }
            }
            NotificationPayload::LoadReportRequest => {
                let load = self
                    .metadata
                    .local_shards()
                    .iter()
                    .map(|(_, server)| server.info().load())
                    .sum();
                output.notifications.push(reply(NotificationPayload::LoadReport {
                    node: self.node_id,
                    load,
                }));
            }
            NotificationPayload::SaveData => {
                output.actions.push(EngineAction::SaveLocalShards);
                output.notifications.push(reply(NotificationPayload::SaveDataAck));
            }
            NotificationPayload::SaveMetadata => {
                output.actions.push(EngineAction::SaveMetadata);
                output
                    .notifications
                    .push(reply(NotificationPayload::SaveMetadataAck));
            }
            NotificationPayload::Shutdown => {
                output.actions.push(EngineAction::ShutdownProcess);
            }
            NotificationPayload::MergeRequest => {
                output.actions.push(EngineAction::MergeLocalShards);
                output.notifications.push(reply(NotificationPayload::MergeAck));
            }
            NotificationPayload::CommitChange(change) => {
                self.metadata.apply(change)?;
                self.metadata.commit_cluster_metadata();
                output.notifications.push(reply(NotificationPayload::CommitAck));
            }
            NotificationPayload::NodeFailure { node } => {
                let failure_output = self.node_failure(node)?;
                output.notifications.extend(failure_output.notifications);
                output.actions.extend(failure_output.actions);
            }
            other => {
                warn!(kind = other.kind_name(), "unexpected node-level notification");
            }
        }
        Ok(output)
    }

    /// Propagate a node failure to the metadata manager, the lock manager
    /// and every live operation.
    pub fn node_failure(&self, node: NodeId) -> Result<StepOutput> {
        info!(%node, "handling node failure");
        let mut output = StepOutput::default();

        if self
            .metadata
            .apply(MetadataChange::SetNodeState {
                node,
                state: NodeState::Failed,
            })
            .is_ok()
        {
            self.metadata.commit_cluster_metadata();
        }

        let me = responder(self.node_id);
        for granted in self.locks.node_failed(node) {
            output.notifications.push(Notification::new(
                me,
                granted,
                NotificationPayload::LockGranted,
            ));
        }

        let mut operations = self.operations.lock();
        let mut finished = Vec::new();
        for (id, operation) in operations.iter_mut() {
            let mut ctx = self.context();
            let status = operation.on_node_failure(&mut ctx, node)?;
            if let OperationStatus::Aborted(code) = status {
                operation.abort(&mut ctx, code);
            }
            if status != OperationStatus::InProgress {
                finished.push(*id);
            }
            output.absorb(ctx);
        }
        for id in finished {
            operations.remove(&id);
        }

        // Drop pending retries towards the dead node.
        self.bounced
            .lock()
            .retain(|n| n.destination_node() != node);
        Ok(output)
    }

    /// Periodic worker round: resend bounced notifications in their original
    /// direction. A destination that is still not joined bounces them again
    /// for the next round, so retries piggy-back on the 2 s cadence instead
    /// of storming.
    pub fn periodic_tick(&self) -> StepOutput {
        let mut output = StepOutput::default();
        let mut bounced = self.bounced.lock();
        for mut notification in bounced.drain(..) {
            std::mem::swap(&mut notification.source, &mut notification.destination);
            notification.bounced = false;
            output.notifications.push(notification);
        }
        output
    }

    /// Abort every live operation (shutdown path); each releases its locks
    /// and leaves the registry.
    pub fn abort_all(&self, code: AbortCode) -> StepOutput {
        let mut output = StepOutput::default();
        let mut operations = self.operations.lock();
        for (_, operation) in operations.iter_mut() {
            let mut ctx = self.context();
            operation.abort(&mut ctx, code);
            output.absorb(ctx);
        }
        operations.clear();
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> ClusterStateMachine {
        ClusterStateMachine::new(
            NodeId(1),
            Arc::new(MetadataManager::new()),
            Arc::new(LockManager::new()),
        )
    }

    #[test]
    fn operation_ids_are_monotonic() {
        let machine = machine();
        let a = machine.next_operation_id();
        let b = machine.next_operation_id();
        assert!(b.seq > a.seq);
        assert_eq!(a.node, NodeId(1));
        assert_ne!(a.seq, RESPONDER_SEQ);
    }

    #[test]
    fn unjoined_node_bounces_node_level_requests() {
        let machine = machine();
        let from = OperationId::new(NodeId(2), 5);
        let request = Notification::new(
            from,
            responder(NodeId(1)),
            NotificationPayload::MetadataRequest,
        );
        let output = machine.dispatch(request).unwrap();
        assert_eq!(output.notifications.len(), 1);
        let bounced = &output.notifications[0];
        assert!(bounced.bounced);
        assert_eq!(bounced.destination, from);
    }

    #[test]
    fn bounced_notification_retried_in_original_direction() {
        let machine = machine();
        let target = OperationId::new(NodeId(2), RESPONDER_SEQ);
        let original = Notification::new(
            OperationId::new(NodeId(1), 7),
            target,
            NotificationPayload::SaveData,
        );
        // Came back bounced.
        machine.dispatch(original.clone().bounce()).unwrap();

        let retried = machine.periodic_tick();
        assert_eq!(retried.notifications.len(), 1);
        assert!(!retried.notifications[0].bounced);
        assert_eq!(retried.notifications[0].destination, target);
        assert_eq!(retried.notifications[0].source, original.source);

        // The queue drains; nothing is resent twice.
        assert!(machine.periodic_tick().notifications.is_empty());
    }

    #[test]
    fn responder_answers_metadata_request_when_joined() {
        let machine = machine();
        machine.joined.store(true, Ordering::SeqCst);
        let from = OperationId::new(NodeId(2), 3);
        let output = machine
            .dispatch(Notification::new(
                from,
                responder(NodeId(1)),
                NotificationPayload::MetadataRequest,
            ))
            .unwrap();
        assert_eq!(output.notifications.len(), 1);
        assert!(matches!(
            output.notifications[0].payload,
            NotificationPayload::MetadataReply(_)
        ));
        assert_eq!(output.notifications[0].destination, from);
    }
}
