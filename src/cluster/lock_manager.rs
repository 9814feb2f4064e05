use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{NodeId, OperationId, ShardId};

/// Lockable resources form a hierarchy; batches must acquire parents before
/// children to keep the wait graph acyclic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resource {
    ClusterMetadata,
    Shard(ShardId),
    PrimaryKey(ShardId, String),
}

impl Resource {
    fn level(&self) -> u8 {
        match self {
            Resource::ClusterMetadata => 0,
            Resource::Shard(_) => 1,
            Resource::PrimaryKey(..) => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequest {
    pub resource: Resource,
    pub mode: LockMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Granted,
    /// Non-blocking batch that could not be granted atomically.
    Denied,
    /// Blocking batch parked on the queue; the owner is notified on grant.
    Queued,
}

#[derive(Debug, Default)]
struct HeldResource {
    shared: HashSet<OperationId>,
    exclusive: Option<OperationId>,
}

impl HeldResource {
    fn is_free(&self) -> bool {
        self.shared.is_empty() && self.exclusive.is_none()
    }

    fn grantable(&self, op: OperationId, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => self.exclusive.is_none() || self.exclusive == Some(op),
            LockMode::Exclusive => {
                (self.exclusive.is_none() || self.exclusive == Some(op))
                    && self.shared.iter().all(|&holder| holder == op)
            }
        }
    }
}

#[derive(Debug)]
struct PendingBatch {
    op: OperationId,
    requests: Vec<LockRequest>,
}

#[derive(Default)]
struct LockTable {
    held: HashMap<Resource, HeldResource>,
    queue: VecDeque<PendingBatch>,
}

/// Hierarchical lock manager for cluster resources. Batches are granted
/// all-or-nothing; blocking batches queue in arrival order.
#[derive(Default)]
pub struct LockManager {
    table: Mutex<LockTable>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a batch for an operation. Blocking batches that cannot be
    /// granted immediately are queued; the grant surfaces later through
    /// `release_all` / `node_failed` return values.
    pub fn acquire_batch(
        &self,
        op: OperationId,
        requests: Vec<LockRequest>,
        blocking: bool,
    ) -> Result<LockOutcome> {
        validate_order(&requests)?;
        let mut table = self.table.lock();
        self.check_hierarchy(&table, op, &requests)?;

        if Self::batch_grantable(&table, op, &requests) {
            Self::grant(&mut table, op, &requests);
            return Ok(LockOutcome::Granted);
        }
        if blocking {
            table.queue.push_back(PendingBatch { op, requests });
            Ok(LockOutcome::Queued)
        } else {
            Ok(LockOutcome::Denied)
        }
    }

    /// Release every lock held by the operation and drop its queued batches.
    /// Returns the operations whose queued batches became granted.
    pub fn release_all(&self, op: OperationId) -> Vec<OperationId> {
        let mut table = self.table.lock();
        table.queue.retain(|batch| batch.op != op);
        Self::strip_holder(&mut table, op);
        Self::drain_queue(&mut table)
    }

    /// Drop every lock held by any operation of a failed node.
    pub fn node_failed(&self, node: NodeId) -> Vec<OperationId> {
        let mut table = self.table.lock();
        table.queue.retain(|batch| batch.op.node != node);
        let holders: Vec<OperationId> = table
            .held
            .values()
            .flat_map(|h| {
                h.shared
                    .iter()
                    .copied()
                    .chain(h.exclusive.into_iter())
                    .collect::<Vec<_>>()
            })
            .filter(|op| op.node == node)
            .collect();
        for holder in holders {
            Self::strip_holder(&mut table, holder);
        }
        Self::drain_queue(&mut table)
    }

    pub fn holds(&self, op: OperationId, resource: &Resource) -> bool {
        let table = self.table.lock();
        table
            .held
            .get(resource)
            .map(|h| h.shared.contains(&op) || h.exclusive == Some(op))
            .unwrap_or(false)
    }

    /// An operation must never request a parent while already holding one of
    /// its descendants.
    fn check_hierarchy(
        &self,
        table: &LockTable,
        op: OperationId,
        requests: &[LockRequest],
    ) -> Result<()> {
        let deepest_held = table
            .held
            .iter()
            .filter(|(_, h)| h.shared.contains(&op) || h.exclusive == Some(op))
            .map(|(r, _)| r.level())
            .max();
        if let (Some(deepest), Some(shallowest_requested)) = (
            deepest_held,
            requests.iter().map(|r| r.resource.level()).min(),
        ) {
            if shallowest_requested < deepest {
                return Err(Error::new(
                    ErrorKind::InvalidState,
                    "lock batch violates the parent-before-child order",
                ));
            }
        }
        Ok(())
    }

    fn batch_grantable(table: &LockTable, op: OperationId, requests: &[LockRequest]) -> bool {
        requests.iter().all(|request| {
            table
                .held
                .get(&request.resource)
                .map(|h| h.grantable(op, request.mode))
                .unwrap_or(true)
        })
    }

    fn grant(table: &mut LockTable, op: OperationId, requests: &[LockRequest]) {
        for request in requests {
            let held = table.held.entry(request.resource.clone()).or_default();
            match request.mode {
                LockMode::Shared => {
                    held.shared.insert(op);
                }
                LockMode::Exclusive => held.exclusive = Some(op),
            }
        }
    }

    fn strip_holder(table: &mut LockTable, op: OperationId) {
        table.held.retain(|_, held| {
            held.shared.remove(&op);
            if held.exclusive == Some(op) {
                held.exclusive = None;
            }
            !held.is_free()
        });
    }

    /// Grant queued batches that became satisfiable, in arrival order.
    fn drain_queue(table: &mut LockTable) -> Vec<OperationId> {
        let mut granted = Vec::new();
        let mut remaining = VecDeque::new();
        while let Some(batch) = table.queue.pop_front() {
            if Self::batch_grantable(table, batch.op, &batch.requests) {
                Self::grant(table, batch.op, &batch.requests);
                granted.push(batch.op);
            } else {
                remaining.push_back(batch);
            }
        }
        table.queue = remaining;
        granted
    }
}

/// Batches must list parents before children.
fn validate_order(requests: &[LockRequest]) -> Result<()> {
    let levels: Vec<u8> = requests.iter().map(|r| r.resource.level()).collect();
    if levels.windows(2).any(|w| w[0] > w[1]) {
        return Err(Error::new(
            ErrorKind::InvalidState,
            "lock batch must be ordered cluster, shard, primary-key",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(node: u32, seq: u64) -> OperationId {
        OperationId::new(NodeId(node), seq)
    }

    fn shard_x(id: u32) -> LockRequest {
        LockRequest {
            resource: Resource::Shard(ShardId(id)),
            mode: LockMode::Exclusive,
        }
    }

    fn shard_s(id: u32) -> LockRequest {
        LockRequest {
            resource: Resource::Shard(ShardId(id)),
            mode: LockMode::Shared,
        }
    }

    #[test]
    fn shared_locks_coexist_exclusive_does_not() {
        let locks = LockManager::new();
        assert_eq!(
            locks.acquire_batch(op(1, 1), vec![shard_s(0)], false).unwrap(),
            LockOutcome::Granted
        );
        assert_eq!(
            locks.acquire_batch(op(1, 2), vec![shard_s(0)], false).unwrap(),
            LockOutcome::Granted
        );
        assert_eq!(
            locks.acquire_batch(op(1, 3), vec![shard_x(0)], false).unwrap(),
            LockOutcome::Denied
        );
    }

    #[test]
    fn blocking_batch_waits_and_gets_granted_in_order() {
        let locks = LockManager::new();
        locks.acquire_batch(op(1, 1), vec![shard_x(0)], false).unwrap();
        assert_eq!(
            locks.acquire_batch(op(1, 2), vec![shard_x(0)], true).unwrap(),
            LockOutcome::Queued
        );
        assert_eq!(
            locks.acquire_batch(op(1, 3), vec![shard_x(0)], true).unwrap(),
            LockOutcome::Queued
        );

        let granted = locks.release_all(op(1, 1));
        assert_eq!(granted, vec![op(1, 2)]);
        let granted = locks.release_all(op(1, 2));
        assert_eq!(granted, vec![op(1, 3)]);
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let locks = LockManager::new();
        locks.acquire_batch(op(1, 1), vec![shard_x(1)], false).unwrap();
        // Shard 0 is free but shard 1 is taken; nothing must be granted.
        assert_eq!(
            locks
                .acquire_batch(op(1, 2), vec![shard_x(0), shard_x(1)], false)
                .unwrap(),
            LockOutcome::Denied
        );
        assert_eq!(
            locks.acquire_batch(op(1, 3), vec![shard_x(0)], false).unwrap(),
            LockOutcome::Granted
        );
    }

    #[test]
    fn unordered_batch_is_rejected() {
        let locks = LockManager::new();
        let batch = vec![
            shard_x(0),
            LockRequest {
                resource: Resource::ClusterMetadata,
                mode: LockMode::Shared,
            },
        ];
        let err = locks.acquire_batch(op(1, 1), batch, false).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);
    }

    #[test]
    fn child_before_parent_across_batches_is_rejected() {
        let locks = LockManager::new();
        locks
            .acquire_batch(
                op(1, 1),
                vec![LockRequest {
                    resource: Resource::PrimaryKey(ShardId(0), "pk".into()),
                    mode: LockMode::Exclusive,
                }],
                false,
            )
            .unwrap();
        let err = locks
            .acquire_batch(op(1, 1), vec![shard_x(0)], false)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);
    }

    #[test]
    fn node_failure_sweeps_all_its_locks() {
        let locks = LockManager::new();
        locks.acquire_batch(op(1, 1), vec![shard_x(0)], false).unwrap();
        locks.acquire_batch(op(1, 2), vec![shard_x(1)], false).unwrap();
        assert_eq!(
            locks.acquire_batch(op(2, 1), vec![shard_x(0)], true).unwrap(),
            LockOutcome::Queued
        );

        let granted = locks.node_failed(NodeId(1));
        assert_eq!(granted, vec![op(2, 1)]);
        assert!(locks.holds(op(2, 1), &Resource::Shard(ShardId(0))));
        assert!(!locks.holds(op(1, 2), &Resource::Shard(ShardId(1))));
    }
}
