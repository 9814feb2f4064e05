use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::analysis::analyzer::Analyzer;
use crate::cluster::lock_manager::LockManager;
use crate::cluster::metadata::{MetadataManager, NodeDescriptor, NodeState};
use crate::cluster::notifications::{Notification, NotificationPayload};
use crate::cluster::operations::load_balance::LoadBalancingStart;
use crate::cluster::operations::node_join::NewNodeJoin;
use crate::cluster::operations::save::ClusterSaveOperation;
use crate::cluster::operations::shard_move::ShardMoveOperation;
use crate::cluster::state_machine::{
    responder, AbortCode, ClusterStateMachine, EngineAction, StepOutput,
};
use crate::core::config::{ClusterConfig, EngineConfig};
use crate::core::error::Result;
use crate::core::types::{NodeId, ShardId};
use crate::migration::{MigrationChunk, MigrationManager, MigrationReceiver};
use crate::record::schema::Schema;
use crate::server::ShardSearchServer;
use crate::storage::layout::ShardLayout;
use crate::transport::manager::{InboundReceiver, TransportManager};
use crate::transport::message::{Message, MessageKind};
use crate::transport::sync::SyncManager;

/// One engine process: shard servers, cluster metadata, state machine,
/// transport and migration wired together.
pub struct ClusterNode {
    cluster_config: ClusterConfig,
    engine_config: EngineConfig,
    schema: Schema,
    analyzer_factory: fn() -> Analyzer,
    metadata: Arc<MetadataManager>,
    locks: Arc<LockManager>,
    state_machine: Arc<ClusterStateMachine>,
    transport: Arc<TransportManager>,
    migration: Arc<MigrationManager>,
    receiver: Mutex<MigrationReceiver>,
    shutdown: Arc<AtomicBool>,
}

impl ClusterNode {
    pub fn new(
        cluster_config: ClusterConfig,
        engine_config: EngineConfig,
        schema: Schema,
        analyzer_factory: fn() -> Analyzer,
    ) -> (Arc<Self>, InboundReceiver) {
        let metadata = Arc::new(MetadataManager::new());
        let locks = Arc::new(LockManager::new());
        let state_machine = Arc::new(ClusterStateMachine::new(
            cluster_config.node_id,
            Arc::clone(&metadata),
            Arc::clone(&locks),
        ));
        let (transport, inbound) =
            TransportManager::new(cluster_config.node_id, cluster_config.listen_address);
        let migration = Arc::new(MigrationManager::new(
            Arc::clone(&transport),
            Duration::from_millis(cluster_config.rpc_timeout_ms),
        ));
        let node = Arc::new(ClusterNode {
            cluster_config,
            engine_config,
            schema,
            analyzer_factory,
            metadata,
            locks,
            state_machine,
            transport,
            migration,
            receiver: Mutex::new(MigrationReceiver::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        });
        (node, inbound)
    }

    pub fn node_id(&self) -> NodeId {
        self.cluster_config.node_id
    }

    pub fn is_joined(&self) -> bool {
        self.state_machine.is_joined()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn metadata(&self) -> &Arc<MetadataManager> {
        &self.metadata
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn local_shard(&self, shard: ShardId) -> Option<Arc<ShardSearchServer>> {
        self.metadata.local_shard(shard)
    }

    /// Boot the node: start the transport, dial the configured peers, run
    /// the join operation and spawn the background loops.
    pub async fn start(self: &Arc<Self>, inbound: InboundReceiver) -> Result<()> {
        self.transport.start().await?;
        for peer in &self.cluster_config.peers {
            if let Err(err) = self.transport.connect(peer.id, peer.address).await {
                warn!(peer = %peer.id, error = %err, "peer unreachable at boot");
            }
        }

        let descriptor = NodeDescriptor {
            id: self.node_id(),
            address: self.cluster_config.listen_address,
            state: NodeState::Joining,
        };
        let join = NewNodeJoin::new(
            self.state_machine.next_operation_id(),
            descriptor,
            self.cluster_config.peers.iter().map(|p| p.id).collect(),
            self.cluster_config.cluster_shard_count,
        );
        let output = self.state_machine.register(Box::new(join))?;
        self.route(output).await;
        self.ensure_local_shards().await?;

        // Inbound pump.
        let node = Arc::clone(self);
        tokio::spawn(async move {
            node.run_inbound(inbound).await;
        });

        // Periodic worker: bounced retries plus shard materialisation.
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let interval = Duration::from_secs(node.cluster_config.periodic_interval_secs);
            while !node.is_shut_down() {
                tokio::time::sleep(interval).await;
                let output = node.state_machine.periodic_tick();
                node.route(output).await;
                if node.is_joined() {
                    if let Err(err) = node.ensure_local_shards().await {
                        warn!(error = %err, "shard materialisation failed");
                    }
                }
            }
        });

        // Heartbeat failure detector.
        let (sync, mut failures) = SyncManager::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.metadata),
            Duration::from_secs(self.cluster_config.periodic_interval_secs),
            self.cluster_config.failure_after_misses,
        );
        tokio::spawn(sync.run());
        let node = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(failed) = failures.recv().await {
                match node.state_machine.node_failure(failed) {
                    Ok(output) => node.route(output).await,
                    Err(err) => warn!(error = %err, "node failure handling failed"),
                }
                // Tell the rest of the cluster what we observed.
                let view = node.metadata.readview();
                for peer in view.live_nodes() {
                    if peer.id == node.node_id() {
                        continue;
                    }
                    let notification = Notification::new(
                        responder(node.node_id()),
                        responder(peer.id),
                        NotificationPayload::NodeFailure { node: failed },
                    );
                    node.send_notification(notification).await;
                }
            }
        });

        Ok(())
    }

    /// Instantiate (or load from disk) a server for every shard assigned to
    /// this node that has no local instance yet.
    pub async fn ensure_local_shards(self: &Arc<Self>) -> Result<()> {
        let view = self.metadata.readview();
        for shard in view.shards_of(self.node_id()) {
            if self.metadata.local_shard(shard).is_some() {
                continue;
            }
            let layout =
                ShardLayout::for_shard(&self.engine_config.storage_path, shard)?;
            let server = ShardSearchServer::open(
                &layout,
                self.schema.clone(),
                self.engine_config.clone(),
                (self.analyzer_factory)(),
            )?;
            server.commit()?;
            server.start_merge_scheduler();
            self.metadata.register_local_shard(shard, Arc::new(server));
            info!(%shard, "local shard ready");
        }
        Ok(())
    }

    /// Kick off one load-balancing round.
    pub async fn balance_now(self: &Arc<Self>) -> Result<()> {
        let op = LoadBalancingStart::new(
            self.state_machine.next_operation_id(),
            self.cluster_config.load_balance_threshold,
        );
        let output = self.state_machine.register(Box::new(op))?;
        self.route(output).await;
        Ok(())
    }

    /// Cluster-wide save (data then metadata, with acks).
    pub async fn save_cluster(self: &Arc<Self>) -> Result<()> {
        let op = ClusterSaveOperation::save(self.state_machine.next_operation_id());
        let output = self.state_machine.register(Box::new(op))?;
        self.route(output).await;
        Ok(())
    }

    /// Cluster-wide save followed by shutdown of every node.
    pub async fn shutdown_cluster(self: &Arc<Self>) -> Result<()> {
        let op = ClusterSaveOperation::shutdown(self.state_machine.next_operation_id());
        let output = self.state_machine.register(Box::new(op))?;
        self.route(output).await;
        Ok(())
    }

    async fn run_inbound(self: &Arc<Self>, mut inbound: InboundReceiver) {
        while let Some((from, message)) = inbound.recv().await {
            if self.is_shut_down() {
                break;
            }
            if let Err(err) = self.handle_message(from, message).await {
                warn!(error = %err, "message handling failed");
            }
        }
    }

    async fn handle_message(self: &Arc<Self>, from: NodeId, message: Message) -> Result<()> {
        match message.kind {
            MessageKind::GetInfoCommand => {
                // Heartbeat ping.
                let reply = self
                    .transport
                    .reply_to(&message, Message::new(MessageKind::GetInfoResults, Bytes::new()));
                self.transport.send(from, reply).await?;
            }
            MessageKind::MigrationNotification => {
                let chunk: MigrationChunk = bincode::deserialize(&message.body)?;
                let ack = self
                    .transport
                    .reply_to(&message, Message::new(MessageKind::Status, Bytes::new()));
                let completed = self.receiver.lock().accept(chunk)?;
                self.transport.send(from, ack).await?;
                if let Some((shard, owner, archive)) = completed {
                    let server = archive
                        .into_server(self.engine_config.clone(), (self.analyzer_factory)())?;
                    server.start_merge_scheduler();
                    self.metadata.register_local_shard(shard, Arc::new(server));
                    // Wake the owning move operation.
                    let notification = Notification::new(
                        responder(self.node_id()),
                        owner,
                        NotificationPayload::MoveFinish { shard },
                    );
                    let output = self.state_machine.dispatch(notification)?;
                    self.route(output).await;
                }
            }
            _ => {
                let notification: Notification = bincode::deserialize(&message.body)?;
                let output = self.state_machine.dispatch(notification)?;
                self.route(output).await;
            }
        }
        Ok(())
    }

    /// Deliver a step's notifications (looping local ones back through the
    /// state machine) and execute its engine actions.
    async fn route(self: &Arc<Self>, output: StepOutput) {
        let mut queue: VecDeque<Notification> = output.notifications.into();
        let mut actions: VecDeque<EngineAction> = output.actions.into();

        while !queue.is_empty() || !actions.is_empty() {
            while let Some(notification) = queue.pop_front() {
                if notification.destination_node() == self.node_id() {
                    match self.state_machine.dispatch(notification) {
                        Ok(output) => {
                            queue.extend(output.notifications);
                            actions.extend(output.actions);
                        }
                        Err(err) => warn!(error = %err, "local dispatch failed"),
                    }
                } else {
                    self.send_notification(notification).await;
                }
            }
            if let Some(action) = actions.pop_front() {
                match self.execute(action).await {
                    Ok(output) => {
                        queue.extend(output.notifications);
                        actions.extend(output.actions);
                    }
                    Err(err) => warn!(error = %err, "engine action failed"),
                }
            }
        }
    }

    async fn send_notification(&self, notification: Notification) {
        let destination = notification.destination_node();
        match self.transport.notification_message(&notification) {
            Ok(message) => {
                if let Err(err) = self.transport.send(destination, message).await {
                    debug!(%destination, error = %err, "notification undeliverable");
                }
            }
            Err(err) => warn!(error = %err, "notification serialisation failed"),
        }
    }

    async fn execute(self: &Arc<Self>, action: EngineAction) -> Result<StepOutput> {
        let mut output = StepOutput::default();
        match action {
            EngineAction::StartMigration {
                shard,
                destination,
                owner,
            } => {
                let Some(server) = self.metadata.local_shard(shard) else {
                    output.notifications.push(Notification::new(
                        responder(self.node_id()),
                        owner,
                        NotificationPayload::MoveAbort { shard },
                    ));
                    return Ok(output);
                };
                let node = Arc::clone(self);
                tokio::spawn(async move {
                    let result = node
                        .migration
                        .stream_shard(shard, owner, &server, destination)
                        .await;
                    if let Err(err) = result {
                        warn!(%shard, error = %err, "migration failed");
                        let abort = Notification::new(
                            responder(node.node_id()),
                            owner,
                            NotificationPayload::MoveAbort { shard },
                        );
                        node.send_notification(abort).await;
                    }
                });
            }
            EngineAction::StartShardMove { shard, source } => {
                let op = ShardMoveOperation::new(
                    self.state_machine.next_operation_id(),
                    shard,
                    source,
                );
                let step = self.state_machine.register(Box::new(op))?;
                output.notifications.extend(step.notifications);
                output.actions.extend(step.actions);
            }
            EngineAction::SaveLocalShards => {
                for (shard, server) in self.metadata.local_shards() {
                    let layout =
                        ShardLayout::for_shard(&self.engine_config.storage_path, shard)?;
                    server.save(&layout)?;
                }
            }
            EngineAction::SaveMetadata => {
                let path = ShardLayout::metadata_path(&self.engine_config.storage_path);
                self.metadata.save(path)?;
            }
            EngineAction::MergeLocalShards => {
                for (_, server) in self.metadata.local_shards() {
                    server.merge_now();
                }
            }
            EngineAction::ShutdownProcess => {
                info!(node = %self.node_id(), "shutting down");
                self.shutdown.store(true, Ordering::SeqCst);
                let aborted = self.state_machine.abort_all(AbortCode::Shutdown);
                output.notifications.extend(aborted.notifications);
                for (_, server) in self.metadata.local_shards() {
                    server.stop_merge_scheduler();
                }
            }
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::PeerConfig;
    use crate::query::ast::{LogicalNode, SearchQuery};
    use crate::query::term::Term;
    use crate::record::schema::{IndexType, SearchableAttribute};
    use std::net::SocketAddr;

    fn test_schema() -> Schema {
        let mut schema = Schema::new("id", IndexType::Keyword);
        schema
            .add_searchable(SearchableAttribute {
                name: "title".to_string(),
                boost: 1.0,
                multi_valued: false,
                highlight: false,
                acl_controlled: false,
            })
            .unwrap();
        schema.commit().unwrap();
        schema
    }

    async fn free_address() -> SocketAddr {
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = probe.local_addr().unwrap();
        drop(probe);
        address
    }

    fn node_config(id: u32, address: SocketAddr, peers: Vec<PeerConfig>) -> ClusterConfig {
        let mut config = ClusterConfig::default();
        config.node_id = NodeId(id);
        config.listen_address = address;
        config.peers = peers;
        config.cluster_shard_count = 4;
        config.periodic_interval_secs = 1;
        config
    }

    fn engine_config(dir: &std::path::Path) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.storage_path = dir.to_path_buf();
        config
    }

    async fn wait_until(deadline_secs: u64, mut check: impl FnMut() -> bool) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_secs(deadline_secs);
        while std::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    #[tokio::test]
    async fn single_node_bootstraps_and_serves() {
        let dir = tempfile::tempdir().unwrap();
        let address = free_address().await;
        let (node, inbound) = ClusterNode::new(
            node_config(1, address, vec![]),
            engine_config(dir.path()),
            test_schema(),
            Analyzer::standard,
        );
        node.start(inbound).await.unwrap();

        assert!(node.is_joined());
        let view = node.metadata().readview();
        assert_eq!(view.shards_of(NodeId(1)).len(), 4);

        let shard = node.local_shard(ShardId(0)).expect("local shard exists");
        shard
            .insert_json(r#"{"id": "a", "title": "hello cluster"}"#)
            .unwrap();
        shard.merge_now();
        let query = SearchQuery::top_k(LogicalNode::Term(Term::complete("cluster")), 5);
        assert_eq!(shard.search(&query).unwrap().results.len(), 1);
    }

    #[tokio::test]
    async fn second_node_joins_and_balancing_moves_a_shard() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let addr_a = free_address().await;
        let addr_b = free_address().await;

        let (node_a, inbound_a) = ClusterNode::new(
            node_config(1, addr_a, vec![]),
            engine_config(dir_a.path()),
            test_schema(),
            Analyzer::standard,
        );
        node_a.start(inbound_a).await.unwrap();
        assert!(node_a.is_joined());

        // Give shard 0 some records so the load spread is visible.
        let shard = node_a.local_shard(ShardId(0)).unwrap();
        for i in 0..20 {
            shard
                .insert_json(&format!(r#"{{"id": "r-{}", "title": "doc {}"}}"#, i, i))
                .unwrap();
        }
        shard.merge_now();

        let (node_b, inbound_b) = ClusterNode::new(
            node_config(
                2,
                addr_b,
                vec![PeerConfig {
                    id: NodeId(1),
                    address: addr_a,
                }],
            ),
            engine_config(dir_b.path()),
            test_schema(),
            Analyzer::standard,
        );
        node_b.start(inbound_b).await.unwrap();

        // B pulls the metadata from A and joins; A learns about B.
        assert!(wait_until(10, || node_b.is_joined()).await);
        assert!(
            wait_until(10, || {
                node_a.metadata().readview().is_alive(NodeId(2))
            })
            .await
        );

        // A balancing round schedules a move of one shard towards B.
        node_b.balance_now().await.unwrap();
        assert!(
            wait_until(20, || {
                !node_b.metadata().readview().shards_of(NodeId(2)).is_empty()
            })
            .await,
            "no shard moved to the new node"
        );

        // Both readviews converge on the new assignment.
        let moved = node_b.metadata().readview().shards_of(NodeId(2))[0];
        assert!(
            wait_until(10, || {
                node_a
                    .metadata()
                    .readview()
                    .assignments
                    .get(&moved)
                    .map(|a| a.node == NodeId(2))
                    .unwrap_or(false)
            })
            .await,
            "source node did not learn about the transfer"
        );
        assert!(node_b.local_shard(moved).is_some());
    }
}
