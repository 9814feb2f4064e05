use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::analysis::analyzer::Analyzer;
use crate::core::config::EngineConfig;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{KeywordId, NodeId, OperationId, ShardId};
use crate::geo::quadtree::{GeoElement, QuadTree};
use crate::index::forward::ForwardIndex;
use crate::index::inverted::{InvertedDirectory, InvertedList};
use crate::index::store::IndexStore;
use crate::ranking::feedback::FeedbackEntry;
use crate::record::schema::Schema;
use crate::server::ShardSearchServer;
use crate::transport::manager::TransportManager;
use crate::transport::message::{Message, MessageKind, MASK_MIGRATION};
use crate::trie::node::Trie;

/// Bytes of serialized shard state per migration chunk.
const CHUNK_SIZE: usize = 256 * 1024;

/// Complete serialized state of one shard, as streamed between nodes.
#[derive(Serialize, Deserialize, Debug)]
pub struct ShardArchive {
    /// Identifies this transfer in both nodes' logs.
    pub transfer_id: uuid::Uuid,
    pub schema: Schema,
    pub trie: Trie,
    pub forward: ForwardIndex,
    pub inverted: Vec<(KeywordId, InvertedList)>,
    pub quadtree_elements: Vec<GeoElement>,
    pub feedback: HashMap<String, Vec<FeedbackEntry>>,
}

impl ShardArchive {
    /// Snapshot a server's current readview into a transferable archive.
    pub fn capture(server: &ShardSearchServer) -> Self {
        let view = server.readview();
        let mut quadtree_elements = Vec::new();
        view.quadtree_root.collect_elements(&mut quadtree_elements);
        ShardArchive {
            transfer_id: uuid::Uuid::new_v4(),
            schema: (*view.schema).clone(),
            trie: (*view.trie).clone(),
            forward: (*view.forward).clone(),
            inverted: view.inverted.to_serializable(),
            quadtree_elements,
            feedback: server.feedback.snapshot(),
        }
    }

    /// Reassemble a live server from the archive.
    pub fn into_server(self, config: EngineConfig, analyzer: Analyzer) -> Result<ShardSearchServer> {
        let store = IndexStore::from_parts(
            self.schema,
            config,
            self.trie,
            self.forward,
            InvertedDirectory::from_serializable(self.inverted),
            QuadTree::from_elements(self.quadtree_elements),
        )?;
        let server = ShardSearchServer::from_store(Arc::new(store), analyzer);
        server.feedback.restore(self.feedback);
        Ok(server)
    }
}

/// One frame of a shard stream.
#[derive(Serialize, Deserialize)]
pub struct MigrationChunk {
    pub session: u32,
    pub shard: ShardId,
    /// The shard-move operation that owns this transfer on the destination.
    pub owner: OperationId,
    pub index: u32,
    pub total: u32,
    pub data: Vec<u8>,
}

/// Source side: streams a shard's archive to a destination node in
/// fixed-size chunks, each acknowledged before the next goes out.
pub struct MigrationManager {
    transport: Arc<TransportManager>,
    rpc_timeout: Duration,
}

impl MigrationManager {
    pub fn new(transport: Arc<TransportManager>, rpc_timeout: Duration) -> Self {
        MigrationManager {
            transport,
            rpc_timeout,
        }
    }

    pub async fn stream_shard(
        &self,
        shard: ShardId,
        owner: OperationId,
        server: &ShardSearchServer,
        destination: NodeId,
    ) -> Result<()> {
        let archive = ShardArchive::capture(server);
        let payload = bincode::serialize(&archive)?;
        let session = self.transport.next_message_id();
        let total = payload.len().div_ceil(CHUNK_SIZE) as u32;
        info!(
            %shard, %destination, transfer = %archive.transfer_id,
            bytes = payload.len(), chunks = total,
            "streaming shard"
        );

        for (index, data) in payload.chunks(CHUNK_SIZE).enumerate() {
            let chunk = MigrationChunk {
                session,
                shard,
                owner,
                index: index as u32,
                total,
                data: data.to_vec(),
            };
            let message = Message::new(
                MessageKind::MigrationNotification,
                Bytes::from(bincode::serialize(&chunk)?),
            )
            .with_mask(MASK_MIGRATION);
            let reply = self
                .transport
                .request(destination, message, self.rpc_timeout)
                .await?;
            if reply.kind != MessageKind::Status {
                return Err(Error::new(
                    ErrorKind::Internal,
                    format!("unexpected migration ack {:?}", reply.kind),
                ));
            }
            debug!(%shard, chunk = index, "chunk acknowledged");
        }
        Ok(())
    }
}

struct Session {
    shard: ShardId,
    owner: OperationId,
    total: u32,
    chunks: Vec<Option<Vec<u8>>>,
}

/// Destination side: reassembles chunk streams into shard archives.
#[derive(Default)]
pub struct MigrationReceiver {
    sessions: HashMap<u32, Session>,
}

impl MigrationReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns the finished archive once every chunk of the
    /// session has arrived.
    pub fn accept(
        &mut self,
        chunk: MigrationChunk,
    ) -> Result<Option<(ShardId, OperationId, ShardArchive)>> {
        let session = self.sessions.entry(chunk.session).or_insert_with(|| Session {
            shard: chunk.shard,
            owner: chunk.owner,
            total: chunk.total,
            chunks: vec![None; chunk.total as usize],
        });
        if chunk.index >= session.total {
            return Err(Error::new(
                ErrorKind::Validation,
                format!("chunk {} out of range ({})", chunk.index, session.total),
            ));
        }
        session.chunks[chunk.index as usize] = Some(chunk.data);
        if session.chunks.iter().any(|c| c.is_none()) {
            return Ok(None);
        }

        let session = self.sessions.remove(&chunk.session).expect("just present");
        let mut payload = Vec::new();
        for piece in session.chunks.into_iter().flatten() {
            payload.extend_from_slice(&piece);
        }
        let archive: ShardArchive = bincode::deserialize(&payload)?;
        info!(
            shard = %session.shard,
            transfer = %archive.transfer_id,
            "shard stream complete"
        );
        Ok(Some((session.shard, session.owner, archive)))
    }

    /// Drop half-finished sessions from a failed source.
    pub fn abort_sessions_for_shard(&mut self, shard: ShardId) {
        self.sessions.retain(|_, s| s.shard != shard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::EngineConfig;
    use crate::record::schema::{IndexType, SearchableAttribute};

    fn server_with_records() -> ShardSearchServer {
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
        let server =
            ShardSearchServer::create(schema, EngineConfig::default(), Analyzer::standard())
                .unwrap();
        for i in 0..50 {
            server
                .insert_json(&format!(r#"{{"id": "r-{}", "title": "entry {}"}}"#, i, i))
                .unwrap();
        }
        server.commit().unwrap();
        server
    }

    #[test]
    fn archive_round_trip_through_chunks() {
        let server = server_with_records();
        let archive = ShardArchive::capture(&server);
        let payload = bincode::serialize(&archive).unwrap();

        let owner = OperationId::new(NodeId(2), 5);
        let total = payload.len().div_ceil(1024) as u32;
        let mut receiver = MigrationReceiver::new();
        let mut finished = None;
        // Deliver out of order.
        let chunks: Vec<(usize, &[u8])> = payload.chunks(1024).enumerate().collect();
        for (index, data) in chunks.iter().rev() {
            let result = receiver
                .accept(MigrationChunk {
                    session: 9,
                    shard: ShardId(3),
                    owner,
                    index: *index as u32,
                    total,
                    data: data.to_vec(),
                })
                .unwrap();
            if result.is_some() {
                finished = result;
            }
        }

        let (shard, got_owner, archive) = finished.expect("stream completes");
        assert_eq!(shard, ShardId(3));
        assert_eq!(got_owner, owner);
        let rebuilt = archive
            .into_server(EngineConfig::default(), Analyzer::standard())
            .unwrap();
        assert_eq!(rebuilt.readview().total_records(), 50);
    }

    #[test]
    fn out_of_range_chunk_is_rejected() {
        let mut receiver = MigrationReceiver::new();
        let owner = OperationId::new(NodeId(2), 5);
        let err = receiver
            .accept(MigrationChunk {
                session: 1,
                shard: ShardId(0),
                owner,
                index: 5,
                total: 2,
                data: vec![],
            })
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }
}
