use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::cluster::notifications::{Notification, NotificationPayload};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::NodeId;
use crate::transport::message::{
    Message, MessageKind, MASK_DISCOVERY, MASK_LOCAL, MASK_SHARDING,
};

/// Messages received from peers (or looped back locally), tagged with the
/// sending node.
pub type InboundReceiver = mpsc::Receiver<(NodeId, Message)>;

struct Peer {
    writer: mpsc::Sender<Message>,
}

/// Framed TCP transport between cluster nodes: one persistent stream per
/// destination, a listener task for inbound connections, and request/reply
/// correlation with per-request timeouts.
pub struct TransportManager {
    node_id: NodeId,
    listen_address: SocketAddr,
    message_counter: AtomicU32,
    peers: Mutex<HashMap<NodeId, Peer>>,
    pending: Arc<Mutex<HashMap<u32, oneshot::Sender<Message>>>>,
    inbound: mpsc::Sender<(NodeId, Message)>,
}

impl TransportManager {
    pub fn new(node_id: NodeId, listen_address: SocketAddr) -> (Arc<Self>, InboundReceiver) {
        let (inbound_tx, inbound_rx) = mpsc::channel(1024);
        let manager = Arc::new(TransportManager {
            node_id,
            listen_address,
            message_counter: AtomicU32::new(1),
            peers: Mutex::new(HashMap::new()),
            pending: Arc::new(Mutex::new(HashMap::new())),
            inbound: inbound_tx,
        });
        (manager, inbound_rx)
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn next_message_id(&self) -> u32 {
        self.message_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Bind the listener and start accepting peer connections.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.listen_address).await?;
        info!(node = %self.node_id, address = %self.listen_address, "transport listening");
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        debug!(%remote, "inbound connection");
                        let manager = Arc::clone(&manager);
                        tokio::spawn(async move {
                            if let Err(err) = manager.handle_inbound_connection(stream).await {
                                warn!(error = %err, "inbound connection closed");
                            }
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    /// Open (or reuse) the persistent stream to a peer. The first frame on a
    /// fresh connection is a discovery message carrying our node id.
    pub async fn connect(self: &Arc<Self>, node: NodeId, address: SocketAddr) -> Result<()> {
        if self.peers.lock().contains_key(&node) {
            return Ok(());
        }
        let mut stream = TcpStream::connect(address)
            .await
            .map_err(|e| Error::new(ErrorKind::NodeGone, e.to_string()))?;

        let handshake = Message::new(
            MessageKind::Status,
            Bytes::from(bincode::serialize(&self.node_id)?),
        )
        .with_mask(MASK_DISCOVERY);
        stream.write_all(&handshake.encode()).await?;

        self.attach_stream(node, stream, BytesMut::new());
        info!(peer = %node, %address, "connected to peer");
        Ok(())
    }

    async fn handle_inbound_connection(self: &Arc<Self>, mut stream: TcpStream) -> Result<()> {
        // The peer identifies itself before anything else flows. Bytes read
        // past the handshake frame stay in the buffer for the reader loop.
        let (handshake, leftover) = read_one_message(&mut stream).await?;
        if !handshake.is_discovery() {
            return Err(Error::new(
                ErrorKind::Parse,
                "connection did not start with a discovery frame",
            ));
        }
        let peer_id: NodeId = bincode::deserialize(&handshake.body)?;
        debug!(peer = %peer_id, "peer identified");
        self.attach_stream(peer_id, stream, leftover);
        Ok(())
    }

    /// Split the stream into a writer task fed by a channel and a reader
    /// loop that frames messages and dispatches them.
    fn attach_stream(self: &Arc<Self>, node: NodeId, stream: TcpStream, initial: BytesMut) {
        let (mut read_half, mut write_half) = stream.into_split();
        let (writer_tx, mut writer_rx) = mpsc::channel::<Message>(256);
        self.peers.lock().insert(node, Peer { writer: writer_tx });

        tokio::spawn(async move {
            while let Some(message) = writer_rx.recv().await {
                if write_half.write_all(&message.encode()).await.is_err() {
                    break;
                }
            }
        });

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = initial;
            let mut chunk = [0u8; 16 * 1024];
            loop {
                match Message::decode(&mut buf) {
                    Ok(Some(message)) => {
                        manager.dispatch_inbound(node, message).await;
                        continue;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(peer = %node, error = %err, "bad frame, dropping connection");
                        break;
                    }
                }
                match read_half.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                }
            }
            manager.peers.lock().remove(&node);
            debug!(peer = %node, "connection closed");
        });
    }

    /// Replies claim their pending entry; everything else goes to the
    /// registered consumer.
    async fn dispatch_inbound(&self, from: NodeId, message: Message) {
        if message.reply_to != 0 {
            let waiter = self.pending.lock().remove(&message.reply_to);
            match waiter {
                Some(waiter) => {
                    let _ = waiter.send(message);
                }
                // The request already timed out; a late reply has no taker.
                None => debug!(reply_to = message.reply_to, "dropping late reply"),
            }
            return;
        }
        if self.inbound.send((from, message)).await.is_err() {
            warn!("inbound consumer gone, message dropped");
        }
    }

    /// Fire-and-forget send. Messages to this node never touch a socket;
    /// they loop back with the local mask set.
    pub async fn send(&self, node: NodeId, mut message: Message) -> Result<()> {
        if message.id == 0 {
            message.id = self.next_message_id();
        }
        if node == self.node_id {
            message.mask |= MASK_LOCAL;
            self.dispatch_inbound(self.node_id, message).await;
            return Ok(());
        }
        let writer = {
            let peers = self.peers.lock();
            peers
                .get(&node)
                .map(|p| p.writer.clone())
                .ok_or_else(|| Error::new(ErrorKind::NodeGone, format!("{} not connected", node)))?
        };
        writer
            .send(message)
            .await
            .map_err(|_| Error::new(ErrorKind::NodeGone, format!("{} writer closed", node)))
    }

    /// Request/reply with correlation on the reply-to field. A missed
    /// deadline removes the pending entry and surfaces `Timeout`.
    pub async fn request(
        &self,
        node: NodeId,
        mut message: Message,
        timeout: Duration,
    ) -> Result<Message> {
        message.id = self.next_message_id();
        let id = message.id;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if let Err(err) = self.send(node, message).await {
            self.pending.lock().remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                self.pending.lock().remove(&id);
                Err(Error::new(ErrorKind::NodeGone, format!("{} dropped reply", node)))
            }
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(Error::new(
                    ErrorKind::Timeout,
                    format!("no reply from {} within {:?}", node, timeout),
                ))
            }
        }
    }

    pub fn reply_to(&self, request: &Message, mut reply: Message) -> Message {
        reply.reply_to = request.id;
        reply.id = self.next_message_id();
        reply
    }

    /// Serialise a cluster notification into its wire message.
    pub fn notification_message(&self, notification: &Notification) -> Result<Message> {
        let body = Bytes::from(bincode::serialize(notification)?);
        Ok(Message::new(notification_kind(&notification.payload), body).with_mask(MASK_SHARDING))
    }

    pub fn connected_peers(&self) -> Vec<NodeId> {
        self.peers.lock().keys().copied().collect()
    }

    pub fn disconnect(&self, node: NodeId) {
        self.peers.lock().remove(&node);
    }
}

/// Map a notification payload to the message kind that labels it on the
/// wire.
fn notification_kind(payload: &NotificationPayload) -> MessageKind {
    match payload {
        NotificationPayload::MetadataRequest => MessageKind::NewNodeReadMetadataRequest,
        NotificationPayload::MetadataReply(_) => MessageKind::NewNodeReadMetadataReply,
        NotificationPayload::LockRequestBatch { .. } => MessageKind::Lock,
        NotificationPayload::LockGranted | NotificationPayload::LockDenied => MessageKind::LockAck,
        NotificationPayload::LockReleased => MessageKind::LockReleased,
        NotificationPayload::StartMove { .. } => MessageKind::CopyToMe,
        NotificationPayload::MoveToMe { .. } => MessageKind::MoveToMe,
        NotificationPayload::MoveAck { .. } => MessageKind::MoveAck,
        NotificationPayload::MoveAbort { .. } => MessageKind::MoveAbort,
        NotificationPayload::MoveFinish { .. } => MessageKind::MoveFinish,
        NotificationPayload::MoveCleanup { .. } => MessageKind::MoveCleanup,
        NotificationPayload::LoadReportRequest => MessageKind::LoadBalancingReportRequest,
        NotificationPayload::LoadReport { .. } => MessageKind::LoadBalancingReportReply,
        NotificationPayload::SaveData => MessageKind::SaveDataNotification,
        NotificationPayload::SaveDataAck => MessageKind::SaveDataAck,
        NotificationPayload::SaveMetadata => MessageKind::SaveMetadataNotification,
        NotificationPayload::SaveMetadataAck => MessageKind::SaveMetadataAck,
        NotificationPayload::Shutdown => MessageKind::ShutdownNotification,
        NotificationPayload::MergeRequest => MessageKind::MergeNotification,
        NotificationPayload::MergeAck => MessageKind::MergeAck,
        NotificationPayload::CommitChange(_) => MessageKind::CommitCommand,
        NotificationPayload::CommitAck => MessageKind::Status,
        NotificationPayload::NodeFailure { .. } => MessageKind::NodeFailureNotification,
    }
}

async fn read_one_message(stream: &mut TcpStream) -> Result<(Message, BytesMut)> {
    let mut buf = BytesMut::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(message) = Message::decode(&mut buf)? {
            return Ok((message, buf));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::new(ErrorKind::NodeGone, "peer closed during handshake"));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn start_on_free_port(
        node: NodeId,
    ) -> (Arc<TransportManager>, InboundReceiver, SocketAddr) {
        // Bind a throwaway listener to learn a free port, then start the
        // transport on it.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = probe.local_addr().unwrap();
        drop(probe);
        let (manager, rx) = TransportManager::new(node, address);
        manager.start().await.unwrap();
        (manager, rx, address)
    }

    #[tokio::test]
    async fn send_between_two_nodes() {
        let (a, _a_rx, _addr_a) = start_on_free_port(NodeId(1)).await;
        let (_b, mut b_rx, address_b) = start_on_free_port(NodeId(2)).await;
        a.connect(NodeId(2), address_b).await.unwrap();
        a.send(
            NodeId(2),
            Message::new(MessageKind::Status, Bytes::from_static(b"ping")),
        )
        .await
        .unwrap();

        let (from, message) = tokio::time::timeout(Duration::from_secs(5), b_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, NodeId(1));
        assert_eq!(message.body.as_ref(), b"ping");
        assert!(!message.is_local());
    }

    #[tokio::test]
    async fn local_send_loops_back_with_local_mask() {
        let (a, mut a_rx) = TransportManager::new(NodeId(1), "127.0.0.1:0".parse().unwrap());
        a.send(
            NodeId(1),
            Message::new(MessageKind::Status, Bytes::from_static(b"self")),
        )
        .await
        .unwrap();
        let (from, message) = a_rx.recv().await.unwrap();
        assert_eq!(from, NodeId(1));
        assert!(message.is_local());
    }

    #[tokio::test]
    async fn request_reply_correlation() {
        let (a, _arx, _addr_a) = start_on_free_port(NodeId(1)).await;
        let (b, mut b_rx, address_b) = start_on_free_port(NodeId(2)).await;
        a.connect(NodeId(2), address_b).await.unwrap();

        // Node B echoes requests back as replies.
        let b_clone = Arc::clone(&b);
        tokio::spawn(async move {
            while let Some((from, request)) = b_rx.recv().await {
                let reply = b_clone.reply_to(
                    &request,
                    Message::new(MessageKind::GetInfoResults, request.body.clone()),
                );
                let _ = b_clone.send(from, reply).await;
            }
        });

        let reply = a
            .request(
                NodeId(2),
                Message::new(MessageKind::GetInfoCommand, Bytes::from_static(b"info?")),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(reply.kind, MessageKind::GetInfoResults);
        assert_eq!(reply.body.as_ref(), b"info?");
    }

    #[tokio::test]
    async fn request_times_out_without_reply() {
        let (a, _arx, _addr) = start_on_free_port(NodeId(1)).await;
        let (_b, _brx, address_b) = start_on_free_port(NodeId(2)).await;
        a.connect(NodeId(2), address_b).await.unwrap();

        let err = a
            .request(
                NodeId(2),
                Message::new(MessageKind::GetInfoCommand, Bytes::new()),
                Duration::from_millis(200),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }
}
