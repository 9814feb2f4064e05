use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::core::error::{Error, ErrorKind, Result};

/// Fixed header: kind (4) + mask (1) + body size (4) + message id (4) +
/// reply-to id (4).
pub const HEADER_CONST_SIZE: usize = 17;
/// Padding after the header keeps the body 32-byte aligned on the wire.
pub const HEADER_PADDING_SIZE: usize = 15;
pub const HEADER_TOTAL_SIZE: usize = HEADER_CONST_SIZE + HEADER_PADDING_SIZE;

pub const MASK_LOCAL: u8 = 0x01;
pub const MASK_DISCOVERY: u8 = 0x02;
pub const MASK_DP_REQUEST: u8 = 0x04;
pub const MASK_DP_REPLY: u8 = 0x08;
pub const MASK_SHARDING: u8 = 0x10;
pub const MASK_MIGRATION: u8 = 0x40;

/// Every message kind of the inter-node protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageKind {
    SearchCommand = 0,
    SearchResults = 1,
    InsertUpdateCommand = 2,
    DeleteCommand = 3,
    SerializeCommand = 4,
    GetInfoCommand = 5,
    GetInfoResults = 6,
    CommitCommand = 7,
    ResetLogCommand = 8,
    Status = 9,
    Lock = 10,
    LockAck = 11,
    LockReleased = 12,
    MoveToMe = 13,
    MoveAck = 14,
    MoveAbort = 15,
    MoveFinish = 16,
    MoveCleanup = 17,
    CopyToMe = 18,
    ReadMetadataRequest = 19,
    ReadMetadataReply = 20,
    LoadBalancingReportRequest = 21,
    LoadBalancingReportReply = 22,
    MergeNotification = 23,
    MergeAck = 24,
    SaveDataNotification = 25,
    SaveDataAck = 26,
    SaveMetadataNotification = 27,
    SaveMetadataAck = 28,
    ShutdownNotification = 29,
    NewNodeReadMetadataRequest = 30,
    NewNodeReadMetadataReply = 31,
    MigrationNotification = 32,
    NodeFailureNotification = 33,
}

impl MessageKind {
    pub fn from_u32(value: u32) -> Result<Self> {
        use MessageKind::*;
        const KINDS: [MessageKind; 34] = [
            SearchCommand,
            SearchResults,
            InsertUpdateCommand,
            DeleteCommand,
            SerializeCommand,
            GetInfoCommand,
            GetInfoResults,
            CommitCommand,
            ResetLogCommand,
            Status,
            Lock,
            LockAck,
            LockReleased,
            MoveToMe,
            MoveAck,
            MoveAbort,
            MoveFinish,
            MoveCleanup,
            CopyToMe,
            ReadMetadataRequest,
            ReadMetadataReply,
            LoadBalancingReportRequest,
            LoadBalancingReportReply,
            MergeNotification,
            MergeAck,
            SaveDataNotification,
            SaveDataAck,
            SaveMetadataNotification,
            SaveMetadataAck,
            ShutdownNotification,
            NewNodeReadMetadataRequest,
            NewNodeReadMetadataReply,
            MigrationNotification,
            NodeFailureNotification,
        ];
        KINDS.get(value as usize).copied().ok_or_else(|| {
            Error::new(ErrorKind::Parse, format!("unknown message kind {}", value))
        })
    }
}

/// One framed inter-node message. Within a process the body is passed as-is
/// (local mask set) and never crosses a socket.
#[derive(Debug, Clone)]
pub struct Message {
    pub kind: MessageKind,
    pub mask: u8,
    pub id: u32,
    pub reply_to: u32,
    pub body: Bytes,
}

impl Message {
    pub fn new(kind: MessageKind, body: Bytes) -> Self {
        Message {
            kind,
            mask: 0,
            id: 0,
            reply_to: 0,
            body,
        }
    }

    pub fn with_mask(mut self, mask: u8) -> Self {
        self.mask |= mask;
        self
    }

    pub fn is_local(&self) -> bool {
        self.mask & MASK_LOCAL != 0
    }

    pub fn is_discovery(&self) -> bool {
        self.mask & MASK_DISCOVERY != 0
    }

    pub fn is_dp_request(&self) -> bool {
        self.mask & MASK_DP_REQUEST != 0
    }

    pub fn is_dp_reply(&self) -> bool {
        self.mask & MASK_DP_REPLY != 0
    }

    pub fn is_sharding(&self) -> bool {
        self.mask & MASK_SHARDING != 0
    }

    pub fn is_migration(&self) -> bool {
        self.mask & MASK_MIGRATION != 0
    }

    /// Serialise the header field by field; the struct is never written with
    /// a raw copy, so alignment and padding differences cannot leak onto the
    /// wire. All integers little-endian.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_TOTAL_SIZE + self.body.len());
        buf.put_u32_le(self.kind as u32);
        buf.put_u8(self.mask);
        buf.put_u32_le(self.body.len() as u32);
        buf.put_u32_le(self.id);
        buf.put_u32_le(self.reply_to);
        buf.put_bytes(0, HEADER_PADDING_SIZE);
        buf.extend_from_slice(&self.body);
        buf
    }

    /// Decode one message from the front of `buf`, or `None` when the frame
    /// is not complete yet.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Message>> {
        if buf.len() < HEADER_TOTAL_SIZE {
            return Ok(None);
        }
        let body_len =
            u32::from_le_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;
        if buf.len() < HEADER_TOTAL_SIZE + body_len {
            return Ok(None);
        }

        let kind = MessageKind::from_u32(buf.get_u32_le())?;
        let mask = buf.get_u8();
        let _body_len = buf.get_u32_le() as usize;
        let id = buf.get_u32_le();
        let reply_to = buf.get_u32_le();
        buf.advance(HEADER_PADDING_SIZE);
        let body = buf.split_to(body_len).freeze();

        Ok(Some(Message {
            kind,
            mask,
            id,
            reply_to,
            body,
        }))
    }
}
