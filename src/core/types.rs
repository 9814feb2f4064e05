use serde::{Deserialize, Serialize};
use std::fmt;

/// Internal record id, assigned densely on ingest. Never exposed to callers;
/// the external identity of a record is its primary key string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub u32);

impl RecordId {
    pub fn new(id: u32) -> Self {
        RecordId(id)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Keyword id. Equal to the id of the trie terminal node that owns the
/// keyword, assigned on first insertion and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeywordId(pub u32);

/// Index of a searchable attribute in the schema's ordered list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AttributeId(pub u8);

impl AttributeId {
    pub fn bit(&self) -> u64 {
        1u64 << self.0
    }
}

/// Bitmap over searchable attribute ids. Bit i set means attribute i holds
/// the keyword occurrence.
pub type AttributeMask = u64;

/// Role id for record- and attribute-level access control.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoleId(pub String);

impl RoleId {
    pub fn new(id: impl Into<String>) -> Self {
        RoleId(id.into())
    }
}

/// Identity of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Logical partition of the record set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId(pub u32);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "shard-{}", self.0)
    }
}

/// Identity of a long-lived cluster operation: owning node plus a counter
/// monotonically increasing on that node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId {
    pub node: NodeId,
    pub seq: u64,
}

impl OperationId {
    pub fn new(node: NodeId, seq: u64) -> Self {
        OperationId { node, seq }
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/op-{}", self.node, self.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_bits() {
        assert_eq!(AttributeId(0).bit(), 1);
        assert_eq!(AttributeId(5).bit(), 32);
        let mask = AttributeId(0).bit() | AttributeId(3).bit();
        assert_eq!(mask, 0b1001);
    }
}
