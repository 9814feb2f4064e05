use std::fs;
use std::path::{Path, PathBuf};

use crate::core::error::Result;
use crate::core::types::ShardId;

/// On-disk layout of one shard's persisted state.
#[derive(Debug, Clone)]
pub struct ShardLayout {
    pub base_dir: PathBuf,
}

impl ShardLayout {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;
        Ok(ShardLayout { base_dir })
    }

    pub fn for_shard(root: impl AsRef<Path>, shard: ShardId) -> Result<Self> {
        Self::new(root.as_ref().join(format!("shard-{}", shard.0)))
    }

    pub fn schema_path(&self) -> PathBuf {
        self.base_dir.join("schema.bin")
    }

    pub fn trie_path(&self) -> PathBuf {
        self.base_dir.join("trie.bin")
    }

    pub fn forward_path(&self) -> PathBuf {
        self.base_dir.join("forward.bin")
    }

    pub fn inverted_path(&self) -> PathBuf {
        self.base_dir.join("inverted.bin")
    }

    pub fn quadtree_path(&self) -> PathBuf {
        self.base_dir.join("quadtree.bin")
    }

    pub fn analyzer_path(&self) -> PathBuf {
        self.base_dir.join("analyzer.bin")
    }

    pub fn feedback_path(&self) -> PathBuf {
        self.base_dir.join("feedback.bin")
    }

    /// Cluster-level metadata lives beside the shard directories.
    pub fn metadata_path(root: impl AsRef<Path>) -> PathBuf {
        root.as_ref().join("cluster-metadata.bin")
    }
}
