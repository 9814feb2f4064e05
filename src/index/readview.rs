use std::sync::Arc;

use crate::geo::quadtree::QuadTreeNode;
use crate::index::forward::ForwardIndex;
use crate::index::histogram::HistogramStats;
use crate::index::inverted::InvertedDirectory;
use crate::record::schema::Schema;
use crate::trie::node::Trie;

/// Callback fired when the last holder of a readview version releases it.
pub type ReleaseHook = Arc<dyn Fn(u64) + Send + Sync>;

/// One observationally consistent snapshot of every index structure of a
/// shard. Holders keep it alive through `Arc`; dropping the final clone
/// notifies the engine so superseded copies can be reclaimed.
pub struct IndexReadView {
    pub version: u64,
    pub schema: Arc<Schema>,
    pub trie: Arc<Trie>,
    pub forward: Arc<ForwardIndex>,
    pub inverted: Arc<InvertedDirectory>,
    pub quadtree_root: Arc<QuadTreeNode>,
    pub histogram: Arc<HistogramStats>,
    release: Option<ReleaseHook>,
}

impl IndexReadView {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        version: u64,
        schema: Arc<Schema>,
        trie: Arc<Trie>,
        forward: Arc<ForwardIndex>,
        inverted: Arc<InvertedDirectory>,
        quadtree_root: Arc<QuadTreeNode>,
        histogram: Arc<HistogramStats>,
        release: Option<ReleaseHook>,
    ) -> Self {
        IndexReadView {
            version,
            schema,
            trie,
            forward,
            inverted,
            quadtree_root,
            histogram,
            release,
        }
    }

    pub fn total_records(&self) -> usize {
        self.forward.live_count()
    }
}

impl Drop for IndexReadView {
    fn drop(&mut self) {
        if let Some(hook) = self.release.take() {
            hook(self.version);
        }
    }
}

impl std::fmt::Debug for IndexReadView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexReadView")
            .field("version", &self.version)
            .field("records", &self.forward.len())
            .field("keywords", &self.inverted.len())
            .finish()
    }
}
