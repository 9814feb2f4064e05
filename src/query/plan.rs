use crate::geo::shapes::Shape;
use crate::query::term::Term;

/// Sort property carried between physical operators. An operator whose
/// output property differs from its parent's required input property gets a
/// sort operator injected in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortProperty {
    SortedByScore,
    SortedById,
}

/// Physical operator kinds. Random-access variants can only verify; they
/// never drive iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum PhysicalKind {
    /// Heap-merge of the inverted lists of a term's active-node expansion,
    /// descending runtime score.
    TermVirtualList(Term),
    /// Materialise the full expansion, ascending record id.
    SimpleScan(Term),
    RandomAccessTerm(Term),

    MergeTopK,
    /// Drive iteration by the cheapest child; verify the rest by random
    /// access.
    MergeByShortestList,
    MergeSortedById,
    RandomAccessAnd,

    UnionSortedById,
    RandomAccessOr,

    RandomAccessNot,

    PhraseSearch { terms: Vec<Term>, slop: u32 },

    GeoNearestNeighbor(Shape),
    GeoSimpleScan(Shape),
    RandomAccessGeo(Shape),

    SortByScore,
    SortById,
}

impl PhysicalKind {
    /// Random-access operators cannot produce a stream of records.
    pub fn is_random_access_only(&self) -> bool {
        matches!(
            self,
            PhysicalKind::RandomAccessTerm(_)
                | PhysicalKind::RandomAccessAnd
                | PhysicalKind::RandomAccessOr
                | PhysicalKind::RandomAccessNot
                | PhysicalKind::RandomAccessGeo(_)
        )
    }

    /// Output ordering this operator guarantees, given its children's
    /// outputs. `None` means unsorted.
    pub fn output_property(&self) -> Option<SortProperty> {
        match self {
            PhysicalKind::TermVirtualList(_) => Some(SortProperty::SortedByScore),
            PhysicalKind::SimpleScan(_) => Some(SortProperty::SortedById),
            PhysicalKind::MergeTopK => Some(SortProperty::SortedByScore),
            PhysicalKind::MergeByShortestList => None,
            PhysicalKind::MergeSortedById => Some(SortProperty::SortedById),
            PhysicalKind::UnionSortedById => Some(SortProperty::SortedById),
            PhysicalKind::PhraseSearch { .. } => None,
            PhysicalKind::GeoNearestNeighbor(_) => Some(SortProperty::SortedByScore),
            PhysicalKind::GeoSimpleScan(_) => Some(SortProperty::SortedById),
            PhysicalKind::SortByScore => Some(SortProperty::SortedByScore),
            PhysicalKind::SortById => Some(SortProperty::SortedById),
            _ => None,
        }
    }

    /// Input ordering this operator demands from every driving child.
    pub fn required_input_property(&self) -> Option<SortProperty> {
        match self {
            PhysicalKind::MergeTopK => Some(SortProperty::SortedByScore),
            PhysicalKind::MergeSortedById | PhysicalKind::UnionSortedById => {
                Some(SortProperty::SortedById)
            }
            _ => None,
        }
    }

    /// Whether the operator applies the feedback boost itself when it is
    /// ranking by score.
    pub fn is_feedback_capable(&self) -> bool {
        matches!(self, PhysicalKind::MergeTopK | PhysicalKind::SortByScore)
    }
}

/// Cost of one operator, in abstract work units.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlanCost {
    pub open: f64,
    pub get_next: f64,
    pub close: f64,
}

impl PlanCost {
    pub fn total(&self, estimated_get_next_calls: f64) -> f64 {
        self.open + estimated_get_next_calls * self.get_next + self.close
    }
}

#[derive(Debug, Clone)]
pub struct PlanNode {
    pub kind: PhysicalKind,
    pub children: Vec<usize>,
    pub parent: Option<usize>,
    pub output: Option<SortProperty>,
    /// Estimated result cardinality from the histogram statistics.
    pub estimate: usize,
    pub cost: PlanCost,
}

/// Physical plan: an arena of operator nodes with index-based parent and
/// child links (the operator tree is cyclic if expressed with references).
#[derive(Debug, Clone, Default)]
pub struct PlanArena {
    pub nodes: Vec<PlanNode>,
    pub root: usize,
}

impl PlanArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, kind: PhysicalKind, children: Vec<usize>) -> usize {
        let id = self.nodes.len();
        let output = kind.output_property();
        self.nodes.push(PlanNode {
            kind,
            children: children.clone(),
            parent: None,
            output,
            estimate: 0,
            cost: PlanCost::default(),
        });
        for child in children {
            self.nodes[child].parent = Some(id);
        }
        id
    }

    pub fn node(&self, id: usize) -> &PlanNode {
        &self.nodes[id]
    }

    pub fn root_node(&self) -> &PlanNode {
        &self.nodes[self.root]
    }

    /// Total cost of the tree rooted at `root` for a request of `k` results.
    pub fn total_cost(&self, k: usize) -> f64 {
        self.cost_of(self.root, k as f64)
    }

    fn cost_of(&self, id: usize, requested: f64) -> f64 {
        let node = &self.nodes[id];
        let calls = requested.min(node.estimate.max(1) as f64);
        let own = node.cost.total(calls);
        let child_requested = match node.kind {
            // Blocking operators drain their children in full at open time.
            PhysicalKind::SortByScore | PhysicalKind::SortById => f64::MAX,
            _ => calls,
        };
        own + node
            .children
            .iter()
            .map(|&c| self.cost_of(c, child_requested))
            .sum::<f64>()
    }
}
