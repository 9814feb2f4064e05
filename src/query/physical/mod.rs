pub mod geo;
pub mod merge;
pub mod phrase;
pub mod sort;
pub mod term_list;
pub mod union;

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{AttributeMask, RecordId};
use crate::index::readview::IndexReadView;
use crate::query::plan::{PhysicalKind, PlanArena};
use crate::ranking::feedback::FeedbackIndex;

/// One record produced by an operator, with the score aggregated so far.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub record: RecordId,
    pub score: f32,
}

/// Feedback signal bound to the concrete query string being executed.
pub struct FeedbackContext<'a> {
    pub index: &'a FeedbackIndex,
    pub query: &'a str,
    pub now_secs: i64,
    /// Upper bound on any record's boost for this query; used to keep the
    /// top-k termination bound conservative under boosting.
    pub max_boost: f32,
}

/// Everything an operator needs at runtime. The readview pins one
/// consistent snapshot for the whole plan execution.
pub struct ExecContext<'a> {
    pub view: &'a IndexReadView,
    pub attribute_mask: AttributeMask,
    pub prefix_penalty: f32,
    pub similarity_boost: f32,
    pub feedback: Option<FeedbackContext<'a>>,
}

impl<'a> ExecContext<'a> {
    pub fn feedback_boost(&self, record: RecordId) -> f32 {
        let Some(feedback) = &self.feedback else {
            return 1.0;
        };
        let Some(list) = self.view.forward.get(record) else {
            return 1.0;
        };
        feedback
            .index
            .boost_for(feedback.query, &list.record.primary_key, feedback.now_secs)
    }

    pub fn feedback_bound(&self) -> f32 {
        self.feedback.as_ref().map(|f| f.max_boost).unwrap_or(1.0)
    }
}

/// Uniform operator lifecycle. `verify` is the random-access side used by
/// AND/OR parents; it returns the operator's score contribution when the
/// record matches.
pub trait PhysicalOperator: Send {
    fn open(&mut self, ctx: &ExecContext) -> Result<()>;
    fn get_next(&mut self, ctx: &ExecContext) -> Result<Option<Candidate>>;
    fn close(&mut self);
    fn verify(&mut self, ctx: &ExecContext, record: RecordId) -> Result<Option<f32>>;
}

/// Instantiate the runtime operator tree described by a plan arena.
pub fn build_operator(arena: &PlanArena, id: usize) -> Result<Box<dyn PhysicalOperator>> {
    let node = arena.node(id);
    let mut children: Vec<Box<dyn PhysicalOperator>> = Vec::with_capacity(node.children.len());
    for &child in &node.children {
        children.push(build_operator(arena, child)?);
    }

    let op: Box<dyn PhysicalOperator> = match &node.kind {
        PhysicalKind::TermVirtualList(term) => {
            Box::new(term_list::TermVirtualList::new(term.clone()))
        }
        PhysicalKind::SimpleScan(term) => Box::new(term_list::SimpleScan::new(term.clone())),
        PhysicalKind::RandomAccessTerm(term) => {
            Box::new(term_list::RandomAccessTerm::new(term.clone()))
        }
        PhysicalKind::MergeTopK => Box::new(merge::MergeTopK::new(children)),
        PhysicalKind::MergeByShortestList => Box::new(merge::MergeByShortestList::new(children)),
        PhysicalKind::MergeSortedById => Box::new(merge::MergeSortedById::new(children)),
        PhysicalKind::RandomAccessAnd => Box::new(merge::RandomAccessAnd::new(children)),
        PhysicalKind::UnionSortedById => Box::new(union::UnionSortedById::new(children)),
        PhysicalKind::RandomAccessOr => Box::new(union::RandomAccessOr::new(children)),
        PhysicalKind::RandomAccessNot => {
            let child = children.pop().ok_or_else(|| {
                Error::new(ErrorKind::Internal, "NOT operator without a child")
            })?;
            Box::new(union::RandomAccessNot::new(child))
        }
        PhysicalKind::PhraseSearch { terms, slop } => {
            let child = children.pop().ok_or_else(|| {
                Error::new(ErrorKind::Internal, "phrase operator without a child")
            })?;
            Box::new(phrase::PhraseSearch::new(terms.clone(), *slop, child))
        }
        PhysicalKind::GeoNearestNeighbor(shape) => Box::new(geo::GeoNearestNeighbor::new(*shape)),
        PhysicalKind::GeoSimpleScan(shape) => Box::new(geo::GeoSimpleScan::new(*shape)),
        PhysicalKind::RandomAccessGeo(shape) => Box::new(geo::RandomAccessGeo::new(*shape)),
        PhysicalKind::SortByScore => {
            let child = children.pop().ok_or_else(|| {
                Error::new(ErrorKind::Internal, "sort operator without a child")
            })?;
            Box::new(sort::SortByScore::new(child))
        }
        PhysicalKind::SortById => {
            let child = children.pop().ok_or_else(|| {
                Error::new(ErrorKind::Internal, "sort operator without a child")
            })?;
            Box::new(sort::SortById::new(child))
        }
    };
    Ok(op)
}
