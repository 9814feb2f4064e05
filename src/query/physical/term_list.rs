use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;

use crate::acl::is_valid_term_position_hit;
use crate::core::error::Result;
use crate::core::types::{KeywordId, RecordId};
use crate::index::inverted::InvertedList;
use crate::index::readview::IndexReadView;
use crate::query::physical::{Candidate, ExecContext, PhysicalOperator};
use crate::query::term::{Term, TermType};
use crate::ranking::{compare_records_greater_than, compute_term_record_runtime_score};
use crate::trie::active::ActiveNodeSet;
use crate::trie::leaf_iter::LeafIterator;

/// One keyword reached by a term's fuzzy/prefix expansion.
#[derive(Debug, Clone, Copy)]
pub struct ExpandedLeaf {
    pub keyword: KeywordId,
    pub distance: u32,
    pub is_prefix_match: bool,
}

/// Expand a term over the trie: active-node computation followed by leaf
/// iteration. A leaf that is itself an active node is a complete match at
/// its own distance; anything deeper is a prefix match at the pan-distance.
pub fn expand_term(view: &IndexReadView, term: &Term) -> Vec<ExpandedLeaf> {
    let threshold = term.threshold();
    let set = ActiveNodeSet::compute(&view.trie, &term.text, threshold);
    match term.term_type {
        TermType::Prefix => LeafIterator::for_prefix(&view.trie, &set, threshold)
            .matches()
            .iter()
            .map(|m| ExpandedLeaf {
                keyword: KeywordId(m.leaf),
                distance: set.distance_of(m.leaf).unwrap_or(m.distance),
                is_prefix_match: set.distance_of(m.leaf).is_none(),
            })
            .collect(),
        TermType::Complete => LeafIterator::for_complete(&view.trie, &set, threshold)
            .matches()
            .iter()
            .map(|m| ExpandedLeaf {
                keyword: KeywordId(m.leaf),
                distance: m.distance,
                is_prefix_match: false,
            })
            .collect(),
    }
}

/// Per-leaf multiplier turning a posting's static score into the term's
/// runtime score; constant across the leaf's postings.
fn leaf_multiplier(term: &Term, leaf: &ExpandedLeaf, ctx: &ExecContext) -> f32 {
    compute_term_record_runtime_score(
        term.boost,
        leaf.distance,
        term.len() as u32,
        leaf.is_prefix_match,
        ctx.prefix_penalty,
        ctx.similarity_boost,
    )
}

/// Random-access verification shared by the term operators: the best runtime
/// score of any expanded leaf present in the record under the attribute
/// filter.
fn verify_term(
    ctx: &ExecContext,
    leaves: &[(ExpandedLeaf, f32)],
    record: RecordId,
) -> Option<f32> {
    let list = ctx.view.forward.get(record)?;
    let mut best: Option<f32> = None;
    for (leaf, multiplier) in leaves {
        if let Some(entry) = list.entry_for(leaf.keyword) {
            if !is_valid_term_position_hit(entry.attribute_mask, ctx.attribute_mask) {
                continue;
            }
            let score = entry.text_relevance * list.record.record_boost * multiplier;
            best = Some(best.map_or(score, |b: f32| b.max(score)));
        }
    }
    best
}

struct HeapEntry {
    score: f32,
    record: RecordId,
    list_index: usize,
    position: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score && self.record == other.record
    }
}
impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        if compare_records_greater_than(self.score, self.record, other.score, other.record) {
            CmpOrdering::Greater
        } else {
            CmpOrdering::Less
        }
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Term virtual list: a heap merging every inverted list of the term's
/// expansion, emitting records in descending runtime-score order without
/// duplicates.
pub struct TermVirtualList {
    term: Term,
    lists: Vec<(Arc<InvertedList>, f32)>,
    leaves: Vec<(ExpandedLeaf, f32)>,
    heap: BinaryHeap<HeapEntry>,
    emitted: HashSet<RecordId>,
}

impl TermVirtualList {
    pub fn new(term: Term) -> Self {
        TermVirtualList {
            term,
            lists: Vec::new(),
            leaves: Vec::new(),
            heap: BinaryHeap::new(),
            emitted: HashSet::new(),
        }
    }

    fn push_cursor(&mut self, list_index: usize, position: usize) {
        let (list, multiplier) = &self.lists[list_index];
        if let Some(posting) = list.get(position) {
            self.heap.push(HeapEntry {
                score: posting.score * multiplier,
                record: posting.record,
                list_index,
                position,
            });
        }
    }
}

impl PhysicalOperator for TermVirtualList {
    fn open(&mut self, ctx: &ExecContext) -> Result<()> {
        let expansion = expand_term(ctx.view, &self.term);
        for leaf in expansion {
            let multiplier = leaf_multiplier(&self.term, &leaf, ctx);
            self.leaves.push((leaf, multiplier));
            if let Some(list) = ctx.view.inverted.get(leaf.keyword) {
                self.lists.push((Arc::clone(list), multiplier));
            }
        }
        for i in 0..self.lists.len() {
            self.push_cursor(i, 0);
        }
        Ok(())
    }

    fn get_next(&mut self, ctx: &ExecContext) -> Result<Option<Candidate>> {
        while let Some(entry) = self.heap.pop() {
            self.push_cursor(entry.list_index, entry.position + 1);
            if !self.emitted.insert(entry.record) {
                continue;
            }
            // The attribute filter is enforced on emit; the heap order is on
            // unfiltered scores.
            let Some(list) = ctx.view.forward.get(entry.record) else {
                continue;
            };
            let visible = self.leaves.iter().any(|(leaf, _)| {
                list.entry_for(leaf.keyword)
                    .map(|e| is_valid_term_position_hit(e.attribute_mask, ctx.attribute_mask))
                    .unwrap_or(false)
            });
            if !visible {
                continue;
            }
            return Ok(Some(Candidate {
                record: entry.record,
                score: entry.score,
            }));
        }
        Ok(None)
    }

    fn close(&mut self) {
        self.heap.clear();
        self.lists.clear();
        self.leaves.clear();
        self.emitted.clear();
    }

    fn verify(&mut self, ctx: &ExecContext, record: RecordId) -> Result<Option<f32>> {
        Ok(verify_term(ctx, &self.leaves, record))
    }
}

/// Materialises the full expansion sorted by record id; the cheap choice when
/// the parent needs id order anyway.
pub struct SimpleScan {
    term: Term,
    leaves: Vec<(ExpandedLeaf, f32)>,
    results: Vec<Candidate>,
    cursor: usize,
}

impl SimpleScan {
    pub fn new(term: Term) -> Self {
        SimpleScan {
            term,
            leaves: Vec::new(),
            results: Vec::new(),
            cursor: 0,
        }
    }
}

impl PhysicalOperator for SimpleScan {
    fn open(&mut self, ctx: &ExecContext) -> Result<()> {
        let expansion = expand_term(ctx.view, &self.term);
        let mut best: std::collections::HashMap<RecordId, f32> = std::collections::HashMap::new();
        for leaf in expansion {
            let multiplier = leaf_multiplier(&self.term, &leaf, ctx);
            self.leaves.push((leaf, multiplier));
            if let Some(list) = ctx.view.inverted.get(leaf.keyword) {
                for posting in list.postings() {
                    let Some(fwd) = ctx.view.forward.get(posting.record) else {
                        continue;
                    };
                    let allowed = fwd
                        .entry_for(leaf.keyword)
                        .map(|e| is_valid_term_position_hit(e.attribute_mask, ctx.attribute_mask))
                        .unwrap_or(false);
                    if !allowed {
                        continue;
                    }
                    let score = posting.score * multiplier;
                    best.entry(posting.record)
                        .and_modify(|s| *s = s.max(score))
                        .or_insert(score);
                }
            }
        }
        self.results = best
            .into_iter()
            .map(|(record, score)| Candidate { record, score })
            .collect();
        self.results.sort_by_key(|c| c.record);
        Ok(())
    }

    fn get_next(&mut self, _ctx: &ExecContext) -> Result<Option<Candidate>> {
        let item = self.results.get(self.cursor).copied();
        self.cursor += 1;
        Ok(item)
    }

    fn close(&mut self) {
        self.results.clear();
        self.leaves.clear();
        self.cursor = 0;
    }

    fn verify(&mut self, ctx: &ExecContext, record: RecordId) -> Result<Option<f32>> {
        Ok(verify_term(ctx, &self.leaves, record))
    }
}

/// Verification-only term operator: the passive side of an AND.
pub struct RandomAccessTerm {
    term: Term,
    leaves: Vec<(ExpandedLeaf, f32)>,
}

impl RandomAccessTerm {
    pub fn new(term: Term) -> Self {
        RandomAccessTerm {
            term,
            leaves: Vec::new(),
        }
    }
}

impl PhysicalOperator for RandomAccessTerm {
    fn open(&mut self, ctx: &ExecContext) -> Result<()> {
        self.leaves = expand_term(ctx.view, &self.term)
            .into_iter()
            .map(|leaf| {
                let multiplier = leaf_multiplier(&self.term, &leaf, ctx);
                (leaf, multiplier)
            })
            .collect();
        Ok(())
    }

    fn get_next(&mut self, _ctx: &ExecContext) -> Result<Option<Candidate>> {
        // Random-access operators never drive iteration.
        Ok(None)
    }

    fn close(&mut self) {
        self.leaves.clear();
    }

    fn verify(&mut self, ctx: &ExecContext, record: RecordId) -> Result<Option<f32>> {
        Ok(verify_term(ctx, &self.leaves, record))
    }
}
