use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};

use crate::core::error::Result;
use crate::core::types::RecordId;
use crate::query::physical::{Candidate, ExecContext, PhysicalOperator};
use crate::ranking::compare_records_greater_than;

struct Ranked(Candidate);

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for Ranked {}
impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        if compare_records_greater_than(
            self.0.score,
            self.0.record,
            other.0.score,
            other.0.record,
        ) {
            CmpOrdering::Greater
        } else {
            CmpOrdering::Less
        }
    }
}
impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Threshold-Algorithm AND over score-sorted children: candidates stream from
/// every child, membership in the others is checked by random access, and a
/// buffered result is emitted once its score meets the upper bound of
/// everything unseen.
pub struct MergeTopK {
    children: Vec<Box<dyn PhysicalOperator>>,
    upper_bounds: Vec<f32>,
    exhausted: Vec<bool>,
    buffered: BinaryHeap<Ranked>,
    seen: HashSet<RecordId>,
    draining: bool,
}

impl MergeTopK {
    pub fn new(children: Vec<Box<dyn PhysicalOperator>>) -> Self {
        let n = children.len();
        MergeTopK {
            children,
            upper_bounds: vec![f32::INFINITY; n],
            exhausted: vec![false; n],
            buffered: BinaryHeap::new(),
            seen: HashSet::new(),
            draining: false,
        }
    }

    fn threshold(&self, ctx: &ExecContext) -> f32 {
        if self.upper_bounds.iter().any(|b| b.is_infinite()) {
            return f32::INFINITY;
        }
        self.upper_bounds.iter().sum::<f32>() * ctx.feedback_bound()
    }

    /// Pull one candidate from each live child and try to complete it
    /// against the rest.
    fn advance_round(&mut self, ctx: &ExecContext) -> Result<()> {
        for i in 0..self.children.len() {
            if self.exhausted[i] {
                continue;
            }
            let pulled = self.children[i].get_next(ctx)?;
            let Some(candidate) = pulled else {
                self.exhausted[i] = true;
                // An exhausted child has shown every record it contains; any
                // unseen record would fail its verification, so streaming is
                // over and the buffer is drained.
                self.draining = true;
                continue;
            };
            self.upper_bounds[i] = candidate.score;
            if !self.seen.insert(candidate.record) {
                continue;
            }
            let mut total = candidate.score;
            let mut matched = true;
            for (j, child) in self.children.iter_mut().enumerate() {
                if j == i {
                    continue;
                }
                match child.verify(ctx, candidate.record)? {
                    Some(score) => total += score,
                    None => {
                        matched = false;
                        break;
                    }
                }
            }
            if matched {
                let boosted = total * ctx.feedback_boost(candidate.record);
                self.buffered.push(Ranked(Candidate {
                    record: candidate.record,
                    score: boosted,
                }));
            }
        }
        Ok(())
    }
}

impl PhysicalOperator for MergeTopK {
    fn open(&mut self, ctx: &ExecContext) -> Result<()> {
        for child in &mut self.children {
            child.open(ctx)?;
        }
        Ok(())
    }

    fn get_next(&mut self, ctx: &ExecContext) -> Result<Option<Candidate>> {
        loop {
            if self.draining {
                return Ok(self.buffered.pop().map(|r| r.0));
            }
            if let Some(top) = self.buffered.peek() {
                if top.0.score >= self.threshold(ctx) {
                    return Ok(self.buffered.pop().map(|r| r.0));
                }
            }
            self.advance_round(ctx)?;
        }
    }

    fn close(&mut self) {
        for child in &mut self.children {
            child.close();
        }
        self.buffered.clear();
        self.seen.clear();
    }

    fn verify(&mut self, ctx: &ExecContext, record: RecordId) -> Result<Option<f32>> {
        verify_and(&mut self.children, ctx, record)
    }
}

fn verify_and(
    children: &mut [Box<dyn PhysicalOperator>],
    ctx: &ExecContext,
    record: RecordId,
) -> Result<Option<f32>> {
    let mut total = 0.0;
    for child in children {
        match child.verify(ctx, record)? {
            Some(score) => total += score,
            None => return Ok(None),
        }
    }
    Ok(Some(total))
}

/// AND driven by its first (cheapest) child; every other child only
/// verifies. Output order follows the driver, so the optimiser treats it as
/// unsorted.
pub struct MergeByShortestList {
    children: Vec<Box<dyn PhysicalOperator>>,
}

impl MergeByShortestList {
    pub fn new(children: Vec<Box<dyn PhysicalOperator>>) -> Self {
        MergeByShortestList { children }
    }
}

impl PhysicalOperator for MergeByShortestList {
    fn open(&mut self, ctx: &ExecContext) -> Result<()> {
        for child in &mut self.children {
            child.open(ctx)?;
        }
        Ok(())
    }

    fn get_next(&mut self, ctx: &ExecContext) -> Result<Option<Candidate>> {
        loop {
            let (driver, verifiers) = self.children.split_first_mut().expect("has driver");
            let Some(candidate) = driver.get_next(ctx)? else {
                return Ok(None);
            };
            let mut total = candidate.score;
            let mut matched = true;
            for child in verifiers.iter_mut() {
                match child.verify(ctx, candidate.record)? {
                    Some(score) => total += score,
                    None => {
                        matched = false;
                        break;
                    }
                }
            }
            if matched {
                return Ok(Some(Candidate {
                    record: candidate.record,
                    score: total,
                }));
            }
        }
    }

    fn close(&mut self) {
        for child in &mut self.children {
            child.close();
        }
    }

    fn verify(&mut self, ctx: &ExecContext, record: RecordId) -> Result<Option<f32>> {
        verify_and(&mut self.children, ctx, record)
    }
}

/// K-way intersection of id-sorted children.
pub struct MergeSortedById {
    children: Vec<Box<dyn PhysicalOperator>>,
    heads: Vec<Option<Candidate>>,
    opened: bool,
}

impl MergeSortedById {
    pub fn new(children: Vec<Box<dyn PhysicalOperator>>) -> Self {
        let n = children.len();
        MergeSortedById {
            children,
            heads: vec![None; n],
            opened: false,
        }
    }
}

impl PhysicalOperator for MergeSortedById {
    fn open(&mut self, ctx: &ExecContext) -> Result<()> {
        for child in &mut self.children {
            child.open(ctx)?;
        }
        for i in 0..self.children.len() {
            self.heads[i] = self.children[i].get_next(ctx)?;
        }
        self.opened = true;
        Ok(())
    }

    fn get_next(&mut self, ctx: &ExecContext) -> Result<Option<Candidate>> {
        loop {
            // The frontier record is the maximum head; every child advances
            // to it or past it.
            let mut target: Option<RecordId> = None;
            for head in &self.heads {
                match head {
                    None => return Ok(None),
                    Some(c) => {
                        target = Some(target.map_or(c.record, |t: RecordId| t.max(c.record)));
                    }
                }
            }
            let target = target.expect("children are non-empty");

            let mut all_equal = true;
            let mut total = 0.0;
            for i in 0..self.children.len() {
                while let Some(head) = self.heads[i] {
                    if head.record >= target {
                        break;
                    }
                    self.heads[i] = self.children[i].get_next(ctx)?;
                }
                match self.heads[i] {
                    None => return Ok(None),
                    Some(head) if head.record == target => total += head.score,
                    Some(_) => all_equal = false,
                }
            }
            if all_equal {
                for i in 0..self.children.len() {
                    self.heads[i] = self.children[i].get_next(ctx)?;
                }
                return Ok(Some(Candidate {
                    record: target,
                    score: total,
                }));
            }
        }
    }

    fn close(&mut self) {
        for child in &mut self.children {
            child.close();
        }
        self.heads.iter_mut().for_each(|h| *h = None);
    }

    fn verify(&mut self, ctx: &ExecContext, record: RecordId) -> Result<Option<f32>> {
        verify_and(&mut self.children, ctx, record)
    }
}

/// Verification-only AND, usable as the passive side of an enclosing AND.
pub struct RandomAccessAnd {
    children: Vec<Box<dyn PhysicalOperator>>,
}

impl RandomAccessAnd {
    pub fn new(children: Vec<Box<dyn PhysicalOperator>>) -> Self {
        RandomAccessAnd { children }
    }
}

impl PhysicalOperator for RandomAccessAnd {
    fn open(&mut self, ctx: &ExecContext) -> Result<()> {
        for child in &mut self.children {
            child.open(ctx)?;
        }
        Ok(())
    }

    fn get_next(&mut self, _ctx: &ExecContext) -> Result<Option<Candidate>> {
        Ok(None)
    }

    fn close(&mut self) {
        for child in &mut self.children {
            child.close();
        }
    }

    fn verify(&mut self, ctx: &ExecContext, record: RecordId) -> Result<Option<f32>> {
        verify_and(&mut self.children, ctx, record)
    }
}
