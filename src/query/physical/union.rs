use crate::core::error::Result;
use crate::core::types::RecordId;
use crate::query::physical::{Candidate, ExecContext, PhysicalOperator};
use crate::ranking::aggregate_score_for_not;

/// K-way union of id-sorted children: ascending record id, duplicates merged
/// with the OR aggregation (maximum score).
pub struct UnionSortedById {
    children: Vec<Box<dyn PhysicalOperator>>,
    heads: Vec<Option<Candidate>>,
}

impl UnionSortedById {
    pub fn new(children: Vec<Box<dyn PhysicalOperator>>) -> Self {
        let n = children.len();
        UnionSortedById {
            children,
            heads: vec![None; n],
        }
    }
}

impl PhysicalOperator for UnionSortedById {
    fn open(&mut self, ctx: &ExecContext) -> Result<()> {
        for child in &mut self.children {
            child.open(ctx)?;
        }
        for i in 0..self.children.len() {
            self.heads[i] = self.children[i].get_next(ctx)?;
        }
        Ok(())
    }

    fn get_next(&mut self, ctx: &ExecContext) -> Result<Option<Candidate>> {
        let minimum = self
            .heads
            .iter()
            .flatten()
            .map(|c| c.record)
            .min();
        let Some(record) = minimum else {
            return Ok(None);
        };

        let mut score = -1.0f32;
        for i in 0..self.children.len() {
            if let Some(head) = self.heads[i] {
                if head.record == record {
                    score = score.max(head.score);
                    self.heads[i] = self.children[i].get_next(ctx)?;
                }
            }
        }
        Ok(Some(Candidate { record, score }))
    }

    fn close(&mut self) {
        for child in &mut self.children {
            child.close();
        }
        self.heads.iter_mut().for_each(|h| *h = None);
    }

    fn verify(&mut self, ctx: &ExecContext, record: RecordId) -> Result<Option<f32>> {
        verify_or(&mut self.children, ctx, record)
    }
}

fn verify_or(
    children: &mut [Box<dyn PhysicalOperator>],
    ctx: &ExecContext,
    record: RecordId,
) -> Result<Option<f32>> {
    let mut best: Option<f32> = None;
    for child in children {
        if let Some(score) = child.verify(ctx, record)? {
            best = Some(best.map_or(score, |b: f32| b.max(score)));
        }
    }
    Ok(best)
}

/// Verification-only OR.
pub struct RandomAccessOr {
    children: Vec<Box<dyn PhysicalOperator>>,
}

impl RandomAccessOr {
    pub fn new(children: Vec<Box<dyn PhysicalOperator>>) -> Self {
        RandomAccessOr { children }
    }
}

impl PhysicalOperator for RandomAccessOr {
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
        verify_or(&mut self.children, ctx, record)
    }
}

/// Verification-only NOT: a record passes when the wrapped child does not
/// match it.
pub struct RandomAccessNot {
    child: Box<dyn PhysicalOperator>,
}

impl RandomAccessNot {
    pub fn new(child: Box<dyn PhysicalOperator>) -> Self {
        RandomAccessNot { child }
    }
}

impl PhysicalOperator for RandomAccessNot {
    fn open(&mut self, ctx: &ExecContext) -> Result<()> {
        self.child.open(ctx)
    }

    fn get_next(&mut self, _ctx: &ExecContext) -> Result<Option<Candidate>> {
        Ok(None)
    }

    fn close(&mut self) {
        self.child.close();
    }

    fn verify(&mut self, ctx: &ExecContext, record: RecordId) -> Result<Option<f32>> {
        match self.child.verify(ctx, record)? {
            Some(_) => Ok(None),
            None => Ok(Some(aggregate_score_for_not(0.0))),
        }
    }
}
