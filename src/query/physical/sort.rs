use crate::core::error::Result;
use crate::core::types::RecordId;
use crate::query::physical::{Candidate, ExecContext, PhysicalOperator};
use crate::ranking::compare_records_greater_than;

/// Blocking sort: drains its child at open, ranks by descending score with
/// the record-id tie break, and applies the feedback boost when the context
/// carries one.
pub struct SortByScore {
    child: Box<dyn PhysicalOperator>,
    results: Vec<Candidate>,
    cursor: usize,
}

impl SortByScore {
    pub fn new(child: Box<dyn PhysicalOperator>) -> Self {
        SortByScore {
            child,
            results: Vec::new(),
            cursor: 0,
        }
    }
}

impl PhysicalOperator for SortByScore {
    fn open(&mut self, ctx: &ExecContext) -> Result<()> {
        self.child.open(ctx)?;
        while let Some(mut candidate) = self.child.get_next(ctx)? {
            candidate.score *= ctx.feedback_boost(candidate.record);
            self.results.push(candidate);
        }
        self.results.sort_by(|a, b| {
            if compare_records_greater_than(a.score, a.record, b.score, b.record) {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Greater
            }
        });
        Ok(())
    }

    fn get_next(&mut self, _ctx: &ExecContext) -> Result<Option<Candidate>> {
        let item = self.results.get(self.cursor).copied();
        self.cursor += 1;
        Ok(item)
    }

    fn close(&mut self) {
        self.child.close();
        self.results.clear();
        self.cursor = 0;
    }

    fn verify(&mut self, ctx: &ExecContext, record: RecordId) -> Result<Option<f32>> {
        self.child.verify(ctx, record)
    }
}

/// Blocking sort into ascending record-id order.
pub struct SortById {
    child: Box<dyn PhysicalOperator>,
    results: Vec<Candidate>,
    cursor: usize,
}

impl SortById {
    pub fn new(child: Box<dyn PhysicalOperator>) -> Self {
        SortById {
            child,
            results: Vec::new(),
            cursor: 0,
        }
    }
}

impl PhysicalOperator for SortById {
    fn open(&mut self, ctx: &ExecContext) -> Result<()> {
        self.child.open(ctx)?;
        while let Some(candidate) = self.child.get_next(ctx)? {
            self.results.push(candidate);
        }
        self.results.sort_by_key(|c| c.record);
        Ok(())
    }

    fn get_next(&mut self, _ctx: &ExecContext) -> Result<Option<Candidate>> {
        let item = self.results.get(self.cursor).copied();
        self.cursor += 1;
        Ok(item)
    }

    fn close(&mut self) {
        self.child.close();
        self.results.clear();
        self.cursor = 0;
    }

    fn verify(&mut self, ctx: &ExecContext, record: RecordId) -> Result<Option<f32>> {
        self.child.verify(ctx, record)
    }
}
