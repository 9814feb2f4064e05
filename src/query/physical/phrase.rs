use std::collections::HashMap;

use crate::acl::is_valid_term_position_hit;
use crate::core::error::Result;
use crate::core::types::RecordId;
use crate::query::physical::term_list::{expand_term, ExpandedLeaf};
use crate::query::physical::{Candidate, ExecContext, PhysicalOperator};
use crate::query::term::Term;
use crate::ranking::{compute_positional_score, compute_sloppy_frequency};

/// Positional phrase match above an AND of the constituent terms. The child
/// guarantees every term occurs in the record; this operator checks that the
/// occurrences line up within the slop budget and shapes the score by the
/// sloppy frequency.
pub struct PhraseSearch {
    terms: Vec<Term>,
    slop: u32,
    child: Box<dyn PhysicalOperator>,
    expansions: Vec<Vec<ExpandedLeaf>>,
}

impl PhraseSearch {
    pub fn new(terms: Vec<Term>, slop: u32, child: Box<dyn PhysicalOperator>) -> Self {
        PhraseSearch {
            terms,
            slop,
            child,
            expansions: Vec::new(),
        }
    }

    /// Slop distances of every phrase occurrence in the record, or an empty
    /// list when the phrase does not occur.
    fn phrase_occurrences(&self, ctx: &ExecContext, record: RecordId) -> Vec<u32> {
        let Some(forward) = ctx.view.forward.get(record) else {
            return Vec::new();
        };

        // Positions of each term per attribute, restricted to the caller's
        // attribute filter.
        let mut per_attribute: HashMap<u8, Vec<Vec<u32>>> = HashMap::new();
        for (term_index, expansion) in self.expansions.iter().enumerate() {
            for leaf in expansion {
                let Some(entry) = forward.entry_for(leaf.keyword) else {
                    continue;
                };
                if !is_valid_term_position_hit(entry.attribute_mask, ctx.attribute_mask) {
                    continue;
                }
                for hit in &entry.positions {
                    if (1u64 << hit.attribute) & ctx.attribute_mask == 0 {
                        continue;
                    }
                    let slots = per_attribute
                        .entry(hit.attribute)
                        .or_insert_with(|| vec![Vec::new(); self.terms.len()]);
                    slots[term_index].push(hit.position);
                }
            }
        }

        let mut distances = Vec::new();
        for slots in per_attribute.values_mut() {
            if slots.iter().any(|positions| positions.is_empty()) {
                continue;
            }
            for positions in slots.iter_mut() {
                positions.sort_unstable();
                positions.dedup();
            }
            // For each occurrence of the first term, chain the closest later
            // occurrence of each following term; the accumulated slack is the
            // occurrence's slop distance.
            'starts: for &start in &slots[0] {
                let mut previous = start;
                let mut slack = 0u32;
                for positions in &slots[1..] {
                    let Some(&next) = positions.iter().find(|&&p| p > previous) else {
                        continue 'starts;
                    };
                    slack += next - previous - 1;
                    previous = next;
                }
                if slack <= self.slop {
                    distances.push(slack);
                }
            }
        }
        distances
    }
}

impl PhysicalOperator for PhraseSearch {
    fn open(&mut self, ctx: &ExecContext) -> Result<()> {
        self.child.open(ctx)?;
        self.expansions = self
            .terms
            .iter()
            .map(|term| expand_term(ctx.view, term))
            .collect();
        Ok(())
    }

    fn get_next(&mut self, ctx: &ExecContext) -> Result<Option<Candidate>> {
        loop {
            let Some(candidate) = self.child.get_next(ctx)? else {
                return Ok(None);
            };
            let occurrences = self.phrase_occurrences(ctx, candidate.record);
            if occurrences.is_empty() {
                continue;
            }
            let sloppy = compute_sloppy_frequency(&occurrences);
            return Ok(Some(Candidate {
                record: candidate.record,
                score: compute_positional_score(candidate.score, sloppy),
            }));
        }
    }

    fn close(&mut self) {
        self.child.close();
        self.expansions.clear();
    }

    fn verify(&mut self, ctx: &ExecContext, record: RecordId) -> Result<Option<f32>> {
        let Some(and_score) = self.child.verify(ctx, record)? else {
            return Ok(None);
        };
        let occurrences = self.phrase_occurrences(ctx, record);
        if occurrences.is_empty() {
            return Ok(None);
        }
        let sloppy = compute_sloppy_frequency(&occurrences);
        Ok(Some(compute_positional_score(and_score, sloppy)))
    }
}
