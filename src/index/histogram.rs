use std::collections::HashMap;

use crate::core::types::KeywordId;
use crate::index::inverted::InvertedDirectory;

/// Cardinality statistics captured at merge time and consumed by the query
/// optimiser's cost model. Slightly stale by design.
#[derive(Debug, Clone, Default)]
pub struct HistogramStats {
    pub total_records: usize,
    pub total_postings: usize,
    document_frequency: HashMap<KeywordId, usize>,
}

impl HistogramStats {
    pub fn capture(directory: &InvertedDirectory, total_records: usize) -> Self {
        let mut document_frequency = HashMap::with_capacity(directory.len());
        let mut total_postings = 0;
        for (keyword, list) in directory.iter() {
            document_frequency.insert(*keyword, list.len());
            total_postings += list.len();
        }
        HistogramStats {
            total_records,
            total_postings,
            document_frequency,
        }
    }

    pub fn document_frequency(&self, keyword: KeywordId) -> usize {
        self.document_frequency.get(&keyword).copied().unwrap_or(0)
    }

    /// Estimated postings volume of a fuzzy term: the sum over its expanded
    /// leaves.
    pub fn estimate_term(&self, leaves: &[KeywordId]) -> usize {
        leaves.iter().map(|k| self.document_frequency(*k)).sum()
    }

    /// Independence-assumption estimate of an AND result.
    pub fn estimate_and(&self, input_estimates: &[usize]) -> usize {
        if input_estimates.is_empty() {
            return 0;
        }
        if self.total_records == 0 {
            return 0;
        }
        let mut selectivity = 1.0f64;
        for &estimate in input_estimates {
            selectivity *= estimate.min(self.total_records) as f64 / self.total_records as f64;
        }
        (selectivity * self.total_records as f64).ceil() as usize
    }

    /// Union bound estimate of an OR result, capped by the record count.
    pub fn estimate_or(&self, input_estimates: &[usize]) -> usize {
        input_estimates
            .iter()
            .sum::<usize>()
            .min(self.total_records)
    }

    pub fn estimate_not(&self, input_estimate: usize) -> usize {
        self.total_records.saturating_sub(input_estimate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::RecordId;
    use crate::index::inverted::{InvertedList, Posting};
    use std::sync::Arc;

    fn directory() -> InvertedDirectory {
        let mut dir = InvertedDirectory::new();
        let list = |n: u32| {
            Arc::new(InvertedList::from_postings(
                (0..n)
                    .map(|i| Posting {
                        record: RecordId(i),
                        score: 1.0,
                    })
                    .collect(),
            ))
        };
        dir.insert(KeywordId(1), list(10));
        dir.insert(KeywordId(2), list(40));
        dir
    }

    #[test]
    fn estimates() {
        let stats = HistogramStats::capture(&directory(), 100);
        assert_eq!(stats.document_frequency(KeywordId(1)), 10);
        assert_eq!(stats.document_frequency(KeywordId(9)), 0);
        assert_eq!(stats.estimate_term(&[KeywordId(1), KeywordId(2)]), 50);
        // 0.1 * 0.4 * 100 = 4
        assert_eq!(stats.estimate_and(&[10, 40]), 4);
        assert_eq!(stats.estimate_or(&[80, 60]), 100);
        assert_eq!(stats.estimate_not(30), 70);
    }
}
