use std::collections::HashMap;
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::core::types::{KeywordId, RecordId};
use crate::ranking::compare_records_greater_than;

/// Lists at least this long sort in parallel during bulk commit.
const PARALLEL_SORT_THRESHOLD: usize = 4096;

/// One inverted-list entry: a record containing the keyword plus its static
/// score (text relevance × record boost), fixed until the next merge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    pub record: RecordId,
    pub score: f32,
}

/// Immutable sorted postings of one keyword. Readers hold this via `Arc`;
/// a merge replaces the directory entry wholesale.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvertedList {
    postings: Vec<Posting>,
}

impl InvertedList {
    /// Build from unordered postings: sort descending by score with the
    /// ascending-record-id tie break, then drop duplicate records (keeping
    /// the best-ranked occurrence).
    pub fn from_postings(mut postings: Vec<Posting>) -> Self {
        let ranked = |a: &Posting, b: &Posting| {
            if compare_records_greater_than(a.score, a.record, b.score, b.record) {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Greater
            }
        };
        if postings.len() >= PARALLEL_SORT_THRESHOLD {
            postings.par_sort_by(ranked);
        } else {
            postings.sort_by(ranked);
        }
        // Keep the best-ranked posting per record; later entries of the same
        // record rank lower by construction.
        let mut seen = std::collections::HashSet::with_capacity(postings.len());
        postings.retain(|p| seen.insert(p.record));
        InvertedList { postings }
    }

    pub fn postings(&self) -> &[Posting] {
        &self.postings
    }

    pub fn len(&self) -> usize {
        self.postings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.postings.is_empty()
    }

    pub fn max_score(&self) -> f32 {
        self.postings.first().map(|p| p.score).unwrap_or(0.0)
    }

    pub fn get(&self, index: usize) -> Option<Posting> {
        self.postings.get(index).copied()
    }

    pub fn contains(&self, record: RecordId) -> bool {
        self.postings.iter().any(|p| p.record == record)
    }
}

/// Keyword id → readview list. Cloning shares every list.
#[derive(Debug, Clone, Default)]
pub struct InvertedDirectory {
    lists: HashMap<KeywordId, Arc<InvertedList>>,
}

impl InvertedDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, keyword: KeywordId) -> Option<&Arc<InvertedList>> {
        self.lists.get(&keyword)
    }

    pub fn insert(&mut self, keyword: KeywordId, list: Arc<InvertedList>) {
        self.lists.insert(keyword, list);
    }

    pub fn remove(&mut self, keyword: KeywordId) {
        self.lists.remove(&keyword);
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&KeywordId, &Arc<InvertedList>)> {
        self.lists.iter()
    }

    pub fn to_serializable(&self) -> Vec<(KeywordId, InvertedList)> {
        let mut lists: Vec<(KeywordId, InvertedList)> = self
            .lists
            .iter()
            .map(|(k, v)| (*k, (**v).clone()))
            .collect();
        lists.sort_by_key(|(k, _)| *k);
        lists
    }

    pub fn from_serializable(lists: Vec<(KeywordId, InvertedList)>) -> Self {
        InvertedDirectory {
            lists: lists
                .into_iter()
                .map(|(k, v)| (k, Arc::new(v)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postings_sorted_by_score_then_id() {
        let list = InvertedList::from_postings(vec![
            Posting { record: RecordId(5), score: 1.0 },
            Posting { record: RecordId(2), score: 3.0 },
            Posting { record: RecordId(9), score: 3.0 },
            Posting { record: RecordId(1), score: 2.0 },
        ]);
        let order: Vec<u32> = list.postings().iter().map(|p| p.record.0).collect();
        assert_eq!(order, vec![2, 9, 1, 5]);
        assert_eq!(list.max_score(), 3.0);
    }

    #[test]
    fn duplicate_records_collapse_to_best() {
        let list = InvertedList::from_postings(vec![
            Posting { record: RecordId(4), score: 1.0 },
            Posting { record: RecordId(4), score: 2.5 },
        ]);
        assert_eq!(list.len(), 1);
        assert_eq!(list.get(0).unwrap().score, 2.5);
    }
}
