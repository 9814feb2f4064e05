use std::collections::HashMap;
use std::sync::Arc;

use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use crate::core::types::{AttributeMask, KeywordId, RecordId};
use crate::record::record::Record;

/// One token occurrence inside a record, kept for phrase search and
/// highlighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionHit {
    pub attribute: u8,
    pub position: u32,
    pub char_offset: u32,
}

/// Per-(record, keyword) entry of the forward list, sorted by keyword id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardEntry {
    pub keyword: KeywordId,
    /// tf × sum-of-field-boosts, fixed for the life of the record.
    pub tf_boost_product: f32,
    /// tf_boost_product × idf; refreshed at every merge.
    pub text_relevance: f32,
    pub attribute_mask: AttributeMask,
    pub positions: Vec<PositionHit>,
}

/// Forward list of one record: its keyword layout plus everything needed to
/// answer, verify and export it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardList {
    pub record: Record,
    pub record_length: u32,
    pub entries: Vec<ForwardEntry>,
    /// Write generation that created this slot; `recover_record` only
    /// revives a delete from the same generation.
    pub generation: u64,
}

impl ForwardList {
    pub fn entry_for(&self, keyword: KeywordId) -> Option<&ForwardEntry> {
        self.entries
            .binary_search_by_key(&keyword, |e| e.keyword)
            .ok()
            .map(|i| &self.entries[i])
    }

    /// Random-access check used by AND/OR verifiers: does this record contain
    /// the keyword in any attribute allowed by the filter mask?
    pub fn contains_keyword(&self, keyword: KeywordId, attribute_filter: AttributeMask) -> bool {
        self.entry_for(keyword)
            .map(|e| e.attribute_mask & attribute_filter != 0)
            .unwrap_or(false)
    }
}

/// Record directory of one shard. Slots are append-only; deletion marks the
/// slot invalid and the next merge drops the stale postings.
///
/// Slots hold `Arc`s so a cloned index (a readview snapshot) shares every
/// forward list with the live one; a merge copies only the lists whose
/// relevance it rewrites.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForwardIndex {
    lists: Vec<Arc<ForwardList>>,
    primary_keys: HashMap<Arc<str>, RecordId>,
    deleted: RoaringBitmap,
    /// Write generation in which each deleted slot was invalidated; a
    /// recover is only honoured within the same generation.
    deleted_generation: HashMap<u32, u64>,
}

impl ForwardIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn live_count(&self) -> usize {
        self.lists.len() - self.deleted.len() as usize
    }

    pub fn deleted_count(&self) -> usize {
        self.deleted.len() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.live_count() == 0
    }

    pub fn contains_primary_key(&self, primary_key: &str) -> bool {
        self.primary_keys.contains_key(primary_key)
    }

    pub fn record_id_of(&self, primary_key: &str) -> Option<RecordId> {
        self.primary_keys.get(primary_key).copied()
    }

    pub fn append(&mut self, list: ForwardList) -> RecordId {
        let id = RecordId(self.lists.len() as u32);
        self.primary_keys
            .insert(Arc::from(list.record.primary_key.as_str()), id);
        self.lists.push(Arc::new(list));
        id
    }

    pub fn get(&self, id: RecordId) -> Option<&ForwardList> {
        if self.deleted.contains(id.0) {
            return None;
        }
        self.lists.get(id.0 as usize).map(|list| list.as_ref())
    }

    /// The list regardless of validity; merge uses this to locate stale
    /// postings.
    pub fn get_any(&self, id: RecordId) -> Option<&ForwardList> {
        self.lists.get(id.0 as usize).map(|list| list.as_ref())
    }

    /// Mutable access for the merge's relevance rewrites; a list shared with
    /// a snapshot is copied on write.
    pub fn get_mut(&mut self, id: RecordId) -> Option<&mut ForwardList> {
        if self.deleted.contains(id.0) {
            return None;
        }
        self.lists.get_mut(id.0 as usize).map(Arc::make_mut)
    }

    pub fn is_valid(&self, id: RecordId) -> bool {
        (id.0 as usize) < self.lists.len() && !self.deleted.contains(id.0)
    }

    /// Mark the record invalid. Returns the freed slot id.
    pub fn invalidate(&mut self, primary_key: &str, generation: u64) -> Option<RecordId> {
        let id = self.primary_keys.remove(primary_key)?;
        self.deleted.insert(id.0);
        self.deleted_generation.insert(id.0, generation);
        Some(id)
    }

    /// Undo an `invalidate` that happened in the current write generation;
    /// a delete that already crossed a merge boundary stays deleted.
    pub fn revalidate(&mut self, primary_key: &str, id: RecordId, generation: u64) -> bool {
        if !self.deleted.contains(id.0) {
            return false;
        }
        let Some(list) = self.lists.get(id.0 as usize) else {
            return false;
        };
        if list.record.primary_key != primary_key {
            return false;
        }
        if self.deleted_generation.get(&id.0) != Some(&generation) {
            return false;
        }
        self.deleted.remove(id.0);
        self.deleted_generation.remove(&id.0);
        self.primary_keys.insert(Arc::from(primary_key), id);
        true
    }

    pub fn iter_live(&self) -> impl Iterator<Item = (RecordId, &ForwardList)> {
        self.lists.iter().enumerate().filter_map(move |(i, list)| {
            let id = RecordId(i as u32);
            if self.deleted.contains(id.0) {
                None
            } else {
                Some((id, list.as_ref()))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::schema::{IndexType, Schema, SearchableAttribute};

    fn schema() -> Schema {
        let mut schema = Schema::new("id", IndexType::Keyword);
        schema
            .add_searchable(SearchableAttribute {
                name: "title".to_string(),
                boost: 1.0,
                multi_valued: false,
                highlight: false,
                acl_controlled: false,
            })
            .unwrap();
        schema.commit().unwrap();
        schema
    }

    fn list(pk: &str, generation: u64) -> ForwardList {
        ForwardList {
            record: Record::new(pk, &schema()),
            record_length: 2,
            entries: vec![
                ForwardEntry {
                    keyword: KeywordId(3),
                    tf_boost_product: 1.0,
                    text_relevance: 0.5,
                    attribute_mask: 0b1,
                    positions: vec![],
                },
                ForwardEntry {
                    keyword: KeywordId(9),
                    tf_boost_product: 1.0,
                    text_relevance: 0.5,
                    attribute_mask: 0b1,
                    positions: vec![],
                },
            ],
            generation,
        }
    }

    #[test]
    fn append_and_lookup() {
        let mut index = ForwardIndex::new();
        let id = index.append(list("r-1", 0));
        assert_eq!(index.record_id_of("r-1"), Some(id));
        assert!(index.get(id).is_some());
        assert!(index.get(id).unwrap().contains_keyword(KeywordId(3), u64::MAX));
        assert!(!index.get(id).unwrap().contains_keyword(KeywordId(4), u64::MAX));
    }

    #[test]
    fn attribute_filter_gates_random_access() {
        let mut index = ForwardIndex::new();
        let id = index.append(list("r-1", 0));
        let fwd = index.get(id).unwrap();
        assert!(fwd.contains_keyword(KeywordId(3), 0b1));
        assert!(!fwd.contains_keyword(KeywordId(3), 0b10));
    }

    #[test]
    fn invalidate_then_revalidate_same_generation() {
        let mut index = ForwardIndex::new();
        let id = index.append(list("r-1", 7));
        let freed = index.invalidate("r-1", 7).unwrap();
        assert_eq!(freed, id);
        assert!(!index.is_valid(id));
        assert!(index.get(id).is_none());

        assert!(index.revalidate("r-1", id, 7));
        assert!(index.is_valid(id));
        assert_eq!(index.record_id_of("r-1"), Some(id));
    }

    #[test]
    fn revalidate_rejects_crossed_generation() {
        let mut index = ForwardIndex::new();
        let id = index.append(list("r-1", 7));
        index.invalidate("r-1", 7);
        // A merge bumped the generation in between.
        assert!(!index.revalidate("r-1", id, 8));
        assert!(!index.is_valid(id));
    }

    #[test]
    fn clones_share_unchanged_lists() {
        let mut index = ForwardIndex::new();
        let kept = index.append(list("r-1", 0));
        let touched = index.append(list("r-2", 0));
        let snapshot = index.clone();

        index.get_mut(touched).unwrap().entries[0].text_relevance = 9.0;

        // The rewritten list was copied on write; the other stays shared.
        assert!(Arc::ptr_eq(
            &index.lists[kept.0 as usize],
            &snapshot.lists[kept.0 as usize]
        ));
        assert!(!Arc::ptr_eq(
            &index.lists[touched.0 as usize],
            &snapshot.lists[touched.0 as usize]
        ));
        assert_eq!(
            snapshot.get(touched).unwrap().entries[0].text_relevance,
            0.5
        );
        assert_eq!(index.get(touched).unwrap().entries[0].text_relevance, 9.0);
    }

    #[test]
    fn live_iteration_skips_deleted() {
        let mut index = ForwardIndex::new();
        index.append(list("r-1", 0));
        index.append(list("r-2", 0));
        index.invalidate("r-1", 0);
        let live: Vec<_> = index.iter_live().map(|(id, _)| id).collect();
        assert_eq!(live, vec![RecordId(1)]);
        assert_eq!(index.live_count(), 1);
    }
}
