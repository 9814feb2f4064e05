use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::analysis::analyzer::Analyzer;
use crate::core::config::EngineConfig;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{KeywordId, RecordId};
use crate::geo::quadtree::{GeoElement, QuadTree};
use crate::index::forward::{ForwardEntry, ForwardIndex, ForwardList, PositionHit};
use crate::index::histogram::HistogramStats;
use crate::index::inverted::{InvertedDirectory, InvertedList, Posting};
use crate::index::merge::run_rebuild;
use crate::index::readview::{IndexReadView, ReleaseHook};
use crate::record::record::Record;
use crate::record::schema::{IndexType, PositionIndexMode, Schema};
use crate::trie::node::Trie;

/// Position stride between the values of a multi-valued attribute, so a
/// phrase cannot match across value boundaries.
const MULTI_VALUE_POSITION_GAP: u32 = 1000;

#[derive(Debug, Default)]
struct WriteView {
    /// Record ids appended per keyword since the last merge, unsorted.
    appends: HashMap<KeywordId, Vec<RecordId>>,
    /// Keywords whose readview list must be rebuilt.
    dirty: HashSet<KeywordId>,
    /// Deletes and geo mutations force a republish even with no dirty list.
    structural_change: bool,
    pending_writes: usize,
}

impl WriteView {
    fn is_clean(&self) -> bool {
        self.dirty.is_empty() && !self.structural_change
    }

    fn mark(&mut self, keyword: KeywordId) {
        self.dirty.insert(keyword);
    }

    fn clear(&mut self) {
        self.appends.clear();
        self.dirty.clear();
        self.structural_change = false;
        self.pending_writes = 0;
    }
}

/// Writer-side state; everything behind the single merge mutex.
struct Master {
    trie: Trie,
    forward: ForwardIndex,
    directory: InvertedDirectory,
    quadtree: QuadTree,
    writeview: WriteView,
    histogram: HistogramStats,
    generation: u64,
    committed: bool,
    merges_since_histogram: usize,
    writes_since_histogram: usize,
}

/// Output of rebuilding one dirty inverted list. Computed read-only (and in
/// parallel when a worker pool is configured); applied by the dispatcher.
pub(crate) struct RebuiltList {
    pub keyword: KeywordId,
    pub list: InvertedList,
    pub relevance_updates: Vec<(RecordId, f32)>,
}

/// Pure rebuild of one keyword's postings from the forward index: drops
/// invalidated records, recomputes idf-dependent scores, sorts by score.
pub(crate) fn rebuild_list(
    keyword: KeywordId,
    old: Option<&InvertedList>,
    appended: &[RecordId],
    forward: &ForwardIndex,
    total_records: usize,
) -> RebuiltList {
    let mut candidates: Vec<RecordId> = Vec::new();
    let mut seen = HashSet::new();
    if let Some(old) = old {
        for posting in old.postings() {
            if seen.insert(posting.record) {
                candidates.push(posting.record);
            }
        }
    }
    for &record in appended {
        if seen.insert(record) {
            candidates.push(record);
        }
    }

    candidates.retain(|&id| {
        forward
            .get(id)
            .map(|list| list.entry_for(keyword).is_some())
            .unwrap_or(false)
    });

    let document_frequency = candidates.len();
    let idf = ((total_records as f32 + 1.0) / (document_frequency as f32 + 1.0)).ln();

    let mut postings = Vec::with_capacity(candidates.len());
    let mut relevance_updates = Vec::with_capacity(candidates.len());
    for id in candidates {
        let list = forward.get(id).expect("validated above");
        let entry = list.entry_for(keyword).expect("validated above");
        let text_relevance = crate::ranking::compute_text_relevance(entry.tf_boost_product, idf);
        relevance_updates.push((id, text_relevance));
        postings.push(Posting {
            record: id,
            score: text_relevance * list.record.record_boost,
        });
    }

    RebuiltList {
        keyword,
        list: InvertedList::from_postings(postings),
        relevance_updates,
    }
}

/// Copy-on-write index bundle of one shard: trie, forward and inverted
/// index, quadtree and histogram, published as immutable readviews. Readers
/// never block writers and writers never block readers; all writes serialise
/// on one merge mutex.
pub struct IndexStore {
    schema: Arc<Schema>,
    config: EngineConfig,
    master: Mutex<Master>,
    published: RwLock<Arc<IndexReadView>>,
    version: AtomicU64,
    writes_since_merge: AtomicUsize,
    last_merge: Mutex<Instant>,
    /// Versions whose final holder has released them, collected by the
    /// readview drop hook.
    released_versions: Arc<Mutex<Vec<u64>>>,
}

impl IndexStore {
    pub fn new(schema: Schema, config: EngineConfig) -> Result<Self> {
        if !schema.is_committed() {
            return Err(Error::new(ErrorKind::InvalidState, "schema must be committed"));
        }
        let schema = Arc::new(schema);
        let master = Master {
            trie: Trie::new(),
            forward: ForwardIndex::new(),
            directory: InvertedDirectory::new(),
            quadtree: QuadTree::new(),
            writeview: WriteView::default(),
            histogram: HistogramStats::default(),
            generation: 0,
            committed: false,
            merges_since_histogram: 0,
            writes_since_histogram: 0,
        };
        let initial = Arc::new(IndexReadView::new(
            0,
            Arc::clone(&schema),
            Arc::new(master.trie.clone()),
            Arc::new(master.forward.clone()),
            Arc::new(master.directory.clone()),
            master.quadtree.snapshot(),
            Arc::new(HistogramStats::default()),
            None,
        ));
        Ok(IndexStore {
            schema,
            config,
            master: Mutex::new(master),
            published: RwLock::new(initial),
            version: AtomicU64::new(0),
            writes_since_merge: AtomicUsize::new(0),
            last_merge: Mutex::new(Instant::now()),
            released_versions: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Reassemble a store from deserialized archives. The result is already
    /// committed; the first readview is published immediately.
    pub fn from_parts(
        schema: Schema,
        config: EngineConfig,
        trie: Trie,
        forward: ForwardIndex,
        directory: InvertedDirectory,
        quadtree: QuadTree,
    ) -> Result<Self> {
        if !schema.is_committed() {
            return Err(Error::new(ErrorKind::InvalidState, "schema must be committed"));
        }
        let schema = Arc::new(schema);
        let total_records = forward.live_count();
        let histogram = HistogramStats::capture(&directory, total_records);
        let master = Master {
            trie,
            forward,
            directory,
            quadtree,
            writeview: WriteView::default(),
            histogram,
            generation: 1,
            committed: true,
            merges_since_histogram: 0,
            writes_since_histogram: 0,
        };
        let initial = Arc::new(IndexReadView::new(
            1,
            Arc::clone(&schema),
            Arc::new(master.trie.clone()),
            Arc::new(master.forward.clone()),
            Arc::new(master.directory.clone()),
            master.quadtree.snapshot(),
            Arc::new(master.histogram.clone()),
            None,
        ));
        Ok(IndexStore {
            schema,
            config,
            master: Mutex::new(master),
            published: RwLock::new(initial),
            version: AtomicU64::new(1),
            writes_since_merge: AtomicUsize::new(0),
            last_merge: Mutex::new(Instant::now()),
            released_versions: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared snapshot, valid until the holder drops it.
    pub fn readview(&self) -> Arc<IndexReadView> {
        Arc::clone(&self.published.read())
    }

    pub fn pending_writes(&self) -> usize {
        self.writes_since_merge.load(Ordering::Relaxed)
    }

    pub fn seconds_since_last_merge(&self) -> u64 {
        self.last_merge.lock().elapsed().as_secs()
    }

    pub fn total_records(&self) -> usize {
        self.master.lock().forward.live_count()
    }

    /// Versions reclaimed since the last call.
    pub fn take_released_versions(&self) -> Vec<u64> {
        std::mem::take(&mut *self.released_versions.lock())
    }

    /// Tokenise, assign keyword ids, append the forward list and stage the
    /// postings. Not visible to readers until the next merge.
    pub fn add_record(&self, record: Record, analyzer: &Analyzer) -> Result<RecordId> {
        let mut master = self.master.lock();
        if master.forward.contains_primary_key(&record.primary_key) {
            return Err(Error::new(
                ErrorKind::DuplicatePrimaryKey,
                format!("primary key '{}' already indexed", record.primary_key),
            ));
        }

        let analyzed = analyze_record(&record, &self.schema, analyzer);
        let mut entries = Vec::with_capacity(analyzed.len());
        for keyword_tokens in &analyzed {
            let keyword_id = master.trie.insert_keyword(&keyword_tokens.text, 0.0);
            entries.push(ForwardEntry {
                keyword: keyword_id,
                tf_boost_product: crate::ranking::compute_record_tf_boost_product(
                    keyword_tokens.frequency as f32,
                    self.schema.sum_of_field_boosts(keyword_tokens.attribute_mask),
                ),
                text_relevance: 0.0,
                attribute_mask: keyword_tokens.attribute_mask,
                positions: keyword_tokens.positions.clone(),
            });
        }
        entries.sort_by_key(|e| e.keyword);

        let record_length: u32 = analyzed.iter().map(|k| k.frequency).sum();
        let location = record.location;
        let generation = master.generation;
        let list = ForwardList {
            record,
            record_length,
            entries: entries.clone(),
            generation,
        };
        let id = master.forward.append(list);

        for entry in &entries {
            master.writeview.appends.entry(entry.keyword).or_default().push(id);
            master.writeview.mark(entry.keyword);
        }
        if let Some(point) = location {
            if self.schema.index_type == IndexType::KeywordGeo {
                master.quadtree.insert(GeoElement::new(point, id));
                master.writeview.structural_change = true;
            }
        }
        master.writeview.pending_writes += 1;
        master.writes_since_histogram += 1;
        self.writes_since_merge.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    /// Mark the record invalid; the next merge drops its postings from every
    /// touched list.
    pub fn delete_record(&self, primary_key: &str) -> Result<RecordId> {
        let mut master = self.master.lock();
        let generation = master.generation;
        let Some(id) = master.forward.invalidate(primary_key, generation) else {
            return Err(Error::not_found(format!(
                "primary key '{}' not indexed",
                primary_key
            )));
        };
        let (keywords, location): (Vec<KeywordId>, Option<crate::geo::shapes::Point>) = {
            let list = master.forward.get_any(id).expect("slot exists");
            (
                list.entries.iter().map(|e| e.keyword).collect(),
                list.record.location,
            )
        };
        for keyword in keywords {
            master.writeview.mark(keyword);
        }
        if let Some(point) = location {
            master.quadtree.remove(&GeoElement::new(point, id));
        }
        master.writeview.structural_change = true;
        master.writeview.pending_writes += 1;
        master.writes_since_histogram += 1;
        self.writes_since_merge.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    /// Undo a delete that has not crossed a merge boundary; used to roll back
    /// the delete half of a failed update.
    pub fn recover_record(&self, primary_key: &str, id: RecordId) -> Result<()> {
        let mut master = self.master.lock();
        let generation = master.generation;
        if !master.forward.revalidate(primary_key, id, generation) {
            return Err(Error::new(
                ErrorKind::InvalidState,
                format!("record '{}' cannot be recovered", primary_key),
            ));
        }
        let (keywords, location): (Vec<KeywordId>, Option<crate::geo::shapes::Point>) = {
            let list = master.forward.get(id).expect("revalidated");
            (
                list.entries.iter().map(|e| e.keyword).collect(),
                list.record.location,
            )
        };
        for keyword in keywords {
            master.writeview.mark(keyword);
        }
        if let Some(point) = location {
            master.quadtree.insert(GeoElement::new(point, id));
        }
        master.writeview.structural_change = true;
        Ok(())
    }

    /// Replace under the same primary key: delete then insert, recovering the
    /// old record when the insert half fails.
    pub fn update_record(&self, record: Record, analyzer: &Analyzer) -> Result<RecordId> {
        let primary_key = record.primary_key.clone();
        let old_id = self.delete_record(&primary_key)?;
        match self.add_record(record, analyzer) {
            Ok(id) => Ok(id),
            Err(err) => {
                if let Err(recover_err) = self.recover_record(&primary_key, old_id) {
                    debug!(
                        primary_key = %primary_key,
                        error = %recover_err,
                        "update rollback failed"
                    );
                }
                Err(err)
            }
        }
    }

    /// Seal the bulk-load phase and build the first sorted readview.
    /// Idempotent: a second commit with no interleaving writes returns the
    /// same readview.
    pub fn commit(&self) -> Result<Arc<IndexReadView>> {
        let mut master = self.master.lock();
        if master.committed && master.writeview.is_clean() {
            return Ok(self.readview());
        }
        master.committed = true;
        Ok(self.merge_locked(&mut master, true))
    }

    /// Reconcile the writeview into a new published readview. Idempotent on
    /// a clean writeview.
    pub fn merge(&self) -> Arc<IndexReadView> {
        let mut master = self.master.lock();
        if !master.committed {
            // Bulk load not sealed yet; nothing to publish.
            return self.readview();
        }
        self.merge_locked(&mut master, false)
    }

    fn merge_locked(&self, master: &mut Master, force_histogram: bool) -> Arc<IndexReadView> {
        if master.writeview.is_clean() && !force_histogram {
            *self.last_merge.lock() = Instant::now();
            self.writes_since_merge.store(0, Ordering::Relaxed);
            return self.readview();
        }

        let total_records = master.forward.live_count();
        let dirty: Vec<KeywordId> = master.writeview.dirty.iter().copied().collect();
        let tasks: Vec<(KeywordId, Option<Arc<InvertedList>>, Vec<RecordId>)> = dirty
            .iter()
            .map(|&keyword| {
                (
                    keyword,
                    master.directory.get(keyword).cloned(),
                    master
                        .writeview
                        .appends
                        .get(&keyword)
                        .cloned()
                        .unwrap_or_default(),
                )
            })
            .collect();

        let rebuilt = run_rebuild(
            tasks,
            &master.forward,
            total_records,
            self.config.merge_workers,
        );

        for result in rebuilt {
            for (record, relevance) in &result.relevance_updates {
                if let Some(list) = master.forward.get_mut(*record) {
                    if let Ok(i) = list
                        .entries
                        .binary_search_by_key(&result.keyword, |e| e.keyword)
                    {
                        list.entries[i].text_relevance = *relevance;
                    }
                }
            }
            if result.list.is_empty() {
                master.directory.remove(result.keyword);
                master.trie.remove_terminal(result.keyword.0);
            } else {
                master
                    .trie
                    .set_terminal_score(result.keyword.0, result.list.max_score());
                master.directory.insert(result.keyword, Arc::new(result.list));
            }
        }

        master.generation += 1;
        master.merges_since_histogram += 1;
        if force_histogram
            || master.merges_since_histogram >= self.config.histogram_every_p_merges
            || master.writes_since_histogram >= self.config.histogram_every_q_writes
        {
            master.histogram = HistogramStats::capture(&master.directory, total_records);
            master.merges_since_histogram = 0;
            master.writes_since_histogram = 0;
        }

        master.writeview.clear();
        self.writes_since_merge.store(0, Ordering::Relaxed);
        *self.last_merge.lock() = Instant::now();

        self.publish(master)
    }

    /// Snapshot the master structures into a new readview. All four indexes
    /// share their unchanged pieces with earlier versions through `Arc`s:
    /// trie nodes, forward lists, inverted lists and quadtree subtrees are
    /// only copied by the writes that touch them.
    fn publish(&self, master: &Master) -> Arc<IndexReadView> {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let released = Arc::clone(&self.released_versions);
        let hook: ReleaseHook = Arc::new(move |v| {
            released.lock().push(v);
        });
        let view = Arc::new(IndexReadView::new(
            version,
            Arc::clone(&self.schema),
            Arc::new(master.trie.clone()),
            Arc::new(master.forward.clone()),
            Arc::new(master.directory.clone()),
            master.quadtree.snapshot(),
            Arc::new(master.histogram.clone()),
            Some(hook),
        ));
        debug!(version, records = master.forward.live_count(), "published readview");
        *self.published.write() = Arc::clone(&view);
        view
    }
}

struct AnalyzedKeyword {
    text: String,
    frequency: u32,
    attribute_mask: u64,
    positions: Vec<PositionHit>,
}

/// Flatten a record's searchable attributes into per-keyword occurrence
/// summaries.
fn analyze_record(record: &Record, schema: &Schema, analyzer: &Analyzer) -> Vec<AnalyzedKeyword> {
    let mut keywords: HashMap<String, AnalyzedKeyword> = HashMap::new();
    let keep_positions = schema.position_mode != PositionIndexMode::None;

    for (attr_index, values) in record.searchable_values.iter().enumerate() {
        for (value_index, value) in values.iter().enumerate() {
            let position_base = value_index as u32 * MULTI_VALUE_POSITION_GAP;
            for token in analyzer.analyze(value) {
                let entry = keywords
                    .entry(token.text.clone())
                    .or_insert_with(|| AnalyzedKeyword {
                        text: token.text.clone(),
                        frequency: 0,
                        attribute_mask: 0,
                        positions: Vec::new(),
                    });
                entry.frequency += 1;
                entry.attribute_mask |= 1u64 << attr_index;
                if keep_positions {
                    entry.positions.push(PositionHit {
                        attribute: attr_index as u8,
                        position: position_base + token.position,
                        char_offset: token.char_offset,
                    });
                }
            }
        }
    }

    keywords.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::schema::SearchableAttribute;

    fn geo_schema() -> Schema {
        let mut schema = Schema::new("id", IndexType::KeywordGeo);
        schema
            .add_searchable(SearchableAttribute {
                name: "title".to_string(),
                boost: 2.0,
                multi_valued: false,
                highlight: false,
                acl_controlled: false,
            })
            .unwrap();
        schema
            .add_searchable(SearchableAttribute {
                name: "body".to_string(),
                boost: 1.0,
                multi_valued: false,
                highlight: false,
                acl_controlled: false,
            })
            .unwrap();
        schema.set_geo_attributes("lat", "lng");
        schema.commit().unwrap();
        schema
    }

    fn store() -> IndexStore {
        IndexStore::new(geo_schema(), EngineConfig::default()).unwrap()
    }

    fn record(pk: &str, title: &str) -> Record {
        let schema = geo_schema();
        let mut r = Record::new(pk, &schema);
        r.set_searchable(0, title);
        r
    }

    #[test]
    fn duplicate_primary_key_is_rejected() {
        let store = store();
        let analyzer = Analyzer::standard();
        store.add_record(record("r-1", "coffee"), &analyzer).unwrap();
        let err = store.add_record(record("r-1", "tea"), &analyzer).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DuplicatePrimaryKey);
    }

    #[test]
    fn commit_publishes_sorted_lists() {
        let store = store();
        let analyzer = Analyzer::standard();
        let mut boosted = record("r-1", "coffee coffee coffee");
        boosted.record_boost = 1.0;
        store.add_record(boosted, &analyzer).unwrap();
        store.add_record(record("r-2", "coffee"), &analyzer).unwrap();
        let view = store.commit().unwrap();

        let keyword = view.trie.lookup_prefix("coffee").unwrap();
        let list = view.inverted.get(KeywordId(keyword)).unwrap();
        assert_eq!(list.len(), 2);
        // Higher term frequency ranks first.
        assert_eq!(list.get(0).unwrap().record, RecordId(0));
        assert!(list.get(0).unwrap().score > list.get(1).unwrap().score);
        // The invariant: every posting's record holds the keyword.
        for posting in list.postings() {
            assert!(view
                .forward
                .get(posting.record)
                .unwrap()
                .contains_keyword(KeywordId(keyword), u64::MAX));
        }
    }

    #[test]
    fn commit_is_idempotent() {
        let store = store();
        let analyzer = Analyzer::standard();
        store.add_record(record("r-1", "coffee"), &analyzer).unwrap();
        let first = store.commit().unwrap();
        let second = store.commit().unwrap();
        assert_eq!(first.version, second.version);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn merge_is_idempotent_without_writes() {
        let store = store();
        let analyzer = Analyzer::standard();
        store.add_record(record("r-1", "coffee"), &analyzer).unwrap();
        store.commit().unwrap();
        let first = store.merge();
        let second = store.merge();
        assert_eq!(first.version, second.version);
    }

    #[test]
    fn writes_are_invisible_until_merge() {
        let store = store();
        let analyzer = Analyzer::standard();
        store.add_record(record("r-1", "coffee"), &analyzer).unwrap();
        let before = store.commit().unwrap();

        store.add_record(record("r-2", "coffee"), &analyzer).unwrap();
        assert_eq!(before.total_records(), 1);
        assert_eq!(store.readview().total_records(), 1);

        let after = store.merge();
        assert_eq!(after.total_records(), 2);
        // The earlier holder still sees its version.
        assert_eq!(before.total_records(), 1);
    }

    #[test]
    fn delete_prunes_postings_at_merge() {
        let store = store();
        let analyzer = Analyzer::standard();
        store.add_record(record("r-1", "coffee"), &analyzer).unwrap();
        store.add_record(record("r-2", "coffee house"), &analyzer).unwrap();
        let view = store.commit().unwrap();
        let coffee = KeywordId(view.trie.lookup_prefix("coffee").unwrap());

        store.delete_record("r-1").unwrap();
        let after = store.merge();
        let list = after.inverted.get(coffee).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list.get(0).unwrap().record, RecordId(1));
    }

    #[test]
    fn empty_list_unmarks_trie_terminal() {
        let store = store();
        let analyzer = Analyzer::standard();
        store.add_record(record("r-1", "unique"), &analyzer).unwrap();
        store.commit().unwrap();
        store.delete_record("r-1").unwrap();
        let view = store.merge();
        let node = view.trie.lookup_prefix("unique").unwrap();
        assert!(!view.trie.node(node).terminal);
        assert!(view.inverted.get(KeywordId(node)).is_none());
    }

    #[test]
    fn update_replaces_record_under_same_key() {
        let store = store();
        let analyzer = Analyzer::standard();
        store.add_record(record("r-1", "coffee"), &analyzer).unwrap();
        store.commit().unwrap();

        store.update_record(record("r-1", "espresso"), &analyzer).unwrap();
        let view = store.merge();
        let espresso = view.trie.lookup_prefix("espresso").unwrap();
        assert!(view.trie.node(espresso).terminal);
        let coffee = view.trie.lookup_prefix("coffee").unwrap();
        assert!(!view.trie.node(coffee).terminal);
    }

    #[test]
    fn delete_then_recover_restores_record() {
        let store = store();
        let analyzer = Analyzer::standard();
        store.add_record(record("r-1", "coffee"), &analyzer).unwrap();
        store.commit().unwrap();

        let id = store.delete_record("r-1").unwrap();
        store.recover_record("r-1", id).unwrap();
        let view = store.merge();
        assert_eq!(view.total_records(), 1);
        let coffee = KeywordId(view.trie.lookup_prefix("coffee").unwrap());
        assert!(view.inverted.get(coffee).unwrap().contains(id));
    }

    #[test]
    fn readview_release_hook_fires() {
        let store = store();
        let analyzer = Analyzer::standard();
        store.add_record(record("r-1", "coffee"), &analyzer).unwrap();
        let first = store.commit().unwrap();
        let first_version = first.version;

        store.add_record(record("r-2", "tea"), &analyzer).unwrap();
        store.merge();

        assert!(store.take_released_versions().is_empty());
        drop(first);
        assert_eq!(store.take_released_versions(), vec![first_version]);
    }
}
