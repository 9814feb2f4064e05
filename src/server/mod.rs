use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{info, warn};

use crate::acl::AttributeAcl;
use crate::analysis::analyzer::Analyzer;
use crate::cache::{fingerprint_of, ArtifactCache, CacheArtifact};
use crate::core::config::EngineConfig;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::stats::ShardStats;
use crate::geo::quadtree::{GeoElement, QuadTree};
use crate::index::forward::ForwardIndex;
use crate::index::inverted::{InvertedDirectory, InvertedList};
use crate::index::merge::MergeScheduler;
use crate::index::readview::IndexReadView;
use crate::index::store::IndexStore;
use crate::core::types::KeywordId;
use crate::query::ast::SearchQuery;
use crate::query::executor::{QueryExecutor, SearchResults, Suggestion};
use crate::query::term::Term;
use crate::ranking::feedback::FeedbackIndex;
use crate::record::record::Record;
use crate::record::schema::{IndexType, Schema};
use crate::storage::archive::{load_archive, save_archive};
use crate::storage::layout::ShardLayout;
use crate::trie::node::Trie;

impl CacheArtifact for SearchResults {
    fn byte_size(&self) -> usize {
        self.results
            .iter()
            .map(|r| {
                64 + r.primary_key.len() + r.stored_blob.as_ref().map(Vec::len).unwrap_or(0)
            })
            .sum::<usize>()
            + 64
    }
}

/// One shard's search server: the index bundle, its analyzer, the attribute
/// ACL, click feedback and the result cache, behind the operations the
/// cluster layer calls.
pub struct ShardSearchServer {
    store: Arc<IndexStore>,
    analyzer: Analyzer,
    pub acl: AttributeAcl,
    pub feedback: FeedbackIndex,
    result_cache: ArtifactCache<SearchResults>,
    scheduler: parking_lot::Mutex<Option<MergeScheduler>>,
    start_time: SystemTime,
    search_count: AtomicU64,
    write_count: AtomicU64,
    merge_count: AtomicU64,
}

impl ShardSearchServer {
    pub fn create(schema: Schema, config: EngineConfig, analyzer: Analyzer) -> Result<Self> {
        let cache_budget = config.cache_byte_budget;
        let store = Arc::new(IndexStore::new(schema, config)?);
        Ok(Self::assemble(store, analyzer, cache_budget))
    }

    /// Load persisted state from the shard directory, or start empty when
    /// any required archive is missing.
    pub fn open(
        layout: &ShardLayout,
        configured_schema: Schema,
        config: EngineConfig,
        analyzer: Analyzer,
    ) -> Result<Self> {
        let required = [
            layout.schema_path(),
            layout.trie_path(),
            layout.forward_path(),
        ];
        let index_file = match configured_schema.index_type {
            IndexType::Keyword => layout.inverted_path(),
            IndexType::KeywordGeo => layout.quadtree_path(),
        };
        let all_present =
            required.iter().all(|p| p.exists()) && index_file.exists();
        if !all_present {
            info!(dir = %layout.base_dir.display(), "no persisted index, starting empty");
            return Self::create(configured_schema, config, analyzer);
        }

        let disk_schema: Schema = load_archive(layout.schema_path())?;
        if !disk_schema.matches(&configured_schema) {
            warn!(
                dir = %layout.base_dir.display(),
                "on-disk schema differs from the configured schema; \
                 loading with the on-disk schema"
            );
        }
        if layout.analyzer_path().exists() {
            let disk_analyzer: String = load_archive(layout.analyzer_path())?;
            if disk_analyzer != analyzer.name {
                warn!(
                    on_disk = %disk_analyzer,
                    configured = %analyzer.name,
                    "index was built with a different analyzer"
                );
            }
        }
        let trie: Trie = load_archive(layout.trie_path())?;
        let forward: ForwardIndex = load_archive(layout.forward_path())?;
        let directory = if layout.inverted_path().exists() {
            let lists: Vec<(KeywordId, InvertedList)> = load_archive(layout.inverted_path())?;
            InvertedDirectory::from_serializable(lists)
        } else {
            InvertedDirectory::new()
        };
        let quadtree = if layout.quadtree_path().exists() {
            let elements: Vec<GeoElement> = load_archive(layout.quadtree_path())?;
            QuadTree::from_elements(elements)
        } else {
            QuadTree::new()
        };

        let cache_budget = config.cache_byte_budget;
        let store = Arc::new(IndexStore::from_parts(
            disk_schema,
            config,
            trie,
            forward,
            directory,
            quadtree,
        )?);
        let server = Self::assemble(store, analyzer, cache_budget);

        if layout.feedback_path().exists() {
            match load_archive(layout.feedback_path()) {
                Ok(snapshot) => server.feedback.restore(snapshot),
                Err(err) => warn!(error = %err, "feedback archive unreadable, ignoring"),
            }
        }
        info!(
            dir = %layout.base_dir.display(),
            records = server.store.total_records(),
            "loaded shard"
        );
        Ok(server)
    }

    /// Wrap an already-built store (migration receive path).
    pub fn from_store(store: Arc<IndexStore>, analyzer: Analyzer) -> Self {
        let cache_budget = store.config().cache_byte_budget;
        Self::assemble(store, analyzer, cache_budget)
    }

    fn assemble(store: Arc<IndexStore>, analyzer: Analyzer, cache_budget: usize) -> Self {
        ShardSearchServer {
            store,
            analyzer,
            acl: AttributeAcl::new(),
            feedback: FeedbackIndex::new(),
            result_cache: ArtifactCache::new(cache_budget),
            scheduler: parking_lot::Mutex::new(None),
            start_time: SystemTime::now(),
            search_count: AtomicU64::new(0),
            write_count: AtomicU64::new(0),
            merge_count: AtomicU64::new(0),
        }
    }

    pub fn schema(&self) -> &Schema {
        self.store.schema()
    }

    pub fn store(&self) -> &Arc<IndexStore> {
        &self.store
    }

    pub fn readview(&self) -> Arc<IndexReadView> {
        self.store.readview()
    }

    /// Start the background merge driver for this shard.
    pub fn start_merge_scheduler(&self) {
        let mut scheduler = self.scheduler.lock();
        if scheduler.is_none() {
            *scheduler = Some(MergeScheduler::start(Arc::clone(&self.store)));
        }
    }

    pub fn stop_merge_scheduler(&self) {
        if let Some(scheduler) = self.scheduler.lock().take() {
            scheduler.shutdown();
        }
    }

    pub fn insert_json(&self, json: &str) -> Result<()> {
        let record = Record::from_json(json, self.store.schema())?;
        self.insert(record)
    }

    pub fn insert(&self, record: Record) -> Result<()> {
        if self.store.total_records() >= self.store.config().max_documents {
            return Err(Error::new(
                ErrorKind::CapacityExceeded,
                format!("document limit {} reached", self.store.config().max_documents),
            ));
        }
        self.store.add_record(record, &self.analyzer)?;
        self.write_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn delete(&self, primary_key: &str) -> Result<()> {
        self.store.delete_record(primary_key)?;
        self.write_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn update_json(&self, json: &str) -> Result<()> {
        let record = Record::from_json(json, self.store.schema())?;
        self.store.update_record(record, &self.analyzer)?;
        self.write_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Seal bulk load; further writes go through the merge path.
    pub fn commit(&self) -> Result<()> {
        self.store.commit()?;
        Ok(())
    }

    pub fn merge_now(&self) {
        self.store.merge();
        self.merge_count.fetch_add(1, Ordering::Relaxed);
        self.result_cache.clear();
    }

    pub fn search(&self, query: &SearchQuery) -> Result<Arc<SearchResults>> {
        self.search_count.fetch_add(1, Ordering::Relaxed);
        let view = self.store.readview();

        let fingerprint = fingerprint_of(&[
            &query.plan.normalized(),
            &query.k.to_string(),
            &format!("{:?}", query.role),
            &format!("{:?}", query.search_type),
            &view.version.to_string(),
        ]);
        if let Some(cached) = self.result_cache.get(fingerprint) {
            return Ok(cached);
        }

        let results = Arc::new(QueryExecutor::execute_with_cap(
            &view,
            query,
            &self.acl,
            &self.feedback,
            self.store.config().get_all_results_cap,
        )?);
        self.result_cache.put(fingerprint, Arc::clone(&results));
        Ok(results)
    }

    pub fn suggest(&self, prefix: &Term, limit: usize) -> Vec<Suggestion> {
        let view = self.store.readview();
        QueryExecutor::suggest(&view, prefix, limit)
    }

    /// Persist the shard under its directory: one archive per index
    /// structure, each written atomically.
    pub fn save(&self, layout: &ShardLayout) -> Result<()> {
        self.store.merge();
        let view = self.store.readview();

        save_archive(layout.schema_path(), view.schema.as_ref())?;
        save_archive(layout.trie_path(), view.trie.as_ref())?;
        save_archive(layout.forward_path(), view.forward.as_ref())?;
        save_archive(layout.analyzer_path(), &self.analyzer.name)?;
        match view.schema.index_type {
            IndexType::Keyword => {
                save_archive(layout.inverted_path(), &view.inverted.to_serializable())?;
            }
            IndexType::KeywordGeo => {
                // Both indexes exist for a geo schema; the quadtree archive is
                // the one the loader requires.
                save_archive(layout.inverted_path(), &view.inverted.to_serializable())?;
                let mut elements = Vec::new();
                view.quadtree_root.collect_elements(&mut elements);
                save_archive(layout.quadtree_path(), &elements)?;
            }
        }
        save_archive(layout.feedback_path(), &self.feedback.snapshot())?;
        info!(dir = %layout.base_dir.display(), records = view.total_records(), "saved shard");
        Ok(())
    }

    /// Dump every live record as JSON lines.
    pub fn export(&self, path: impl AsRef<Path>) -> Result<usize> {
        let view = self.store.readview();
        let file = fs::File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        let mut exported = 0;
        for (_, list) in view.forward.iter_live() {
            let line = list.record.to_json(&view.schema)?;
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
            exported += 1;
        }
        writer.flush()?;
        Ok(exported)
    }

    pub fn info(&self) -> ShardStats {
        let view = self.store.readview();
        ShardStats {
            start_time: self.start_time,
            uptime_secs: self
                .start_time
                .elapsed()
                .map(|d| d.as_secs())
                .unwrap_or(0),
            total_records: view.forward.len(),
            deleted_records: view.forward.deleted_count(),
            keyword_count: view.trie.len(),
            geo_element_count: view.quadtree_root.elements_in_subtree,
            write_count: self.write_count.load(Ordering::Relaxed),
            search_count: self.search_count.load(Ordering::Relaxed),
            merge_count: self.merge_count.load(Ordering::Relaxed),
            cache_stats: self.result_cache.stats(),
        }
    }
}

impl Drop for ShardSearchServer {
    fn drop(&mut self) {
        self.stop_merge_scheduler();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::shapes::{Point, Rectangle, Shape};
    use crate::query::ast::LogicalNode;
    use crate::record::schema::SearchableAttribute;

    fn geo_schema() -> Schema {
        let mut schema = Schema::new("id", IndexType::KeywordGeo);
        schema
            .add_searchable(SearchableAttribute {
                name: "name".to_string(),
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

    fn server() -> ShardSearchServer {
        ShardSearchServer::create(geo_schema(), EngineConfig::default(), Analyzer::standard())
            .unwrap()
    }

    #[test]
    fn round_trip_insert_search_delete() {
        let server = server();
        server
            .insert_json(r#"{"id": "r-1", "name": "blue bottle", "lat": 10.0, "lng": 20.0}"#)
            .unwrap();
        server.commit().unwrap();

        let query = SearchQuery::top_k(LogicalNode::Term(Term::complete("bottle")), 10);
        let found = server.search(&query).unwrap();
        assert_eq!(found.results.len(), 1);
        assert_eq!(found.results[0].primary_key, "r-1");

        server.delete("r-1").unwrap();
        server.merge_now();
        let found = server.search(&query).unwrap();
        assert!(found.results.is_empty());
    }

    #[test]
    fn delete_unknown_key_is_not_found() {
        let server = server();
        server.commit().unwrap();
        let err = server.delete("missing").unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[test]
    fn capacity_limit_is_enforced() {
        let mut config = EngineConfig::default();
        config.max_documents = 2;
        let server =
            ShardSearchServer::create(geo_schema(), config, Analyzer::standard()).unwrap();
        server.insert_json(r#"{"id": "a", "name": "x"}"#).unwrap();
        server.insert_json(r#"{"id": "b", "name": "y"}"#).unwrap();
        server.commit().unwrap();
        let err = server.insert_json(r#"{"id": "c", "name": "z"}"#).unwrap_err();
        assert_eq!(err.kind, ErrorKind::CapacityExceeded);
    }

    #[test]
    fn save_load_round_trip_with_geo() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ShardLayout::new(dir.path().join("shard-0")).unwrap();

        let server = server();
        for i in 0..1000 {
            let x = (i % 40) as f64 * 9.0 - 180.0;
            let y = (i / 40) as f64 * 14.0 - 175.0;
            server
                .insert_json(&format!(
                    r#"{{"id": "r-{}", "name": "place {}", "lat": {}, "lng": {}}}"#,
                    i, i, x, y
                ))
                .unwrap();
        }
        server.commit().unwrap();
        server.save(&layout).unwrap();
        drop(server);

        let reloaded = ShardSearchServer::open(
            &layout,
            geo_schema(),
            EngineConfig::default(),
            Analyzer::standard(),
        )
        .unwrap();
        let view = reloaded.readview();
        assert_eq!(view.quadtree_root.elements_in_subtree, 1000);

        // A point query on an inserted coordinate returns that record.
        let target = Point::new(-180.0, -175.0);
        let shape = Shape::Rectangle(Rectangle::new(
            Point::new(target.x - 0.1, target.y - 0.1),
            Point::new(target.x + 0.1, target.y + 0.1),
        ));
        let query = SearchQuery::top_k(LogicalNode::Geo(shape), 10);
        let results = reloaded.search(&query).unwrap();
        assert!(results
            .results
            .iter()
            .any(|r| r.primary_key == "r-0"));
    }

    #[test]
    fn export_writes_live_records() {
        let dir = tempfile::tempdir().unwrap();
        let server = server();
        server.insert_json(r#"{"id": "a", "name": "kept"}"#).unwrap();
        server.insert_json(r#"{"id": "b", "name": "dropped"}"#).unwrap();
        server.commit().unwrap();
        server.delete("b").unwrap();
        server.merge_now();

        let path = dir.path().join("export.jsonl");
        let exported = server.export(&path).unwrap();
        assert_eq!(exported, 1);
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("kept"));
        assert!(!content.contains("dropped"));
    }

    #[test]
    fn result_cache_serves_repeat_queries() {
        let server = server();
        server.insert_json(r#"{"id": "a", "name": "latte"}"#).unwrap();
        server.commit().unwrap();

        let query = SearchQuery::top_k(LogicalNode::Term(Term::complete("latte")), 5);
        server.search(&query).unwrap();
        server.search(&query).unwrap();
        let stats = server.info();
        assert!(stats.cache_stats.hit_count >= 1);
    }
}
