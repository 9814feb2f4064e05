pub mod core;
pub mod record;
pub mod analysis;
pub mod trie;
pub mod index;
pub mod geo;
pub mod acl;
pub mod ranking;
pub mod query;
pub mod cache;
pub mod server;
pub mod storage;
pub mod cluster;
pub mod transport;
pub mod migration;
pub mod connector;

/*
┌─────────────────────────────────────────────────────────────────────────────┐
│                          FARSIGHT ARCHITECTURE                              │
└─────────────────────────────────────────────────────────────────────────────┘

┌──────────────────────────────── SHARD CORE ─────────────────────────────────┐
│                                                                             │
│  ShardSearchServer                                                          │
│    ├── IndexStore (one merge mutex; publishes Arc<IndexReadView>)           │
│    │     ├── Trie              keyword dictionary + active-node expansion   │
│    │     ├── ForwardIndex      per-record keyword layout, validity bits     │
│    │     ├── InvertedDirectory keyword id → Arc<InvertedList> (COW)         │
│    │     ├── QuadTree          geo points, path-copied on write             │
│    │     └── HistogramStats    cardinalities for the optimiser              │
│    ├── Analyzer                tokenizer + filter chain                     │
│    ├── AttributeAcl            role → attribute bitmap overlay              │
│    ├── FeedbackIndex           query → clicked-record boosts                │
│    └── ArtifactCache           fingerprint → results, byte budget LRU       │
│                                                                             │
│  search: SearchQuery → QueryOptimizer (alternatives, sort injection,        │
│          min-cost pick) → PhysicalOperator tree (open/get_next/close/       │
│          verify) → ranked, ACL-filtered, deduplicated results               │
│                                                                             │
│  mutate: add/delete/update → writeview → MergeScheduler (N secs | M        │
│          writes) → worker-pool list rebuild → readview swap                 │
└─────────────────────────────────────────────────────────────────────────────┘

┌──────────────────────────────── CLUSTER ────────────────────────────────────┐
│                                                                             │
│  ClusterNode                                                                │
│    ├── MetadataManager    writeview (global mutex) / Arc readview           │
│    ├── LockManager        metadata → shard → primary-key hierarchy          │
│    ├── ClusterStateMachine operations + notification dispatch + bounce      │
│    │     ├── NewNodeJoin, ShardMove, LoadBalancingStart,                    │
│    │     └── ClusterSave/Shutdown, CommitMetadataChange                     │
│    ├── TransportManager   framed TCP, request/reply, timeouts               │
│    ├── SyncManager        heartbeats → failure detection                    │
│    └── MigrationManager   chunked shard streaming                           │
│                                                                             │
│  connectors: DataConnector (init / create_new_indexes / run_listener /      │
│              save_last_accessed_log_record_time) → ServerInterface          │
└─────────────────────────────────────────────────────────────────────────────┘
*/
