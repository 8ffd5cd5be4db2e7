/// Soma Storage - Embedded Vector+Graph Database Engine
///
/// Semantic entities ("nouns") carry a 384-dim embedding and typed
/// metadata, relate through typed edges ("verbs"), and answer vector,
/// metadata, and graph-traversal queries over one portable on-disk
/// layout.
///
/// Key features:
/// - Pluggable storage adapters (memory, filesystem, S3-compatible)
/// - Sharded two-file entity layout with a metadata/vector split
/// - Native HNSW index with per-node persistence and tombstones
/// - Crash-atomic write-ahead log with recovery and checkpoints
/// - Adaptive backpressure with per-class circuit breakers
/// - Content-addressed copy-on-write snapshots and version history
mod adapter;
mod adjacency;
mod backpressure;
mod base_storage;
mod db;
mod embedding;
mod error;
mod fs_adapter;
mod hashing;
mod history;
mod hnsw;
mod hnsw_persistence;
mod memory_adapter;
mod object_store;
mod query;
mod routing;
#[cfg(feature = "cloud")]
mod s3_adapter;
mod statistics;
mod types;
mod version_index;
mod wal;

pub use adapter::{with_retry, ListPage, StorageAdapter, StorageClass, MAX_RETRY_ATTEMPTS};
pub use adjacency::{AdjacencyIndex, Direction, EdgeInfo};
pub use backpressure::{
    AdaptationSample, BackpressureConfig, BackpressureController, BackpressureMetrics,
    CircuitState, Permit,
};
pub use base_storage::{
    BaseStorage, EdgeLookup, NounFilter, Page, Pagination, VerbFilter, DEFAULT_PAGE_LIMIT,
};
pub use db::{
    IntegrityReport, Noun, NounDraft, Soma, SomaConfig, Verb, VerbDraft,
};
pub use embedding::{embed_normalized, Embedder, HashingEmbedder};
pub use error::{ErrorKind, OpClass, Result, SomaError};
pub use fs_adapter::FilesystemAdapter;
pub use hashing::{canonical_json, hash_value, sha256_hex};
pub use history::{
    CommitEntry, HistoryStore, RefDocument, RefKind, RefUpdate, WalkOptions,
};
pub use hnsw::{Hit, HnswIndex, HnswParams, NodeState};
pub use hnsw_persistence::HnswPersistence;
pub use memory_adapter::MemoryAdapter;
pub use object_store::{CommitObject, ObjectKind, ObjectStore, TreeEntry, TreeObject};
pub use query::{
    field_match_score, matches_predicate, Boost, ConnectedAnchor, ConnectedClause, Predicate,
    Query, QueryEngine, QueryHit, QueryInput,
};
pub use routing::{
    analyze, shard_of, EntityKind, KeyRoute, RecordKind, DELETED_INDEX_KEY, HNSW_META_KEY,
    INDEXES_PREFIX, OBJECTS_PREFIX, REFS_PREFIX, RESERVED_KEY_PREFIXES, STATISTICS_KEY,
    SYSTEM_PREFIX, WAL_PREFIX,
};
#[cfg(feature = "cloud")]
pub use s3_adapter::{S3CompatAdapter, S3Config};
pub use statistics::{AdvisoryLock, StatisticsStore, ADVISORY_LOCK_TTL};
pub use types::{
    cosine_distance, normalize_vector, Connections, NounMetadata, NounType, NounVectorRecord,
    StatisticsDocument, VerbMetadata, VerbType, VerbVectorRecord, ALL_NOUN_TYPES, ALL_VERB_TYPES,
    EMBEDDING_DIM, RESERVED_FIELDS, TAG_SCHEMA_VERSION,
};
pub use version_index::{VersionEntry, VersionIndex, VersionIndexDocument, VersionOptions};
pub use wal::{RecoveryReport, ReplayHandler, Wal, WalConfig, WalEntry, WalStatus};

/// Version of the persisted storage layout.
pub const STORAGE_LAYOUT_VERSION: u32 = 1;
