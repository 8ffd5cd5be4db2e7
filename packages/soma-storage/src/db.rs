/// Soma: the embedded database handle. Owns every subsystem explicitly
/// (no globals) and sequences the write path:
///
///   admit -> assign id -> embed -> WAL pending -> persist vector ->
///   persist metadata (counter bump) -> HNSW insert -> adjacency ->
///   WAL completed
///
/// Reads ride their own admission class, so an open write circuit never
/// blocks queries.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adapter::StorageAdapter;
use crate::adjacency::AdjacencyIndex;
use crate::backpressure::{BackpressureController, BackpressureConfig, BackpressureMetrics};
use crate::base_storage::{BaseStorage, NounFilter, Page, Pagination, VerbFilter};
use crate::embedding::{embed_normalized, Embedder};
use crate::error::{OpClass, Result, SomaError};
use crate::hnsw::{HnswIndex, HnswParams};
use crate::hnsw_persistence::HnswPersistence;
use crate::history::{HistoryStore, RefDocument, RefKind, RefUpdate};
use crate::object_store::{CommitObject, ObjectStore, ObjectKind, TreeEntry};
use crate::query::{Query, QueryEngine, QueryHit, QueryInput};
use crate::routing::{self, EntityKind, RecordKind};
use crate::statistics::StatisticsStore;
use crate::types::{
    normalize_vector, NounMetadata, NounType, NounVectorRecord, StatisticsDocument, VerbMetadata,
    VerbType, VerbVectorRecord,
};
use crate::version_index::{VersionEntry, VersionIndex, VersionOptions};
use crate::wal::{ReplayHandler, Wal, WalConfig};

const OP_SAVE_NOUN: &str = "saveNoun";
const OP_SAVE_VERB: &str = "saveVerb";
const OP_DELETE_NOUN: &str = "deleteNoun";
const OP_DELETE_VERB: &str = "deleteVerb";
const OP_UPDATE_NOUN_METADATA: &str = "updateNounMetadata";
const OP_UPDATE_VERB_METADATA: &str = "updateVerbMetadata";

#[derive(Debug, Clone)]
pub struct SomaConfig {
    pub hnsw: HnswParams,
    /// Defaults to the adapter's storage class when unset.
    pub wal: Option<WalConfig>,
    pub backpressure: BackpressureConfig,
    /// Strict mode turns vector-without-metadata reads into `Fatal`.
    pub strict: bool,
}

impl Default for SomaConfig {
    fn default() -> Self {
        Self {
            hnsw: HnswParams::default(),
            wal: None,
            backpressure: BackpressureConfig::default(),
            strict: false,
        }
    }
}

/// A noun to insert. Exactly one of `text` (embedded through the
/// supplied embedder) or `vector` must be present; the id is optional
/// and assigned server-side when absent.
#[derive(Debug, Clone, Default)]
pub struct NounDraft {
    pub id: Option<Uuid>,
    pub noun: Option<NounType>,
    pub text: Option<String>,
    pub vector: Option<Vec<f32>>,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct VerbDraft {
    pub id: Option<Uuid>,
    pub verb: VerbType,
    pub source: Uuid,
    pub target: Uuid,
    pub weight: Option<f64>,
    pub metadata: Map<String, Value>,
}

/// A fully-read noun.
#[derive(Debug, Clone)]
pub struct Noun {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub metadata: NounMetadata,
}

#[derive(Debug, Clone)]
pub struct Verb {
    pub id: Uuid,
    pub verb: VerbType,
    pub source: Uuid,
    pub target: Uuid,
    pub metadata: VerbMetadata,
}

#[derive(Debug, Clone, Default)]
pub struct IntegrityReport {
    pub nouns_scanned: usize,
    pub verbs_scanned: usize,
    pub vectors_without_metadata: usize,
    pub dangling_verbs: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveNounParams {
    record: NounVectorRecord,
    metadata: NounMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveVerbParams {
    record: VerbVectorRecord,
    metadata: VerbMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdParams {
    id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PatchParams {
    id: Uuid,
    patch: Map<String, Value>,
}

pub struct Soma {
    storage: Arc<BaseStorage>,
    statistics: Arc<StatisticsStore>,
    adjacency: Arc<AdjacencyIndex>,
    hnsw: Arc<HnswIndex>,
    hnsw_persistence: Arc<HnswPersistence>,
    wal: Arc<Wal>,
    backpressure: Arc<BackpressureController>,
    objects: Arc<ObjectStore>,
    history: Arc<HistoryStore>,
    versions: Arc<VersionIndex>,
    query_engine: QueryEngine,
    embedder: Arc<dyn Embedder>,
}

impl Soma {
    /// Opens the database over an adapter: loads statistics, warms the
    /// HNSW and adjacency indexes from storage, starts the WAL, and
    /// replays anything left pending by a crash.
    pub async fn open(
        adapter: Arc<dyn StorageAdapter>,
        embedder: Arc<dyn Embedder>,
        config: SomaConfig,
    ) -> Result<Arc<Self>> {
        let statistics = StatisticsStore::load(Arc::clone(&adapter)).await?;
        let storage = BaseStorage::new(Arc::clone(&adapter), Arc::clone(&statistics), config.strict);
        let adjacency = Arc::new(AdjacencyIndex::new());
        storage.set_edge_lookup(Arc::clone(&adjacency) as Arc<dyn crate::base_storage::EdgeLookup>);

        let hnsw = Arc::new(HnswIndex::new(config.hnsw.clone()));
        let hnsw_persistence = Arc::new(HnswPersistence::new(Arc::clone(&storage)));
        let loaded = hnsw_persistence.load_into(&hnsw).await?;
        tracing::info!(nodes = loaded, "loaded HNSW index from storage");

        storage.rebuild_type_index().await?;
        adjacency.rebuild(&storage).await?;

        let wal_config = config
            .wal
            .clone()
            .unwrap_or_else(|| WalConfig::for_class(adapter.storage_class()));
        let wal = Wal::start(Arc::clone(&adapter), wal_config);
        Self::register_replay_handlers(&wal, &storage, &hnsw, &hnsw_persistence, &adjacency);
        let report = wal.recover().await?;
        if report.replayed > 0 || report.failed > 0 {
            tracing::info!(
                replayed = report.replayed,
                failed = report.failed,
                "WAL recovery finished"
            );
        }

        let backpressure = BackpressureController::new(config.backpressure.clone());
        let objects = Arc::new(ObjectStore::new(Arc::clone(&adapter)));
        let history = Arc::new(HistoryStore::new(Arc::clone(&adapter), Arc::clone(&objects)));
        let versions = Arc::new(VersionIndex::new(Arc::clone(&adapter)));
        let query_engine = QueryEngine::new(
            Arc::clone(&storage),
            Arc::clone(&hnsw),
            Arc::clone(&adjacency),
            Arc::clone(&embedder),
        );

        statistics.set_hnsw_index_size(hnsw.len() as u64);

        Ok(Arc::new(Self {
            storage,
            statistics,
            adjacency,
            hnsw,
            hnsw_persistence,
            wal,
            backpressure,
            objects,
            history,
            versions,
            query_engine,
            embedder,
        }))
    }

    fn register_replay_handlers(
        wal: &Arc<Wal>,
        storage: &Arc<BaseStorage>,
        hnsw: &Arc<HnswIndex>,
        persistence: &Arc<HnswPersistence>,
        adjacency: &Arc<AdjacencyIndex>,
    ) {
        fn handler<F, Fut>(f: F) -> ReplayHandler
        where
            F: Fn(Value) -> Fut + Send + Sync + 'static,
            Fut: std::future::Future<Output = Result<()>> + Send + 'static,
        {
            Arc::new(move |params| Box::pin(f(params)))
        }

        let (s, h, p) = (Arc::clone(storage), Arc::clone(hnsw), Arc::clone(persistence));
        wal.register_handler(
            OP_SAVE_NOUN,
            handler(move |params| {
                let (s, h, p) = (Arc::clone(&s), Arc::clone(&h), Arc::clone(&p));
                async move {
                    let params: SaveNounParams = decode_params(params)?;
                    apply_save_noun(&s, &h, &p, params).await
                }
            }),
        );

        let (s, a) = (Arc::clone(storage), Arc::clone(adjacency));
        wal.register_handler(
            OP_SAVE_VERB,
            handler(move |params| {
                let (s, a) = (Arc::clone(&s), Arc::clone(&a));
                async move {
                    let params: SaveVerbParams = decode_params(params)?;
                    apply_save_verb(&s, &a, params).await
                }
            }),
        );

        let (s, h, p, a) = (
            Arc::clone(storage),
            Arc::clone(hnsw),
            Arc::clone(persistence),
            Arc::clone(adjacency),
        );
        wal.register_handler(
            OP_DELETE_NOUN,
            handler(move |params| {
                let (s, h, p, a) = (
                    Arc::clone(&s),
                    Arc::clone(&h),
                    Arc::clone(&p),
                    Arc::clone(&a),
                );
                async move {
                    let params: IdParams = decode_params(params)?;
                    apply_delete_noun(&s, &h, &p, &a, params.id).await
                }
            }),
        );

        let (s, a) = (Arc::clone(storage), Arc::clone(adjacency));
        wal.register_handler(
            OP_DELETE_VERB,
            handler(move |params| {
                let (s, a) = (Arc::clone(&s), Arc::clone(&a));
                async move {
                    let params: IdParams = decode_params(params)?;
                    apply_delete_verb(&s, &a, params.id).await
                }
            }),
        );

        let s = Arc::clone(storage);
        wal.register_handler(
            OP_UPDATE_NOUN_METADATA,
            handler(move |params| {
                let s = Arc::clone(&s);
                async move {
                    let params: PatchParams = decode_params(params)?;
                    match s.update_noun_metadata(&params.id, params.patch).await {
                        Ok(_) => Ok(()),
                        // The entity may have been deleted after the
                        // update was logged; replay must stay idempotent.
                        Err(SomaError::NotFound { .. }) => Ok(()),
                        Err(err) => Err(err),
                    }
                }
            }),
        );

        let s = Arc::clone(storage);
        wal.register_handler(
            OP_UPDATE_VERB_METADATA,
            handler(move |params| {
                let s = Arc::clone(&s);
                async move {
                    let params: PatchParams = decode_params(params)?;
                    match s.update_verb_metadata(&params.id, params.patch).await {
                        Ok(_) => Ok(()),
                        Err(SomaError::NotFound { .. }) => Ok(()),
                        Err(err) => Err(err),
                    }
                }
            }),
        );
    }

    // ========================
    // WRITE API
    // ========================

    /// Inserts a noun. Returns the (possibly server-assigned) id.
    pub async fn add(&self, draft: NounDraft) -> Result<Uuid> {
        let permit = self
            .backpressure
            .request_permission(OpClass::Write, 0)
            .await?;
        let result = self.add_inner(draft).await;
        match &result {
            Ok(_) => permit.success(),
            Err(err) => permit.failure(err),
        }
        result
    }

    async fn add_inner(&self, draft: NounDraft) -> Result<Uuid> {
        let id = draft.id.unwrap_or_else(Uuid::new_v4);
        let noun = draft
            .noun
            .ok_or_else(|| SomaError::invalid("noun type is required"))?;
        let vector = match (draft.vector, &draft.text) {
            (Some(vector), _) => normalize_vector(vector)?,
            (None, Some(text)) => embed_normalized(self.embedder.as_ref(), text).await?,
            (None, None) => {
                return Err(SomaError::invalid("either text or vector is required"))
            }
        };

        let mut metadata = NounMetadata::new(id, noun);
        metadata.extra = draft.metadata;
        if let Some(text) = draft.text {
            metadata
                .extra
                .entry("text".to_string())
                .or_insert(Value::String(text));
        }
        crate::types::validate_user_fields(&metadata.extra)?;

        let record = NounVectorRecord {
            id,
            vector,
            connections: Default::default(),
            level: 0,
        };
        let params = serde_json::to_value(SaveNounParams {
            record: record.clone(),
            metadata: metadata.clone(),
        })
        .expect("params serialize");

        let storage = Arc::clone(&self.storage);
        let hnsw = Arc::clone(&self.hnsw);
        let persistence = Arc::clone(&self.hnsw_persistence);
        self.wal
            .execute(OP_SAVE_NOUN, params, async move {
                apply_save_noun(
                    &storage,
                    &hnsw,
                    &persistence,
                    SaveNounParams { record, metadata },
                )
                .await
            })
            .await?;
        self.statistics.set_hnsw_index_size(self.hnsw.len() as u64);
        Ok(id)
    }

    /// Batch ingestion: per-item outcomes, a failed item never aborts
    /// the rest.
    pub async fn add_batch(&self, drafts: Vec<NounDraft>) -> Vec<Result<Uuid>> {
        let mut results = Vec::with_capacity(drafts.len());
        for draft in drafts {
            results.push(self.add(draft).await);
        }
        results
    }

    /// Creates a typed edge between two existing nouns.
    pub async fn relate(&self, draft: VerbDraft) -> Result<Uuid> {
        let permit = self
            .backpressure
            .request_permission(OpClass::Write, 0)
            .await?;
        let result = self.relate_inner(draft).await;
        match &result {
            Ok(_) => permit.success(),
            Err(err) => permit.failure(err),
        }
        result
    }

    async fn relate_inner(&self, draft: VerbDraft) -> Result<Uuid> {
        let id = draft.id.unwrap_or_else(Uuid::new_v4);
        let Some(source) = self.storage.get_noun_vector(&draft.source).await? else {
            return Err(SomaError::not_found(draft.source.to_string()));
        };
        let Some(target) = self.storage.get_noun_vector(&draft.target).await? else {
            return Err(SomaError::not_found(draft.target.to_string()));
        };

        // Edge embedding: midpoint of the endpoints, renormalized. Two
        // antipodal endpoints degenerate to the source vector.
        let mut vector: Vec<f32> = source
            .vector
            .iter()
            .zip(target.vector.iter())
            .map(|(a, b)| (a + b) / 2.0)
            .collect();
        if normalize_vector(vector.clone()).is_err() {
            vector = source.vector.clone();
        } else {
            vector = normalize_vector(vector)?;
        }

        let mut metadata = VerbMetadata::new(id, draft.verb);
        metadata.weight = draft.weight.unwrap_or(1.0);
        metadata.extra = draft.metadata;
        metadata.validate()?;
        crate::types::validate_user_fields(&metadata.extra)?;

        let record = VerbVectorRecord {
            id,
            vector,
            connections: Default::default(),
            verb: draft.verb,
            source_id: draft.source,
            target_id: draft.target,
        };
        let params = serde_json::to_value(SaveVerbParams {
            record: record.clone(),
            metadata: metadata.clone(),
        })
        .expect("params serialize");

        let storage = Arc::clone(&self.storage);
        let adjacency = Arc::clone(&self.adjacency);
        self.wal
            .execute(OP_SAVE_VERB, params, async move {
                apply_save_verb(&storage, &adjacency, SaveVerbParams { record, metadata }).await
            })
            .await?;
        Ok(id)
    }

    pub async fn delete_noun(&self, id: Uuid) -> Result<()> {
        let permit = self
            .backpressure
            .request_permission(OpClass::Write, 0)
            .await?;
        let params = serde_json::to_value(IdParams { id }).expect("params serialize");
        let storage = Arc::clone(&self.storage);
        let hnsw = Arc::clone(&self.hnsw);
        let persistence = Arc::clone(&self.hnsw_persistence);
        let adjacency = Arc::clone(&self.adjacency);
        let result = self
            .wal
            .execute(OP_DELETE_NOUN, params, async move {
                apply_delete_noun(&storage, &hnsw, &persistence, &adjacency, id).await
            })
            .await;
        match &result {
            Ok(_) => permit.success(),
            Err(err) => permit.failure(err),
        }
        self.statistics.set_hnsw_index_size(self.hnsw.len() as u64);
        result
    }

    pub async fn delete_verb(&self, id: Uuid) -> Result<()> {
        let permit = self
            .backpressure
            .request_permission(OpClass::Write, 0)
            .await?;
        let params = serde_json::to_value(IdParams { id }).expect("params serialize");
        let storage = Arc::clone(&self.storage);
        let adjacency = Arc::clone(&self.adjacency);
        let result = self
            .wal
            .execute(OP_DELETE_VERB, params, async move {
                apply_delete_verb(&storage, &adjacency, id).await
            })
            .await;
        match &result {
            Ok(_) => permit.success(),
            Err(err) => permit.failure(err),
        }
        result
    }

    pub async fn update_noun_metadata(
        &self,
        id: Uuid,
        patch: Map<String, Value>,
    ) -> Result<NounMetadata> {
        let permit = self
            .backpressure
            .request_permission(OpClass::Write, 0)
            .await?;
        let params =
            serde_json::to_value(PatchParams { id, patch: patch.clone() }).expect("params serialize");
        let storage = Arc::clone(&self.storage);
        let result = self
            .wal
            .execute(OP_UPDATE_NOUN_METADATA, params, async move {
                storage.update_noun_metadata(&id, patch).await
            })
            .await;
        match &result {
            Ok(_) => permit.success(),
            Err(err) => permit.failure(err),
        }
        result
    }

    pub async fn update_verb_metadata(
        &self,
        id: Uuid,
        patch: Map<String, Value>,
    ) -> Result<VerbMetadata> {
        let permit = self
            .backpressure
            .request_permission(OpClass::Write, 0)
            .await?;
        let params =
            serde_json::to_value(PatchParams { id, patch: patch.clone() }).expect("params serialize");
        let storage = Arc::clone(&self.storage);
        let result = self
            .wal
            .execute(OP_UPDATE_VERB_METADATA, params, async move {
                storage.update_verb_metadata(&id, patch).await
            })
            .await;
        match &result {
            Ok(_) => permit.success(),
            Err(err) => permit.failure(err),
        }
        result
    }

    // ========================
    // READ API
    // ========================

    pub async fn get_noun(&self, id: Uuid) -> Result<Option<Noun>> {
        let permit = self
            .backpressure
            .request_permission(OpClass::Read, 0)
            .await?;
        let result = self.storage.get_noun(&id).await;
        match &result {
            Ok(_) => permit.success(),
            Err(err) => permit.failure(err),
        }
        Ok(result?.map(|(record, metadata)| Noun {
            id,
            vector: record.vector,
            metadata,
        }))
    }

    pub async fn get_verb(&self, id: Uuid) -> Result<Option<Verb>> {
        let permit = self
            .backpressure
            .request_permission(OpClass::Read, 0)
            .await?;
        let result = self.storage.get_verb(&id).await;
        match &result {
            Ok(_) => permit.success(),
            Err(err) => permit.failure(err),
        }
        Ok(result?.map(|(record, metadata)| Verb {
            id,
            verb: record.verb,
            source: record.source_id,
            target: record.target_id,
            metadata,
        }))
    }

    pub async fn get_nouns(
        &self,
        filter: Option<NounFilter>,
        pagination: &Pagination,
    ) -> Result<Page<NounMetadata>> {
        let permit = self
            .backpressure
            .request_permission(OpClass::Read, 0)
            .await?;
        let result = self.storage.get_nouns(filter, pagination).await;
        match &result {
            Ok(_) => permit.success(),
            Err(err) => permit.failure(err),
        }
        result
    }

    pub async fn get_verbs(
        &self,
        filter: Option<VerbFilter>,
        pagination: &Pagination,
    ) -> Result<Page<VerbMetadata>> {
        let permit = self
            .backpressure
            .request_permission(OpClass::Read, 0)
            .await?;
        let result = self.storage.get_verbs(filter, pagination).await;
        match &result {
            Ok(_) => permit.success(),
            Err(err) => permit.failure(err),
        }
        result
    }

    pub async fn get_nouns_by_type(
        &self,
        noun: NounType,
        pagination: &Pagination,
    ) -> Result<Page<NounMetadata>> {
        self.get_nouns(Some(NounFilter::ByType(noun)), pagination).await
    }

    pub async fn get_verbs_by_source(
        &self,
        source: Uuid,
        pagination: &Pagination,
    ) -> Result<Page<VerbMetadata>> {
        self.get_verbs(Some(VerbFilter::BySource(source)), pagination).await
    }

    pub async fn get_verbs_by_target(
        &self,
        target: Uuid,
        pagination: &Pagination,
    ) -> Result<Page<VerbMetadata>> {
        self.get_verbs(Some(VerbFilter::ByTarget(target)), pagination).await
    }

    pub async fn get_verbs_by_type(
        &self,
        verb: VerbType,
        pagination: &Pagination,
    ) -> Result<Page<VerbMetadata>> {
        self.get_verbs(Some(VerbFilter::ByType(verb)), pagination).await
    }

    /// Vector top-k search.
    pub async fn search(&self, input: QueryInput, k: usize) -> Result<Vec<QueryHit>> {
        self.search_cancellable(input, k, None, &CancellationToken::new())
            .await
    }

    pub async fn search_cancellable(
        &self,
        input: QueryInput,
        k: usize,
        ef: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<Vec<QueryHit>> {
        let permit = self
            .backpressure
            .request_permission(OpClass::Read, 0)
            .await?;
        let result = self.query_engine.search(input, k, ef, cancel).await;
        match &result {
            Ok(_) => permit.success(),
            Err(err) => permit.failure(err),
        }
        result
    }

    /// Composite like/where/connected query.
    pub async fn query(&self, query: &Query) -> Result<Vec<QueryHit>> {
        self.query_cancellable(query, &CancellationToken::new()).await
    }

    pub async fn query_cancellable(
        &self,
        query: &Query,
        cancel: &CancellationToken,
    ) -> Result<Vec<QueryHit>> {
        let permit = self
            .backpressure
            .request_permission(OpClass::Read, 0)
            .await?;
        let result = self.query_engine.query(query, cancel).await;
        match &result {
            Ok(_) => permit.success(),
            Err(err) => permit.failure(err),
        }
        result
    }

    pub fn statistics(&self) -> StatisticsDocument {
        let mut doc = self.statistics.snapshot();
        doc.hnsw_index_size = self.hnsw.len() as u64;
        doc
    }

    pub fn backpressure_metrics(&self) -> BackpressureMetrics {
        self.backpressure.metrics()
    }

    // ========================
    // VERSIONING & HISTORY
    // ========================

    /// Records a content version for an entity on the current branch.
    pub async fn save_version(
        &self,
        entity_id: Uuid,
        content: &Value,
        options: VersionOptions,
    ) -> Result<VersionEntry> {
        let branch = self.history.head_branch().await?;
        let (entry, appended) = self
            .versions
            .save_version(&entity_id, &branch, content, options)
            .await?;
        if appended {
            tracing::debug!(%entity_id, version = entry.version, "recorded entity version");
        }
        Ok(entry)
    }

    pub async fn list_versions(&self, entity_id: Uuid) -> Result<Vec<VersionEntry>> {
        let branch = self.history.head_branch().await?;
        self.versions.list_versions(&entity_id, &branch).await
    }

    pub async fn get_version(
        &self,
        entity_id: Uuid,
        version: u64,
    ) -> Result<Option<(VersionEntry, Value)>> {
        let branch = self.history.head_branch().await?;
        self.versions.get_version(&entity_id, &branch, version).await
    }

    /// Snapshots every live entity into a blob/tree/commit chain on the
    /// current branch and returns the commit hash.
    pub async fn commit_snapshot(&self, author: &str, message: Option<&str>) -> Result<String> {
        let permit = self
            .backpressure
            .request_permission(OpClass::Write, 0)
            .await?;
        let result = self.commit_snapshot_inner(author, message).await;
        match &result {
            Ok(_) => permit.success(),
            Err(err) => permit.failure(err),
        }
        result
    }

    async fn commit_snapshot_inner(&self, author: &str, message: Option<&str>) -> Result<String> {
        let mut entries = Vec::new();
        for kind in [EntityKind::Noun, EntityKind::Verb] {
            let prefix = routing::entity_prefix(kind, RecordKind::Metadata);
            let mut cursor: Option<String> = None;
            loop {
                let page = self
                    .storage
                    .adapter()
                    .list(&prefix, 200, cursor.as_deref())
                    .await?;
                for key in &page.keys {
                    let Some(id) = routing::id_from_entity_path(key) else {
                        continue;
                    };
                    let Some(content) = self.entity_snapshot(kind, &id).await? else {
                        continue;
                    };
                    let bytes = crate::hashing::canonical_json(&content).into_bytes();
                    let size = bytes.len() as u64;
                    let hash = self.objects.put_blob(&bytes).await?;
                    entries.push(TreeEntry {
                        name: format!("{}/{}.json", kind.dir(), id.as_hyphenated()),
                        hash,
                        kind: ObjectKind::Blob,
                        size,
                    });
                }
                if !page.has_more || page.keys.is_empty() {
                    break;
                }
                cursor = page.next_cursor;
            }
        }

        let tree = self.objects.put_tree(entries).await?;
        let branch = self.history.head_branch().await?;
        let parent = match self.history.read_ref(RefKind::Branch, &branch).await? {
            Some(doc) => Some(doc.commit_hash),
            None => None,
        };
        let commit = CommitObject {
            tree,
            parent: parent.clone(),
            timestamp: Utc::now(),
            author: author.to_string(),
            message: message.map(str::to_string),
            metadata: {
                let mut map = Map::new();
                map.insert("operation".into(), Value::String("snapshot".into()));
                map
            },
        };
        let hash = self.objects.put_commit(&commit).await?;
        let mode = match parent {
            Some(expected) => RefUpdate::Cas { expected },
            None => RefUpdate::CreateOnly,
        };
        self.history
            .update_ref(RefKind::Branch, &branch, &hash, mode)
            .await?;
        self.history.invalidate_index();
        Ok(hash)
    }

    async fn entity_snapshot(&self, kind: EntityKind, id: &Uuid) -> Result<Option<Value>> {
        let value = match kind {
            EntityKind::Noun => match self.storage.get_noun(id).await? {
                Some((record, metadata)) => serde_json::json!({
                    "vector": serde_json::to_value(&record).expect("record serializes"),
                    "metadata": serde_json::to_value(&metadata).expect("metadata serializes"),
                }),
                None => return Ok(None),
            },
            EntityKind::Verb => match self.storage.get_verb(id).await? {
                Some((record, metadata)) => serde_json::json!({
                    "vector": serde_json::to_value(&record).expect("record serializes"),
                    "metadata": serde_json::to_value(&metadata).expect("metadata serializes"),
                }),
                None => return Ok(None),
            },
        };
        Ok(Some(value))
    }

    /// Time-travel read: the entity as captured by the snapshot commit
    /// current at `refish` (a ref) or at a timestamp on HEAD's branch.
    pub async fn get_noun_at(&self, id: Uuid, refish: &str) -> Result<Option<Noun>> {
        let commit_hash = self.history.resolve(refish).await?;
        self.noun_from_commit(&commit_hash, id).await
    }

    pub async fn get_noun_at_time(
        &self,
        id: Uuid,
        ts: DateTime<Utc>,
    ) -> Result<Option<Noun>> {
        let branch = self.history.head_branch().await?;
        let Some(entry) = self.history.find_at_time(&branch, ts).await? else {
            return Ok(None);
        };
        self.noun_from_commit(&entry.hash, id).await
    }

    async fn noun_from_commit(&self, commit_hash: &str, id: Uuid) -> Result<Option<Noun>> {
        let Some(commit) = self.objects.get_commit(commit_hash).await? else {
            return Err(SomaError::not_found(commit_hash.to_string()));
        };
        let Some(tree) = self.objects.get_tree(&commit.tree).await? else {
            return Err(SomaError::fatal(format!(
                "commit {commit_hash} references missing tree {}",
                commit.tree
            )));
        };
        let name = format!("nouns/{}.json", id.as_hyphenated());
        let Some(entry) = tree.entries.iter().find(|e| e.name == name) else {
            return Ok(None);
        };
        let Some(bytes) = self.objects.get_blob(&entry.hash).await? else {
            return Err(SomaError::fatal(format!(
                "tree entry {name} references missing blob {}",
                entry.hash
            )));
        };
        let value: Value = serde_json::from_slice(&bytes)
            .map_err(|e| SomaError::fatal(format!("corrupt snapshot blob {name}: {e}")))?;
        let record: NounVectorRecord = serde_json::from_value(
            value.get("vector").cloned().unwrap_or(Value::Null),
        )
        .map_err(|e| SomaError::fatal(format!("corrupt snapshot vector for {id}: {e}")))?;
        let metadata: NounMetadata = serde_json::from_value(
            value.get("metadata").cloned().unwrap_or(Value::Null),
        )
        .map_err(|e| SomaError::fatal(format!("corrupt snapshot metadata for {id}: {e}")))?;
        Ok(Some(Noun {
            id,
            vector: record.vector,
            metadata,
        }))
    }

    pub async fn create_branch(&self, name: &str, from: Option<&str>) -> Result<RefDocument> {
        let from = match from {
            Some(refish) => self.history.resolve(refish).await?,
            None => self.history.resolve("HEAD").await?,
        };
        self.history
            .update_ref(RefKind::Branch, name, &from, RefUpdate::CreateOnly)
            .await
    }

    pub async fn create_tag(&self, name: &str, refish: &str) -> Result<RefDocument> {
        let target = self.history.resolve(refish).await?;
        self.history
            .update_ref(RefKind::Tag, name, &target, RefUpdate::CreateOnly)
            .await
    }

    pub async fn checkout(&self, branch: &str) -> Result<()> {
        self.history.set_head(branch).await
    }

    pub async fn delete_branch(&self, name: &str) -> Result<()> {
        self.history.delete_ref(RefKind::Branch, name).await
    }

    pub async fn list_refs(&self) -> Result<Vec<RefDocument>> {
        self.history.list_refs().await
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    // ========================
    // MAINTENANCE
    // ========================

    /// Rebuilds the HNSW arena without tombstones and re-persists it.
    pub async fn compact(&self) -> Result<usize> {
        let (states, dropped) = self.hnsw.compact();
        self.hnsw_persistence
            .persist_after_compaction(&self.hnsw, &states)
            .await?;
        self.statistics.set_hnsw_index_size(self.hnsw.len() as u64);
        Ok(dropped.len())
    }

    /// Scans the store for two-file violations and dangling verbs.
    pub async fn verify_store(&self) -> Result<IntegrityReport> {
        let mut report = IntegrityReport::default();
        let prefix = routing::entity_prefix(EntityKind::Noun, RecordKind::Hnsw);
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .storage
                .adapter()
                .list(&prefix, 200, cursor.as_deref())
                .await?;
            for key in &page.keys {
                let Some(id) = routing::id_from_entity_path(key) else {
                    continue;
                };
                report.nouns_scanned += 1;
                if self.storage.get_noun_metadata(&id).await?.is_none() {
                    report.vectors_without_metadata += 1;
                    tracing::warn!(%id, "noun vector record without metadata");
                }
            }
            if !page.has_more || page.keys.is_empty() {
                break;
            }
            cursor = page.next_cursor;
        }

        let prefix = routing::entity_prefix(EntityKind::Verb, RecordKind::Hnsw);
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .storage
                .adapter()
                .list(&prefix, 200, cursor.as_deref())
                .await?;
            for key in &page.keys {
                let Some(id) = routing::id_from_entity_path(key) else {
                    continue;
                };
                report.verbs_scanned += 1;
                let Some(record) = self.storage.get_verb_vector(&id).await? else {
                    continue;
                };
                let source = self.storage.get_noun_metadata(&record.source_id).await?;
                let target = self.storage.get_noun_metadata(&record.target_id).await?;
                if source.is_none() || target.is_none() {
                    report.dangling_verbs += 1;
                }
            }
            if !page.has_more || page.keys.is_empty() {
                break;
            }
            cursor = page.next_cursor;
        }
        Ok(report)
    }

    /// Deletes every object in the namespace and resets in-memory state.
    pub async fn clear(&self) -> Result<()> {
        self.storage.clear().await?;
        self.hnsw.reset();
        self.adjacency.rebuild(&self.storage).await?;
        self.statistics.reset();
        Ok(())
    }

    /// Graceful teardown: final checkpoint, index metadata, statistics.
    pub async fn shutdown(&self) -> Result<()> {
        if self.wal.enabled() {
            self.wal.checkpoint().await?;
        }
        self.hnsw_persistence
            .persist_entry_point(&self.hnsw)
            .await?;
        self.hnsw_persistence.persist_deleted(&self.hnsw).await?;
        self.statistics.persist().await?;
        self.wal.shutdown();
        Ok(())
    }
}

fn decode_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params)
        .map_err(|e| SomaError::fatal(format!("malformed WAL params: {e}")))
}

/// The persisted write path for one noun: vector record first, metadata
/// second, then the HNSW insert and its dirty-node persistence. Replays
/// re-run this whole function; every step is a replace or a no-op.
async fn apply_save_noun(
    storage: &Arc<BaseStorage>,
    hnsw: &Arc<HnswIndex>,
    persistence: &Arc<HnswPersistence>,
    params: SaveNounParams,
) -> Result<()> {
    let SaveNounParams { record, metadata } = params;
    let id = record.id;
    let vector = record.vector.clone();
    let had_entry = hnsw.entry_point();
    storage.save_noun(&record).await?;
    storage.save_noun_metadata(id, &metadata).await?;
    let states = hnsw.insert(id, vector)?;
    persistence.persist_nodes(&states).await?;
    if hnsw.entry_point() != had_entry {
        persistence.persist_entry_point(hnsw).await?;
    }
    Ok(())
}

async fn apply_save_verb(
    storage: &Arc<BaseStorage>,
    adjacency: &Arc<AdjacencyIndex>,
    params: SaveVerbParams,
) -> Result<()> {
    let SaveVerbParams { record, metadata } = params;
    storage.save_verb(&record).await?;
    storage.save_verb_metadata(record.id, &metadata).await?;
    adjacency.insert_edge(record.id, record.source_id, record.target_id, record.verb);
    Ok(())
}

async fn apply_delete_noun(
    storage: &Arc<BaseStorage>,
    hnsw: &Arc<HnswIndex>,
    persistence: &Arc<HnswPersistence>,
    adjacency: &Arc<AdjacencyIndex>,
    id: Uuid,
) -> Result<()> {
    if hnsw.delete(&id) {
        persistence.persist_deleted(hnsw).await?;
        persistence.persist_entry_point(hnsw).await?;
    }
    storage.delete_noun(&id).await?;
    // Incident edges leave the in-memory index; their records stay and
    // are reported dangling until explicitly deleted.
    adjacency.remove_node(&id);
    Ok(())
}

async fn apply_delete_verb(
    storage: &Arc<BaseStorage>,
    adjacency: &Arc<AdjacencyIndex>,
    id: Uuid,
) -> Result<()> {
    storage.delete_verb(&id).await?;
    adjacency.remove_edge(&id);
    Ok(())
}
