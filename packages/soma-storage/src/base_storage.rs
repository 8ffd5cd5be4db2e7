/// Base storage: the logical entity API over a storage adapter.
///
/// Every entity is two objects, written vector-record first and metadata
/// second; an entity whose metadata is missing is reported absent (or
/// `Fatal` in strict mode), never half-read. Counts-by-type are bumped
/// only after a metadata write succeeds at a previously empty path, so
/// WAL replays can never double-count.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::adapter::{with_retry, StorageAdapter};
use crate::error::{Result, SomaError};
use crate::routing::{self, EntityKind, RecordKind};
use crate::statistics::StatisticsStore;
use crate::types::{
    validate_user_fields, NounMetadata, NounType, NounVectorRecord, VerbMetadata, VerbType,
    VerbVectorRecord,
};

/// Page size used when the caller does not constrain listings.
pub const DEFAULT_PAGE_LIMIT: usize = 100;

#[derive(Debug, Clone, Default)]
pub struct Pagination {
    pub offset: Option<usize>,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total_count: Option<usize>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            total_count: Some(0),
            has_more: false,
            next_cursor: None,
        }
    }
}

/// Filters with a dedicated fast path. Anything richer belongs to the
/// query engine, which pages through entities explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NounFilter {
    ByType(NounType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerbFilter {
    BySource(Uuid),
    ByTarget(Uuid),
    ByType(VerbType),
    BySourceAndType(Uuid, VerbType),
}

/// Edge lookups served by the adjacency index. Injected after
/// construction so the dependency only points one way.
pub trait EdgeLookup: Send + Sync {
    fn edges_from(&self, source: &Uuid, verb: Option<VerbType>) -> Vec<Uuid>;
    fn edges_to(&self, target: &Uuid, verb: Option<VerbType>) -> Vec<Uuid>;
}

/// In-memory id sets per type tag, rebuilt by scan at open and
/// maintained inline on every metadata write.
#[derive(Default)]
struct TypeIndex {
    nouns: HashMap<String, HashSet<Uuid>>,
    verbs: HashMap<String, HashSet<Uuid>>,
}

pub struct BaseStorage {
    adapter: Arc<dyn StorageAdapter>,
    statistics: Arc<StatisticsStore>,
    type_index: Mutex<TypeIndex>,
    edge_lookup: RwLock<Option<Arc<dyn EdgeLookup>>>,
    /// Strict mode turns a vector-without-metadata read into `Fatal`
    /// instead of reporting the entity missing.
    strict: bool,
}

impl BaseStorage {
    pub fn new(
        adapter: Arc<dyn StorageAdapter>,
        statistics: Arc<StatisticsStore>,
        strict: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            adapter,
            statistics,
            type_index: Mutex::new(TypeIndex::default()),
            edge_lookup: RwLock::new(None),
            strict,
        })
    }

    pub fn adapter(&self) -> &Arc<dyn StorageAdapter> {
        &self.adapter
    }

    pub fn statistics(&self) -> &Arc<StatisticsStore> {
        &self.statistics
    }

    pub fn set_edge_lookup(&self, lookup: Arc<dyn EdgeLookup>) {
        *self.edge_lookup.write() = Some(lookup);
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.adapter.read_only() {
            return Err(SomaError::PermissionDenied {
                key: format!("{} adapter is read-only", self.adapter.name()),
            });
        }
        Ok(())
    }

    async fn write_json<T: serde::Serialize>(&self, path: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| SomaError::fatal(format!("serialize {path}: {e}")))?;
        with_retry(path, || {
            let bytes = bytes.clone();
            async move { self.adapter.write_object(path, bytes).await }
        })
        .await
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let bytes = with_retry(path, || async { self.adapter.read_object(path).await }).await?;
        match bytes {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| SomaError::fatal(format!("corrupt object {path}: {e}"))),
            None => Ok(None),
        }
    }

    async fn delete_path(&self, path: &str) -> Result<()> {
        with_retry(path, || async { self.adapter.delete_object(path).await }).await
    }

    // ========================
    // NOUNS
    // ========================

    /// Persists the vector record. Always the first of the two writes.
    pub async fn save_noun(&self, record: &NounVectorRecord) -> Result<()> {
        self.ensure_writable()?;
        let path = routing::entity_path(&record.id, EntityKind::Noun, RecordKind::Hnsw);
        self.write_json(&path, record).await
    }

    /// Persists metadata, bumping the per-type counter only when the
    /// write succeeded and no metadata existed at the path before.
    pub async fn save_noun_metadata(&self, id: Uuid, meta: &NounMetadata) -> Result<()> {
        self.ensure_writable()?;
        if meta.id != id {
            return Err(SomaError::invalid(format!(
                "metadata id {} does not match {}",
                meta.id, id
            )));
        }
        validate_user_fields(&meta.extra)?;
        let path = routing::entity_path(&id, EntityKind::Noun, RecordKind::Metadata);
        let existed = self.adapter.read_object(&path).await?.is_some();
        self.write_json(&path, meta).await?;
        if !existed {
            self.statistics.increment_noun(meta.noun);
            self.index_insert(EntityKind::Noun, meta.noun.as_str(), id);
        }
        Ok(())
    }

    pub async fn get_noun_vector(&self, id: &Uuid) -> Result<Option<NounVectorRecord>> {
        let path = routing::entity_path(id, EntityKind::Noun, RecordKind::Hnsw);
        self.read_json(&path).await
    }

    pub async fn get_noun_metadata(&self, id: &Uuid) -> Result<Option<NounMetadata>> {
        let path = routing::entity_path(id, EntityKind::Noun, RecordKind::Metadata);
        self.read_json(&path).await
    }

    /// Reads both records. A present vector with absent metadata means
    /// the entity is missing (a crash between the two writes); strict
    /// mode reports it as corruption instead.
    pub async fn get_noun(&self, id: &Uuid) -> Result<Option<(NounVectorRecord, NounMetadata)>> {
        let vector = self.get_noun_vector(id).await?;
        let metadata = self.get_noun_metadata(id).await?;
        match (vector, metadata) {
            (Some(vector), Some(metadata)) => Ok(Some((vector, metadata))),
            (Some(_), None) => {
                if self.strict {
                    Err(SomaError::fatal(format!(
                        "noun {id} has a vector record but no metadata"
                    )))
                } else {
                    tracing::warn!(%id, "noun vector present without metadata, reporting missing");
                    Ok(None)
                }
            }
            _ => Ok(None),
        }
    }

    /// Removes both records; decrements the counter only if metadata
    /// actually existed.
    pub async fn delete_noun(&self, id: &Uuid) -> Result<()> {
        self.ensure_writable()?;
        let meta = self.get_noun_metadata(id).await?;
        self.delete_path(&routing::entity_path(id, EntityKind::Noun, RecordKind::Hnsw))
            .await?;
        self.delete_path(&routing::entity_path(id, EntityKind::Noun, RecordKind::Metadata))
            .await?;
        if let Some(meta) = meta {
            self.statistics.decrement_noun(meta.noun);
            self.index_remove(EntityKind::Noun, meta.noun.as_str(), id);
        }
        Ok(())
    }

    /// Shallow-merges a metadata patch. Reserved identity fields (`id`,
    /// `noun`, `createdAt`) are immutable; `updatedAt` is refreshed.
    pub async fn update_noun_metadata(
        &self,
        id: &Uuid,
        patch: Map<String, Value>,
    ) -> Result<NounMetadata> {
        let mut meta = self
            .get_noun_metadata(id)
            .await?
            .ok_or_else(|| SomaError::not_found(id.to_string()))?;
        apply_patch(
            &mut meta.confidence,
            &mut meta.weight,
            &mut meta.service,
            &mut meta.created_by,
            &mut meta.data,
            &mut meta.extra,
            patch,
        )?;
        meta.updated_at = chrono::Utc::now();
        let path = routing::entity_path(id, EntityKind::Noun, RecordKind::Metadata);
        self.write_json(&path, &meta).await?;
        Ok(meta)
    }

    // ========================
    // VERBS
    // ========================

    pub async fn save_verb(&self, record: &VerbVectorRecord) -> Result<()> {
        self.ensure_writable()?;
        let path = routing::entity_path(&record.id, EntityKind::Verb, RecordKind::Hnsw);
        self.write_json(&path, record).await
    }

    pub async fn save_verb_metadata(&self, id: Uuid, meta: &VerbMetadata) -> Result<()> {
        self.ensure_writable()?;
        if meta.id != id {
            return Err(SomaError::invalid(format!(
                "metadata id {} does not match {}",
                meta.id, id
            )));
        }
        meta.validate()?;
        validate_user_fields(&meta.extra)?;
        let path = routing::entity_path(&id, EntityKind::Verb, RecordKind::Metadata);
        let existed = self.adapter.read_object(&path).await?.is_some();
        self.write_json(&path, meta).await?;
        if !existed {
            self.statistics.increment_verb(meta.verb);
            self.index_insert(EntityKind::Verb, meta.verb.as_str(), id);
        }
        Ok(())
    }

    pub async fn get_verb_vector(&self, id: &Uuid) -> Result<Option<VerbVectorRecord>> {
        let path = routing::entity_path(id, EntityKind::Verb, RecordKind::Hnsw);
        self.read_json(&path).await
    }

    pub async fn get_verb_metadata(&self, id: &Uuid) -> Result<Option<VerbMetadata>> {
        let path = routing::entity_path(id, EntityKind::Verb, RecordKind::Metadata);
        self.read_json(&path).await
    }

    pub async fn get_verb(&self, id: &Uuid) -> Result<Option<(VerbVectorRecord, VerbMetadata)>> {
        let vector = self.get_verb_vector(id).await?;
        let metadata = self.get_verb_metadata(id).await?;
        match (vector, metadata) {
            (Some(vector), Some(metadata)) => Ok(Some((vector, metadata))),
            (Some(_), None) => {
                if self.strict {
                    Err(SomaError::fatal(format!(
                        "verb {id} has a vector record but no metadata"
                    )))
                } else {
                    tracing::warn!(%id, "verb vector present without metadata, reporting missing");
                    Ok(None)
                }
            }
            _ => Ok(None),
        }
    }

    pub async fn delete_verb(&self, id: &Uuid) -> Result<()> {
        self.ensure_writable()?;
        let meta = self.get_verb_metadata(id).await?;
        self.delete_path(&routing::entity_path(id, EntityKind::Verb, RecordKind::Hnsw))
            .await?;
        self.delete_path(&routing::entity_path(id, EntityKind::Verb, RecordKind::Metadata))
            .await?;
        if let Some(meta) = meta {
            self.statistics.decrement_verb(meta.verb);
            self.index_remove(EntityKind::Verb, meta.verb.as_str(), id);
        }
        Ok(())
    }

    pub async fn update_verb_metadata(
        &self,
        id: &Uuid,
        patch: Map<String, Value>,
    ) -> Result<VerbMetadata> {
        let mut meta = self
            .get_verb_metadata(id)
            .await?
            .ok_or_else(|| SomaError::not_found(id.to_string()))?;
        let mut weight = Some(meta.weight);
        apply_patch(
            &mut meta.confidence,
            &mut weight,
            &mut meta.service,
            &mut meta.created_by,
            &mut meta.data,
            &mut meta.extra,
            patch,
        )?;
        meta.weight = weight.unwrap_or(meta.weight);
        meta.validate()?;
        meta.updated_at = chrono::Utc::now();
        let path = routing::entity_path(id, EntityKind::Verb, RecordKind::Metadata);
        self.write_json(&path, &meta).await?;
        Ok(meta)
    }

    // ========================
    // LISTINGS
    // ========================

    /// Paginated noun listing. `ByType` short-circuits through the type
    /// index; the unfiltered form pages the metadata namespace.
    pub async fn get_nouns(
        &self,
        filter: Option<NounFilter>,
        pagination: &Pagination,
    ) -> Result<Page<NounMetadata>> {
        match filter {
            Some(NounFilter::ByType(noun)) => {
                let ids = self.ids_for_type(EntityKind::Noun, noun.as_str());
                self.page_nouns_by_ids(ids, pagination).await
            }
            None => {
                let keys = self
                    .page_keys(
                        &routing::entity_prefix(EntityKind::Noun, RecordKind::Metadata),
                        pagination,
                    )
                    .await?;
                let mut items = Vec::with_capacity(keys.items.len());
                for key in &keys.items {
                    if let Some(id) = routing::id_from_entity_path(key) {
                        if let Some(meta) = self.get_noun_metadata(&id).await? {
                            items.push(meta);
                        }
                    }
                }
                Ok(Page {
                    items,
                    total_count: keys.total_count,
                    has_more: keys.has_more,
                    next_cursor: keys.next_cursor,
                })
            }
        }
    }

    /// Paginated verb listing with the mandated fast paths: by-source,
    /// by-target, by-type, and by-(source+type) never scan.
    pub async fn get_verbs(
        &self,
        filter: Option<VerbFilter>,
        pagination: &Pagination,
    ) -> Result<Page<VerbMetadata>> {
        let ids = match filter {
            Some(VerbFilter::BySource(source)) => Some(self.edges(&source, None, true)?),
            Some(VerbFilter::ByTarget(target)) => Some(self.edges(&target, None, false)?),
            Some(VerbFilter::BySourceAndType(source, verb)) => {
                Some(self.edges(&source, Some(verb), true)?)
            }
            Some(VerbFilter::ByType(verb)) => {
                Some(self.ids_for_type(EntityKind::Verb, verb.as_str()))
            }
            None => None,
        };
        match ids {
            Some(ids) => self.page_verbs_by_ids(ids, pagination).await,
            None => {
                let keys = self
                    .page_keys(
                        &routing::entity_prefix(EntityKind::Verb, RecordKind::Metadata),
                        pagination,
                    )
                    .await?;
                let mut items = Vec::with_capacity(keys.items.len());
                for key in &keys.items {
                    if let Some(id) = routing::id_from_entity_path(key) {
                        if let Some(meta) = self.get_verb_metadata(&id).await? {
                            items.push(meta);
                        }
                    }
                }
                Ok(Page {
                    items,
                    total_count: keys.total_count,
                    has_more: keys.has_more,
                    next_cursor: keys.next_cursor,
                })
            }
        }
    }

    fn edges(&self, id: &Uuid, verb: Option<VerbType>, outgoing: bool) -> Result<Vec<Uuid>> {
        let guard = self.edge_lookup.read();
        let lookup = guard.as_ref().ok_or_else(|| {
            SomaError::IndexUnavailable("adjacency index is not attached".to_string())
        })?;
        Ok(if outgoing {
            lookup.edges_from(id, verb)
        } else {
            lookup.edges_to(id, verb)
        })
    }

    /// Raw key paging with the empty-page safety rule: an adapter that
    /// reports `has_more` alongside an empty page gets downgraded so a
    /// buggy cursor can never spin a caller forever.
    pub async fn page_keys(&self, prefix: &str, pagination: &Pagination) -> Result<Page<String>> {
        let limit = pagination.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
        if let Some(offset) = pagination.offset {
            return self.page_keys_by_offset(prefix, offset, limit).await;
        }
        let page = with_retry(prefix, || async {
            self.adapter
                .list(prefix, limit, pagination.cursor.as_deref())
                .await
        })
        .await?;
        let has_more = if page.keys.is_empty() && page.has_more {
            tracing::warn!(prefix, "adapter returned empty page with has_more, downgrading");
            false
        } else {
            page.has_more
        };
        Ok(Page {
            items: page.keys,
            total_count: None,
            has_more,
            next_cursor: if has_more { page.next_cursor } else { None },
        })
    }

    async fn page_keys_by_offset(
        &self,
        prefix: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Page<String>> {
        let mut skipped = 0usize;
        let mut cursor: Option<String> = None;
        let mut items = Vec::new();
        loop {
            let page = with_retry(prefix, || async {
                self.adapter.list(prefix, limit.max(DEFAULT_PAGE_LIMIT), cursor.as_deref()).await
            })
            .await?;
            if page.keys.is_empty() {
                return Ok(Page {
                    items,
                    total_count: None,
                    has_more: false,
                    next_cursor: None,
                });
            }
            let mut leftover = false;
            for key in &page.keys {
                if skipped < offset {
                    skipped += 1;
                    continue;
                }
                if items.len() < limit {
                    items.push(key.clone());
                } else {
                    leftover = true;
                    break;
                }
            }
            if items.len() >= limit {
                return Ok(Page {
                    items,
                    total_count: None,
                    has_more: leftover || page.has_more,
                    next_cursor: None,
                });
            }
            if !page.has_more || page.next_cursor.is_none() {
                return Ok(Page {
                    items,
                    total_count: None,
                    has_more: false,
                    next_cursor: None,
                });
            }
            cursor = page.next_cursor;
        }
    }

    async fn page_nouns_by_ids(
        &self,
        mut ids: Vec<Uuid>,
        pagination: &Pagination,
    ) -> Result<Page<NounMetadata>> {
        ids.sort_unstable();
        let total = ids.len();
        let (slice, has_more) = paginate_ids(ids, pagination);
        let mut items = Vec::with_capacity(slice.len());
        for id in slice {
            match self.get_noun_metadata(&id).await? {
                Some(meta) => items.push(meta),
                None => tracing::warn!(%id, "type index references a missing noun"),
            }
        }
        Ok(Page {
            items,
            total_count: Some(total),
            has_more,
            next_cursor: None,
        })
    }

    async fn page_verbs_by_ids(
        &self,
        mut ids: Vec<Uuid>,
        pagination: &Pagination,
    ) -> Result<Page<VerbMetadata>> {
        ids.sort_unstable();
        let total = ids.len();
        let (slice, has_more) = paginate_ids(ids, pagination);
        let mut items = Vec::with_capacity(slice.len());
        for id in slice {
            match self.get_verb_metadata(&id).await? {
                Some(meta) => items.push(meta),
                None => tracing::warn!(%id, "index references a missing verb"),
            }
        }
        Ok(Page {
            items,
            total_count: Some(total),
            has_more,
            next_cursor: None,
        })
    }

    // ========================
    // TYPE INDEX
    // ========================

    fn ids_for_type(&self, entity: EntityKind, tag: &str) -> Vec<Uuid> {
        let index = self.type_index.lock();
        let map = match entity {
            EntityKind::Noun => &index.nouns,
            EntityKind::Verb => &index.verbs,
        };
        map.get(tag).map(|s| s.iter().copied().collect()).unwrap_or_default()
    }

    fn index_insert(&self, entity: EntityKind, tag: &str, id: Uuid) {
        let mut index = self.type_index.lock();
        let map = match entity {
            EntityKind::Noun => &mut index.nouns,
            EntityKind::Verb => &mut index.verbs,
        };
        map.entry(tag.to_string()).or_default().insert(id);
    }

    fn index_remove(&self, entity: EntityKind, tag: &str, id: &Uuid) {
        let mut index = self.type_index.lock();
        let map = match entity {
            EntityKind::Noun => &mut index.nouns,
            EntityKind::Verb => &mut index.verbs,
        };
        if let Some(set) = map.get_mut(tag) {
            set.remove(id);
        }
    }

    /// Rebuilds the type index by paging every metadata record. Called
    /// once at open; incremental updates keep it current afterwards.
    pub async fn rebuild_type_index(&self) -> Result<()> {
        let mut fresh = TypeIndex::default();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .adapter
                .list(
                    &routing::entity_prefix(EntityKind::Noun, RecordKind::Metadata),
                    DEFAULT_PAGE_LIMIT,
                    cursor.as_deref(),
                )
                .await?;
            for key in &page.keys {
                if let Some(id) = routing::id_from_entity_path(key) {
                    if let Some(meta) = self.get_noun_metadata(&id).await? {
                        fresh
                            .nouns
                            .entry(meta.noun.as_str().to_string())
                            .or_default()
                            .insert(id);
                    }
                }
            }
            if !page.has_more || page.keys.is_empty() {
                break;
            }
            cursor = page.next_cursor;
        }
        cursor = None;
        loop {
            let page = self
                .adapter
                .list(
                    &routing::entity_prefix(EntityKind::Verb, RecordKind::Metadata),
                    DEFAULT_PAGE_LIMIT,
                    cursor.as_deref(),
                )
                .await?;
            for key in &page.keys {
                if let Some(id) = routing::id_from_entity_path(key) {
                    if let Some(meta) = self.get_verb_metadata(&id).await? {
                        fresh
                            .verbs
                            .entry(meta.verb.as_str().to_string())
                            .or_default()
                            .insert(id);
                    }
                }
            }
            if !page.has_more || page.keys.is_empty() {
                break;
            }
            cursor = page.next_cursor;
        }
        *self.type_index.lock() = fresh;
        Ok(())
    }

    /// Deletes every object in the namespace. Refused on read-only
    /// adapters; the caller is responsible for having torn down indexes.
    pub async fn clear(&self) -> Result<()> {
        self.ensure_writable()?;
        loop {
            let page = self.adapter.list("", DEFAULT_PAGE_LIMIT, None).await?;
            if page.keys.is_empty() {
                break;
            }
            for key in &page.keys {
                self.adapter.delete_object(key).await?;
            }
            if !page.has_more {
                break;
            }
        }
        *self.type_index.lock() = TypeIndex::default();
        Ok(())
    }
}

fn paginate_ids(ids: Vec<Uuid>, pagination: &Pagination) -> (Vec<Uuid>, bool) {
    let offset = pagination.offset.unwrap_or(0);
    let limit = pagination.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    let has_more = ids.len() > offset + limit;
    let slice = ids.into_iter().skip(offset).take(limit).collect();
    (slice, has_more)
}

/// Shallow metadata merge. Mutable reserved fields are routed to their
/// typed slots; `null` removes a user field; identity fields reject.
#[allow(clippy::too_many_arguments)]
fn apply_patch(
    confidence: &mut Option<f64>,
    weight: &mut Option<f64>,
    service: &mut Option<String>,
    created_by: &mut Option<String>,
    data: &mut Option<Value>,
    extra: &mut Map<String, Value>,
    patch: Map<String, Value>,
) -> Result<()> {
    for (key, value) in patch {
        match key.as_str() {
            "id" | "noun" | "verb" | "createdAt" | "updatedAt" => {
                return Err(SomaError::invalid(format!(
                    "metadata field {key:?} is immutable"
                )));
            }
            "confidence" => *confidence = value.as_f64(),
            "weight" => *weight = value.as_f64(),
            "service" => *service = value.as_str().map(str::to_string),
            "createdBy" => *created_by = value.as_str().map(str::to_string),
            "data" => *data = if value.is_null() { None } else { Some(value) },
            _ => {
                if key.starts_with('_') {
                    return Err(SomaError::invalid(format!(
                        "user metadata field {key:?} uses the reserved '_' prefix"
                    )));
                }
                if value.is_null() {
                    extra.remove(&key);
                } else {
                    extra.insert(key, value);
                }
            }
        }
    }
    Ok(())
}
