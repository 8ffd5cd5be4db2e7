/// HNSW persistence through base storage.
///
/// No monolithic index blob: every node's level and connections live on
/// its own vector record, so a partial write can corrupt at most one
/// node and the graph is reloadable object by object. The entry point
/// sits in a small `indexes/hnsw_meta` document and the tombstone set in
/// `indexes/deleted`; if either is missing or stale the index repairs
/// itself from the surviving nodes.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::base_storage::{BaseStorage, DEFAULT_PAGE_LIMIT};
use crate::error::{Result, SomaError};
use crate::hnsw::{HnswIndex, NodeState};
use crate::routing::{self, EntityKind, RecordKind, DELETED_INDEX_KEY, HNSW_META_KEY};
use crate::types::Connections;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HnswMetaDocument {
    entry_id: Option<Uuid>,
    entry_level: Option<usize>,
    node_count: u64,
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeletedIndexDocument {
    #[serde(default)]
    deleted: Vec<Uuid>,
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
}

pub struct HnswPersistence {
    storage: Arc<BaseStorage>,
}

impl HnswPersistence {
    pub fn new(storage: Arc<BaseStorage>) -> Self {
        Self { storage }
    }

    /// Writes back the connection state of every dirty node. The vector
    /// record is read-modified-written: the vector itself is immutable,
    /// only `connections` and `level` change after an insert.
    pub async fn persist_nodes(&self, states: &[NodeState]) -> Result<()> {
        for state in states {
            let Some(mut record) = self.storage.get_noun_vector(&state.id).await? else {
                return Err(SomaError::fatal(format!(
                    "hnsw node {} has no persisted vector record",
                    state.id
                )));
            };
            record.level = state.level;
            record.connections = state.connections.clone();
            self.storage.save_noun(&record).await?;
        }
        Ok(())
    }

    pub async fn persist_entry_point(&self, index: &HnswIndex) -> Result<()> {
        let entry = index.entry_point();
        let doc = HnswMetaDocument {
            entry_id: entry.map(|(id, _)| id),
            entry_level: entry.map(|(_, level)| level),
            node_count: index.len() as u64,
            last_updated: Some(Utc::now()),
        };
        let bytes = serde_json::to_vec(&doc).expect("meta serializes");
        self.storage.adapter().write_object(HNSW_META_KEY, bytes).await
    }

    pub async fn persist_deleted(&self, index: &HnswIndex) -> Result<()> {
        let mut deleted = index.deleted_ids();
        deleted.sort_unstable();
        let doc = DeletedIndexDocument {
            deleted,
            last_updated: Some(Utc::now()),
        };
        let bytes = serde_json::to_vec(&doc).expect("deleted index serializes");
        self.storage
            .adapter()
            .write_object(DELETED_INDEX_KEY, bytes)
            .await
    }

    /// Loads the whole graph from per-node records: first materialize
    /// every node, then rewire connections in one pass so forward
    /// references resolve. A missing meta document just means the entry
    /// point is re-picked from the highest surviving node.
    pub async fn load_into(&self, index: &HnswIndex) -> Result<usize> {
        let deleted: HashSet<Uuid> = match self
            .storage
            .adapter()
            .read_object(DELETED_INDEX_KEY)
            .await?
        {
            Some(bytes) => serde_json::from_slice::<DeletedIndexDocument>(&bytes)
                .map_err(|e| SomaError::fatal(format!("corrupt deleted index: {e}")))?
                .deleted
                .into_iter()
                .collect(),
            None => HashSet::new(),
        };

        let mut connections: HashMap<Uuid, Connections> = HashMap::new();
        let prefix = routing::entity_prefix(EntityKind::Noun, RecordKind::Hnsw);
        let mut cursor: Option<String> = None;
        let mut loaded = 0usize;
        loop {
            let page = self
                .storage
                .adapter()
                .list(&prefix, DEFAULT_PAGE_LIMIT, cursor.as_deref())
                .await?;
            for key in &page.keys {
                let Some(id) = routing::id_from_entity_path(key) else {
                    continue;
                };
                let Some(record) = self.storage.get_noun_vector(&id).await? else {
                    continue;
                };
                index.load_node(
                    record.id,
                    record.vector,
                    record.level,
                    deleted.contains(&record.id),
                );
                connections.insert(record.id, record.connections);
                loaded += 1;
            }
            if !page.has_more || page.keys.is_empty() {
                break;
            }
            cursor = page.next_cursor;
        }

        let entry_hint = match self.storage.adapter().read_object(HNSW_META_KEY).await? {
            Some(bytes) => serde_json::from_slice::<HnswMetaDocument>(&bytes)
                .map_err(|e| SomaError::fatal(format!("corrupt hnsw meta: {e}")))?
                .entry_id,
            None => None,
        };
        index.rewire(&connections, entry_hint);
        Ok(loaded)
    }

    /// Post-compaction persistence: every survivor is rewritten, the
    /// tombstone set is cleared, and the entry point refreshed.
    pub async fn persist_after_compaction(
        &self,
        index: &HnswIndex,
        states: &[NodeState],
    ) -> Result<()> {
        self.persist_nodes(states).await?;
        self.persist_deleted(index).await?;
        self.persist_entry_point(index).await
    }
}
