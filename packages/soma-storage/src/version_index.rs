/// Per-entity version index: one document per `(entity, branch)` pair
/// listing versions keyed by content hash, newest last on disk and
/// served newest-first.
///
/// Version payloads are stored under `__system_version_*` keys, which
/// route to `_system/` and therefore never show up in entity scans.
/// Saving identical content twice is a dedup: the existing entry may
/// pick up a new tag or description, but no new version is appended.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::adapter::StorageAdapter;
use crate::error::{Result, SomaError};
use crate::hashing::{canonical_json, hash_value};
use crate::routing::{system_path, version_content_key, version_index_key};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionEntry {
    pub version: u64,
    pub ts: DateTime<Utc>,
    pub content_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionIndexDocument {
    pub entity_id: Uuid,
    pub branch: String,
    #[serde(default)]
    pub versions: Vec<VersionEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct VersionOptions {
    pub tag: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub commit_hash: Option<String>,
}

pub struct VersionIndex {
    adapter: Arc<dyn StorageAdapter>,
}

impl VersionIndex {
    pub fn new(adapter: Arc<dyn StorageAdapter>) -> Self {
        Self { adapter }
    }

    async fn read_document(
        &self,
        entity_id: &Uuid,
        branch: &str,
    ) -> Result<VersionIndexDocument> {
        let key = system_path(&version_index_key(entity_id, branch));
        match self.adapter.read_object(&key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| SomaError::fatal(format!("corrupt version index {key}: {e}"))),
            None => Ok(VersionIndexDocument {
                entity_id: *entity_id,
                branch: branch.to_string(),
                versions: Vec::new(),
            }),
        }
    }

    async fn write_document(&self, doc: &VersionIndexDocument) -> Result<()> {
        let key = system_path(&version_index_key(&doc.entity_id, &doc.branch));
        let bytes = serde_json::to_vec(doc).expect("version index serializes");
        self.adapter.write_object(&key, bytes).await
    }

    /// Records a version of an entity's content. Returns the entry and
    /// whether it was newly appended (false on content-hash dedup).
    pub async fn save_version(
        &self,
        entity_id: &Uuid,
        branch: &str,
        content: &Value,
        options: VersionOptions,
    ) -> Result<(VersionEntry, bool)> {
        let content_hash = hash_value(content);
        let mut doc = self.read_document(entity_id, branch).await?;

        if let Some(existing) = doc
            .versions
            .iter_mut()
            .find(|entry| entry.content_hash == content_hash)
        {
            let mut touched = false;
            if options.tag.is_some() && options.tag != existing.tag {
                existing.tag = options.tag;
                touched = true;
            }
            if options.description.is_some() && options.description != existing.description {
                existing.description = options.description;
                touched = true;
            }
            let entry = existing.clone();
            if touched {
                self.write_document(&doc).await?;
            }
            return Ok((entry, false));
        }

        let content_key = system_path(&version_content_key(entity_id, &content_hash));
        self.adapter
            .write_object(&content_key, canonical_json(content).into_bytes())
            .await?;

        let entry = VersionEntry {
            version: doc.versions.iter().map(|v| v.version).max().unwrap_or(0) + 1,
            ts: Utc::now(),
            content_hash,
            commit_hash: options.commit_hash,
            tag: options.tag,
            description: options.description,
            author: options.author,
        };
        doc.versions.push(entry.clone());
        self.write_document(&doc).await?;
        Ok((entry, true))
    }

    /// Versions newest-first.
    pub async fn list_versions(&self, entity_id: &Uuid, branch: &str) -> Result<Vec<VersionEntry>> {
        let mut versions = self.read_document(entity_id, branch).await?.versions;
        versions.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(versions)
    }

    pub async fn get_content(&self, entity_id: &Uuid, content_hash: &str) -> Result<Option<Value>> {
        let key = system_path(&version_content_key(entity_id, content_hash));
        match self.adapter.read_object(&key).await? {
            Some(bytes) => {
                let value: Value = serde_json::from_slice(&bytes)
                    .map_err(|e| SomaError::fatal(format!("corrupt version content {key}: {e}")))?;
                let actual = hash_value(&value);
                if actual != content_hash {
                    return Err(SomaError::fatal(format!(
                        "version content hash mismatch at {key}: expected {content_hash}, got {actual}"
                    )));
                }
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn get_version(
        &self,
        entity_id: &Uuid,
        branch: &str,
        version: u64,
    ) -> Result<Option<(VersionEntry, Value)>> {
        let doc = self.read_document(entity_id, branch).await?;
        let Some(entry) = doc.versions.iter().find(|v| v.version == version).cloned() else {
            return Ok(None);
        };
        match self.get_content(entity_id, &entry.content_hash).await? {
            Some(content) => Ok(Some((entry, content))),
            None => Err(SomaError::fatal(format!(
                "version {version} of {entity_id} lists hash {} but its content is gone",
                entry.content_hash
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_adapter::MemoryAdapter;
    use serde_json::json;

    fn index() -> VersionIndex {
        VersionIndex::new(Arc::new(MemoryAdapter::new()))
    }

    #[tokio::test]
    async fn test_dedup_by_content_hash() {
        let index = index();
        let id = Uuid::new_v4();
        let content = json!({"name": "Ada", "role": "mathematician"});

        let (first, appended) = index
            .save_version(&id, "main", &content, VersionOptions::default())
            .await
            .unwrap();
        assert!(appended);
        assert_eq!(first.version, 1);

        // Same content: no new entry, even with fields in another order.
        let same = json!({"role": "mathematician", "name": "Ada"});
        let (again, appended) = index
            .save_version(&id, "main", &same, VersionOptions::default())
            .await
            .unwrap();
        assert!(!appended);
        assert_eq!(again.version, 1);

        let (second, appended) = index
            .save_version(&id, "main", &json!({"name": "Grace"}), VersionOptions::default())
            .await
            .unwrap();
        assert!(appended);
        assert_eq!(second.version, 2);

        let versions = index.list_versions(&id, "main").await.unwrap();
        assert_eq!(versions.len(), 2);
        // Newest first.
        assert_eq!(versions[0].version, 2);
        assert_eq!(versions[1].version, 1);
    }

    #[tokio::test]
    async fn test_dedup_updates_tag_and_description() {
        let index = index();
        let id = Uuid::new_v4();
        let content = json!({"v": 1});
        index
            .save_version(&id, "main", &content, VersionOptions::default())
            .await
            .unwrap();
        let (entry, appended) = index
            .save_version(
                &id,
                "main",
                &content,
                VersionOptions {
                    tag: Some("stable".into()),
                    description: Some("first cut".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!appended);
        assert_eq!(entry.tag.as_deref(), Some("stable"));
        assert_eq!(
            index.list_versions(&id, "main").await.unwrap()[0]
                .description
                .as_deref(),
            Some("first cut")
        );
    }

    #[tokio::test]
    async fn test_content_roundtrip_and_branch_isolation() {
        let index = index();
        let id = Uuid::new_v4();
        let content = json!({"text": "hello"});
        let (entry, _) = index
            .save_version(&id, "main", &content, VersionOptions::default())
            .await
            .unwrap();
        let loaded = index
            .get_content(&id, &entry.content_hash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, content);

        // Another branch starts its own numbering.
        let (on_dev, appended) = index
            .save_version(&id, "dev", &content, VersionOptions::default())
            .await
            .unwrap();
        assert!(appended);
        assert_eq!(on_dev.version, 1);
        assert_eq!(index.list_versions(&id, "main").await.unwrap().len(), 1);
        assert_eq!(index.list_versions(&id, "dev").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_version_payload_invisible_to_entity_namespace() {
        let adapter: Arc<dyn StorageAdapter> = Arc::new(MemoryAdapter::new());
        let index = VersionIndex::new(Arc::clone(&adapter));
        let id = Uuid::new_v4();
        index
            .save_version(&id, "main", &json!({"a": 1}), VersionOptions::default())
            .await
            .unwrap();
        let entities = adapter.list("entities/", 100, None).await.unwrap();
        assert!(entities.keys.is_empty());
        let system = adapter.list("_system/", 100, None).await.unwrap();
        assert_eq!(system.keys.len(), 2); // index document + payload
    }

    #[tokio::test]
    async fn test_get_version_by_number() {
        let index = index();
        let id = Uuid::new_v4();
        index
            .save_version(&id, "main", &json!({"rev": 1}), VersionOptions::default())
            .await
            .unwrap();
        index
            .save_version(&id, "main", &json!({"rev": 2}), VersionOptions::default())
            .await
            .unwrap();
        let (entry, content) = index.get_version(&id, "main", 2).await.unwrap().unwrap();
        assert_eq!(entry.version, 2);
        assert_eq!(content, json!({"rev": 2}));
        assert!(index.get_version(&id, "main", 9).await.unwrap().is_none());
    }
}
