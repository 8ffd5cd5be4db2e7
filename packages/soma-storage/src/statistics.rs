/// Process-wide statistics: counts-by-type for nouns and verbs plus the
/// HNSW index size, persisted as a singleton `_system/statistics.json`
/// document. Persistence is scheduled fire-and-forget, so reads of the
/// stored document may lag the in-memory truth by a beat.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::adapter::StorageAdapter;
use crate::error::{Result, SomaError};
use crate::routing::{system_path, STATISTICS_KEY};
use crate::types::{NounType, StatisticsDocument, VerbType};

/// Default TTL for advisory locks on singleton system documents.
pub const ADVISORY_LOCK_TTL: Duration = Duration::from_secs(10);

const PERSIST_DEBOUNCE: Duration = Duration::from_millis(200);

#[derive(serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockDocument {
    owner: Uuid,
    expires_at: chrono::DateTime<Utc>,
}

/// Best-effort TTL lock over a system document. Expiry is wall-clock
/// bounded; a holder that loses the lock must fall back to
/// read-merge-write.
pub struct AdvisoryLock {
    adapter: Arc<dyn StorageAdapter>,
    key: String,
    owner: Uuid,
}

impl AdvisoryLock {
    pub async fn try_acquire(
        adapter: Arc<dyn StorageAdapter>,
        name: &str,
        ttl: Duration,
    ) -> Result<Option<AdvisoryLock>> {
        let key = system_path(&format!("__system_lock_{name}"));
        if let Some(bytes) = adapter.read_object(&key).await? {
            if let Ok(doc) = serde_json::from_slice::<LockDocument>(&bytes) {
                if doc.expires_at > Utc::now() {
                    return Ok(None);
                }
            }
        }
        let owner = Uuid::new_v4();
        let doc = LockDocument {
            owner,
            expires_at: Utc::now()
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero()),
        };
        adapter
            .write_object(&key, serde_json::to_vec(&doc).expect("lock serializes"))
            .await?;
        // Re-read to confirm we won the race. Best effort only.
        match adapter.read_object(&key).await? {
            Some(bytes) => {
                let stored: LockDocument = serde_json::from_slice(&bytes)
                    .map_err(|e| SomaError::fatal(format!("corrupt lock document {key}: {e}")))?;
                if stored.owner == owner {
                    Ok(Some(AdvisoryLock {
                        adapter,
                        key,
                        owner,
                    }))
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    pub async fn release(self) -> Result<()> {
        if let Some(bytes) = self.adapter.read_object(&self.key).await? {
            if let Ok(doc) = serde_json::from_slice::<LockDocument>(&bytes) {
                if doc.owner == self.owner {
                    self.adapter.delete_object(&self.key).await?;
                }
            }
        }
        Ok(())
    }
}

pub struct StatisticsStore {
    adapter: Arc<dyn StorageAdapter>,
    doc: Mutex<StatisticsDocument>,
    persist_scheduled: AtomicBool,
    /// Self-handle for the background persist task.
    weak: Weak<StatisticsStore>,
}

impl StatisticsStore {
    /// Loads the persisted document, or starts empty when absent.
    pub async fn load(adapter: Arc<dyn StorageAdapter>) -> Result<Arc<Self>> {
        let key = system_path(STATISTICS_KEY);
        let doc = match adapter.read_object(&key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| SomaError::fatal(format!("corrupt statistics document: {e}")))?,
            None => StatisticsDocument::default(),
        };
        Ok(Arc::new_cyclic(|weak| Self {
            adapter,
            doc: Mutex::new(doc),
            persist_scheduled: AtomicBool::new(false),
            weak: weak.clone(),
        }))
    }

    pub fn snapshot(&self) -> StatisticsDocument {
        self.doc.lock().clone()
    }

    pub fn increment_noun(&self, noun: NounType) {
        {
            let mut doc = self.doc.lock();
            *doc.noun_count.entry(noun.as_str().to_string()).or_insert(0) += 1;
            *doc.metadata_count.entry("nouns".to_string()).or_insert(0) += 1;
            doc.last_updated = Some(Utc::now());
        }
        self.schedule_persist();
    }

    pub fn decrement_noun(&self, noun: NounType) {
        {
            let mut doc = self.doc.lock();
            if let Some(count) = doc.noun_count.get_mut(noun.as_str()) {
                *count = count.saturating_sub(1);
            }
            if let Some(count) = doc.metadata_count.get_mut("nouns") {
                *count = count.saturating_sub(1);
            }
            doc.last_updated = Some(Utc::now());
        }
        self.schedule_persist();
    }

    pub fn increment_verb(&self, verb: VerbType) {
        {
            let mut doc = self.doc.lock();
            *doc.verb_count.entry(verb.as_str().to_string()).or_insert(0) += 1;
            *doc.metadata_count.entry("verbs".to_string()).or_insert(0) += 1;
            doc.last_updated = Some(Utc::now());
        }
        self.schedule_persist();
    }

    pub fn decrement_verb(&self, verb: VerbType) {
        {
            let mut doc = self.doc.lock();
            if let Some(count) = doc.verb_count.get_mut(verb.as_str()) {
                *count = count.saturating_sub(1);
            }
            if let Some(count) = doc.metadata_count.get_mut("verbs") {
                *count = count.saturating_sub(1);
            }
            doc.last_updated = Some(Utc::now());
        }
        self.schedule_persist();
    }

    /// Zeroes every counter. Used when the namespace is cleared.
    pub fn reset(&self) {
        *self.doc.lock() = StatisticsDocument::default();
        self.schedule_persist();
    }

    pub fn set_hnsw_index_size(&self, size: u64) {
        {
            let mut doc = self.doc.lock();
            doc.hnsw_index_size = size;
            doc.last_updated = Some(Utc::now());
        }
        self.schedule_persist();
    }

    /// Schedules a debounced persist. Fire-and-forget: failures are
    /// logged, never propagated into the write path.
    fn schedule_persist(&self) {
        if self
            .persist_scheduled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let weak = self.weak.clone();
        tokio::spawn(async move {
            tokio::time::sleep(PERSIST_DEBOUNCE).await;
            let Some(store) = weak.upgrade() else { return };
            store.persist_scheduled.store(false, Ordering::SeqCst);
            if let Err(err) = store.persist().await {
                tracing::warn!(error = %err, "statistics persist failed");
            }
        });
    }

    /// Serializes updates under the advisory lock when available; a
    /// process that loses the lock still writes its own view, since each
    /// process is authoritative for the counters it maintains.
    pub async fn persist(&self) -> Result<()> {
        let key = system_path(STATISTICS_KEY);
        let lock = AdvisoryLock::try_acquire(
            Arc::clone(&self.adapter),
            STATISTICS_KEY,
            ADVISORY_LOCK_TTL,
        )
        .await
        .unwrap_or(None);
        if lock.is_none() {
            tracing::debug!("statistics lock unavailable, writing without it");
        }

        let bytes = serde_json::to_vec(&self.snapshot()).expect("statistics serialize");
        let result = self.adapter.write_object(&key, bytes).await;
        if let Some(lock) = lock {
            let _ = lock.release().await;
        }
        result
    }
}
