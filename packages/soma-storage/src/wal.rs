/// Write-ahead log: newline-delimited JSON entries appended to
/// `_wal/wal_<start-ts>.log` objects through a single-writer actor, so
/// entries for one process are totally ordered even when the adapter
/// only emulates append.
///
/// Protocol: log `pending`, run the operation, log `completed` or
/// `failed` under the same id. Recovery folds every file to the latest
/// status per id and replays the ones still pending through registered
/// handlers; handlers must be idempotent (object writes are replaces, so
/// the storage operations here already are).
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::adapter::{with_retry, StorageAdapter, StorageClass};
use crate::error::{Result, SomaError};
use crate::routing::WAL_PREFIX;

pub const CHECKPOINT_OPERATION: &str = "CHECKPOINT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalEntry {
    pub id: Uuid,
    pub operation: String,
    pub params: Value,
    pub timestamp: DateTime<Utc>,
    pub status: WalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<Uuid>,
}

/// Replay handler for one operation type. Receives the logged params.
pub type ReplayHandler =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct WalConfig {
    pub enabled: bool,
    /// Rotation threshold in bytes. Storage-class-aware default.
    pub max_size: usize,
    /// Checkpoint cadence; `None` disables the timer (memory class).
    pub checkpoint_interval: Option<Duration>,
}

impl WalConfig {
    pub fn for_class(class: StorageClass) -> Self {
        match class {
            StorageClass::Cloud => Self {
                enabled: true,
                max_size: 50 * 1024 * 1024,
                checkpoint_interval: Some(Duration::from_secs(300)),
            },
            StorageClass::Local => Self {
                enabled: true,
                max_size: 10 * 1024 * 1024,
                checkpoint_interval: Some(Duration::from_secs(60)),
            },
            StorageClass::Memory => Self {
                enabled: true,
                max_size: 1024 * 1024,
                checkpoint_interval: None,
            },
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct RecoveryReport {
    pub scanned: usize,
    pub replayed: usize,
    pub failed: usize,
}

enum Command {
    Append {
        line: Vec<u8>,
        ack: oneshot::Sender<Result<()>>,
    },
}

struct Writer {
    adapter: Arc<dyn StorageAdapter>,
    key: String,
    size: usize,
    max_size: usize,
    seq: u64,
}

impl Writer {
    fn fresh_key(seq: u64) -> String {
        format!("{}wal_{:013}_{:04}.log", WAL_PREFIX, Utc::now().timestamp_millis(), seq)
    }

    async fn append(&mut self, line: &[u8]) -> Result<()> {
        if self.size > 0 && self.size + line.len() > self.max_size {
            self.seq += 1;
            self.key = Self::fresh_key(self.seq);
            self.size = 0;
            tracing::debug!(key = %self.key, "rotated WAL object");
        }
        let key = self.key.clone();
        with_retry(&key, || async { self.adapter.append(&key, line).await }).await?;
        self.size += line.len();
        Ok(())
    }
}

pub struct Wal {
    adapter: Arc<dyn StorageAdapter>,
    tx: Mutex<Option<mpsc::Sender<Command>>>,
    handlers: RwLock<HashMap<String, ReplayHandler>>,
    config: WalConfig,
    operation_count: AtomicU64,
    writer_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    checkpoint_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Wal {
    pub fn start(adapter: Arc<dyn StorageAdapter>, config: WalConfig) -> Arc<Self> {
        let wal = Arc::new(Self {
            adapter: Arc::clone(&adapter),
            tx: Mutex::new(None),
            handlers: RwLock::new(HashMap::new()),
            config: config.clone(),
            operation_count: AtomicU64::new(0),
            writer_task: Mutex::new(None),
            checkpoint_task: Mutex::new(None),
        });
        if !config.enabled {
            tracing::warn!("write-ahead log disabled; crash recovery will be unavailable");
            return wal;
        }

        let (tx, mut rx) = mpsc::channel::<Command>(256);
        let mut writer = Writer {
            adapter,
            key: Writer::fresh_key(0),
            size: 0,
            max_size: config.max_size,
            seq: 0,
        };
        let task = tokio::spawn(async move {
            while let Some(Command::Append { line, ack }) = rx.recv().await {
                let result = writer.append(&line).await;
                let _ = ack.send(result);
            }
        });
        *wal.tx.lock() = Some(tx);
        *wal.writer_task.lock() = Some(task);

        if let Some(interval) = config.checkpoint_interval {
            let weak = Arc::downgrade(&wal);
            let task = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let Some(wal) = weak.upgrade() else { break };
                    if let Err(err) = wal.checkpoint().await {
                        tracing::warn!(error = %err, "WAL checkpoint failed");
                    }
                }
            });
            *wal.checkpoint_task.lock() = Some(task);
        }
        wal
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn register_handler(&self, operation: &str, handler: ReplayHandler) {
        self.handlers.write().insert(operation.to_string(), handler);
    }

    async fn append_entry(&self, entry: &WalEntry) -> Result<()> {
        let tx = match self.tx.lock().as_ref() {
            Some(tx) => tx.clone(),
            None => return Ok(()),
        };
        let mut line = serde_json::to_vec(entry)
            .map_err(|e| SomaError::fatal(format!("WAL entry serialize: {e}")))?;
        line.push(b'\n');
        let (ack, rx) = oneshot::channel();
        tx.send(Command::Append { line, ack })
            .await
            .map_err(|_| SomaError::fatal("WAL writer is gone"))?;
        rx.await.map_err(|_| SomaError::fatal("WAL writer dropped an append"))?
    }

    /// Wraps a mutating operation: `pending` before, `completed` or
    /// `failed` (with the message) after, same id throughout.
    pub async fn execute<T, Fut>(
        &self,
        operation: &str,
        params: Value,
        thunk: Fut,
    ) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        if !self.config.enabled {
            return thunk.await;
        }
        let id = Uuid::new_v4();
        self.append_entry(&WalEntry {
            id,
            operation: operation.to_string(),
            params: params.clone(),
            timestamp: Utc::now(),
            status: WalStatus::Pending,
            error: None,
            checkpoint_id: None,
        })
        .await?;
        self.operation_count.fetch_add(1, Ordering::Relaxed);

        match thunk.await {
            Ok(value) => {
                self.append_entry(&WalEntry {
                    id,
                    operation: operation.to_string(),
                    params,
                    timestamp: Utc::now(),
                    status: WalStatus::Completed,
                    error: None,
                    checkpoint_id: None,
                })
                .await?;
                Ok(value)
            }
            Err(err) => {
                // The failure outcome is always recorded; a logging
                // failure must not mask the original error.
                if let Err(log_err) = self
                    .append_entry(&WalEntry {
                        id,
                        operation: operation.to_string(),
                        params,
                        timestamp: Utc::now(),
                        status: WalStatus::Failed,
                        error: Some(err.to_string()),
                        checkpoint_id: None,
                    })
                    .await
                {
                    tracing::error!(error = %log_err, "failed to record WAL failure entry");
                }
                Err(err)
            }
        }
    }

    /// Appends a CHECKPOINT entry carrying the running operation count.
    /// Entries completed before it become garbage-collectable.
    pub async fn checkpoint(&self) -> Result<Uuid> {
        let checkpoint_id = Uuid::new_v4();
        self.append_entry(&WalEntry {
            id: checkpoint_id,
            operation: CHECKPOINT_OPERATION.to_string(),
            params: serde_json::json!({
                "operationCount": self.operation_count.load(Ordering::Relaxed),
            }),
            timestamp: Utc::now(),
            status: WalStatus::Completed,
            error: None,
            checkpoint_id: Some(checkpoint_id),
        })
        .await?;
        Ok(checkpoint_id)
    }

    async fn wal_keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self.adapter.list(WAL_PREFIX, 100, cursor.as_deref()).await?;
            keys.extend(page.keys.iter().cloned());
            if !page.has_more || page.keys.is_empty() {
                break;
            }
            cursor = page.next_cursor;
        }
        keys.sort_unstable();
        Ok(keys)
    }

    /// Reads every WAL object in order and folds to the latest status
    /// per id. Malformed lines are skipped with a warning; a torn tail
    /// line from a crash must not block recovery.
    async fn fold_entries(&self) -> Result<HashMap<Uuid, WalEntry>> {
        let mut latest: HashMap<Uuid, WalEntry> = HashMap::new();
        for key in self.wal_keys().await? {
            let Some(bytes) = self.adapter.read_object(&key).await? else {
                continue;
            };
            for line in bytes.split(|&b| b == b'\n') {
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_slice::<WalEntry>(line) {
                    Ok(entry) => {
                        latest.insert(entry.id, entry);
                    }
                    Err(err) => {
                        tracing::warn!(key, error = %err, "skipping malformed WAL line");
                    }
                }
            }
        }
        Ok(latest)
    }

    /// Replays every operation still pending. Outcomes are logged back
    /// to the WAL under the original entry id.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        if !self.config.enabled {
            return Ok(RecoveryReport::default());
        }
        let latest = self.fold_entries().await?;
        let mut report = RecoveryReport {
            scanned: latest.len(),
            ..Default::default()
        };
        let mut pending: Vec<WalEntry> = latest
            .into_values()
            .filter(|entry| entry.status == WalStatus::Pending)
            .collect();
        pending.sort_by_key(|entry| entry.timestamp);

        for entry in pending {
            let handler = self.handlers.read().get(&entry.operation).cloned();
            let outcome = match handler {
                Some(handler) => handler(entry.params.clone()).await,
                None => Err(SomaError::fatal(format!(
                    "no replay handler registered for {}",
                    entry.operation
                ))),
            };
            let (status, error) = match &outcome {
                Ok(()) => (WalStatus::Completed, None),
                Err(err) => (WalStatus::Failed, Some(err.to_string())),
            };
            match status {
                WalStatus::Completed => report.replayed += 1,
                _ => report.failed += 1,
            }
            tracing::info!(
                id = %entry.id,
                operation = %entry.operation,
                ok = outcome.is_ok(),
                "replayed pending WAL operation"
            );
            self.append_entry(&WalEntry {
                id: entry.id,
                operation: entry.operation,
                params: entry.params,
                timestamp: Utc::now(),
                status,
                error,
                checkpoint_id: None,
            })
            .await?;
        }
        Ok(report)
    }

    /// Deletes retired WAL objects: any non-current file whose entries
    /// have all reached a terminal status.
    pub async fn garbage_collect(&self) -> Result<usize> {
        let latest = self.fold_entries().await?;
        let keys = self.wal_keys().await?;
        let current = keys.last().cloned();
        let mut removed = 0;
        for key in keys {
            if Some(&key) == current.as_ref() {
                continue;
            }
            let Some(bytes) = self.adapter.read_object(&key).await? else {
                continue;
            };
            let mut retired = true;
            for line in bytes.split(|&b| b == b'\n') {
                if line.is_empty() {
                    continue;
                }
                if let Ok(entry) = serde_json::from_slice::<WalEntry>(line) {
                    if latest
                        .get(&entry.id)
                        .map(|e| e.status == WalStatus::Pending)
                        .unwrap_or(false)
                    {
                        retired = false;
                        break;
                    }
                }
            }
            if retired {
                self.adapter.delete_object(&key).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn shutdown(&self) {
        if let Some(task) = self.checkpoint_task.lock().take() {
            task.abort();
        }
        *self.tx.lock() = None;
        if let Some(task) = self.writer_task.lock().take() {
            // Writer drains its channel and exits once the sender drops.
            drop(task);
        }
    }
}
