/// Storage adapter protocol: primitive object-level operations over a
/// keyed namespace. Every environment (memory, filesystem, S3 family)
/// implements this one trait; the engine above it never touches bytes
/// any other way.
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Broad latency/durability class of an adapter. Drives WAL sizing and
/// checkpoint cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    Memory,
    Local,
    Cloud,
}

/// One page of a listing. The cursor is opaque and stable for a given
/// prefix; adapters may implement it as an offset, marker, or token.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub keys: Vec<String>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

#[async_trait]
pub trait StorageAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn storage_class(&self) -> StorageClass;

    /// Read-only adapters refuse mutations at the base-storage boundary.
    fn read_only(&self) -> bool {
        false
    }

    /// Whether `append` is native. When false, the default
    /// read-modify-write emulation below is used; concurrent appenders
    /// must then be excluded externally (single WAL writer per process).
    fn supports_append(&self) -> bool {
        false
    }

    /// Durable replace.
    async fn write_object(&self, path: &str, bytes: Vec<u8>) -> Result<()>;

    async fn read_object(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Idempotent: deleting an absent key succeeds.
    async fn delete_object(&self, path: &str) -> Result<()>;

    async fn list(&self, prefix: &str, limit: usize, cursor: Option<&str>) -> Result<ListPage>;

    async fn append(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let mut buf = self.read_object(path).await?.unwrap_or_default();
        buf.extend_from_slice(bytes);
        self.write_object(path, buf).await
    }
}

/// Retry policy for transient I/O: exponential backoff, max 3 attempts.
/// Every other error class surfaces immediately.
pub const MAX_RETRY_ATTEMPTS: u32 = 3;

pub async fn with_retry<T, F, Fut>(op: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = Duration::from_millis(50);
    let mut attempt = 1;
    loop {
        match f().await {
            Err(err) if err.is_retryable() && attempt < MAX_RETRY_ATTEMPTS => {
                tracing::debug!(op, attempt, error = %err, "transient I/O, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SomaError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_gives_up_after_three_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry("op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SomaError::transient("k", "flaky")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_recovers() {
        let calls = AtomicU32::new(0);
        let result = with_retry("op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(SomaError::transient("k", "flaky"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_non_transient_never_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry("op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SomaError::invalid("bad")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
