/// Local filesystem adapter. Object keys map directly to relative paths
/// under a root directory; replaces go through a temp file + rename so a
/// crash never leaves a half-written object behind.
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::adapter::{ListPage, StorageAdapter, StorageClass};
use crate::error::{Result, SomaError};

pub struct FilesystemAdapter {
    root: PathBuf,
    read_only: bool,
}

impl FilesystemAdapter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            read_only: false,
        }
    }

    pub fn read_only(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            read_only: true,
        }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.starts_with('/') || key.split('/').any(|c| c == "..") {
            return Err(SomaError::invalid(format!("invalid object key: {key:?}")));
        }
        Ok(self.root.join(key))
    }

    fn ensure_writable(&self, key: &str) -> Result<()> {
        if self.read_only {
            return Err(SomaError::PermissionDenied {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    fn classify(key: &str, err: io::Error) -> SomaError {
        match err.kind() {
            io::ErrorKind::PermissionDenied => SomaError::PermissionDenied {
                key: key.to_string(),
            },
            io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded => SomaError::QuotaExceeded {
                key: key.to_string(),
            },
            _ => SomaError::transient(key, err.to_string()),
        }
    }

    /// Collects relative keys under `prefix`, sorted. Listing walks the
    /// deepest directory the prefix pins down, so shard-scoped listings
    /// never touch sibling shards.
    async fn collect_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let (start_dir, _) = match prefix.rfind('/') {
            Some(idx) => (self.root.join(&prefix[..idx]), &prefix[idx + 1..]),
            None => (self.root.clone(), prefix),
        };
        if !start_dir.exists() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        let mut stack = vec![start_dir];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(Self::classify(prefix, err)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Self::classify(prefix, e))?
            {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Some(key) = relative_key(&self.root, &path) {
                    if key.starts_with(prefix) && !key.ends_with(".tmp") {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort_unstable();
        Ok(keys)
    }
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        parts.push(component.as_os_str().to_str()?);
    }
    Some(parts.join("/"))
}

#[async_trait]
impl StorageAdapter for FilesystemAdapter {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    fn storage_class(&self) -> StorageClass {
        StorageClass::Local
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn supports_append(&self) -> bool {
        true
    }

    async fn write_object(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.ensure_writable(key)?;
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::classify(key, e))?;
        }
        // Write-then-rename keeps replaces atomic on the same filesystem.
        let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| Self::classify(key, e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| Self::classify(key, e))?;
        file.sync_all().await.map_err(|e| Self::classify(key, e))?;
        drop(file);
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Self::classify(key, e))?;
        Ok(())
    }

    async fn read_object(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Self::classify(key, err)),
        }
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.ensure_writable(key)?;
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Self::classify(key, err)),
        }
    }

    async fn list(&self, prefix: &str, limit: usize, cursor: Option<&str>) -> Result<ListPage> {
        let keys = self.collect_keys(prefix).await?;
        let start = match cursor {
            Some(marker) => keys.partition_point(|k| k.as_str() <= marker),
            None => 0,
        };
        let has_more = keys.len() > start + limit;
        let page: Vec<String> = keys.into_iter().skip(start).take(limit).collect();
        let next_cursor = if has_more { page.last().cloned() } else { None };
        Ok(ListPage {
            keys: page,
            has_more,
            next_cursor,
        })
    }

    async fn append(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.ensure_writable(key)?;
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::classify(key, e))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Self::classify(key, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| Self::classify(key, e))?;
        file.sync_data().await.map_err(|e| Self::classify(key, e))?;
        Ok(())
    }
}
