/// In-process adapter: a concurrent map from path to bytes. The fastest
/// backend and the reference implementation for adapter semantics.
use async_trait::async_trait;
use dashmap::DashMap;

use crate::adapter::{ListPage, StorageAdapter, StorageClass};
use crate::error::{Result, SomaError};

#[derive(Default)]
pub struct MemoryAdapter {
    objects: DashMap<String, Vec<u8>>,
    read_only: bool,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_only_view(objects: DashMap<String, Vec<u8>>) -> Self {
        Self {
            objects,
            read_only: true,
        }
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    fn ensure_writable(&self, path: &str) -> Result<()> {
        if self.read_only {
            return Err(SomaError::PermissionDenied {
                key: path.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn storage_class(&self) -> StorageClass {
        StorageClass::Memory
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn supports_append(&self) -> bool {
        true
    }

    async fn write_object(&self, path: &str, bytes: Vec<u8>) -> Result<()> {
        self.ensure_writable(path)?;
        self.objects.insert(path.to_string(), bytes);
        Ok(())
    }

    async fn read_object(&self, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.get(path).map(|entry| entry.value().clone()))
    }

    async fn delete_object(&self, path: &str) -> Result<()> {
        self.ensure_writable(path)?;
        self.objects.remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str, limit: usize, cursor: Option<&str>) -> Result<ListPage> {
        // Marker cursor: the last key of the previous page. Keys are
        // sorted so the cursor stays stable for a given prefix.
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|k| k.starts_with(prefix))
            .collect();
        keys.sort_unstable();
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

    async fn append(&self, path: &str, bytes: &[u8]) -> Result<()> {
        self.ensure_writable(path)?;
        self.objects
            .entry(path.to_string())
            .or_default()
            .extend_from_slice(bytes);
        Ok(())
    }
}
