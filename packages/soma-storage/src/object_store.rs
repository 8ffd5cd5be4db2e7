/// Content-addressed object store: blobs, trees, and commits for
/// copy-on-write snapshots and version history.
///
/// Blobs are addressed by the SHA-256 of their uncompressed content and
/// stored under `objects/<hh>/<rest>.blob`. The payload carries a
/// one-byte frame tag (0 = raw, 1 = deflate); compression is applied
/// only when it actually shrinks the bytes, and `get_blob` always hands
/// back the original content bit for bit.
use std::io::{Read, Write};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::adapter::StorageAdapter;
use crate::error::{Result, SomaError};
use crate::hashing::{canonical_json, sha256_hex};
use crate::routing::object_path;

const FRAME_RAW: u8 = 0;
const FRAME_DEFLATE: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Blob,
    Tree,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeEntry {
    pub name: String,
    pub hash: String,
    #[serde(rename = "type")]
    pub kind: ObjectKind,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeObject {
    pub entries: Vec<TreeEntry>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitObject {
    pub tree: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub author: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

pub struct ObjectStore {
    adapter: Arc<dyn StorageAdapter>,
}

impl ObjectStore {
    pub fn new(adapter: Arc<dyn StorageAdapter>) -> Self {
        Self { adapter }
    }

    /// Stores a blob, returning its content hash. Idempotent: an
    /// already-present hash is not rewritten.
    pub async fn put_blob(&self, content: &[u8]) -> Result<String> {
        let hash = sha256_hex(content);
        let path = object_path(&hash);
        if self.adapter.read_object(&path).await?.is_some() {
            return Ok(hash);
        }

        let mut framed = Vec::with_capacity(content.len() + 1);
        let compressed = deflate(content)?;
        if compressed.len() < content.len() {
            framed.push(FRAME_DEFLATE);
            framed.extend_from_slice(&compressed);
        } else {
            framed.push(FRAME_RAW);
            framed.extend_from_slice(content);
        }
        self.adapter.write_object(&path, framed).await?;
        Ok(hash)
    }

    /// Reads a blob back, verifying its content hash. A mismatch is
    /// corruption and aborts as `Fatal`.
    pub async fn get_blob(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        let path = object_path(hash);
        let Some(framed) = self.adapter.read_object(&path).await? else {
            return Ok(None);
        };
        let Some((&tag, payload)) = framed.split_first() else {
            return Err(SomaError::fatal(format!("empty blob frame at {path}")));
        };
        let content = match tag {
            FRAME_RAW => payload.to_vec(),
            FRAME_DEFLATE => inflate(payload)?,
            other => {
                return Err(SomaError::fatal(format!(
                    "unknown blob frame tag {other} at {path}"
                )))
            }
        };
        let actual = sha256_hex(&content);
        if actual != hash {
            return Err(SomaError::fatal(format!(
                "blob hash mismatch at {path}: expected {hash}, got {actual}"
            )));
        }
        Ok(Some(content))
    }

    pub async fn has_blob(&self, hash: &str) -> Result<bool> {
        Ok(self.adapter.read_object(&object_path(hash)).await?.is_some())
    }

    /// Stores a tree. Entries are sorted by name before hashing so the
    /// same directory content always produces the same hash.
    pub async fn put_tree(&self, mut entries: Vec<TreeEntry>) -> Result<String> {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        let tree = TreeObject {
            entries,
            created_at: Utc::now(),
        };
        self.put_tree_object(&tree).await
    }

    pub async fn put_tree_object(&self, tree: &TreeObject) -> Result<String> {
        let value = serde_json::to_value(tree)
            .map_err(|e| SomaError::fatal(format!("tree serialize: {e}")))?;
        self.put_blob(canonical_json(&value).as_bytes()).await
    }

    pub async fn get_tree(&self, hash: &str) -> Result<Option<TreeObject>> {
        let Some(bytes) = self.get_blob(hash).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| SomaError::fatal(format!("corrupt tree {hash}: {e}")))
    }

    pub async fn put_commit(&self, commit: &CommitObject) -> Result<String> {
        let value = serde_json::to_value(commit)
            .map_err(|e| SomaError::fatal(format!("commit serialize: {e}")))?;
        self.put_blob(canonical_json(&value).as_bytes()).await
    }

    pub async fn get_commit(&self, hash: &str) -> Result<Option<CommitObject>> {
        let Some(bytes) = self.get_blob(hash).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| SomaError::fatal(format!("corrupt commit {hash}: {e}")))
    }
}

fn deflate(content: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(content)
        .map_err(|e| SomaError::fatal(format!("deflate: {e}")))?;
    encoder
        .finish()
        .map_err(|e| SomaError::fatal(format!("deflate: {e}")))
}

fn inflate(payload: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(payload);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| SomaError::fatal(format!("inflate: {e}")))?;
    Ok(out)
}
