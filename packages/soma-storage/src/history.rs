/// Refs and commit history over the object store.
///
/// Branches live under `refs/heads/<name>`, tags under
/// `refs/tags/<name>`, and `HEAD` is a symbolic ref document. The DAG
/// walk is strictly child-to-parent (single parent; merge semantics are
/// deliberately undefined).
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Map;

use crate::adapter::StorageAdapter;
use crate::error::{Result, SomaError};
use crate::object_store::{CommitObject, ObjectStore};
use crate::routing::REFS_PREFIX;

const HEAD_KEY: &str = "refs/HEAD";
const DEFAULT_BRANCH: &str = "main";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefKind {
    Branch,
    Tag,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefDocument {
    pub name: String,
    pub commit_hash: String,
    #[serde(rename = "type")]
    pub kind: RefKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeadDocument {
    symbolic: String,
}

/// Ref update discipline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefUpdate {
    /// Fails with `Conflict` if the ref already exists.
    CreateOnly,
    /// Fails with `NotFound` if the ref does not exist.
    UpdateOnly,
    /// Compare-and-swap against the expected current commit hash.
    Cas { expected: String },
    Force,
}

#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    pub max_depth: Option<usize>,
    /// Stop before commits older than this timestamp.
    pub until: Option<DateTime<Utc>>,
    /// Stop when reaching this hash (exclusive).
    pub stop_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CommitEntry {
    pub hash: String,
    pub commit: CommitObject,
}

pub struct HistoryStore {
    adapter: Arc<dyn StorageAdapter>,
    objects: Arc<ObjectStore>,
    /// Lazily-built per-head commit index for `find_at_time`:
    /// (timestamp, hash) oldest-first, keyed by the head commit hash.
    commit_index: Mutex<HashMap<String, Arc<Vec<(DateTime<Utc>, String)>>>>,
}

impl HistoryStore {
    pub fn new(adapter: Arc<dyn StorageAdapter>, objects: Arc<ObjectStore>) -> Self {
        Self {
            adapter,
            objects,
            commit_index: Mutex::new(HashMap::new()),
        }
    }

    fn ref_key(kind: RefKind, name: &str) -> String {
        match kind {
            RefKind::Branch => format!("{REFS_PREFIX}heads/{name}"),
            RefKind::Tag => format!("{REFS_PREFIX}tags/{name}"),
        }
    }

    // ========================
    // REFS
    // ========================

    pub async fn read_ref(&self, kind: RefKind, name: &str) -> Result<Option<RefDocument>> {
        let key = Self::ref_key(kind, name);
        match self.adapter.read_object(&key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| SomaError::fatal(format!("corrupt ref {key}: {e}"))),
            None => Ok(None),
        }
    }

    pub async fn update_ref(
        &self,
        kind: RefKind,
        name: &str,
        commit_hash: &str,
        mode: RefUpdate,
    ) -> Result<RefDocument> {
        if name.is_empty() || name.contains('/') {
            return Err(SomaError::invalid(format!("invalid ref name {name:?}")));
        }
        if self.objects.get_commit(commit_hash).await?.is_none() {
            return Err(SomaError::invalid(format!(
                "ref target {commit_hash} is not a stored commit"
            )));
        }
        let key = Self::ref_key(kind, name);
        let existing = self.read_ref(kind, name).await?;
        match (&mode, &existing) {
            (RefUpdate::CreateOnly, Some(_)) => {
                return Err(SomaError::conflict(key, "ref already exists"));
            }
            (RefUpdate::UpdateOnly, None) => {
                return Err(SomaError::not_found(key));
            }
            (RefUpdate::Cas { expected }, Some(doc)) if &doc.commit_hash != expected => {
                return Err(SomaError::conflict(
                    key,
                    format!("expected {expected}, found {}", doc.commit_hash),
                ));
            }
            (RefUpdate::Cas { .. }, None) => {
                return Err(SomaError::conflict(key, "CAS against an absent ref"));
            }
            _ => {}
        }

        let now = Utc::now();
        let doc = RefDocument {
            name: name.to_string(),
            commit_hash: commit_hash.to_string(),
            kind,
            created_at: existing.as_ref().map(|d| d.created_at).unwrap_or(now),
            updated_at: now,
            metadata: existing.and_then(|d| d.metadata),
        };
        let bytes = serde_json::to_vec(&doc).expect("ref serializes");
        self.adapter.write_object(&key, bytes).await?;
        Ok(doc)
    }

    /// Deleting the last branch, or the branch HEAD points to, is
    /// forbidden. Tags delete freely.
    pub async fn delete_ref(&self, kind: RefKind, name: &str) -> Result<()> {
        let key = Self::ref_key(kind, name);
        if self.read_ref(kind, name).await?.is_none() {
            return Err(SomaError::not_found(key));
        }
        if kind == RefKind::Branch {
            if self.head_branch().await? == name {
                return Err(SomaError::conflict(key, "HEAD points at this branch"));
            }
            let branches = self
                .list_refs()
                .await?
                .into_iter()
                .filter(|r| r.kind == RefKind::Branch)
                .count();
            if branches <= 1 {
                return Err(SomaError::conflict(key, "cannot delete the last branch"));
            }
        }
        self.adapter.delete_object(&key).await
    }

    pub async fn list_refs(&self) -> Result<Vec<RefDocument>> {
        let mut refs: Vec<RefDocument> = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self.adapter.list(REFS_PREFIX, 100, cursor.as_deref()).await?;
            for key in &page.keys {
                if key == HEAD_KEY {
                    continue;
                }
                if let Some(bytes) = self.adapter.read_object(key).await? {
                    match serde_json::from_slice(&bytes) {
                        Ok(doc) => refs.push(doc),
                        Err(err) => tracing::warn!(key, error = %err, "skipping corrupt ref"),
                    }
                }
            }
            if !page.has_more || page.keys.is_empty() {
                break;
            }
            cursor = page.next_cursor;
        }
        refs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(refs)
    }

    /// The branch HEAD points at; defaults to `main` when HEAD was never
    /// written.
    pub async fn head_branch(&self) -> Result<String> {
        match self.adapter.read_object(HEAD_KEY).await? {
            Some(bytes) => {
                let doc: HeadDocument = serde_json::from_slice(&bytes)
                    .map_err(|e| SomaError::fatal(format!("corrupt HEAD: {e}")))?;
                Ok(doc
                    .symbolic
                    .strip_prefix("refs/heads/")
                    .unwrap_or(&doc.symbolic)
                    .to_string())
            }
            None => Ok(DEFAULT_BRANCH.to_string()),
        }
    }

    pub async fn set_head(&self, branch: &str) -> Result<()> {
        if self.read_ref(RefKind::Branch, branch).await?.is_none() {
            return Err(SomaError::not_found(Self::ref_key(RefKind::Branch, branch)));
        }
        let doc = HeadDocument {
            symbolic: format!("refs/heads/{branch}"),
        };
        self.adapter
            .write_object(HEAD_KEY, serde_json::to_vec(&doc).expect("HEAD serializes"))
            .await
    }

    /// Resolves `HEAD`, a branch or tag name, a fully-qualified ref, or
    /// a raw commit hash to a commit hash.
    pub async fn resolve(&self, refish: &str) -> Result<String> {
        if refish == "HEAD" {
            let branch = self.head_branch().await?;
            return match self.read_ref(RefKind::Branch, &branch).await? {
                Some(doc) => Ok(doc.commit_hash),
                None => Err(SomaError::not_found(format!("refs/heads/{branch}"))),
            };
        }
        if let Some(name) = refish.strip_prefix("refs/heads/") {
            return match self.read_ref(RefKind::Branch, name).await? {
                Some(doc) => Ok(doc.commit_hash),
                None => Err(SomaError::not_found(refish.to_string())),
            };
        }
        if let Some(name) = refish.strip_prefix("refs/tags/") {
            return match self.read_ref(RefKind::Tag, name).await? {
                Some(doc) => Ok(doc.commit_hash),
                None => Err(SomaError::not_found(refish.to_string())),
            };
        }
        if let Some(doc) = self.read_ref(RefKind::Branch, refish).await? {
            return Ok(doc.commit_hash);
        }
        if let Some(doc) = self.read_ref(RefKind::Tag, refish).await? {
            return Ok(doc.commit_hash);
        }
        if refish.len() == 64 && refish.bytes().all(|b| b.is_ascii_hexdigit()) {
            if self.objects.get_commit(refish).await?.is_some() {
                return Ok(refish.to_string());
            }
        }
        Err(SomaError::not_found(refish.to_string()))
    }

    // ========================
    // COMMIT LOG
    // ========================

    /// Streams the chain newest-first, invoking `visit` per commit until
    /// it returns false or a stop condition hits. Keeps nothing in
    /// memory beyond the visited-set cycle guard.
    pub async fn for_each_commit<F>(
        &self,
        start_hash: &str,
        options: &WalkOptions,
        mut visit: F,
    ) -> Result<()>
    where
        F: FnMut(&CommitEntry) -> bool,
    {
        let mut visited: HashSet<String> = HashSet::new();
        let mut current = Some(start_hash.to_string());
        let mut depth = 0usize;
        let mut last_ts: Option<DateTime<Utc>> = None;
        while let Some(hash) = current {
            if let Some(max) = options.max_depth {
                if depth >= max {
                    break;
                }
            }
            if options.stop_at.as_deref() == Some(hash.as_str()) {
                break;
            }
            if !visited.insert(hash.clone()) {
                return Err(SomaError::fatal(format!(
                    "commit cycle detected at {hash}"
                )));
            }
            let Some(commit) = self.objects.get_commit(&hash).await? else {
                return Err(SomaError::not_found(hash));
            };
            if let Some(until) = options.until {
                if commit.timestamp < until {
                    break;
                }
            }
            if let Some(prev) = last_ts {
                if commit.timestamp > prev {
                    tracing::warn!(%hash, "commit timestamp newer than its child");
                }
            }
            last_ts = Some(commit.timestamp);
            let parent = commit.parent.clone();
            let entry = CommitEntry { hash, commit };
            if !visit(&entry) {
                break;
            }
            depth += 1;
            current = parent;
        }
        Ok(())
    }

    /// Collecting walk, newest-first.
    pub async fn walk(&self, start_hash: &str, options: &WalkOptions) -> Result<Vec<CommitEntry>> {
        let mut out = Vec::new();
        self.for_each_commit(start_hash, options, |entry| {
            out.push(entry.clone());
            true
        })
        .await?;
        Ok(out)
    }

    /// Latest commit at or before `ts` on the given ref. Binary-searches
    /// a lazily-built per-head commit index.
    pub async fn find_at_time(
        &self,
        refish: &str,
        ts: DateTime<Utc>,
    ) -> Result<Option<CommitEntry>> {
        let head = self.resolve(refish).await?;
        let index = {
            let cached = self.commit_index.lock().get(&head).cloned();
            match cached {
                Some(index) => index,
                None => {
                    let mut chain: Vec<(DateTime<Utc>, String)> = Vec::new();
                    self.for_each_commit(&head, &WalkOptions::default(), |entry| {
                        chain.push((entry.commit.timestamp, entry.hash.clone()));
                        true
                    })
                    .await?;
                    chain.reverse(); // oldest-first for binary search
                    let index = Arc::new(chain);
                    self.commit_index
                        .lock()
                        .insert(head.clone(), Arc::clone(&index));
                    index
                }
            }
        };
        let at = index.partition_point(|(commit_ts, _)| *commit_ts <= ts);
        if at == 0 {
            return Ok(None);
        }
        let hash = index[at - 1].1.clone();
        let commit = self
            .objects
            .get_commit(&hash)
            .await?
            .ok_or_else(|| SomaError::not_found(hash.clone()))?;
        Ok(Some(CommitEntry { hash, commit }))
    }

    pub async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let mut found = false;
        self.for_each_commit(descendant, &WalkOptions::default(), |entry| {
            if entry.hash == ancestor {
                found = true;
                return false;
            }
            true
        })
        .await?;
        Ok(found)
    }

    /// Number of commits in `(ancestor, descendant]`, or None when the
    /// two are unrelated.
    pub async fn count_between(&self, ancestor: &str, descendant: &str) -> Result<Option<usize>> {
        let mut count = 0usize;
        let mut found = false;
        self.for_each_commit(descendant, &WalkOptions::default(), |entry| {
            if entry.hash == ancestor {
                found = true;
                return false;
            }
            count += 1;
            true
        })
        .await?;
        Ok(found.then_some(count))
    }

    pub async fn find_common_ancestor(&self, a: &str, b: &str) -> Result<Option<String>> {
        let mut seen: HashSet<String> = HashSet::new();
        self.for_each_commit(a, &WalkOptions::default(), |entry| {
            seen.insert(entry.hash.clone());
            true
        })
        .await?;
        let mut common = None;
        self.for_each_commit(b, &WalkOptions::default(), |entry| {
            if seen.contains(&entry.hash) {
                common = Some(entry.hash.clone());
                return false;
            }
            true
        })
        .await?;
        Ok(common)
    }

    /// Drops cached commit indexes; called after refs move.
    pub fn invalidate_index(&self) {
        self.commit_index.lock().clear();
    }
}
