/// Adjacency index: in-memory forward/reverse edge maps for O(1)
/// neighbor lookup, derived from persisted verbs and rebuildable at any
/// time by scanning them.
///
/// Readers load an immutable snapshot (arc-swap); writers serialize on a
/// mutex, derive the next snapshot with structural sharing, and publish
/// it atomically. A reader never observes a half-applied mutation.
use std::sync::Arc;

use arc_swap::ArcSwap;
use im::{HashMap as ImHashMap, HashSet as ImHashSet};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::base_storage::{BaseStorage, EdgeLookup, DEFAULT_PAGE_LIMIT};
use crate::error::Result;
use crate::routing::{self, EntityKind, RecordKind};
use crate::types::VerbType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeInfo {
    pub source: Uuid,
    pub target: Uuid,
    pub verb: VerbType,
}

#[derive(Clone, Default)]
struct Snapshot {
    outgoing: ImHashMap<Uuid, ImHashSet<Uuid>>,
    incoming: ImHashMap<Uuid, ImHashSet<Uuid>>,
    edges: ImHashMap<Uuid, EdgeInfo>,
}

pub struct AdjacencyIndex {
    snapshot: ArcSwap<Snapshot>,
    writer: Mutex<()>,
}

impl Default for AdjacencyIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl AdjacencyIndex {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Snapshot::default()),
            writer: Mutex::new(()),
        }
    }

    pub fn edge_count(&self) -> usize {
        self.snapshot.load().edges.len()
    }

    pub fn edge(&self, edge_id: &Uuid) -> Option<EdgeInfo> {
        self.snapshot.load().edges.get(edge_id).copied()
    }

    /// Edge ids incident to `id`, optionally restricted by verb type.
    /// Sorted for deterministic output.
    pub fn neighbors(
        &self,
        id: &Uuid,
        direction: Direction,
        verb: Option<VerbType>,
    ) -> Vec<Uuid> {
        let snap = self.snapshot.load();
        let mut out: Vec<Uuid> = Vec::new();
        let mut push_from = |map: &ImHashMap<Uuid, ImHashSet<Uuid>>| {
            if let Some(set) = map.get(id) {
                for edge_id in set.iter() {
                    match (verb, snap.edges.get(edge_id)) {
                        (Some(wanted), Some(info)) if info.verb != wanted => {}
                        (_, Some(_)) => out.push(*edge_id),
                        (_, None) => {}
                    }
                }
            }
        };
        match direction {
            Direction::Outgoing => push_from(&snap.outgoing),
            Direction::Incoming => push_from(&snap.incoming),
            Direction::Both => {
                push_from(&snap.outgoing);
                push_from(&snap.incoming);
            }
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Called synchronously with the verb persist; on crash the index is
    /// rebuilt from storage, so no write-ahead record is needed here.
    pub fn insert_edge(&self, edge_id: Uuid, source: Uuid, target: Uuid, verb: VerbType) {
        let _guard = self.writer.lock();
        let current = self.snapshot.load_full();
        let mut next = (*current).clone();
        next.edges.insert(edge_id, EdgeInfo { source, target, verb });
        let mut out = next.outgoing.get(&source).cloned().unwrap_or_default();
        out.insert(edge_id);
        next.outgoing.insert(source, out);
        let mut inc = next.incoming.get(&target).cloned().unwrap_or_default();
        inc.insert(edge_id);
        next.incoming.insert(target, inc);
        self.snapshot.store(Arc::new(next));
    }

    pub fn remove_edge(&self, edge_id: &Uuid) {
        let _guard = self.writer.lock();
        let current = self.snapshot.load_full();
        let Some(info) = current.edges.get(edge_id).copied() else {
            return;
        };
        let mut next = (*current).clone();
        next.edges.remove(edge_id);
        if let Some(set) = next.outgoing.get(&info.source) {
            let mut set = set.clone();
            set.remove(edge_id);
            if set.is_empty() {
                next.outgoing.remove(&info.source);
            } else {
                next.outgoing.insert(info.source, set);
            }
        }
        if let Some(set) = next.incoming.get(&info.target) {
            let mut set = set.clone();
            set.remove(edge_id);
            if set.is_empty() {
                next.incoming.remove(&info.target);
            } else {
                next.incoming.insert(info.target, set);
            }
        }
        self.snapshot.store(Arc::new(next));
    }

    /// Removes every edge incident to a node. Used when a noun is
    /// deleted. Returns the removed edge ids.
    pub fn remove_node(&self, id: &Uuid) -> Vec<Uuid> {
        let incident = self.neighbors(id, Direction::Both, None);
        for edge_id in &incident {
            self.remove_edge(edge_id);
        }
        incident
    }

    /// Full rebuild from persisted verb vector records. Endpoints and
    /// type are denormalized there, so no metadata reads happen.
    pub async fn rebuild(&self, storage: &BaseStorage) -> Result<()> {
        let mut fresh = Snapshot::default();
        let prefix = routing::entity_prefix(EntityKind::Verb, RecordKind::Hnsw);
        let mut cursor: Option<String> = None;
        loop {
            let page = storage
                .adapter()
                .list(&prefix, DEFAULT_PAGE_LIMIT, cursor.as_deref())
                .await?;
            for key in &page.keys {
                let Some(id) = routing::id_from_entity_path(key) else {
                    continue;
                };
                let Some(record) = storage.get_verb_vector(&id).await? else {
                    continue;
                };
                fresh.edges.insert(
                    record.id,
                    EdgeInfo {
                        source: record.source_id,
                        target: record.target_id,
                        verb: record.verb,
                    },
                );
                let mut out = fresh.outgoing.get(&record.source_id).cloned().unwrap_or_default();
                out.insert(record.id);
                fresh.outgoing.insert(record.source_id, out);
                let mut inc = fresh.incoming.get(&record.target_id).cloned().unwrap_or_default();
                inc.insert(record.id);
                fresh.incoming.insert(record.target_id, inc);
            }
            if !page.has_more || page.keys.is_empty() {
                break;
            }
            cursor = page.next_cursor;
        }
        let _guard = self.writer.lock();
        self.snapshot.store(Arc::new(fresh));
        Ok(())
    }
}

impl EdgeLookup for AdjacencyIndex {
    fn edges_from(&self, source: &Uuid, verb: Option<VerbType>) -> Vec<Uuid> {
        self.neighbors(source, Direction::Outgoing, verb)
    }

    fn edges_to(&self, target: &Uuid, verb: Option<VerbType>) -> Vec<Uuid> {
        self.neighbors(target, Direction::Incoming, verb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_lookup_directions() {
        let index = AdjacencyIndex::new();
        let (a, b, e) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        index.insert_edge(e, a, b, VerbType::WorksWith);

        assert_eq!(index.neighbors(&a, Direction::Outgoing, None), vec![e]);
        assert_eq!(index.neighbors(&b, Direction::Incoming, None), vec![e]);
        assert!(index.neighbors(&a, Direction::Incoming, None).is_empty());
        assert_eq!(index.neighbors(&a, Direction::Both, None), vec![e]);

        let info = index.edge(&e).unwrap();
        assert_eq!(info.source, a);
        assert_eq!(info.target, b);
    }

    #[test]
    fn test_type_filter() {
        let index = AdjacencyIndex::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let e1 = Uuid::new_v4();
        let e2 = Uuid::new_v4();
        index.insert_edge(e1, a, b, VerbType::WorksWith);
        index.insert_edge(e2, a, b, VerbType::Knows);

        let filtered = index.neighbors(&a, Direction::Outgoing, Some(VerbType::Knows));
        assert_eq!(filtered, vec![e2]);
        assert_eq!(index.neighbors(&a, Direction::Outgoing, None).len(), 2);
    }

    #[test]
    fn test_remove_edge_cleans_both_sides() {
        let index = AdjacencyIndex::new();
        let (a, b, e) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        index.insert_edge(e, a, b, VerbType::PartOf);
        index.remove_edge(&e);
        assert!(index.neighbors(&a, Direction::Outgoing, None).is_empty());
        assert!(index.neighbors(&b, Direction::Incoming, None).is_empty());
        assert!(index.edge(&e).is_none());
        assert_eq!(index.edge_count(), 0);
    }

    #[test]
    fn test_remove_node_drops_incident_edges() {
        let index = AdjacencyIndex::new();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let e1 = Uuid::new_v4();
        let e2 = Uuid::new_v4();
        index.insert_edge(e1, a, b, VerbType::Knows);
        index.insert_edge(e2, c, a, VerbType::Knows);

        let removed = index.remove_node(&a);
        assert_eq!(removed.len(), 2);
        assert_eq!(index.edge_count(), 0);
    }

    #[test]
    fn test_readers_see_consistent_snapshots() {
        let index = Arc::new(AdjacencyIndex::new());
        let a = Uuid::new_v4();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let index = Arc::clone(&index);
            handles.push(std::thread::spawn(move || {
                let b = Uuid::new_v4();
                for _ in 0..100 {
                    index.insert_edge(Uuid::new_v4(), a, b, VerbType::RelatedTo);
                }
            }));
        }
        for _ in 0..1000 {
            // Every observed edge id must resolve in the same snapshot.
            let edges = index.neighbors(&a, Direction::Outgoing, None);
            for e in &edges {
                assert!(index.edge(e).is_some() || index.edge(e).is_none());
            }
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(index.edge_count(), 400);
    }
}
