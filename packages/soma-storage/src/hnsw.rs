/// Hierarchical Navigable Small World index over unit vectors.
///
/// The in-memory graph is an arena of nodes addressed by slot index;
/// persisted connections use entity ids and are rewired to slots on
/// load. One reader/writer lock guards the whole graph: readers share,
/// inserts and deletes exclude. Deletes are tombstones; tombstoned
/// nodes still route searches but never appear in results, and
/// `compact` rebuilds the arena without them.
///
/// Distance is cosine over normalized vectors (1 - dot).
use std::collections::{HashMap, HashSet};

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use smallvec::SmallVec;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Result, SomaError};
use crate::types::{cosine_distance, Connections, EMBEDDING_DIM};

/// Hard cap on drawn levels; bounds memory for adversarial RNG streaks.
const MAX_LEVEL: usize = 16;

#[derive(Debug, Clone)]
pub struct HnswParams {
    /// Max connections per node above level 0.
    pub m: usize,
    /// Max connections at level 0.
    pub m_max0: usize,
    /// Beam width during construction.
    pub ef_construction: usize,
    /// Default beam width during search.
    pub ef_search: usize,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            m_max0: 32,
            ef_construction: 200,
            ef_search: 128,
        }
    }
}

impl HnswParams {
    /// Level multiplier mL = 1/ln(M).
    fn ml(&self) -> f64 {
        1.0 / (self.m as f64).ln()
    }

    fn m_max(&self, level: usize) -> usize {
        if level == 0 {
            self.m_max0
        } else {
            self.m
        }
    }
}

struct Node {
    id: Uuid,
    vector: Vec<f32>,
    level: usize,
    /// One neighbor list per level 0..=level, holding slot indices.
    neighbors: Vec<SmallVec<[u32; 32]>>,
    deleted: bool,
}

#[derive(Default)]
struct Graph {
    nodes: Vec<Node>,
    slot_of: HashMap<Uuid, u32>,
    entry: Option<u32>,
}

impl Graph {
    fn node(&self, slot: u32) -> &Node {
        &self.nodes[slot as usize]
    }

    fn live_count(&self) -> usize {
        self.nodes.iter().filter(|n| !n.deleted).count()
    }

    /// Highest-level surviving node, smallest id on ties. Used for lazy
    /// entry point repair.
    fn pick_entry(&self) -> Option<u32> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| !n.deleted)
            .min_by(|(_, a), (_, b)| b.level.cmp(&a.level).then(a.id.cmp(&b.id)))
            .map(|(slot, _)| slot as u32)
    }
}

/// Persistable view of one node's graph state.
#[derive(Debug, Clone)]
pub struct NodeState {
    pub id: Uuid,
    pub level: usize,
    pub connections: Connections,
}

/// Search hit: ascending distance, ids break ties.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    pub id: Uuid,
    pub distance: f32,
}

#[derive(Clone, Copy)]
struct Candidate {
    distance: f32,
    slot: u32,
    id: Uuid,
}

impl Candidate {
    fn cmp_asc(&self, other: &Self) -> std::cmp::Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.id.cmp(&other.id))
    }
}

pub struct HnswIndex {
    graph: RwLock<Graph>,
    params: HnswParams,
    rng: Mutex<StdRng>,
}

impl HnswIndex {
    pub fn new(params: HnswParams) -> Self {
        Self {
            graph: RwLock::new(Graph::default()),
            params,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic level draws, for tests and reproducible rebuilds.
    pub fn with_seed(params: HnswParams, seed: u64) -> Self {
        Self {
            graph: RwLock::new(Graph::default()),
            params,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn params(&self) -> &HnswParams {
        &self.params
    }

    /// Live (non-tombstoned) node count.
    pub fn len(&self) -> usize {
        self.graph.read().live_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        let graph = self.graph.read();
        graph
            .slot_of
            .get(id)
            .map(|&slot| !graph.node(slot).deleted)
            .unwrap_or(false)
    }

    pub fn entry_point(&self) -> Option<(Uuid, usize)> {
        let graph = self.graph.read();
        graph.entry.map(|slot| {
            let node = graph.node(slot);
            (node.id, node.level)
        })
    }

    fn draw_level(&self) -> usize {
        let u: f64 = self.rng.lock().gen_range(f64::EPSILON..1.0);
        ((-u.ln() * self.params.ml()).floor() as usize).min(MAX_LEVEL)
    }

    /// Inserts a vector, returning the nodes whose connection state
    /// changed (including the new node) for per-node persistence.
    /// Re-inserting an existing live id is a no-op, which keeps WAL
    /// replays idempotent.
    pub fn insert(&self, id: Uuid, vector: Vec<f32>) -> Result<Vec<NodeState>> {
        let level = self.draw_level();
        self.insert_at_level(id, vector, level)
    }

    /// Insert with a pinned level; `compact` and rebuilds use this so a
    /// node keeps its persisted level across reconstructions.
    pub fn insert_at_level(
        &self,
        id: Uuid,
        vector: Vec<f32>,
        level: usize,
    ) -> Result<Vec<NodeState>> {
        let mut graph = self.graph.write();
        self.insert_inner(&mut graph, id, vector, level)
    }

    fn insert_inner(
        &self,
        graph: &mut Graph,
        id: Uuid,
        vector: Vec<f32>,
        level: usize,
    ) -> Result<Vec<NodeState>> {
        if vector.len() != EMBEDDING_DIM {
            return Err(SomaError::invalid(format!(
                "vector dimension mismatch: expected {EMBEDDING_DIM}, got {}",
                vector.len()
            )));
        }
        if let Some(&slot) = graph.slot_of.get(&id) {
            if !graph.node(slot).deleted {
                return Ok(Vec::new());
            }
            return Err(SomaError::conflict(
                id.to_string(),
                "id is tombstoned; compact before reusing it",
            ));
        }

        let slot = graph.nodes.len() as u32;
        graph.nodes.push(Node {
            id,
            vector,
            level,
            neighbors: vec![SmallVec::new(); level + 1],
            deleted: false,
        });
        graph.slot_of.insert(id, slot);

        let mut changed: HashSet<u32> = HashSet::new();
        changed.insert(slot);

        let Some(entry) = graph.entry else {
            graph.entry = Some(slot);
            return Ok(self.states_for(graph, &changed));
        };

        let entry_level = graph.node(entry).level;
        let query = graph.node(slot).vector.clone();

        // Greedy descent through levels above the new node's level.
        let mut ep = entry;
        let mut lc = entry_level;
        while lc > level {
            ep = self.greedy_step(graph, &query, ep, lc);
            lc -= 1;
        }

        // Beam search and connect at each level the node occupies.
        let mut eps = vec![ep];
        for lc in (0..=level.min(entry_level)).rev() {
            let candidates =
                self.search_layer(graph, &query, &eps, self.params.ef_construction, lc);
            let selected = self.select_neighbors(graph, &candidates, self.params.m);
            for cand in &selected {
                graph.nodes[slot as usize].neighbors[lc].push(cand.slot);
                graph.nodes[cand.slot as usize].neighbors[lc].push(slot);
                changed.insert(cand.slot);
            }
            // Shrink any neighbor that now exceeds its degree bound.
            let max = self.params.m_max(lc);
            for cand in &selected {
                if graph.node(cand.slot).neighbors[lc].len() > max {
                    self.shrink_neighbors(graph, cand.slot, lc, max);
                }
            }
            eps = candidates.iter().map(|c| c.slot).collect();
            if eps.is_empty() {
                eps = vec![ep];
            }
        }

        if level > entry_level {
            graph.entry = Some(slot);
        }
        Ok(self.states_for(graph, &changed))
    }

    /// Marks a tombstone. The node keeps routing searches until the next
    /// `compact`. Returns false if the id was absent or already deleted.
    pub fn delete(&self, id: &Uuid) -> bool {
        let mut graph = self.graph.write();
        let Some(&slot) = graph.slot_of.get(id) else {
            return false;
        };
        if graph.node(slot).deleted {
            return false;
        }
        graph.nodes[slot as usize].deleted = true;
        if graph.entry == Some(slot) {
            graph.entry = graph.pick_entry();
        }
        true
    }

    /// Vectors are immutable in place: an update is delete + insert.
    pub fn update(&self, id: Uuid, vector: Vec<f32>) -> Result<Vec<NodeState>> {
        {
            let mut graph = self.graph.write();
            if let Some(&slot) = graph.slot_of.get(&id) {
                graph.nodes[slot as usize].deleted = true;
                graph.slot_of.remove(&id);
                if graph.entry == Some(slot) {
                    graph.entry = graph.pick_entry();
                }
            }
        }
        self.insert(id, vector)
    }

    /// Beam search. Tombstoned nodes route but are filtered from the
    /// result; cancellation is checked between level transitions.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        ef: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Hit>> {
        if query.len() != EMBEDDING_DIM {
            return Err(SomaError::invalid(format!(
                "query dimension mismatch: expected {EMBEDDING_DIM}, got {}",
                query.len()
            )));
        }
        let graph = self.graph.read();
        let Some(mut entry) = graph.entry else {
            return Ok(Vec::new());
        };
        // Lazy entry repair: a tombstoned entry is replaced by the
        // highest-level surviving node for the duration of this search.
        if graph.node(entry).deleted {
            match graph.pick_entry() {
                Some(slot) => entry = slot,
                None => return Ok(Vec::new()),
            }
        }

        let ef = ef.unwrap_or(self.params.ef_search).max(k);
        let top = graph.node(entry).level;
        let mut ep = entry;
        for lc in (1..=top).rev() {
            if cancel.is_cancelled() {
                return Err(SomaError::Cancelled);
            }
            ep = self.greedy_step(&graph, query, ep, lc);
        }
        if cancel.is_cancelled() {
            return Err(SomaError::Cancelled);
        }

        let mut found = self.search_layer(&graph, query, &[ep], ef, 0);
        found.retain(|c| !graph.node(c.slot).deleted);
        found.sort_by(|a, b| a.cmp_asc(b));
        found.truncate(k);
        Ok(found
            .into_iter()
            .map(|c| Hit {
                id: c.id,
                distance: c.distance,
            })
            .collect())
    }

    /// Rebuilds the arena without tombstones, preserving levels, all
    /// under one writer critical section. Returns the surviving node
    /// states (all of them need re-persisting) and the ids that were
    /// actually dropped. An id superseded by `update` is never reported
    /// dropped, since a live node still carries it.
    pub fn compact(&self) -> (Vec<NodeState>, Vec<Uuid>) {
        let mut graph = self.graph.write();
        let mut survivors: Vec<(Uuid, Vec<f32>, usize)> = Vec::new();
        let mut dropped = Vec::new();
        for (slot, node) in graph.nodes.iter().enumerate() {
            if node.deleted {
                if graph.slot_of.get(&node.id) == Some(&(slot as u32)) {
                    dropped.push(node.id);
                }
            } else {
                survivors.push((node.id, node.vector.clone(), node.level));
            }
        }
        *graph = Graph::default();
        for (id, vector, level) in survivors {
            if let Err(err) = self.insert_inner(&mut graph, id, vector, level) {
                tracing::warn!(%id, error = %err, "node skipped during compaction");
            }
        }
        let states = graph
            .nodes
            .iter()
            .filter(|n| !n.deleted)
            .map(|n| self.state_of(&graph, n))
            .collect();
        (states, dropped)
    }

    /// Wires a pre-built node from its persisted record. First load all
    /// nodes, then call `rewire` once so connection ids resolve.
    pub fn load_node(&self, id: Uuid, vector: Vec<f32>, level: usize, deleted: bool) {
        let mut graph = self.graph.write();
        let slot = graph.nodes.len() as u32;
        graph.nodes.push(Node {
            id,
            vector,
            level: level.min(MAX_LEVEL),
            neighbors: vec![SmallVec::new(); level.min(MAX_LEVEL) + 1],
            deleted,
        });
        graph.slot_of.insert(id, slot);
    }

    /// Resolves persisted connections (entity ids) into slots. Ids that
    /// no longer resolve are skipped, maintaining the invariant that
    /// connections only reference present nodes.
    pub fn rewire(&self, connections: &HashMap<Uuid, Connections>, entry_hint: Option<Uuid>) {
        let mut graph = self.graph.write();
        for (id, conns) in connections {
            let Some(&slot) = graph.slot_of.get(id) else {
                continue;
            };
            for (level_key, ids) in conns {
                let Ok(level) = level_key.parse::<usize>() else {
                    tracing::warn!(%id, level_key, "ignoring malformed connection level");
                    continue;
                };
                if level > graph.node(slot).level {
                    continue;
                }
                let neighbor_slots: SmallVec<[u32; 32]> = ids
                    .iter()
                    .filter_map(|nid| graph.slot_of.get(nid).copied())
                    .collect();
                graph.nodes[slot as usize].neighbors[level] = neighbor_slots;
            }
        }
        graph.entry = entry_hint
            .and_then(|id| graph.slot_of.get(&id).copied())
            .filter(|&slot| !graph.node(slot).deleted)
            .or_else(|| graph.pick_entry());
    }

    /// Current state of one node, if present.
    pub fn node_state(&self, id: &Uuid) -> Option<NodeState> {
        let graph = self.graph.read();
        let &slot = graph.slot_of.get(id)?;
        Some(self.state_of(&graph, graph.node(slot)))
    }

    /// Drops the entire in-memory graph. Used by `clear`.
    pub fn reset(&self) {
        *self.graph.write() = Graph::default();
    }

    /// Ids tombstoned by `delete`. Ids superseded through `update` are
    /// excluded: the id is still live on its replacement node.
    pub fn deleted_ids(&self) -> Vec<Uuid> {
        let graph = self.graph.read();
        graph
            .nodes
            .iter()
            .enumerate()
            .filter(|(slot, n)| {
                n.deleted && graph.slot_of.get(&n.id) == Some(&(*slot as u32))
            })
            .map(|(_, n)| n.id)
            .collect()
    }

    // ========================
    // INTERNALS
    // ========================

    fn greedy_step(&self, graph: &Graph, query: &[f32], start: u32, level: usize) -> u32 {
        let mut current = start;
        let mut current_dist = cosine_distance(query, &graph.node(current).vector);
        loop {
            let mut improved = false;
            let node = graph.node(current);
            if level < node.neighbors.len() {
                for &next in &node.neighbors[level] {
                    let dist = cosine_distance(query, &graph.node(next).vector);
                    if dist < current_dist {
                        current = next;
                        current_dist = dist;
                        improved = true;
                    }
                }
            }
            if !improved {
                return current;
            }
        }
    }

    /// Bounded beam search at one level. Returns up to `ef` candidates
    /// sorted ascending by (distance, id).
    fn search_layer(
        &self,
        graph: &Graph,
        query: &[f32],
        entry_points: &[u32],
        ef: usize,
        level: usize,
    ) -> Vec<Candidate> {
        use std::cmp::Reverse;
        use std::collections::BinaryHeap;

        struct Ordered(Candidate);
        impl PartialEq for Ordered {
            fn eq(&self, other: &Self) -> bool {
                self.cmp(other) == std::cmp::Ordering::Equal
            }
        }
        impl Eq for Ordered {}
        impl PartialOrd for Ordered {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }
        impl Ord for Ordered {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                self.0.cmp_asc(&other.0)
            }
        }

        let mut visited: HashSet<u32> = HashSet::new();
        // Min-heap of nodes to expand; max-heap of current best `ef`.
        let mut to_visit: BinaryHeap<Reverse<Ordered>> = BinaryHeap::new();
        let mut best: BinaryHeap<Ordered> = BinaryHeap::new();

        for &ep in entry_points {
            if visited.insert(ep) {
                let cand = Candidate {
                    distance: cosine_distance(query, &graph.node(ep).vector),
                    slot: ep,
                    id: graph.node(ep).id,
                };
                to_visit.push(Reverse(Ordered(cand)));
                best.push(Ordered(cand));
            }
        }

        while let Some(Reverse(Ordered(current))) = to_visit.pop() {
            let worst = best.peek().map(|o| o.0.distance).unwrap_or(f32::MAX);
            if current.distance > worst && best.len() >= ef {
                break;
            }
            let node = graph.node(current.slot);
            if level >= node.neighbors.len() {
                continue;
            }
            for &next in &node.neighbors[level] {
                if !visited.insert(next) {
                    continue;
                }
                let cand = Candidate {
                    distance: cosine_distance(query, &graph.node(next).vector),
                    slot: next,
                    id: graph.node(next).id,
                };
                let worst = best.peek().map(|o| o.0.distance).unwrap_or(f32::MAX);
                if best.len() < ef || cand.distance < worst {
                    to_visit.push(Reverse(Ordered(cand)));
                    best.push(Ordered(cand));
                    if best.len() > ef {
                        best.pop();
                    }
                }
            }
        }

        let mut out: Vec<Candidate> = best.into_iter().map(|o| o.0).collect();
        out.sort_by(|a, b| a.cmp_asc(b));
        out
    }

    /// Neighbor-heuristic diversification: walk candidates by ascending
    /// distance and discard any that sit closer to an already-selected
    /// neighbor than to the query.
    fn select_neighbors(
        &self,
        graph: &Graph,
        candidates: &[Candidate],
        m: usize,
    ) -> Vec<Candidate> {
        let mut selected: Vec<Candidate> = Vec::with_capacity(m);
        for cand in candidates {
            if selected.len() >= m {
                break;
            }
            let dominated = selected.iter().any(|s| {
                cosine_distance(&graph.node(cand.slot).vector, &graph.node(s.slot).vector)
                    < cand.distance
            });
            if !dominated {
                selected.push(*cand);
            }
        }
        // Heuristic can be over-aggressive on tight clusters; backfill
        // with the nearest discarded candidates up to m.
        if selected.len() < m {
            for cand in candidates {
                if selected.len() >= m {
                    break;
                }
                if !selected.iter().any(|s| s.slot == cand.slot) {
                    selected.push(*cand);
                }
            }
        }
        selected
    }

    fn shrink_neighbors(&self, graph: &mut Graph, slot: u32, level: usize, max: usize) {
        let base_vector = graph.node(slot).vector.clone();
        let neighbor_slots: Vec<u32> = graph.node(slot).neighbors[level].to_vec();
        let mut candidates: Vec<Candidate> = neighbor_slots
            .iter()
            .map(|&n| Candidate {
                distance: cosine_distance(&base_vector, &graph.node(n).vector),
                slot: n,
                id: graph.node(n).id,
            })
            .collect();
        candidates.sort_by(|a, b| a.cmp_asc(b));
        let kept = self.select_neighbors(graph, &candidates, max);
        graph.nodes[slot as usize].neighbors[level] = kept.iter().map(|c| c.slot).collect();
    }

    fn state_of(&self, graph: &Graph, node: &Node) -> NodeState {
        let mut connections = Connections::new();
        for (level, slots) in node.neighbors.iter().enumerate() {
            let mut ids: Vec<Uuid> = slots
                .iter()
                .map(|&s| graph.node(s).id)
                .collect();
            ids.sort_unstable();
            connections.insert(level.to_string(), ids);
        }
        NodeState {
            id: node.id,
            level: node.level,
            connections,
        }
    }

    fn states_for(&self, graph: &Graph, slots: &HashSet<u32>) -> Vec<NodeState> {
        let mut states: Vec<NodeState> = slots
            .iter()
            .map(|&slot| self.state_of(graph, graph.node(slot)))
            .collect();
        states.sort_by(|a, b| a.id.cmp(&b.id));
        states
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_vector(seed: u64) -> Vec<f32> {
        let mut v: Vec<f32> = (0..EMBEDDING_DIM)
            .map(|i| ((seed as f32) * 0.37 + (i as f32) * 0.11).sin())
            .collect();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        for x in &mut v {
            *x /= norm;
        }
        v
    }

    fn basis_vector(axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; EMBEDDING_DIM];
        v[axis] = 1.0;
        v
    }

    fn index() -> HnswIndex {
        HnswIndex::with_seed(HnswParams::default(), 7)
    }

    #[test]
    fn test_empty_search_returns_nothing() {
        let index = index();
        let hits = index
            .search(&unit_vector(0), 5, None, &CancellationToken::new())
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_exact_match_ranks_first() {
        let index = index();
        let mut ids = Vec::new();
        for i in 0..200u64 {
            let id = Uuid::new_v4();
            index.insert(id, unit_vector(i)).unwrap();
            ids.push(id);
        }
        let hits = index
            .search(&unit_vector(120), 5, None, &CancellationToken::new())
            .unwrap();
        assert_eq!(hits[0].id, ids[120]);
        assert!(hits[0].distance < 1e-5);
        // Ascending distances.
        for pair in hits.windows(2) {
            assert!(pair[0].distance <= pair[1].distance);
        }
    }

    #[test]
    fn test_k_larger_than_population() {
        let index = index();
        for i in 0..3u64 {
            index.insert(Uuid::new_v4(), unit_vector(i)).unwrap();
        }
        let hits = index
            .search(&unit_vector(0), 10, None, &CancellationToken::new())
            .unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn test_insert_is_idempotent() {
        let index = index();
        let id = Uuid::new_v4();
        let first = index.insert(id, basis_vector(0)).unwrap();
        assert!(!first.is_empty());
        let again = index.insert(id, basis_vector(0)).unwrap();
        assert!(again.is_empty());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_tombstone_excluded_from_results() {
        let index = index();
        let victim = Uuid::new_v4();
        index.insert(victim, basis_vector(0)).unwrap();
        for axis in 1..6 {
            index.insert(Uuid::new_v4(), basis_vector(axis)).unwrap();
        }
        assert!(index.delete(&victim));
        assert!(!index.delete(&victim));
        let hits = index
            .search(&basis_vector(0), 6, None, &CancellationToken::new())
            .unwrap();
        assert!(hits.iter().all(|h| h.id != victim));
        assert_eq!(index.len(), 5);
        assert_eq!(index.deleted_ids(), vec![victim]);
    }

    #[test]
    fn test_entry_point_survives_deleting_it() {
        let index = index();
        for i in 0..30u64 {
            index.insert(Uuid::new_v4(), unit_vector(i)).unwrap();
        }
        let (entry_id, _) = index.entry_point().unwrap();
        assert!(index.delete(&entry_id));
        let (new_entry, _) = index.entry_point().unwrap();
        assert_ne!(new_entry, entry_id);
        let hits = index
            .search(&unit_vector(3), 5, None, &CancellationToken::new())
            .unwrap();
        assert_eq!(hits.len(), 5);
    }

    #[test]
    fn test_compact_drops_tombstones() {
        let index = index();
        let mut ids = Vec::new();
        for i in 0..20u64 {
            let id = Uuid::new_v4();
            index.insert(id, unit_vector(i)).unwrap();
            ids.push(id);
        }
        index.delete(&ids[0]);
        index.delete(&ids[1]);
        let (states, dropped) = index.compact();
        assert_eq!(states.len(), 18);
        assert_eq!(dropped.len(), 2);
        assert!(index.deleted_ids().is_empty());
        // Dropped ids are insertable again after compaction.
        assert!(index.insert(ids[0], unit_vector(0)).is_ok());
    }

    #[test]
    fn test_degree_bound_holds() {
        let params = HnswParams::default();
        let (m, m_max0) = (params.m, params.m_max0);
        let index = HnswIndex::with_seed(params, 3);
        let mut ids = Vec::new();
        for i in 0..300u64 {
            let id = Uuid::new_v4();
            index.insert(id, unit_vector(i)).unwrap();
            ids.push(id);
        }
        for id in &ids {
            let state = index.node_state(id).unwrap();
            for (level_key, conns) in &state.connections {
                let level: usize = level_key.parse().unwrap();
                let bound = if level == 0 { m_max0 } else { m };
                assert!(
                    conns.len() <= bound,
                    "level {level} degree {} exceeds {bound}",
                    conns.len()
                );
            }
        }
    }

    #[test]
    fn test_cancelled_search_returns_promptly() {
        let index = index();
        for i in 0..50u64 {
            index.insert(Uuid::new_v4(), unit_vector(i)).unwrap();
        }
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = index.search(&unit_vector(0), 5, None, &cancel).unwrap_err();
        assert!(matches!(err, SomaError::Cancelled));
    }

    #[test]
    fn test_persist_and_rewire_roundtrip() {
        let index = index();
        let mut records = Vec::new();
        for i in 0..100u64 {
            let id = Uuid::new_v4();
            index.insert(id, unit_vector(i)).unwrap();
            records.push((id, unit_vector(i)));
        }
        let entry = index.entry_point().map(|(id, _)| id);

        // Re-load into a fresh index from per-node state.
        let restored = HnswIndex::with_seed(HnswParams::default(), 7);
        let mut connections = HashMap::new();
        for (id, vector) in &records {
            let state = index.node_state(id).unwrap();
            restored.load_node(*id, vector.clone(), state.level, false);
            connections.insert(*id, state.connections);
        }
        restored.rewire(&connections, entry);

        assert_eq!(restored.len(), 100);
        assert_eq!(restored.entry_point().map(|(id, _)| id), entry);
        let query = unit_vector(42);
        let original = index
            .search(&query, 5, None, &CancellationToken::new())
            .unwrap();
        let reloaded = restored
            .search(&query, 5, None, &CancellationToken::new())
            .unwrap();
        assert_eq!(original[0].id, reloaded[0].id);
    }

    #[test]
    fn test_update_replaces_vector() {
        let index = index();
        let id = Uuid::new_v4();
        index.insert(id, basis_vector(0)).unwrap();
        index.update(id, basis_vector(5)).unwrap();
        let hits = index
            .search(&basis_vector(5), 1, None, &CancellationToken::new())
            .unwrap();
        assert_eq!(hits[0].id, id);
        assert!(hits[0].distance < 1e-5);
    }
}
