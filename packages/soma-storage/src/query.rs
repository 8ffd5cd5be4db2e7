/// Query engine: composes the HNSW index, the adjacency index, and base
/// storage to answer `like` (vector), `where` (metadata predicate), and
/// `connected` (graph traversal) clauses and their combinations.
///
/// Planning: a selective `where` (noun-type equality) filters first
/// through the type fast path and re-ranks the shortlist by vector
/// distance; otherwise the HNSW runs with an over-fetch and results are
/// post-filtered. Scores land in [0,1] with deterministic id tie-break.
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adjacency::{AdjacencyIndex, Direction};
use crate::base_storage::{BaseStorage, NounFilter, Pagination};
use crate::embedding::{embed_normalized, Embedder};
use crate::error::{Result, SomaError};
use crate::hnsw::HnswIndex;
use crate::types::{normalize_vector, NounMetadata, NounType, VerbType};

/// Over-fetch factor when HNSW results are post-filtered.
const OVER_FETCH: usize = 4;
/// Page size for predicate-only scans.
const SCAN_PAGE: usize = 200;

#[derive(Debug, Clone)]
pub enum QueryInput {
    Text(String),
    Vector(Vec<f32>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(String, Value),
    Ne(String, Value),
    Gt(String, f64),
    Gte(String, f64),
    Lt(String, f64),
    Lte(String, f64),
    In(String, Vec<Value>),
    Contains(String, String),
    Exists(String),
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
}

#[derive(Debug, Clone)]
pub enum ConnectedAnchor {
    /// Follow outgoing edges from these nodes.
    From(Vec<Uuid>),
    /// Follow incoming edges toward these nodes.
    To(Vec<Uuid>),
    Both(Vec<Uuid>),
}

#[derive(Debug, Clone)]
pub struct ConnectedClause {
    pub anchor: ConnectedAnchor,
    pub via: Option<Vec<VerbType>>,
    /// Clamped to 1..=3.
    pub hops: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct Boost {
    pub vector: f64,
    pub field: f64,
    pub graph: f64,
}

impl Default for Boost {
    fn default() -> Self {
        Self {
            vector: 1.0,
            field: 1.0,
            graph: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Query {
    pub like: Option<QueryInput>,
    pub r#where: Option<Predicate>,
    pub connected: Option<ConnectedClause>,
    pub limit: Option<usize>,
    pub boost: Option<Boost>,
    pub ef: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct QueryHit {
    pub id: Uuid,
    pub score: f64,
    pub metadata: NounMetadata,
}

pub struct QueryEngine {
    storage: Arc<BaseStorage>,
    hnsw: Arc<HnswIndex>,
    adjacency: Arc<AdjacencyIndex>,
    embedder: Arc<dyn Embedder>,
}

impl QueryEngine {
    pub fn new(
        storage: Arc<BaseStorage>,
        hnsw: Arc<HnswIndex>,
        adjacency: Arc<AdjacencyIndex>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            storage,
            hnsw,
            adjacency,
            embedder,
        }
    }

    /// Vector-only top-k, the `like` clause on its own.
    pub async fn search(
        &self,
        input: QueryInput,
        k: usize,
        ef: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<Vec<QueryHit>> {
        let query = Query {
            like: Some(input),
            limit: Some(k),
            ef,
            ..Default::default()
        };
        self.query(&query, cancel).await
    }

    pub async fn query(&self, query: &Query, cancel: &CancellationToken) -> Result<Vec<QueryHit>> {
        let limit = query.limit.unwrap_or(10).max(1);
        let boost = query.boost.unwrap_or_default();

        let like_vector = match &query.like {
            Some(QueryInput::Text(text)) => {
                Some(embed_normalized(self.embedder.as_ref(), text).await?)
            }
            Some(QueryInput::Vector(vector)) => Some(normalize_vector(vector.clone())?),
            None => None,
        };
        if cancel.is_cancelled() {
            return Err(SomaError::Cancelled);
        }

        // Graph constraint first when present: it bounds everything else.
        let reachable: Option<HashMap<Uuid, u8>> = match &query.connected {
            Some(clause) => Some(self.traverse(clause, cancel)?),
            None => None,
        };

        // Candidate generation.
        let mut candidates: HashMap<Uuid, f64> = HashMap::new(); // id -> vector distance
        match (&like_vector, selective_noun_type(query.r#where.as_ref())) {
            (_, Some(noun_type)) => {
                // Selective filter-first plan: shortlist by type, then
                // re-rank the shortlist by distance.
                let page = self
                    .storage
                    .get_nouns(
                        Some(NounFilter::ByType(noun_type)),
                        &Pagination {
                            limit: Some(usize::MAX / 2),
                            ..Default::default()
                        },
                    )
                    .await?;
                for meta in page.items {
                    let distance = match &like_vector {
                        Some(vector) => match self.distance_to(&meta.id, vector).await? {
                            Some(distance) => distance,
                            None => continue,
                        },
                        None => 0.0,
                    };
                    candidates.insert(meta.id, distance);
                }
            }
            (Some(vector), None) => {
                let fetch = limit
                    .saturating_mul(OVER_FETCH)
                    .max(query.ef.unwrap_or(0));
                let hits = self.hnsw.search(vector, fetch, query.ef, cancel)?;
                for hit in hits {
                    candidates.insert(hit.id, hit.distance as f64);
                }
            }
            (None, None) => match &reachable {
                Some(reached) => {
                    for id in reached.keys() {
                        candidates.insert(*id, 0.0);
                    }
                }
                None => {
                    // Predicate-only plan: page through the metadata
                    // namespace via the adapter's pagination.
                    let mut cursor: Option<String> = None;
                    loop {
                        if cancel.is_cancelled() {
                            return Err(SomaError::Cancelled);
                        }
                        let page = self
                            .storage
                            .get_nouns(
                                None,
                                &Pagination {
                                    limit: Some(SCAN_PAGE),
                                    cursor: cursor.clone(),
                                    ..Default::default()
                                },
                            )
                            .await?;
                        for meta in page.items {
                            candidates.insert(meta.id, 0.0);
                        }
                        if !page.has_more {
                            break;
                        }
                        cursor = page.next_cursor;
                        if cursor.is_none() {
                            break;
                        }
                    }
                }
            },
        }
        if cancel.is_cancelled() {
            return Err(SomaError::Cancelled);
        }

        // Apply graph constraint.
        if let Some(reached) = &reachable {
            candidates.retain(|id, _| reached.contains_key(id));
        }

        // Fetch metadata, post-filter, and score.
        let mut hits: Vec<QueryHit> = Vec::new();
        let mut ids: Vec<Uuid> = candidates.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let Some(meta) = self.storage.get_noun_metadata(&id).await? else {
                // Composed partial failure: skip with a warning instead
                // of failing the whole query.
                tracing::warn!(%id, "query candidate has no metadata, skipping");
                continue;
            };
            if let Some(predicate) = &query.r#where {
                if !matches_predicate(predicate, &meta) {
                    continue;
                }
            }

            let distance = candidates[&id];
            let vector_score = if like_vector.is_some() {
                Some((1.0 - distance).clamp(0.0, 1.0))
            } else {
                None
            };
            let field_score = query
                .r#where
                .as_ref()
                .map(|predicate| field_match_score(predicate, &meta));
            let graph_score = reachable
                .as_ref()
                .map(|reached| 1.0 / f64::from(reached[&id]));

            let mut weighted = 0.0;
            let mut total_boost = 0.0;
            if let Some(score) = vector_score {
                weighted += boost.vector * score;
                total_boost += boost.vector;
            }
            if let Some(score) = field_score {
                weighted += boost.field * score;
                total_boost += boost.field;
            }
            if let Some(score) = graph_score {
                weighted += boost.graph * score;
                total_boost += boost.graph;
            }
            let score = if total_boost > 0.0 {
                weighted / total_boost
            } else {
                1.0
            };
            hits.push(QueryHit {
                id,
                score,
                metadata: meta,
            });
        }

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    /// Nodes reachable from the anchors within `hops`, mapped to their
    /// minimum hop count. Anchors themselves are excluded. Verbs whose
    /// far endpoint has no metadata are treated as dangling and skipped
    /// at result time by the caller.
    fn traverse(
        &self,
        clause: &ConnectedClause,
        cancel: &CancellationToken,
    ) -> Result<HashMap<Uuid, u8>> {
        let hops = clause.hops.clamp(1, 3);
        let (anchors, direction) = match &clause.anchor {
            ConnectedAnchor::From(ids) => (ids.clone(), Direction::Outgoing),
            ConnectedAnchor::To(ids) => (ids.clone(), Direction::Incoming),
            ConnectedAnchor::Both(ids) => (ids.clone(), Direction::Both),
        };
        let mut reached: HashMap<Uuid, u8> = HashMap::new();
        let mut frontier: VecDeque<(Uuid, u8)> = anchors.iter().map(|id| (*id, 0)).collect();
        let mut visited: std::collections::HashSet<Uuid> = anchors.iter().copied().collect();

        while let Some((node, depth)) = frontier.pop_front() {
            if depth >= hops {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(SomaError::Cancelled);
            }
            for edge_id in self.adjacency.neighbors(&node, direction, None) {
                let Some(info) = self.adjacency.edge(&edge_id) else {
                    continue;
                };
                if let Some(via) = &clause.via {
                    if !via.contains(&info.verb) {
                        continue;
                    }
                }
                let next = if info.source == node {
                    info.target
                } else {
                    info.source
                };
                let hop = depth + 1;
                reached
                    .entry(next)
                    .and_modify(|d| *d = (*d).min(hop))
                    .or_insert(hop);
                if visited.insert(next) {
                    frontier.push_back((next, hop));
                }
            }
        }
        for anchor in &anchors {
            reached.remove(anchor);
        }
        Ok(reached)
    }

    async fn distance_to(&self, id: &Uuid, query: &[f32]) -> Result<Option<f64>> {
        // Shortlist re-ranking reads the stored vector directly; the
        // HNSW is not involved for filter-first plans.
        match self.storage.get_noun_vector(id).await? {
            Some(record) => Ok(Some(
                crate::types::cosine_distance(query, &record.vector) as f64
            )),
            None => Ok(None),
        }
    }
}

/// Detects the selective fast-path shape: an equality on the noun type,
/// possibly nested in a conjunction.
fn selective_noun_type(predicate: Option<&Predicate>) -> Option<NounType> {
    match predicate? {
        Predicate::Eq(field, value) if field == "noun" => {
            value.as_str().and_then(|s| NounType::parse(s).ok())
        }
        Predicate::All(children) => children.iter().find_map(|c| selective_noun_type(Some(c))),
        _ => None,
    }
}

fn field_value<'a>(meta: &'a NounMetadata, field: &str) -> Option<Value> {
    match field {
        "id" => Some(Value::String(meta.id.to_string())),
        "noun" => Some(Value::String(meta.noun.as_str().to_string())),
        "createdAt" => Some(Value::String(meta.created_at.to_rfc3339())),
        "updatedAt" => Some(Value::String(meta.updated_at.to_rfc3339())),
        "confidence" => meta.confidence.map(Value::from),
        "weight" => meta.weight.map(Value::from),
        "service" => meta.service.clone().map(Value::String),
        "createdBy" => meta.created_by.clone().map(Value::String),
        "data" => meta.data.clone(),
        _ => meta.extra.get(field).cloned(),
    }
}

pub fn matches_predicate(predicate: &Predicate, meta: &NounMetadata) -> bool {
    match predicate {
        Predicate::Eq(field, value) => field_value(meta, field).as_ref() == Some(value),
        Predicate::Ne(field, value) => field_value(meta, field).as_ref() != Some(value),
        Predicate::Gt(field, bound) => numeric(meta, field).map(|v| v > *bound).unwrap_or(false),
        Predicate::Gte(field, bound) => numeric(meta, field).map(|v| v >= *bound).unwrap_or(false),
        Predicate::Lt(field, bound) => numeric(meta, field).map(|v| v < *bound).unwrap_or(false),
        Predicate::Lte(field, bound) => numeric(meta, field).map(|v| v <= *bound).unwrap_or(false),
        Predicate::In(field, values) => field_value(meta, field)
            .map(|v| values.contains(&v))
            .unwrap_or(false),
        Predicate::Contains(field, needle) => field_value(meta, field)
            .and_then(|v| v.as_str().map(|s| s.contains(needle.as_str())))
            .unwrap_or(false),
        Predicate::Exists(field) => field_value(meta, field).is_some(),
        Predicate::All(children) => children.iter().all(|c| matches_predicate(c, meta)),
        Predicate::Any(children) => children.iter().any(|c| matches_predicate(c, meta)),
    }
}

fn numeric(meta: &NounMetadata, field: &str) -> Option<f64> {
    field_value(meta, field).and_then(|v| v.as_f64())
}

/// Field-match component in [0,1]: fraction of satisfied leaves under
/// conjunctions, best branch under disjunctions.
pub fn field_match_score(predicate: &Predicate, meta: &NounMetadata) -> f64 {
    match predicate {
        Predicate::All(children) if !children.is_empty() => {
            children.iter().map(|c| field_match_score(c, meta)).sum::<f64>()
                / children.len() as f64
        }
        Predicate::Any(children) if !children.is_empty() => children
            .iter()
            .map(|c| field_match_score(c, meta))
            .fold(0.0, f64::max),
        leaf => {
            if matches_predicate(leaf, meta) {
                1.0
            } else {
                0.0
            }
        }
    }
}
