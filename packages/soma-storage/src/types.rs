/// Core data model: closed noun/verb tag enumerations, the two-file
/// entity records, the statistics document, and vector rules.
///
/// Persisted layouts are canonical JSON (camelCase keys). The vector
/// record doubles as the HNSW node: connections are keyed by level
/// ("0", "1", ...) and reference entity ids.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Result, SomaError};

/// Embedding dimension. Every stored vector has exactly this length.
pub const EMBEDDING_DIM: usize = 384;

/// Tolerance for treating an incoming vector as already unit-normalized.
pub const NORM_TOLERANCE: f32 = 1e-2;

/// Version of the closed tag enumerations below.
pub const TAG_SCHEMA_VERSION: u32 = 1;

macro_rules! closed_tag_enum {
    ($(#[$meta:meta])* $name:ident, $all:ident, $kind:literal, [$($variant:ident),+ $(,)?]) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        pub const $all: &[$name] = &[$($name::$variant),+];

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => stringify!($variant)),+
                }
            }

            /// Validates a tag at the storage boundary. Unknown tags are
            /// rejected, never coerced.
            pub fn parse(s: &str) -> Result<Self> {
                match s {
                    $(stringify!($variant) => Ok($name::$variant),)+
                    other => Err(SomaError::invalid(format!(
                        concat!("unknown ", $kind, " type: {}"),
                        other
                    ))),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

closed_tag_enum!(
    /// Closed set of entity type tags.
    NounType,
    ALL_NOUN_TYPES,
    "noun",
    [
        Person,
        Organization,
        Location,
        Event,
        Concept,
        Document,
        Message,
        Task,
        Project,
        Topic,
        Product,
        Service,
        Team,
        Meeting,
        Note,
        File,
        Media,
        Article,
        Author,
        Tool,
        Skill,
        Goal,
        Question,
        Answer,
        Process,
        Resource,
        Dataset,
        Model,
        Session,
        Thing,
    ]
);

closed_tag_enum!(
    /// Closed set of relationship type tags.
    VerbType,
    ALL_VERB_TYPES,
    "verb",
    [
        RelatedTo,
        WorksWith,
        Knows,
        Manages,
        ReportsTo,
        MemberOf,
        HasMember,
        PartOf,
        Contains,
        LocatedAt,
        Precedes,
        Follows,
        Causes,
        CausedBy,
        DependsOn,
        RequiredBy,
        References,
        ReferencedBy,
        Mentions,
        MentionedBy,
        Creates,
        CreatedBy,
        Owns,
        OwnedBy,
        Uses,
        UsedBy,
        Produces,
        ProducedBy,
        DerivedFrom,
        Supersedes,
        Implements,
        InstanceOf,
        TypeOf,
        SimilarTo,
        Supports,
        Opposes,
        Describes,
        DescribedBy,
        Attends,
        Influences,
    ]
);

/// HNSW connections keyed by level. JSON keys are the decimal level
/// ("0", "1", ...); BTreeMap keeps serialization order stable.
pub type Connections = BTreeMap<String, Vec<Uuid>>;

/// Noun vector record: one JSON object per entity under
/// `entities/nouns/hnsw/<shard>/<uuid>.json`. This is the HNSW node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NounVectorRecord {
    pub id: Uuid,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub connections: Connections,
    #[serde(default)]
    pub level: usize,
}

/// Verb vector record under `entities/verbs/hnsw/<shard>/<uuid>.json`.
/// Carries the denormalized endpoints so graph repair never needs the
/// metadata file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerbVectorRecord {
    pub id: Uuid,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub connections: Connections,
    pub verb: VerbType,
    pub source_id: Uuid,
    pub target_id: Uuid,
}

/// Noun metadata record. Reserved fields live at the top level; user
/// fields ride the flattened map and are stripped back out on reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NounMetadata {
    pub id: Uuid,
    pub noun: NounType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NounMetadata {
    pub fn new(id: Uuid, noun: NounType) -> Self {
        let now = Utc::now();
        Self {
            id,
            noun,
            created_at: now,
            updated_at: now,
            confidence: None,
            weight: None,
            service: None,
            created_by: None,
            data: None,
            extra: Map::new(),
        }
    }
}

/// Verb metadata record. `weight` is required and must be >= 0; the verb
/// type is denormalized here so count bumps never need a second read.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerbMetadata {
    pub id: Uuid,
    pub verb: VerbType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub weight: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl VerbMetadata {
    pub fn new(id: Uuid, verb: VerbType) -> Self {
        let now = Utc::now();
        Self {
            id,
            verb,
            created_at: now,
            updated_at: now,
            weight: 1.0,
            confidence: None,
            service: None,
            created_by: None,
            data: None,
            extra: Map::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.weight.is_finite() || self.weight < 0.0 {
            return Err(SomaError::invalid(format!(
                "verb weight must be >= 0, got {}",
                self.weight
            )));
        }
        Ok(())
    }
}

/// Reserved metadata field names, promoted to top level on reads and
/// stripped from user metadata on writes.
pub const RESERVED_FIELDS: &[&str] = &[
    "id",
    "noun",
    "verb",
    "createdAt",
    "updatedAt",
    "confidence",
    "weight",
    "service",
    "createdBy",
    "data",
];

/// Rejects user fields that collide with the reserved namespace or use
/// the underscore prefix kept for system keys.
pub fn validate_user_fields(extra: &Map<String, Value>) -> Result<()> {
    for key in extra.keys() {
        if key.starts_with('_') {
            return Err(SomaError::invalid(format!(
                "user metadata field {key:?} uses the reserved '_' prefix"
            )));
        }
        if RESERVED_FIELDS.contains(&key.as_str()) {
            return Err(SomaError::invalid(format!(
                "user metadata field {key:?} collides with a reserved field"
            )));
        }
    }
    Ok(())
}

/// Persisted statistics document at `_system/statistics.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsDocument {
    #[serde(default)]
    pub noun_count: BTreeMap<String, u64>,
    #[serde(default)]
    pub verb_count: BTreeMap<String, u64>,
    #[serde(default)]
    pub metadata_count: BTreeMap<String, u64>,
    #[serde(default)]
    pub hnsw_index_size: u64,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl StatisticsDocument {
    pub fn total_nouns(&self) -> u64 {
        self.noun_count.values().sum()
    }

    pub fn total_verbs(&self) -> u64 {
        self.verb_count.values().sum()
    }
}

/// Validates dimension and finiteness, then normalizes to unit length
/// unless already within tolerance. Zero-norm vectors are invalid.
pub fn normalize_vector(mut vector: Vec<f32>) -> Result<Vec<f32>> {
    if vector.len() != EMBEDDING_DIM {
        return Err(SomaError::invalid(format!(
            "vector dimension mismatch: expected {EMBEDDING_DIM}, got {}",
            vector.len()
        )));
    }
    let mut norm_sq = 0.0f64;
    for v in &vector {
        if !v.is_finite() {
            return Err(SomaError::invalid("vector contains a non-finite component"));
        }
        norm_sq += (*v as f64) * (*v as f64);
    }
    let norm = norm_sq.sqrt() as f32;
    if norm == 0.0 {
        return Err(SomaError::invalid("zero-norm vector"));
    }
    if (norm - 1.0).abs() > NORM_TOLERANCE {
        for v in &mut vector {
            *v /= norm;
        }
    }
    Ok(vector)
}

/// Cosine distance over unit vectors: 1 - dot(a, b).
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    1.0 - dot
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_sets_are_closed() {
        assert_eq!(ALL_NOUN_TYPES.len(), 30);
        assert_eq!(ALL_VERB_TYPES.len(), 40);
        assert_eq!(NounType::parse("Person").unwrap(), NounType::Person);
        assert_eq!(VerbType::parse("WorksWith").unwrap(), VerbType::WorksWith);
        assert!(NounType::parse("Wizard").is_err());
        assert!(VerbType::parse("FightsWith").is_err());
    }

    #[test]
    fn test_vector_record_layout() {
        let id = Uuid::new_v4();
        let mut connections = Connections::new();
        connections.insert("0".into(), vec![id]);
        let record = NounVectorRecord {
            id,
            vector: vec![0.0; EMBEDDING_DIM],
            connections,
            level: 2,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("connections").unwrap().get("0").is_some());
        assert_eq!(json.get("level").unwrap(), 2);
    }

    #[test]
    fn test_metadata_reserved_and_user_fields() {
        let mut meta = NounMetadata::new(Uuid::new_v4(), NounType::Person);
        meta.extra.insert("name".into(), Value::String("Ada".into()));
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json.get("noun").unwrap(), "Person");
        assert_eq!(json.get("name").unwrap(), "Ada");

        let mut bad = Map::new();
        bad.insert("noun".into(), Value::String("x".into()));
        assert!(validate_user_fields(&bad).is_err());
        let mut underscored = Map::new();
        underscored.insert("_hidden".into(), Value::Null);
        assert!(validate_user_fields(&underscored).is_err());
    }

    #[test]
    fn test_normalize_rejects_zero_and_wrong_dim() {
        assert!(normalize_vector(vec![0.0; EMBEDDING_DIM]).is_err());
        assert!(normalize_vector(vec![1.0; 10]).is_err());
    }

    #[test]
    fn test_normalize_unit_output() {
        let mut v = vec![0.0; EMBEDDING_DIM];
        v[0] = 3.0;
        v[1] = 4.0;
        let n = normalize_vector(v).unwrap();
        let norm: f32 = n.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!((n[0] - 0.6).abs() < 1e-6);
        assert!((n[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_verb_weight_validation() {
        let mut meta = VerbMetadata::new(Uuid::new_v4(), VerbType::PartOf);
        assert!(meta.validate().is_ok());
        meta.weight = -0.1;
        assert!(meta.validate().is_err());
    }
}
