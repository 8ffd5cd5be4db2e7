/// Key routing: analyzes logical keys into physical object paths.
///
/// Entity ids (canonical hyphenated UUIDv4, case-insensitive) land under
/// `entities/{nouns|verbs}/{hnsw|metadata}/<shard>/<uuid>.json` where the
/// shard is the first two hex chars of the id. Everything else is a
/// system key under `_system/`; unknown formats are logged and routed
/// there too, never silently sharded.
use uuid::Uuid;

/// Singleton/system namespaces.
pub const SYSTEM_PREFIX: &str = "_system/";
pub const WAL_PREFIX: &str = "_wal/";
pub const OBJECTS_PREFIX: &str = "objects/";
pub const REFS_PREFIX: &str = "refs/";
pub const INDEXES_PREFIX: &str = "indexes/";

pub const STATISTICS_KEY: &str = "statistics";
pub const HNSW_META_KEY: &str = "indexes/hnsw_meta.json";
pub const DELETED_INDEX_KEY: &str = "indexes/deleted.json";

/// Logical key prefixes that always route to `_system/`.
pub const RESERVED_KEY_PREFIXES: &[&str] = &[
    "__system_",
    "__metadata_",
    "__index_",
    "__chunk__",
    "__sparse_index__",
    "statistics_",
    "statistics",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Noun,
    Verb,
}

impl EntityKind {
    pub fn dir(&self) -> &'static str {
        match self {
            EntityKind::Noun => "nouns",
            EntityKind::Verb => "verbs",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Hnsw,
    Metadata,
}

impl RecordKind {
    pub fn dir(&self) -> &'static str {
        match self {
            RecordKind::Hnsw => "hnsw",
            RecordKind::Metadata => "metadata",
        }
    }
}

/// Result of key analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRoute {
    pub is_entity: bool,
    pub shard_id: Option<String>,
    pub directory: String,
    pub full_path: String,
}

/// Two-hex-char shard of an entity id (`[0-9a-f]{2}`).
pub fn shard_of(id: &Uuid) -> String {
    let mut buf = Uuid::encode_buffer();
    let s = id.as_hyphenated().encode_lower(&mut buf);
    s[..2].to_string()
}

/// Parses a key as a canonical hyphenated UUID, case-insensitive.
/// Other UUID spellings (simple, braced, urn) are not entity keys.
pub fn parse_entity_id(key: &str) -> Option<Uuid> {
    if key.len() != 36 {
        return None;
    }
    let bytes = key.as_bytes();
    if bytes[8] != b'-' || bytes[13] != b'-' || bytes[18] != b'-' || bytes[23] != b'-' {
        return None;
    }
    Uuid::parse_str(key).ok()
}

/// Analyzes a logical key for a given entity/record kind.
pub fn analyze(key: &str, entity: EntityKind, record: RecordKind) -> KeyRoute {
    if let Some(id) = parse_entity_id(key) {
        let shard = shard_of(&id);
        let directory = format!("entities/{}/{}/{}", entity.dir(), record.dir(), shard);
        let full_path = format!("{}/{}.json", directory, id.as_hyphenated());
        return KeyRoute {
            is_entity: true,
            shard_id: Some(shard),
            directory,
            full_path,
        };
    }

    if !RESERVED_KEY_PREFIXES.iter().any(|p| key.starts_with(p)) {
        tracing::warn!(key, "unrecognized key format, routing to system namespace");
    }
    KeyRoute {
        is_entity: false,
        shard_id: None,
        directory: SYSTEM_PREFIX.trim_end_matches('/').to_string(),
        full_path: system_path(key),
    }
}

/// `_system/<key>.json` for a logical system key.
pub fn system_path(key: &str) -> String {
    format!("{SYSTEM_PREFIX}{key}.json")
}

pub fn entity_path(id: &Uuid, entity: EntityKind, record: RecordKind) -> String {
    format!(
        "entities/{}/{}/{}/{}.json",
        entity.dir(),
        record.dir(),
        shard_of(id),
        id.as_hyphenated()
    )
}

/// Listing prefix for one record directory across all shards.
pub fn entity_prefix(entity: EntityKind, record: RecordKind) -> String {
    format!("entities/{}/{}/", entity.dir(), record.dir())
}

/// Extracts the entity id from a routed entity path.
pub fn id_from_entity_path(path: &str) -> Option<Uuid> {
    let file = path.rsplit('/').next()?;
    let stem = file.strip_suffix(".json")?;
    parse_entity_id(stem)
}

/// COW object path: `objects/<hh>/<rest>.blob` for a hex content hash.
pub fn object_path(hash: &str) -> String {
    format!("{}{}/{}.blob", OBJECTS_PREFIX, &hash[..2], &hash[2..])
}

/// Version payload system key; routed to `_system/` and therefore
/// invisible to entity scans.
pub fn version_content_key(entity_id: &Uuid, content_hash: &str) -> String {
    format!("__system_version_{}_{}", entity_id.as_hyphenated(), content_hash)
}

/// Version index system key for one `(entity, branch)` pair.
pub fn version_index_key(entity_id: &Uuid, branch: &str) -> String {
    format!("__index_versions_{}_{}", entity_id.as_hyphenated(), branch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_routes_to_shard() {
        let key = "3fa85f64-5717-4562-b3fc-2c963f66afa6";
        let route = analyze(key, EntityKind::Noun, RecordKind::Metadata);
        assert!(route.is_entity);
        assert_eq!(route.shard_id.as_deref(), Some("3f"));
        assert_eq!(
            route.full_path,
            "entities/nouns/metadata/3f/3fa85f64-5717-4562-b3fc-2c963f66afa6.json"
        );
    }

    #[test]
    fn test_uppercase_uuid_is_entity() {
        let key = "3FA85F64-5717-4562-B3FC-2C963F66AFA6";
        let route = analyze(key, EntityKind::Verb, RecordKind::Hnsw);
        assert!(route.is_entity);
        // Shard is always lowercase hex.
        assert_eq!(route.shard_id.as_deref(), Some("3f"));
    }

    #[test]
    fn test_simple_form_uuid_is_not_entity() {
        let key = "3fa85f6457174562b3fc2c963f66afa6";
        let route = analyze(key, EntityKind::Noun, RecordKind::Metadata);
        assert!(!route.is_entity);
        assert_eq!(route.full_path, system_path(key));
    }

    #[test]
    fn test_reserved_prefixes_route_to_system() {
        for key in ["statistics", "__chunk__0042", "__sparse_index__nouns_Person"] {
            let route = analyze(key, EntityKind::Noun, RecordKind::Metadata);
            assert!(!route.is_entity);
            assert!(route.full_path.starts_with(SYSTEM_PREFIX));
        }
    }

    #[test]
    fn test_object_path_split() {
        let hash = "ab".to_string() + &"cd".repeat(31);
        let path = object_path(&hash);
        assert!(path.starts_with("objects/ab/"));
        assert!(path.ends_with(".blob"));
    }

    #[test]
    fn test_id_from_entity_path_roundtrip() {
        let id = Uuid::new_v4();
        let path = entity_path(&id, EntityKind::Noun, RecordKind::Hnsw);
        assert_eq!(id_from_entity_path(&path), Some(id));
    }
}
