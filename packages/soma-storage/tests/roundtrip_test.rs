/// End-to-end round-trips through the full engine over the in-memory
/// and filesystem adapters.
use std::sync::Arc;

use serde_json::{json, Map, Value};
use soma_storage::{
    HashingEmbedder, MemoryAdapter, Noun, NounDraft, NounType, QueryInput, Soma, SomaConfig,
    SomaError, StorageAdapter, EMBEDDING_DIM,
};
use uuid::Uuid;

async fn open_memory() -> Arc<Soma> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Soma::open(
        Arc::new(MemoryAdapter::new()),
        Arc::new(HashingEmbedder),
        SomaConfig::default(),
    )
    .await
    .unwrap()
}

fn axis_vector(axis: usize) -> Vec<f32> {
    let mut v = vec![0.0; EMBEDDING_DIM];
    v[axis] = 1.0;
    v
}

#[tokio::test]
async fn test_single_entity_roundtrip() {
    let soma = open_memory().await;
    let id: Uuid = "3fa85f64-5717-4562-b3fc-2c963f66afa6".parse().unwrap();

    let mut metadata = Map::new();
    metadata.insert("name".into(), Value::String("Ada".into()));
    let assigned = soma
        .add(NounDraft {
            id: Some(id),
            noun: Some(NounType::Person),
            vector: Some(axis_vector(0)),
            metadata,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(assigned, id);

    let noun: Noun = soma.get_noun(id).await.unwrap().unwrap();
    assert_eq!(noun.metadata.extra.get("name").unwrap(), "Ada");
    assert_eq!(noun.metadata.noun, NounType::Person);

    // Vector survives within a ULP of the normalized input.
    let diff: f32 = noun
        .vector
        .iter()
        .zip(axis_vector(0).iter())
        .map(|(a, b)| (a - b) * (a - b))
        .sum::<f32>()
        .sqrt();
    assert!(diff < 1e-6, "vector drifted by {diff}");

    assert_eq!(soma.statistics().noun_count.get("Person"), Some(&1));
}

#[tokio::test]
async fn test_roundtrip_on_filesystem_adapter() {
    let dir = tempfile::TempDir::new().unwrap();
    let adapter: Arc<dyn StorageAdapter> =
        Arc::new(soma_storage::FilesystemAdapter::new(dir.path()));
    let soma = Soma::open(
        Arc::clone(&adapter),
        Arc::new(HashingEmbedder),
        SomaConfig::default(),
    )
    .await
    .unwrap();

    let id = soma
        .add(NounDraft {
            noun: Some(NounType::Document),
            text: Some("storage engines and their layouts".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    soma.shutdown().await.unwrap();

    // A second open over the same directory sees the entity and serves
    // vector search for it.
    let reopened = Soma::open(adapter, Arc::new(HashingEmbedder), SomaConfig::default())
        .await
        .unwrap();
    let noun = reopened.get_noun(id).await.unwrap().unwrap();
    assert_eq!(noun.metadata.noun, NounType::Document);
    let hits = reopened
        .search(
            QueryInput::Text("storage engines and their layouts".into()),
            1,
        )
        .await
        .unwrap();
    assert_eq!(hits[0].id, id);
}

#[tokio::test]
async fn test_zero_norm_vector_rejected() {
    let soma = open_memory().await;
    let err = soma
        .add(NounDraft {
            noun: Some(NounType::Concept),
            vector: Some(vec![0.0; EMBEDDING_DIM]),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SomaError::Invalid(_)));
}

#[tokio::test]
async fn test_empty_store_search_returns_empty() {
    let soma = open_memory().await;
    let hits = soma
        .search(QueryInput::Vector(axis_vector(1)), 5)
        .await
        .unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn test_k_larger_than_population() {
    let soma = open_memory().await;
    for axis in 0..3 {
        soma.add(NounDraft {
            noun: Some(NounType::Concept),
            vector: Some(axis_vector(axis)),
            ..Default::default()
        })
        .await
        .unwrap();
    }
    let hits = soma
        .search(QueryInput::Vector(axis_vector(0)), 50)
        .await
        .unwrap();
    assert_eq!(hits.len(), 3);
}

#[tokio::test]
async fn test_delete_removes_everything() {
    let soma = open_memory().await;
    let id = soma
        .add(NounDraft {
            noun: Some(NounType::Task),
            vector: Some(axis_vector(2)),
            ..Default::default()
        })
        .await
        .unwrap();
    soma.delete_noun(id).await.unwrap();

    assert!(soma.get_noun(id).await.unwrap().is_none());
    assert_eq!(soma.statistics().noun_count.get("Task"), Some(&0));
    let hits = soma
        .search(QueryInput::Vector(axis_vector(2)), 5)
        .await
        .unwrap();
    assert!(hits.iter().all(|h| h.id != id));
}

#[tokio::test]
async fn test_metadata_update_and_reserved_promotion() {
    let soma = open_memory().await;
    let mut metadata = Map::new();
    metadata.insert("city".into(), json!("London"));
    let id = soma
        .add(NounDraft {
            noun: Some(NounType::Person),
            vector: Some(axis_vector(3)),
            metadata,
            ..Default::default()
        })
        .await
        .unwrap();

    let mut patch = Map::new();
    patch.insert("city".into(), json!("Cambridge"));
    patch.insert("confidence".into(), json!(0.75));
    let updated = soma.update_noun_metadata(id, patch).await.unwrap();
    assert_eq!(updated.extra.get("city").unwrap(), "Cambridge");
    assert_eq!(updated.confidence, Some(0.75));

    // Reserved fields never leak into user metadata.
    assert!(!updated.extra.contains_key("confidence"));
    assert!(!updated.extra.contains_key("noun"));
}

#[tokio::test]
async fn test_batch_reports_per_item_outcomes() {
    let soma = open_memory().await;
    let results = soma
        .add_batch(vec![
            NounDraft {
                noun: Some(NounType::Note),
                vector: Some(axis_vector(4)),
                ..Default::default()
            },
            // Invalid: no content at all.
            NounDraft {
                noun: Some(NounType::Note),
                ..Default::default()
            },
            NounDraft {
                noun: Some(NounType::Note),
                vector: Some(axis_vector(5)),
                ..Default::default()
            },
        ])
        .await;
    assert!(results[0].is_ok());
    assert!(results[1].is_err());
    assert!(results[2].is_ok());
    assert_eq!(soma.statistics().noun_count.get("Note"), Some(&2));
}
