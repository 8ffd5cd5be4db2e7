/// Vector search at population scale: nearest-neighbor retrieval over a
/// thousand random unit vectors.
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Map};
use soma_storage::{
    HashingEmbedder, HnswParams, MemoryAdapter, NounDraft, NounType, QueryInput, Soma, SomaConfig,
    EMBEDDING_DIM,
};
use uuid::Uuid;

fn random_unit_vector(rng: &mut StdRng) -> Vec<f32> {
    let mut v: Vec<f32> = (0..EMBEDDING_DIM).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    for x in &mut v {
        *x /= norm;
    }
    v
}

#[tokio::test]
async fn test_search_retrieves_nearest_among_thousand() {
    let soma = Soma::open(
        Arc::new(MemoryAdapter::new()),
        Arc::new(HashingEmbedder),
        SomaConfig {
            // Construction width trimmed for test runtime; recall for an
            // exact-match query is unaffected.
            hnsw: HnswParams {
                ef_construction: 100,
                ..Default::default()
            },
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let mut rng = StdRng::seed_from_u64(42);
    let mut ids: Vec<Uuid> = Vec::with_capacity(1000);
    let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(1000);
    for i in 0..1000usize {
        let vector = random_unit_vector(&mut rng);
        let mut metadata = Map::new();
        metadata.insert("i".into(), json!(i));
        let id = soma
            .add(NounDraft {
                noun: Some(NounType::Concept),
                vector: Some(vector.clone()),
                metadata,
                ..Default::default()
            })
            .await
            .unwrap();
        ids.push(id);
        vectors.push(vector);
    }

    // k = 1: the stored vector itself comes back with near-perfect score.
    let hits = soma
        .search(QueryInput::Vector(vectors[500].clone()), 1)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, ids[500]);
    assert!(hits[0].score >= 0.999, "score was {}", hits[0].score);
    assert_eq!(hits[0].metadata.extra.get("i").unwrap(), 500);

    // k = 10: rank 1 is still the exact match, scores descend.
    let hits = soma
        .search(QueryInput::Vector(vectors[500].clone()), 10)
        .await
        .unwrap();
    assert_eq!(hits.len(), 10);
    assert_eq!(hits[0].id, ids[500]);
    for pair in hits.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
}

#[tokio::test]
async fn test_search_by_text_is_consistent() {
    let soma = Soma::open(
        Arc::new(MemoryAdapter::new()),
        Arc::new(HashingEmbedder),
        SomaConfig::default(),
    )
    .await
    .unwrap();

    let id = soma
        .add(NounDraft {
            noun: Some(NounType::Message),
            text: Some("the write-ahead log rotated at fifty megabytes".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    for filler in ["completely unrelated gardening advice", "a recipe for bread"] {
        soma.add(NounDraft {
            noun: Some(NounType::Message),
            text: Some(filler.into()),
            ..Default::default()
        })
        .await
        .unwrap();
    }

    let hits = soma
        .search(
            QueryInput::Text("the write-ahead log rotated at fifty megabytes".into()),
            3,
        )
        .await
        .unwrap();
    assert_eq!(hits[0].id, id);
    assert!(hits[0].score > hits[1].score);
}
