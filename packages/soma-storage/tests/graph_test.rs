/// Graph traversal and composite query behavior.
use std::sync::Arc;

use serde_json::{json, Map, Value};
use soma_storage::{
    Boost, ConnectedAnchor, ConnectedClause, HashingEmbedder, MemoryAdapter, NounDraft, NounType,
    Predicate, Query, QueryInput, Soma, SomaConfig, VerbDraft, VerbFilter, VerbType, EMBEDDING_DIM,
};
use uuid::Uuid;

async fn open_memory() -> Arc<Soma> {
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

async fn person(soma: &Soma, name: &str, axis: usize) -> Uuid {
    let mut metadata = Map::new();
    metadata.insert("name".into(), Value::String(name.into()));
    soma.add(NounDraft {
        noun: Some(NounType::Person),
        vector: Some(axis_vector(axis)),
        metadata,
        ..Default::default()
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_two_hop_traversal() {
    let soma = open_memory().await;
    let a = person(&soma, "A", 0).await;
    let b = person(&soma, "B", 1).await;
    let c = person(&soma, "C", 2).await;

    soma.relate(VerbDraft {
        id: None,
        verb: VerbType::WorksWith,
        source: a,
        target: b,
        weight: None,
        metadata: Map::new(),
    })
    .await
    .unwrap();
    soma.relate(VerbDraft {
        id: None,
        verb: VerbType::WorksWith,
        source: b,
        target: c,
        weight: None,
        metadata: Map::new(),
    })
    .await
    .unwrap();

    let hits = soma
        .query(&Query {
            connected: Some(ConnectedClause {
                anchor: ConnectedAnchor::From(vec![a]),
                via: Some(vec![VerbType::WorksWith]),
                hops: 2,
            }),
            ..Default::default()
        })
        .await
        .unwrap();

    // {B, C}, ordered by hop count (closer first), then id.
    let ids: Vec<Uuid> = hits.iter().map(|h| h.id).collect();
    assert_eq!(ids, vec![b, c]);
    assert!(hits[0].score > hits[1].score);
}

#[tokio::test]
async fn test_hops_limit_and_via_filter() {
    let soma = open_memory().await;
    let a = person(&soma, "A", 0).await;
    let b = person(&soma, "B", 1).await;
    let c = person(&soma, "C", 2).await;

    soma.relate(VerbDraft {
        id: None,
        verb: VerbType::WorksWith,
        source: a,
        target: b,
        weight: None,
        metadata: Map::new(),
    })
    .await
    .unwrap();
    soma.relate(VerbDraft {
        id: None,
        verb: VerbType::Knows,
        source: b,
        target: c,
        weight: None,
        metadata: Map::new(),
    })
    .await
    .unwrap();

    // One hop only reaches B.
    let one_hop = soma
        .query(&Query {
            connected: Some(ConnectedClause {
                anchor: ConnectedAnchor::From(vec![a]),
                via: None,
                hops: 1,
            }),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(one_hop.len(), 1);
    assert_eq!(one_hop[0].id, b);

    // Two hops but restricted to WorksWith edges: C stays unreachable.
    let via_filtered = soma
        .query(&Query {
            connected: Some(ConnectedClause {
                anchor: ConnectedAnchor::From(vec![a]),
                via: Some(vec![VerbType::WorksWith]),
                hops: 2,
            }),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(via_filtered.len(), 1);
    assert_eq!(via_filtered[0].id, b);
}

#[tokio::test]
async fn test_incoming_direction() {
    let soma = open_memory().await;
    let a = person(&soma, "A", 0).await;
    let b = person(&soma, "B", 1).await;
    soma.relate(VerbDraft {
        id: None,
        verb: VerbType::ReportsTo,
        source: a,
        target: b,
        weight: None,
        metadata: Map::new(),
    })
    .await
    .unwrap();

    let to_b = soma
        .query(&Query {
            connected: Some(ConnectedClause {
                anchor: ConnectedAnchor::To(vec![b]),
                via: None,
                hops: 1,
            }),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(to_b.len(), 1);
    assert_eq!(to_b[0].id, a);
}

#[tokio::test]
async fn test_verb_fast_path_listings() {
    let soma = open_memory().await;
    let a = person(&soma, "A", 0).await;
    let b = person(&soma, "B", 1).await;
    let c = person(&soma, "C", 2).await;
    soma.relate(VerbDraft {
        id: None,
        verb: VerbType::WorksWith,
        source: a,
        target: b,
        weight: Some(0.5),
        metadata: Map::new(),
    })
    .await
    .unwrap();
    soma.relate(VerbDraft {
        id: None,
        verb: VerbType::Knows,
        source: a,
        target: c,
        weight: None,
        metadata: Map::new(),
    })
    .await
    .unwrap();

    let by_source = soma.get_verbs_by_source(a, &Default::default()).await.unwrap();
    assert_eq!(by_source.items.len(), 2);

    let by_type = soma
        .get_verbs_by_type(VerbType::Knows, &Default::default())
        .await
        .unwrap();
    assert_eq!(by_type.items.len(), 1);
    assert_eq!(by_type.items[0].verb, VerbType::Knows);

    let by_both = soma
        .get_verbs(
            Some(VerbFilter::BySourceAndType(a, VerbType::WorksWith)),
            &Default::default(),
        )
        .await
        .unwrap();
    assert_eq!(by_both.items.len(), 1);
    assert_eq!(by_both.items[0].weight, 0.5);

    let by_target = soma
        .get_verbs(Some(VerbFilter::ByTarget(b)), &Default::default())
        .await
        .unwrap();
    assert_eq!(by_target.items.len(), 1);
}

#[tokio::test]
async fn test_composite_like_where_connected() {
    let soma = open_memory().await;
    let a = person(&soma, "Ada", 0).await;
    let b = person(&soma, "Grace", 1).await;
    let c = person(&soma, "Alan", 2).await;
    // A concept connected to Ada should be excluded by the noun filter.
    let mut metadata = Map::new();
    metadata.insert("name".into(), json!("Computing"));
    let concept = soma
        .add(NounDraft {
            noun: Some(NounType::Concept),
            vector: Some(axis_vector(3)),
            metadata,
            ..Default::default()
        })
        .await
        .unwrap();

    for target in [b, c, concept] {
        soma.relate(VerbDraft {
            id: None,
            verb: VerbType::Knows,
            source: a,
            target,
            weight: None,
            metadata: Map::new(),
        })
        .await
        .unwrap();
    }

    let hits = soma
        .query(&Query {
            like: Some(QueryInput::Vector(axis_vector(1))),
            r#where: Some(Predicate::Eq("noun".into(), json!("Person"))),
            connected: Some(ConnectedClause {
                anchor: ConnectedAnchor::From(vec![a]),
                via: Some(vec![VerbType::Knows]),
                hops: 1,
            }),
            limit: Some(10),
            boost: Some(Boost {
                vector: 2.0,
                field: 1.0,
                graph: 1.0,
            }),
            ..Default::default()
        })
        .await
        .unwrap();

    let ids: Vec<Uuid> = hits.iter().map(|h| h.id).collect();
    assert!(ids.contains(&b));
    assert!(ids.contains(&c));
    assert!(!ids.contains(&concept));
    // The like-vector points at Grace; the boost makes her rank first.
    assert_eq!(hits[0].id, b);
}

#[tokio::test]
async fn test_dangling_verb_excluded_from_results() {
    let soma = open_memory().await;
    let a = person(&soma, "A", 0).await;
    let b = person(&soma, "B", 1).await;
    soma.relate(VerbDraft {
        id: None,
        verb: VerbType::Knows,
        source: a,
        target: b,
        weight: None,
        metadata: Map::new(),
    })
    .await
    .unwrap();
    // Deleting B leaves the verb dangling; traversal must not surface
    // the missing endpoint.
    soma.delete_noun(b).await.unwrap();

    let hits = soma
        .query(&Query {
            connected: Some(ConnectedClause {
                anchor: ConnectedAnchor::From(vec![a]),
                via: None,
                hops: 1,
            }),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(hits.is_empty());

    let report = soma.verify_store().await.unwrap();
    assert_eq!(report.dangling_verbs, 1);
}
