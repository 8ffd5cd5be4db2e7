/// Version index dedup, snapshot commits, and time-travel reads.
use std::sync::Arc;

use serde_json::{json, Map};
use soma_storage::{
    HashingEmbedder, MemoryAdapter, NounDraft, NounType, Soma, SomaConfig, VersionOptions,
    EMBEDDING_DIM,
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

async fn add_person(soma: &Soma, name: &str, axis: usize) -> Uuid {
    let mut metadata = Map::new();
    metadata.insert("name".into(), json!(name));
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
async fn test_version_dedup_and_listing_order() {
    let soma = open_memory().await;
    let entity = add_person(&soma, "Ada", 0).await;

    let content_one = json!({"name": "Ada", "role": "analyst"});
    let content_two = json!({"name": "Ada", "role": "countess"});

    let v1 = soma
        .save_version(entity, &content_one, VersionOptions::default())
        .await
        .unwrap();
    // Identical content: deduplicated, same version back.
    let again = soma
        .save_version(entity, &content_one, VersionOptions::default())
        .await
        .unwrap();
    assert_eq!(again.version, v1.version);

    let v2 = soma
        .save_version(entity, &content_two, VersionOptions::default())
        .await
        .unwrap();
    assert_eq!(v2.version, 2);

    let versions = soma.list_versions(entity).await.unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].version, 2);
    assert_eq!(versions[1].version, 1);

    // Versions never leak into entity listings.
    let nouns = soma.get_nouns(None, &Default::default()).await.unwrap();
    assert_eq!(nouns.items.len(), 1);

    let (_, content) = soma.get_version(entity, 1).await.unwrap().unwrap();
    assert_eq!(content, content_one);
}

#[tokio::test]
async fn test_snapshot_commit_and_time_travel() -> anyhow::Result<()> {
    let soma = open_memory().await;
    let ada = add_person(&soma, "Ada", 0).await;

    let first = soma.commit_snapshot("tester", Some("first")).await?;

    // Mutate after the snapshot.
    let mut patch = Map::new();
    patch.insert("name".into(), json!("Lovelace"));
    soma.update_noun_metadata(ada, patch).await?;
    let grace = add_person(&soma, "Grace", 1).await;
    let second = soma.commit_snapshot("tester", Some("second")).await?;
    assert_ne!(first, second);

    // The first snapshot still serves the old name and no Grace.
    let old = soma.get_noun_at(ada, &first).await?.unwrap();
    assert_eq!(old.metadata.extra.get("name").unwrap(), "Ada");
    assert!(soma.get_noun_at(grace, &first).await?.is_none());

    // HEAD serves the newest state.
    let new = soma.get_noun_at(ada, "HEAD").await?.unwrap();
    assert_eq!(new.metadata.extra.get("name").unwrap(), "Lovelace");

    // The chain walks newest-first from HEAD.
    let head = soma.history().resolve("HEAD").await?;
    assert_eq!(head, second);
    let log = soma.history().walk(&head, &Default::default()).await?;
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].hash, second);
    assert_eq!(log[1].hash, first);
    Ok(())
}

#[tokio::test]
async fn test_branches_and_tags() {
    let soma = open_memory().await;
    add_person(&soma, "Ada", 0).await;
    let first = soma.commit_snapshot("tester", None).await.unwrap();

    soma.create_branch("experiment", None).await.unwrap();
    soma.create_tag("v1", &first).await.unwrap();

    let refs = soma.list_refs().await.unwrap();
    let names: Vec<&str> = refs.iter().map(|r| r.name.as_str()).collect();
    assert!(names.contains(&"main"));
    assert!(names.contains(&"experiment"));
    assert!(names.contains(&"v1"));

    // Checkout moves HEAD; deleting the checked-out branch is refused.
    soma.checkout("experiment").await.unwrap();
    assert!(soma.delete_branch("experiment").await.is_err());
    soma.checkout("main").await.unwrap();
    soma.delete_branch("experiment").await.unwrap();
}

#[tokio::test]
async fn test_commit_metadata_and_ancestry() -> anyhow::Result<()> {
    let soma = open_memory().await;
    add_person(&soma, "Ada", 0).await;
    let first = soma.commit_snapshot("tester", Some("one")).await?;
    add_person(&soma, "Grace", 1).await;
    let second = soma.commit_snapshot("tester", Some("two")).await?;

    assert!(soma.history().is_ancestor(&first, &second).await?);
    assert_eq!(
        soma.history().count_between(&first, &second).await?,
        Some(1)
    );
    assert_eq!(
        soma.history().find_common_ancestor(&first, &second).await?,
        Some(first)
    );
    Ok(())
}
