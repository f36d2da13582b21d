//! End-to-end tests over the library surface: vault on disk → watcher /
//! reindex → in-memory index → retrieval.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;

use insight_server::embedding::Embedder;
use insight_server::store::{insight_id, InsightStore};
use insight_server::sync::reindex_vault;
use insight_server::vector::{MemoryIndex, VectorIndex};
use insight_server::watcher::VaultWatcher;

/// Deterministic embedder: byte-histogram vector, normalized. Similar
/// texts land close, dissimilar texts far.
struct HashEmbedder;

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = [0.0f32; 16];
        for b in text.bytes() {
            v[(b % 16) as usize] += 1.0;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1.0);
        Ok(v.iter().map(|x| x / norm).collect())
    }
}

fn make_store() -> (Arc<InsightStore>, Arc<MemoryIndex>) {
    let index = Arc::new(MemoryIndex::new());
    let store = Arc::new(InsightStore::new(
        Arc::new(HashEmbedder),
        index.clone() as Arc<dyn VectorIndex>,
    ));
    (store, index)
}

fn write_insight(vault: &Path, name: &str, content: &str) {
    let path = vault.join("Insights").join(name);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

async fn wait_for_count(store: &InsightStore, expected: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if store.count().await.unwrap() == expected {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "index never reached {expected} documents"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn reindex_then_query_finds_the_relevant_insight() {
    let tmp = tempfile::TempDir::new().unwrap();
    let vault = tmp.path();

    write_insight(
        vault,
        "speed.md",
        "---\ntype: insight\nconfidence: high\n---\nSpeed of iteration beats perfection.\n",
    );
    write_insight(vault, "depth.md", "Depth of attention compounds over years.\n");

    let (store, _) = make_store();
    let report = reindex_vault(&store, vault).await.unwrap();
    assert_eq!(report.indexed_count, 2);
    assert!(report.errors.is_empty());

    let results = store
        .query("Speed of iteration beats perfection.", 5, 0.0)
        .await
        .unwrap();
    assert_eq!(results[0].path, "Insights/speed.md");
    assert!((results[0].similarity - 1.0).abs() < 1e-3);
    assert_eq!(results[0].metadata["type"], "insight");
    assert_eq!(results[0].metadata["confidence"], "high");
    // The stored document is the body as written, frontmatter stripped
    assert_eq!(results[0].content, "Speed of iteration beats perfection.\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn watcher_keeps_index_in_step_with_the_vault() {
    let tmp = tempfile::TempDir::new().unwrap();
    let vault = tmp.path().to_path_buf();
    let (store, index) = make_store();

    let mut watcher = VaultWatcher::new(store.clone(), vault.clone(), Duration::from_millis(50));
    watcher.start().unwrap();

    // Create
    write_insight(&vault, "a.md", "First thought.\n");
    wait_for_count(&store, 1).await;

    // Rewrite the same note: still one record, new content
    write_insight(&vault, "a.md", "First thought, sharpened.\n");
    let id = insight_id("Insights/a.md");
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let record = index.get(&id).await.unwrap().unwrap();
        if record.document.contains("sharpened") {
            break;
        }
        assert!(Instant::now() < deadline, "rewrite never reached the index");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(store.count().await.unwrap(), 1);

    // Delete
    std::fs::remove_file(vault.join("Insights/a.md")).unwrap();
    wait_for_count(&store, 0).await;

    watcher.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn non_insight_files_are_ignored_by_the_watcher() {
    let tmp = tempfile::TempDir::new().unwrap();
    let vault = tmp.path().to_path_buf();
    let (store, _) = make_store();

    let mut watcher = VaultWatcher::new(store.clone(), vault.clone(), Duration::from_millis(50));
    watcher.start().unwrap();

    std::fs::create_dir_all(vault.join("Questions")).unwrap();
    std::fs::write(vault.join("Questions/why.md"), "A question note.\n").unwrap();
    std::fs::write(vault.join("Insights/diagram.png"), [0u8; 4]).unwrap();
    write_insight(&vault, "real.md", "The only indexable file here.\n");

    wait_for_count(&store, 1).await;
    // Give stray events a chance to land wrongly
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(store.count().await.unwrap(), 1);

    watcher.stop();
}

#[tokio::test]
async fn query_results_respect_threshold_and_top_k() {
    let tmp = tempfile::TempDir::new().unwrap();
    let vault = tmp.path();

    for i in 0..4 {
        write_insight(
            vault,
            &format!("note-{i}.md"),
            &format!("Observation number {i} about attention and focus.\n"),
        );
    }

    let (store, _) = make_store();
    reindex_vault(&store, vault).await.unwrap();

    let all = store
        .query("Observation number 0 about attention and focus.", 10, 0.0)
        .await
        .unwrap();
    assert_eq!(all.len(), 4);
    for pair in all.windows(2) {
        assert!(pair[0].similarity >= pair[1].similarity);
    }

    let limited = store
        .query("Observation number 0 about attention and focus.", 2, 0.0)
        .await
        .unwrap();
    assert_eq!(limited.len(), 2);

    // Threshold of 1.0 keeps only the exact match
    let exact = store
        .query("Observation number 0 about attention and focus.", 10, 1.0)
        .await
        .unwrap();
    assert_eq!(exact.len(), 1);
    assert_eq!(exact[0].path, "Insights/note-0.md");
}

#[tokio::test]
async fn upserts_for_distinct_paths_share_the_index_safely() {
    let (store, _) = make_store();
    let mut handles = Vec::new();

    for i in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let note = insight_server::note::parse_note_text(&format!(
                "Concurrent insight number {i}.\n"
            ))
            .unwrap();
            store
                .upsert(&format!("Insights/c-{i}.md"), &note)
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(store.count().await.unwrap(), 8);
}

#[tokio::test]
async fn metadata_round_trips_through_the_index() {
    let (store, index) = make_store();
    let note = insight_server::note::parse_note_text(
        "---\ntype: decision\nconfidence: 0.8\ncreated: 2024-03-01\n---\nChose depth.\n",
    )
    .unwrap();

    let id = store.upsert("Insights/choice.md", &note).await.unwrap();
    let record = index.get(&id).await.unwrap().unwrap();

    let expected: HashMap<String, String> = HashMap::from([
        ("path".into(), "Insights/choice.md".into()),
        ("type".into(), "decision".into()),
        ("confidence".into(), "0.8".into()),
        ("created".into(), "2024-03-01".into()),
    ]);
    assert_eq!(record.metadata, expected);
}
