//! Synchronization between the vault filesystem and the vector index:
//! single-note mutations dispatched by the watcher, and the full vault
//! reindex.

use std::path::Path;

use anyhow::{bail, Result};
use walkdir::WalkDir;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::note::{parse_note, relative_path, INSIGHTS_FOLDER};
use crate::store::InsightStore;

/// What the index should do for a changed path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    Upsert,
    Delete,
}

/// Apply one watcher-dispatched mutation.
///
/// This is the watcher's error boundary: failures are logged and
/// swallowed so one bad note never stops the watch. A file that vanished
/// between the event and the dispatch is silently dropped.
pub async fn apply_mutation(store: &InsightStore, vault: &Path, path: &Path, mutation: Mutation) {
    let relative = relative_path(path, vault);

    match mutation {
        Mutation::Upsert => {
            if !path.exists() {
                debug!(path = %relative, "file vanished before indexing, skipping");
                return;
            }

            let note = match parse_note(path) {
                Ok(note) => note,
                Err(e) => {
                    warn!(path = %relative, error = %e, "failed to parse changed note");
                    return;
                }
            };

            match store.upsert(&relative, &note).await {
                Ok(_) => {}
                Err(StoreError::EmptyContent { .. }) => {
                    debug!(path = %relative, "changed note is empty, not indexed");
                }
                Err(e) => warn!(path = %relative, error = %e, "failed to index changed note"),
            }
        }
        Mutation::Delete => {
            if let Err(e) = store.delete(&relative).await {
                warn!(path = %relative, error = %e, "failed to remove deleted note");
            }
        }
    }
}

/// Outcome of a full vault reindex.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReindexReport {
    pub indexed_count: usize,
    /// One entry per document that failed, `"path: cause"`.
    pub errors: Vec<String>,
}

/// Re-index every markdown file under the vault's `Insights/` folder.
///
/// Upserts in place: document ids are path-derived, so existing records
/// are replaced rather than duplicated. Per-document failures
/// (unreadable, malformed frontmatter, empty content, provider errors)
/// are collected, not fatal; a missing `Insights/` folder is.
pub async fn reindex_vault(store: &InsightStore, vault: &Path) -> Result<ReindexReport> {
    let insights_dir = vault.join(INSIGHTS_FOLDER);
    if !insights_dir.is_dir() {
        bail!("Insights folder not found: {}", insights_dir.display());
    }

    let mut indexed_count = 0;
    let mut errors = Vec::new();

    for entry in WalkDir::new(&insights_dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.path().extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }

        let relative = relative_path(entry.path(), vault);

        let note = match parse_note(entry.path()) {
            Ok(note) => note,
            Err(e) => {
                errors.push(format!("{relative}: {e:#}"));
                continue;
            }
        };

        match store.upsert(&relative, &note).await {
            Ok(_) => indexed_count += 1,
            Err(e) => errors.push(format!("{relative}: {e}")),
        }
    }

    info!(
        indexed = indexed_count,
        failed = errors.len(),
        "vault reindex complete"
    );

    Ok(ReindexReport {
        indexed_count,
        errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::StubEmbedder;
    use crate::vector::MemoryIndex;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn store() -> Arc<InsightStore> {
        Arc::new(InsightStore::new(
            Arc::new(StubEmbedder::new()),
            Arc::new(MemoryIndex::new()),
        ))
    }

    fn vault_with_insights() -> tempfile::TempDir {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join(INSIGHTS_FOLDER)).unwrap();
        tmp
    }

    #[tokio::test]
    async fn reindex_counts_good_and_bad_notes() {
        let tmp = vault_with_insights();
        let insights = tmp.path().join(INSIGHTS_FOLDER);

        std::fs::write(insights.join("good.md"), "A perfectly fine note.\n").unwrap();
        std::fs::write(insights.join("bad.md"), "---\ntype: [unclosed\n---\nbody\n").unwrap();
        std::fs::write(insights.join("empty.md"), "   \n").unwrap();
        std::fs::write(insights.join("not-a-note.txt"), "ignored\n").unwrap();

        let store = store();
        let report = reindex_vault(&store, tmp.path()).await.unwrap();

        assert_eq!(report.indexed_count, 1);
        assert_eq!(report.errors.len(), 2);
        assert!(report.errors.iter().any(|e| e.contains("bad.md")));
        assert!(report.errors.iter().any(|e| e.contains("empty.md")));
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reindex_walks_nested_folders() {
        let tmp = vault_with_insights();
        let nested = tmp.path().join(INSIGHTS_FOLDER).join("2024/march");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("deep.md"), "Deeply filed.\n").unwrap();

        let store = store();
        let report = reindex_vault(&store, tmp.path()).await.unwrap();
        assert_eq!(report.indexed_count, 1);
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn reindex_replaces_rather_than_duplicates() {
        let tmp = vault_with_insights();
        let store = store();
        let path = tmp.path().join(INSIGHTS_FOLDER).join("a.md");
        std::fs::write(&path, "First pass.\n").unwrap();

        reindex_vault(&store, tmp.path()).await.unwrap();
        std::fs::write(&path, "Second pass, revised.\n").unwrap();
        let report = reindex_vault(&store, tmp.path()).await.unwrap();

        assert_eq!(report.indexed_count, 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reindex_requires_insights_folder() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = store();
        assert!(reindex_vault(&store, tmp.path()).await.is_err());
    }

    #[tokio::test]
    async fn apply_upsert_skips_vanished_file() {
        let tmp = vault_with_insights();
        let store = store();
        let ghost = tmp.path().join(INSIGHTS_FOLDER).join("ghost.md");

        apply_mutation(&store, tmp.path(), &ghost, Mutation::Upsert).await;
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn apply_upsert_and_delete_round_trip() {
        let tmp = vault_with_insights();
        let store = store();
        let path = tmp.path().join(INSIGHTS_FOLDER).join("a.md");
        std::fs::write(&path, "Worth remembering.\n").unwrap();

        apply_mutation(&store, tmp.path(), &path, Mutation::Upsert).await;
        assert_eq!(store.count().await.unwrap(), 1);

        apply_mutation(&store, tmp.path(), &path, Mutation::Delete).await;
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn apply_swallows_parse_failures() {
        let tmp = vault_with_insights();
        let store = store();
        let path = tmp.path().join(INSIGHTS_FOLDER).join("bad.md");
        std::fs::write(&path, "---\ntype: [unclosed\n---\nbody\n").unwrap();

        // Must not panic or propagate
        apply_mutation(&store, tmp.path(), &path, Mutation::Upsert).await;
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn apply_delete_of_unindexed_path_is_quiet() {
        let store = store();
        apply_mutation(
            &store,
            &PathBuf::from("/vault"),
            &PathBuf::from("/vault/Insights/never-indexed.md"),
            Mutation::Delete,
        )
        .await;
    }
}
