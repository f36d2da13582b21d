//! The Insight store: document identity, metadata projection, and the
//! upsert/delete/query operations over an embedding provider and a
//! vector index.
//!
//! | Operation | Behavior |
//! |-----------|----------|
//! | [`upsert`](InsightStore::upsert) | Normalize → embed → write; empty content is an error |
//! | [`delete`](InsightStore::delete) | Remove by path; returns whether the document existed |
//! | [`query`](InsightStore::query) | Embed query, filter by similarity threshold |
//! | [`clear`](InsightStore::clear) | Drop and recreate the backing collection |
//! | [`count`](InsightStore::count) | Number of indexed documents |
//!
//! Documents are keyed by the SHA-256 of their vault-relative path, so
//! re-indexing the same note replaces its record in place. The *original*
//! body text is stored in the index; only the embedding sees the
//! normalized form.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::embedding::Embedder;
use crate::error::{StoreError, StoreResult};
use crate::note::{normalize_content, ParsedNote};
use crate::vector::VectorIndex;

/// Stable document id: first 16 hex chars of SHA-256 over the
/// vault-relative path.
pub fn insight_id(relative_path: &str) -> String {
    let digest = Sha256::digest(relative_path.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}

/// A query hit, ordered most-similar-first. Also accepted back over the
/// API as input to question generation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RetrievedInsight {
    #[serde(default)]
    pub id: String,
    pub path: String,
    pub content: String,
    /// Cosine similarity in `[0, 1]`-ish space, rounded to 4 decimals.
    pub similarity: f32,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Project frontmatter onto the scalar metadata schema the index stores.
///
/// Exactly four keys, all strings: `path`, `type` (default `"insight"`),
/// `confidence` (default empty), `created` (default empty). Non-string
/// frontmatter values are coerced to their display form.
pub fn project_metadata(
    relative_path: &str,
    frontmatter: &BTreeMap<String, serde_json::Value>,
) -> HashMap<String, String> {
    let scalar = |key: &str, default: &str| -> String {
        match frontmatter.get(key) {
            None | Some(serde_json::Value::Null) => default.to_string(),
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    };

    HashMap::from([
        ("path".to_string(), relative_path.to_string()),
        ("type".to_string(), scalar("type", "insight")),
        ("confidence".to_string(), scalar("confidence", "")),
        ("created".to_string(), scalar("created", "")),
    ])
}

fn round4(value: f32) -> f32 {
    (value * 10_000.0).round() / 10_000.0
}

/// Store facade over an [`Embedder`] and a [`VectorIndex`].
///
/// Both collaborators are injected, so tests run against a deterministic
/// embedder and the in-memory index.
pub struct InsightStore {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
}

impl InsightStore {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>) -> Self {
        Self { embedder, index }
    }

    /// Insert or replace one note in the index. Returns the document id.
    ///
    /// Content that normalizes to the empty string is rejected with
    /// [`StoreError::EmptyContent`] and nothing is written.
    pub async fn upsert(&self, relative_path: &str, note: &ParsedNote) -> StoreResult<String> {
        let normalized = normalize_content(&note.content);
        if normalized.is_empty() {
            return Err(StoreError::EmptyContent {
                path: relative_path.to_string(),
            });
        }

        let embedding =
            self.embedder
                .embed(&normalized)
                .await
                .map_err(|source| StoreError::Embedding {
                    path: relative_path.to_string(),
                    source,
                })?;

        let id = insight_id(relative_path);
        let metadata = project_metadata(relative_path, &note.frontmatter);

        self.index
            .upsert(&id, &embedding, &note.content, &metadata)
            .await
            .map_err(|source| StoreError::Index {
                op: "upsert",
                source,
            })?;

        info!(path = relative_path, id = %id, "indexed insight");
        Ok(id)
    }

    /// Remove one note by path. Returns `true` if a record was removed,
    /// `false` if the path was not indexed.
    pub async fn delete(&self, relative_path: &str) -> StoreResult<bool> {
        let id = insight_id(relative_path);

        let existing = self
            .index
            .get(&id)
            .await
            .map_err(|source| StoreError::Index { op: "get", source })?;
        if existing.is_none() {
            debug!(path = relative_path, "delete for unindexed path");
            return Ok(false);
        }

        self.index
            .delete(&id)
            .await
            .map_err(|source| StoreError::Index {
                op: "delete",
                source,
            })?;

        info!(path = relative_path, id = %id, "removed insight");
        Ok(true)
    }

    /// Semantic retrieval: normalize and embed the query text, then
    /// return up to `top_k` hits at or above `min_similarity`, most
    /// similar first.
    ///
    /// An empty index short-circuits to an empty result without calling
    /// the embedding provider. Bounds on `top_k` (1..=10) and
    /// `min_similarity` (0..=1) are the caller's contract; the store
    /// does not re-validate them.
    pub async fn query(
        &self,
        text: &str,
        top_k: usize,
        min_similarity: f32,
    ) -> StoreResult<Vec<RetrievedInsight>> {
        let indexed = self.count().await?;
        if indexed == 0 {
            return Ok(Vec::new());
        }

        let embedding = self
            .embedder
            .embed(&normalize_content(text))
            .await
            .map_err(|source| StoreError::Embedding {
                path: String::new(),
                source,
            })?;

        let matches = self
            .index
            .query(&embedding, top_k)
            .await
            .map_err(|source| StoreError::Index {
                op: "query",
                source,
            })?;

        let results = matches
            .into_iter()
            .filter_map(|m| {
                let similarity = round4(1.0 - m.distance);
                if similarity < min_similarity {
                    return None;
                }
                let path = m.metadata.get("path").cloned().unwrap_or_default();
                Some(RetrievedInsight {
                    id: m.id,
                    path,
                    content: m.document,
                    similarity,
                    metadata: m.metadata,
                })
            })
            .collect();

        Ok(results)
    }

    /// Drop every indexed document and recreate the collection.
    pub async fn clear(&self) -> StoreResult<()> {
        self.index
            .reset()
            .await
            .map_err(|source| StoreError::Index {
                op: "reset",
                source,
            })
    }

    pub async fn count(&self) -> StoreResult<usize> {
        self.index
            .count()
            .await
            .map_err(|source| StoreError::Index {
                op: "count",
                source,
            })
    }
}
