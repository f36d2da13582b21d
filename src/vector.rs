//! Vector index abstraction for Insight embeddings.
//!
//! The [`VectorIndex`] trait defines the storage operations the store
//! needs, enabling pluggable backends:
//! - **[`ChromaIndex`]** — HTTP client for a Chroma server (cosine space).
//! - **[`MemoryIndex`]** — brute-force in-memory index for tests.
//!
//! Distances are cosine distances in `[0, 2]`; the store converts them to
//! similarity via `1 - distance`. Implementations must tolerate concurrent
//! calls without external locking.

use std::collections::HashMap;
use std::sync::RwLock as StdRwLock;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::IndexConfig;

/// A stored record as returned by [`VectorIndex::get`].
#[derive(Debug, Clone)]
pub struct IndexedRecord {
    pub id: String,
    pub document: String,
    pub metadata: HashMap<String, String>,
}

/// A nearest-neighbor match from [`VectorIndex::query`], ordered
/// nearest-first by the backend.
#[derive(Debug, Clone)]
pub struct QueryMatch {
    pub id: String,
    /// Cosine distance in `[0, 2]`.
    pub distance: f32,
    pub document: String,
    pub metadata: HashMap<String, String>,
}

/// Abstract vector index backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](VectorIndex::upsert) | Insert or replace one record by id |
/// | [`delete`](VectorIndex::delete) | Remove a record (absent id is a no-op) |
/// | [`get`](VectorIndex::get) | Fetch a record by id |
/// | [`query`](VectorIndex::query) | Nearest-neighbor search by cosine distance |
/// | [`count`](VectorIndex::count) | Number of stored records |
/// | [`reset`](VectorIndex::reset) | Drop and recreate the backing collection |
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(
        &self,
        id: &str,
        embedding: &[f32],
        document: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<IndexedRecord>>;

    async fn query(&self, embedding: &[f32], top_k: usize) -> Result<Vec<QueryMatch>>;

    async fn count(&self) -> Result<usize>;

    async fn reset(&self) -> Result<()>;
}

// ============ Chroma HTTP backend ============

/// HTTP client for a Chroma collection configured for cosine space.
///
/// The collection is created on connect if absent (`get_or_create`), and
/// [`reset`](VectorIndex::reset) swaps in a freshly created collection id.
pub struct ChromaIndex {
    client: reqwest::Client,
    base_url: String,
    collection_name: String,
    collection_id: RwLock<String>,
}

impl ChromaIndex {
    /// Connect to the Chroma server and resolve the collection id.
    pub async fn connect(config: &IndexConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        let base_url = config.url.trim_end_matches('/').to_string();
        let collection_id =
            Self::get_or_create_collection(&client, &base_url, &config.collection).await?;

        let index = Self {
            client,
            base_url,
            collection_name: config.collection.clone(),
            collection_id: RwLock::new(collection_id),
        };

        let count = index.count().await.unwrap_or(0);
        info!(
            collection = %index.collection_name,
            documents = count,
            "connected to Chroma collection"
        );

        Ok(index)
    }

    async fn get_or_create_collection(
        client: &reqwest::Client,
        base_url: &str,
        name: &str,
    ) -> Result<String> {
        let body = serde_json::json!({
            "name": name,
            "metadata": { "hnsw:space": "cosine" },
            "get_or_create": true,
        });

        let response = client
            .post(format!("{base_url}/api/v1/collections"))
            .json(&body)
            .send()
            .await
            .context("Chroma connection failed (is the server running?)")?;

        let json = expect_success(response, "create collection").await?;
        json.get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid Chroma response: missing collection id"))
    }

    async fn collection_url(&self, suffix: &str) -> String {
        let id = self.collection_id.read().await;
        format!("{}/api/v1/collections/{}/{}", self.base_url, *id, suffix)
    }
}

/// Return the parsed JSON body of a successful response, or an error
/// carrying the status and body text.
async fn expect_success(response: reqwest::Response, op: &str) -> Result<serde_json::Value> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("Chroma {} error {}: {}", op, status, body);
    }
    response
        .json()
        .await
        .with_context(|| format!("Invalid Chroma {op} response"))
}

fn metadata_from_json(value: Option<&serde_json::Value>) -> HashMap<String, String> {
    let Some(obj) = value.and_then(|v| v.as_object()) else {
        return HashMap::new();
    };
    obj.iter()
        .map(|(k, v)| {
            let s = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), s)
        })
        .collect()
}

#[async_trait]
impl VectorIndex for ChromaIndex {
    async fn upsert(
        &self,
        id: &str,
        embedding: &[f32],
        document: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<()> {
        let body = serde_json::json!({
            "ids": [id],
            "embeddings": [embedding],
            "documents": [document],
            "metadatas": [metadata],
        });

        let response = self
            .client
            .post(self.collection_url("upsert").await)
            .json(&body)
            .send()
            .await?;
        expect_success(response, "upsert").await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let body = serde_json::json!({ "ids": [id] });
        let response = self
            .client
            .post(self.collection_url("delete").await)
            .json(&body)
            .send()
            .await?;
        expect_success(response, "delete").await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<IndexedRecord>> {
        let body = serde_json::json!({
            "ids": [id],
            "include": ["documents", "metadatas"],
        });

        let response = self
            .client
            .post(self.collection_url("get").await)
            .json(&body)
            .send()
            .await?;
        let json = expect_success(response, "get").await?;

        let ids = json.get("ids").and_then(|v| v.as_array());
        if ids.map(|a| a.is_empty()).unwrap_or(true) {
            return Ok(None);
        }

        let document = json
            .get("documents")
            .and_then(|v| v.as_array())
            .and_then(|a| a.first())
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let metadata = metadata_from_json(
            json.get("metadatas")
                .and_then(|v| v.as_array())
                .and_then(|a| a.first()),
        );

        Ok(Some(IndexedRecord {
            id: id.to_string(),
            document,
            metadata,
        }))
    }

    async fn query(&self, embedding: &[f32], top_k: usize) -> Result<Vec<QueryMatch>> {
        let body = serde_json::json!({
            "query_embeddings": [embedding],
            "n_results": top_k,
            "include": ["documents", "metadatas", "distances"],
        });

        let response = self
            .client
            .post(self.collection_url("query").await)
            .json(&body)
            .send()
            .await?;
        let json = expect_success(response, "query").await?;

        // Chroma nests one result list per query embedding
        let ids = json
            .get("ids")
            .and_then(|v| v.as_array())
            .and_then(|a| a.first())
            .and_then(|v| v.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid Chroma query response: missing ids"))?;
        let distances = json
            .get("distances")
            .and_then(|v| v.as_array())
            .and_then(|a| a.first())
            .and_then(|v| v.as_array());
        let documents = json
            .get("documents")
            .and_then(|v| v.as_array())
            .and_then(|a| a.first())
            .and_then(|v| v.as_array());
        let metadatas = json
            .get("metadatas")
            .and_then(|v| v.as_array())
            .and_then(|a| a.first())
            .and_then(|v| v.as_array());

        let mut matches = Vec::with_capacity(ids.len());
        for (i, id) in ids.iter().enumerate() {
            let id = id.as_str().unwrap_or_default().to_string();
            let distance = distances
                .and_then(|d| d.get(i))
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0) as f32;
            let document = documents
                .and_then(|d| d.get(i))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let metadata = metadata_from_json(metadatas.and_then(|m| m.get(i)));

            matches.push(QueryMatch {
                id,
                distance,
                document,
                metadata,
            });
        }

        Ok(matches)
    }

    async fn count(&self) -> Result<usize> {
        let response = self
            .client
            .get(self.collection_url("count").await)
            .send()
            .await?;
        let json = expect_success(response, "count").await?;
        json.as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| anyhow::anyhow!("Invalid Chroma count response"))
    }

    async fn reset(&self) -> Result<()> {
        let response = self
            .client
            .delete(format!(
                "{}/api/v1/collections/{}",
                self.base_url, self.collection_name
            ))
            .send()
            .await?;
        let status = response.status();
        // 404 is fine: dropping an already-absent collection
        if !status.is_success() && status.as_u16() != 404 {
            let body = response.text().await.unwrap_or_default();
            bail!("Chroma drop collection error {}: {}", status, body);
        }

        let new_id =
            Self::get_or_create_collection(&self.client, &self.base_url, &self.collection_name)
                .await?;
        *self.collection_id.write().await = new_id;
        Ok(())
    }
}

// ============ In-memory backend ============

struct MemoryRecord {
    embedding: Vec<f32>,
    document: String,
    metadata: HashMap<String, String>,
}

/// Brute-force in-memory index for tests.
///
/// Query is exact cosine distance over all stored vectors; all methods
/// return immediately-ready futures.
#[derive(Default)]
pub struct MemoryIndex {
    records: StdRwLock<HashMap<String, MemoryRecord>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a < f32::EPSILON || mag_b < f32::EPSILON {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn upsert(
        &self,
        id: &str,
        embedding: &[f32],
        document: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<()> {
        let mut records = self.records.write().unwrap();
        records.insert(
            id.to_string(),
            MemoryRecord {
                embedding: embedding.to_vec(),
                document: document.to_string(),
                metadata: metadata.clone(),
            },
        );
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.records.write().unwrap().remove(id);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<IndexedRecord>> {
        let records = self.records.read().unwrap();
        Ok(records.get(id).map(|r| IndexedRecord {
            id: id.to_string(),
            document: r.document.clone(),
            metadata: r.metadata.clone(),
        }))
    }

    async fn query(&self, embedding: &[f32], top_k: usize) -> Result<Vec<QueryMatch>> {
        let records = self.records.read().unwrap();
        let mut matches: Vec<QueryMatch> = records
            .iter()
            .map(|(id, r)| QueryMatch {
                id: id.clone(),
                distance: 1.0 - cosine_similarity(embedding, &r.embedding),
                document: r.document.clone(),
                metadata: r.metadata.clone(),
            })
            .collect();

        matches.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(top_k);
        Ok(matches)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.records.read().unwrap().len())
    }

    async fn reset(&self) -> Result<()> {
        self.records.write().unwrap().clear();
        Ok(())
    }
}
