//! Error types for the index store and synchronization pipeline.
//!
//! Single-document operations surface these directly; the bulk reindex
//! path collects them per-document instead of aborting (see
//! [`crate::sync::reindex_vault`]).

use thiserror::Error;

/// Errors produced by [`InsightStore`](crate::store::InsightStore) operations.
///
/// A delete of an absent document is *not* an error — it is reported as a
/// `false` return from [`delete`](crate::store::InsightStore::delete).
#[derive(Error, Debug)]
pub enum StoreError {
    /// Normalization left nothing to embed. Recoverable: the caller skips
    /// the document and nothing is written to the index.
    #[error("cannot index empty content for '{path}'")]
    EmptyContent { path: String },

    /// The embedding provider call failed (network, quota, malformed
    /// response). Carries the original cause; retry policy belongs to the
    /// provider itself, not the store.
    #[error("embedding provider call failed for '{path}'")]
    Embedding {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    /// The vector index call failed. Carries the original cause.
    #[error("vector index call failed during {op}")]
    Index {
        op: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;
