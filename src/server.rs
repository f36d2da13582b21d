//! JSON HTTP API for the Insight index.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/api/v1/health` | Health and connection status |
//! | `POST` | `/api/v1/insights/index` | Index one Insight note |
//! | `DELETE` | `/api/v1/insights/{path}` | Remove an Insight from the index |
//! | `POST` | `/api/v1/insights/reindex` | Bulk re-index a vault |
//! | `POST` | `/api/v1/query/insights` | Retrieve Insights for a Question |
//! | `POST` | `/api/v1/generate/comparison-questions` | Generate reflective questions |
//! | `GET`  | `/api/v1/config` | Current vault and watcher state |
//! | `PUT`  | `/api/v1/config` | Repoint the vault, restarting the watcher |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "content is empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted; the expected callers
//! are local editor plugins.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::error::StoreError;
use crate::note::ParsedNote;
use crate::questions::{GeneratedQuestions, QuestionGenerator};
use crate::store::{InsightStore, RetrievedInsight};
use crate::sync::reindex_vault;
use crate::watcher::VaultWatcher;

const EMBEDDING_DIMENSION: usize = 1536;

/// Shared application state, passed to handlers via Axum's `State`
/// extractor. Every collaborator is injected at construction.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<InsightStore>,
    /// `None` until a vault path is configured.
    pub watcher: Arc<tokio::sync::Mutex<Option<VaultWatcher>>>,
    pub generator: Arc<QuestionGenerator>,
    pub openai_configured: bool,
    pub debounce: Duration,
}

/// Starts the HTTP server on `bind_addr`. Runs until the process exits.
pub async fn run_server(bind_addr: &str, state: AppState) -> anyhow::Result<()> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = router(state).layer(cors);

    info!("listening on http://{}", bind_addr);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(handle_health))
        .route("/insights/index", post(handle_index))
        .route("/insights/{*path}", delete(handle_delete))
        .route("/insights/reindex", post(handle_reindex))
        .route("/query/insights", post(handle_query))
        .route(
            "/generate/comparison-questions",
            post(handle_generate_questions),
        )
        .route("/config", get(handle_get_config).put(handle_put_config))
        .with_state(state);

    Router::new().nest("/api/v1", api)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

/// Store failures map to status by recoverability: empty content is the
/// caller's problem, provider and index failures are ours.
fn classify_store_error(err: StoreError) -> AppError {
    match err {
        StoreError::EmptyContent { .. } => bad_request(err.to_string()),
        other => internal(format!("{other:#}")),
    }
}

// ============ Handlers ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    chroma_connected: bool,
    indexed_insights: usize,
    vault_path: Option<String>,
    watching: bool,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let (chroma_connected, indexed_insights) = match state.store.count().await {
        Ok(count) => (true, count),
        Err(_) => (false, 0),
    };

    let watcher = state.watcher.lock().await;
    let (vault_path, watching) = watcher_status(&watcher);

    Json(HealthResponse {
        status: "healthy",
        chroma_connected,
        indexed_insights,
        vault_path,
        watching,
    })
}

#[derive(Deserialize)]
struct NotePayload {
    /// Vault-relative path, e.g. `Insights/speed.md`.
    path: String,
    /// Body markdown, frontmatter already stripped.
    content: String,
    #[serde(default)]
    frontmatter: BTreeMap<String, serde_json::Value>,
}

#[derive(Serialize)]
struct IndexResponse {
    success: bool,
    insight_id: String,
    embedding_dimension: usize,
}

async fn handle_index(
    State(state): State<AppState>,
    Json(payload): Json<NotePayload>,
) -> Result<Json<IndexResponse>, AppError> {
    let note = ParsedNote {
        content: payload.content,
        frontmatter: payload.frontmatter,
    };

    let insight_id = state
        .store
        .upsert(&payload.path, &note)
        .await
        .map_err(classify_store_error)?;

    Ok(Json(IndexResponse {
        success: true,
        insight_id,
        embedding_dimension: EMBEDDING_DIMENSION,
    }))
}

#[derive(Serialize)]
struct DeleteResponse {
    success: bool,
    message: String,
}

async fn handle_delete(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    let removed = state
        .store
        .delete(&path)
        .await
        .map_err(classify_store_error)?;

    Ok(Json(DeleteResponse {
        success: removed,
        message: if removed {
            "Insight removed from index".to_string()
        } else {
            "Insight not found".to_string()
        },
    }))
}

#[derive(Deserialize)]
struct ReindexRequest {
    vault_path: String,
}

#[derive(Serialize)]
struct ReindexResponse {
    success: bool,
    indexed_count: usize,
    errors: Vec<String>,
}

async fn handle_reindex(
    State(state): State<AppState>,
    Json(request): Json<ReindexRequest>,
) -> Result<Json<ReindexResponse>, AppError> {
    let vault = PathBuf::from(&request.vault_path);
    let vault = vault.canonicalize().unwrap_or(vault);

    let report = reindex_vault(&state.store, &vault)
        .await
        .map_err(|e| not_found(format!("{e:#}")))?;

    Ok(Json(ReindexResponse {
        success: true,
        indexed_count: report.indexed_count,
        errors: report.errors,
    }))
}

#[derive(Deserialize)]
struct QueryRequest {
    question_content: String,
    #[serde(default = "default_top_k")]
    top_k: usize,
    #[serde(default = "default_min_similarity")]
    min_similarity: f32,
}

fn default_top_k() -> usize {
    5
}
fn default_min_similarity() -> f32 {
    0.7
}

#[derive(Serialize)]
struct QueryResponse {
    insights: Vec<RetrievedInsight>,
}

async fn handle_query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    // Out-of-range parameters are clamped at the API boundary
    let top_k = request.top_k.clamp(1, 10);
    let min_similarity = request.min_similarity.clamp(0.0, 1.0);

    let insights = state
        .store
        .query(&request.question_content, top_k, min_similarity)
        .await
        .map_err(classify_store_error)?;

    Ok(Json(QueryResponse { insights }))
}

#[derive(Deserialize)]
struct GenerateQuestionsRequest {
    current_question: String,
    retrieved_insights: Vec<RetrievedInsight>,
}

async fn handle_generate_questions(
    State(state): State<AppState>,
    Json(request): Json<GenerateQuestionsRequest>,
) -> Result<Json<GeneratedQuestions>, AppError> {
    let result = state
        .generator
        .generate(&request.current_question, &request.retrieved_insights)
        .await
        .map_err(|e| internal(format!("{e:#}")))?;

    Ok(Json(result))
}

#[derive(Serialize)]
struct ConfigResponse {
    vault_path: Option<String>,
    watching: bool,
    openai_configured: bool,
}

fn watcher_status(watcher: &Option<VaultWatcher>) -> (Option<String>, bool) {
    match watcher {
        Some(w) => (
            Some(w.vault_path().to_string_lossy().to_string()),
            w.is_running(),
        ),
        None => (None, false),
    }
}

async fn handle_get_config(State(state): State<AppState>) -> Json<ConfigResponse> {
    let watcher = state.watcher.lock().await;
    let (vault_path, watching) = watcher_status(&watcher);

    Json(ConfigResponse {
        vault_path,
        watching,
        openai_configured: state.openai_configured,
    })
}

#[derive(Deserialize)]
struct ConfigUpdateRequest {
    vault_path: Option<String>,
}

async fn handle_put_config(
    State(state): State<AppState>,
    Json(request): Json<ConfigUpdateRequest>,
) -> Result<Json<ConfigResponse>, AppError> {
    if let Some(new_path) = request.vault_path {
        let vault = PathBuf::from(&new_path);
        let vault = vault.canonicalize().unwrap_or(vault);

        let mut watcher = state.watcher.lock().await;
        match watcher.as_mut() {
            Some(w) => w
                .restart(vault)
                .map_err(|e| internal(format!("{e:#}")))?,
            None => {
                let mut w = VaultWatcher::new(state.store.clone(), vault, state.debounce);
                w.start().map_err(|e| internal(format!("{e:#}")))?;
                *watcher = Some(w);
            }
        }
    }

    let watcher = state.watcher.lock().await;
    let (vault_path, watching) = watcher_status(&watcher);

    Ok(Json(ConfigResponse {
        vault_path,
        watching,
        openai_configured: state.openai_configured,
    }))
}
