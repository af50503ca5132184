// JSON HTTP surface over the store, registry and generation pipeline.
//
// Every body carries `success`; failures add `error`. Generation output is
// served as `text/event-stream` from `/stream/{id}`.

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Json, Path, Query, State},
    http::{header::HeaderName, HeaderValue, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Router,
};
use futures_util::{stream, Stream};
use scrivener_common::protocol::events::GenerationEvent;
use scrivener_common::types::UNTITLED;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::{ConfigStore, GenerationSettings, SettingsPatch};
use crate::generation::upstream::GenerationError;
use crate::generation::{GenerationRegistry, StreamOrchestrator};
use crate::naming::DocumentNamer;
use crate::search::search;
use crate::store::DocumentStore;

const DOCUMENT_NOT_FOUND: &str = "Document not found";
const GENERATION_NOT_FOUND: &str = "Generation not found";

/// Shared services behind every route.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<DocumentStore>,
    pub config: Arc<ConfigStore>,
    pub registry: Arc<GenerationRegistry>,
    pub orchestrator: Arc<StreamOrchestrator>,
    pub namer: Arc<dyn DocumentNamer>,
}

impl AppState {
    pub fn new(store: Arc<DocumentStore>, client: reqwest::Client, namer: Arc<dyn DocumentNamer>) -> Self {
        let config = Arc::clone(store.config());
        let registry = Arc::new(GenerationRegistry::new());
        let orchestrator = Arc::new(StreamOrchestrator::new(
            client,
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&config),
            Arc::clone(&namer),
        ));
        Self { store, config, registry, orchestrator, namer }
    }
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(&'static str),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "success": false, "error": self.to_string() }));
        (self.status(), body).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

/// Path IDs that are not UUIDs cannot name anything stored.
fn parse_id(raw: &str, missing: &'static str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::NotFound(missing))
}

// ── Router ─────────────────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/documents", get(list_documents))
        .route("/documents/search", get(search_documents))
        .route("/documents/new", post(new_document))
        .route("/documents/{id}", get(get_document).put(update_document).delete(delete_document))
        .route("/documents/{id}/set-current", post(set_current_document))
        .route("/submit", post(submit))
        .route("/cancel/{id}", post(cancel))
        .route("/stream/{id}", get(stream_generation))
        .route("/generate_name", post(generate_name))
        .route("/get_seed", post(get_seed))
        .route("/settings", get(get_settings).post(update_settings))
        .route("/set_token", post(set_token))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Serve until `shutdown` fires.
pub async fn serve(listener: TcpListener, state: AppState, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
        .context("http server failed")
}

// ── Documents ──────────────────────────────────────────────────────

async fn list_documents(State(state): State<AppState>) -> ApiResult {
    let documents = state.store.list_all().await;
    Ok(Json(json!({
        "success": true,
        "documents": documents,
        "current_document": state.store.current_document(),
    })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SearchQuery {
    q: String,
}

async fn search_documents(State(state): State<AppState>, Query(query): Query<SearchQuery>) -> ApiResult {
    let q = query.q.trim();
    let results = search(&state.store, q).await;
    Ok(Json(json!({
        "success": true,
        "total_matches": results.documents.len(),
        "documents": results.documents,
        "query": q,
        "search_type": results.search_type,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct NewDocument {
    name: String,
    content: String,
}

impl Default for NewDocument {
    fn default() -> Self {
        Self { name: UNTITLED.to_string(), content: String::new() }
    }
}

async fn new_document(State(state): State<AppState>, Json(body): Json<NewDocument>) -> ApiResult {
    let document = state.store.create(&body.name, &body.content).await;
    Ok(Json(json!({ "success": true, "document": document })))
}

async fn get_document(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let id = parse_id(&id, DOCUMENT_NOT_FOUND)?;
    let document = state.store.load(id).await.ok_or(ApiError::NotFound(DOCUMENT_NOT_FOUND))?;
    Ok(Json(json!({ "success": true, "document": document })))
}

/// `content` wins when both fields are present.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DocumentUpdate {
    content: Option<String>,
    name: Option<String>,
}

async fn update_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<DocumentUpdate>,
) -> ApiResult {
    let id = parse_id(&id, DOCUMENT_NOT_FOUND)?;
    if !state.store.contains(id) {
        return Err(ApiError::NotFound(DOCUMENT_NOT_FOUND));
    }

    let updated = match (update.content, update.name) {
        (Some(content), _) => state.store.update_content(id, &content).await,
        (None, Some(name)) => state.store.update_metadata(id, &name).await,
        (None, None) => return Err(ApiError::bad_request("Invalid update data")),
    };
    let document = updated.ok_or_else(|| ApiError::internal("Failed to update document"))?;
    Ok(Json(json!({ "success": true, "document": document })))
}

async fn delete_document(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let id = parse_id(&id, DOCUMENT_NOT_FOUND)?;
    if !state.store.contains(id) {
        return Err(ApiError::NotFound(DOCUMENT_NOT_FOUND));
    }
    if !state.store.delete(id).await {
        return Err(ApiError::internal("Failed to delete document"));
    }
    Ok(Json(json!({ "success": true })))
}

async fn set_current_document(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let id = parse_id(&id, DOCUMENT_NOT_FOUND)?;
    if !state.store.set_current(id) {
        return Err(ApiError::NotFound(DOCUMENT_NOT_FOUND));
    }
    Ok(Json(json!({ "success": true })))
}

// ── Generation ─────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SubmitRequest {
    prompt: String,
    document_id: Option<Uuid>,
}

async fn submit(State(state): State<AppState>, Json(request): Json<SubmitRequest>) -> ApiResult {
    if state.config.generation().missing_required_token() {
        return Err(ApiError::bad_request(GenerationError::MissingToken.to_string()));
    }
    let generation_id = state.registry.submit(&request.prompt, request.document_id);
    Ok(Json(json!({ "success": true, "generation_id": generation_id })))
}

async fn cancel(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let id = parse_id(&id, GENERATION_NOT_FOUND)?;
    if !state.registry.cancel(id) {
        return Err(ApiError::NotFound(GENERATION_NOT_FOUND));
    }
    Ok(Json(json!({ "success": true })))
}

async fn stream_generation(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let receiver = match Uuid::parse_str(&id) {
        Ok(id) => state.orchestrator.start(id),
        Err(_) => {
            let (events, receiver) = mpsc::channel(1);
            let _ = events.try_send(GenerationEvent::Error(GENERATION_NOT_FOUND.into()));
            receiver
        }
    };

    let headers = [(HeaderName::from_static("x-accel-buffering"), HeaderValue::from_static("no"))];
    (headers, Sse::new(event_stream(receiver))).into_response()
}

/// One SSE `data:` frame per event. The stream ends after the terminal
/// event or when the sender drops.
fn event_stream(receiver: mpsc::Receiver<GenerationEvent>) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(Some(receiver), |receiver| async move {
        let mut receiver = receiver?;
        let event = receiver.recv().await?;
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        let next = (!event.is_terminal()).then_some(receiver);
        Some((Ok(Event::default().data(data)), next))
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NameRequest {
    content: String,
}

async fn generate_name(State(state): State<AppState>, Json(request): Json<NameRequest>) -> ApiResult {
    if request.content.trim().is_empty() {
        return Err(ApiError::bad_request("No content provided"));
    }
    let name = state.namer.name_from_content(&request.content).await;
    Ok(Json(json!({ "success": true, "name": name })))
}

async fn get_seed(State(state): State<AppState>) -> ApiResult {
    let api_name = state.config.generation().provider.api_name();
    match state.orchestrator.fetch_seed().await {
        Ok(text) => Ok(Json(json!({ "success": true, "text": text }))),
        Err(GenerationError::MissingToken) => Err(ApiError::bad_request("No API token configured")),
        Err(e) => {
            error!(error = %e, "seed request failed");
            Err(ApiError::internal(e.user_message(api_name)))
        }
    }
}

// ── Settings ───────────────────────────────────────────────────────

/// Settings as shown to clients. Secrets are reported only as present.
#[derive(Debug, Serialize)]
struct SettingsView {
    #[serde(flatten)]
    generation: GenerationSettings,
    has_token: bool,
    has_custom_api_key: bool,
    embeddings_search: bool,
}

async fn get_settings(State(state): State<AppState>) -> ApiResult {
    let config = state.config.snapshot();
    let mut generation = config.generation;
    let has_token = !generation.token.is_empty();
    let has_custom_api_key = !generation.custom_api_key.is_empty();
    generation.token.clear();
    generation.custom_api_key.clear();

    let view = SettingsView { generation, has_token, has_custom_api_key, embeddings_search: config.search.embeddings };
    Ok(Json(json!({ "success": true, "settings": view })))
}

async fn update_settings(State(state): State<AppState>, Json(patch): Json<SettingsPatch>) -> ApiResult {
    state.config.update_settings(patch);
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TokenRequest {
    token: String,
}

async fn set_token(State(state): State<AppState>, Json(request): Json<TokenRequest>) -> ApiResult {
    if request.token.is_empty() {
        return Err(ApiError::bad_request(GenerationError::MissingToken.to_string()));
    }
    state.config.set_token(request.token).map_err(|e| {
        error!(error = %e, "failed to save token");
        ApiError::internal("Failed to save token")
    })?;
    info!("API token updated");
    Ok(Json(json!({ "success": true })))
}
