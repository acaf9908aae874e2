//! API routes

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::PersonaLibrary;
use crate::engine::state::StageRecord;
use crate::engine::{ConversationEngine, EngineStats, ResetReport, TurnError, TurnStatus};
use crate::llm::LlmError;
use crate::memory::MemoryRecord;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ConversationEngine>,
    pub personas: Arc<PersonaLibrary>,
}

impl AppState {
    pub fn new(engine: Arc<ConversationEngine>, personas: Arc<PersonaLibrary>) -> Self {
        Self { engine, personas }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub reply: String,
    pub turn_id: Uuid,
    pub status: TurnStatus,
    pub pipeline_id: Uuid,
    pub total_ms: u64,
    pub stages: Vec<StageRecord>,
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub memories: Vec<MemoryRecord>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResetRequest {
    #[serde(default)]
    pub purge_memories: bool,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session_id: Uuid,
    pub persona: String,
    pub user: String,
    pub turns: Vec<crate::conversation::Turn>,
    pub pending_writes: usize,
}

#[derive(Debug, Serialize)]
pub struct PersonasResponse {
    /// Key of the persona this server is running
    pub active: String,
    pub available: Vec<String>,
}

/// Error body; `message` is safe to show the user as-is
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    pub retryable: bool,
}

pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn from_turn(error: &TurnError, engine: &ConversationEngine) -> Self {
        let status = match error {
            TurnError::EmptyInput | TurnError::PromptTooLarge { .. } => StatusCode::BAD_REQUEST,
            TurnError::Cancelled => StatusCode::CONFLICT,
            TurnError::Generation(LlmError::RateLimitExceeded { .. }) => StatusCode::TOO_MANY_REQUESTS,
            TurnError::Generation(LlmError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
            TurnError::Generation(LlmError::GenerationFailed { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            TurnError::Generation(LlmError::Provider(_)) => StatusCode::BAD_GATEWAY,
            TurnError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        Self {
            status,
            body: ErrorBody {
                error: error.to_string(),
                message: error.apology(engine.persona()),
                retryable: error.is_retryable(),
            },
        }
    }

    fn unavailable(error: impl ToString) -> Self {
        let error = error.to_string();
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: ErrorBody {
                message: error.clone(),
                error,
                retryable: true,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let outcome = state
        .engine
        .handle_turn(&request.message)
        .await
        .map_err(|e| ApiError::from_turn(&e, &state.engine))?;

    Ok(Json(ChatResponse {
        reply: outcome.reply,
        turn_id: outcome.turn_id,
        status: outcome.status,
        pipeline_id: outcome.trace.pipeline_id,
        total_ms: outcome.trace.total_ms,
        stages: outcome.trace.stages,
    }))
}

async fn search_memories(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    let limit = request.limit.unwrap_or(10);
    let memories = state
        .engine
        .search_memories(&request.query, limit)
        .await
        .map_err(ApiError::unavailable)?;

    Ok(Json(SearchResponse { memories }))
}

async fn session(State(state): State<AppState>) -> Json<SessionResponse> {
    let engine = &state.engine;
    let session = engine.session();

    Json(SessionResponse {
        session_id: session.id(),
        persona: engine.persona().character_name.clone(),
        user: engine.persona().user_name.clone(),
        turns: session.transcript().await,
        pending_writes: session.pending_len().await,
    })
}

async fn reset(State(state): State<AppState>, request: Option<Json<ResetRequest>>) -> Json<ResetReport> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    Json(state.engine.reset(request.purge_memories).await)
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

async fn cancel(State(state): State<AppState>) -> Json<CancelResponse> {
    state.engine.cancel_in_flight();
    Json(CancelResponse { cancelled: true })
}

async fn personas(State(state): State<AppState>) -> Result<Json<PersonasResponse>, ApiError> {
    let available = state.personas.list_available().await.map_err(ApiError::unavailable)?;

    Ok(Json(PersonasResponse {
        active: state.engine.persona().key.clone(),
        available,
    }))
}

async fn stats(State(state): State<AppState>) -> Json<EngineStats> {
    Json(state.engine.stats().await)
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/v1/chat", post(chat))
        .route("/v1/memories/search", post(search_memories))
        .route("/v1/session", get(session))
        .route("/v1/session/reset", post(reset))
        .route("/v1/session/cancel", post(cancel))
        .route("/v1/personas", get(personas))
        .route("/v1/stats", get(stats))
}
