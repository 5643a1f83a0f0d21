//! HTTP surface of the relay service.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/signed-url` | Mint an upload grant for staging an archive |
//! | `POST` | `/process` | Start a processing run (returns before it finishes) |
//! | `GET` | `/progress/:sessionId` | SSE stream: history replay, then live events |
//! | `GET` | `/health` | Liveness probe |
//!
//! Processing outcomes are only ever delivered over the event stream; the
//! triggering calls confirm acceptance, never the result.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

use crate::pipeline::{ArchivePipeline, UploadCoordinator};
use crate::session::SessionRegistry;
use crate::storage::ObjectStore;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub store: Arc<dyn ObjectStore>,
    /// Object prefix for client-staged archives.
    pub incoming_prefix: String,
    /// Object prefix for relayed members.
    pub dest_prefix: String,
    pub grant_ttl: Duration,
    pub max_in_flight: usize,
    pub session_retention: Duration,
}

/// Creates the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/signed-url", get(signed_url))
        .route("/process", post(process))
        .route("/progress/{session_id}", get(progress))
        .route("/health", get(health))
        .with_state(state)
}

/// Error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, msg: impl Into<String>) -> impl IntoResponse {
    (status, Json(ErrorResponse { error: msg.into() }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignedUrlParams {
    file_name: Option<String>,
    content_type: Option<String>,
    session_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SignedUrlResponse {
    upload_url: String,
    object_name: String,
}

/// `GET /signed-url` — mint a time-limited grant for a direct upload.
async fn signed_url(
    State(state): State<AppState>,
    Query(params): Query<SignedUrlParams>,
) -> impl IntoResponse {
    let Some(file_name) = params.file_name.filter(|v| !v.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "fileName is required").into_response();
    };
    let Some(session_id) = params.session_id.filter(|v| !v.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "sessionId is required").into_response();
    };
    let content_type = params
        .content_type
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "application/octet-stream".to_string());

    let object_name = format!("{}/{}/{}", state.incoming_prefix, session_id, file_name);
    let upload_url = state
        .store
        .upload_grant(&object_name, &content_type, state.grant_ttl);

    Json(SignedUrlResponse {
        upload_url,
        object_name,
    })
    .into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProcessRequest {
    session_id: Option<String>,
    #[serde(default)]
    objects: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ProcessResponse {
    ok: bool,
}

/// `POST /process` — start a run; acknowledged before any processing.
async fn process(
    State(state): State<AppState>,
    Json(request): Json<ProcessRequest>,
) -> impl IntoResponse {
    let Some(session_id) = request.session_id.filter(|v| !v.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "sessionId is required").into_response();
    };
    if request.objects.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "objects must be a non-empty list")
            .into_response();
    }

    tracing::info!(
        session = %session_id,
        archives = request.objects.len(),
        "processing run accepted"
    );

    let coordinator = UploadCoordinator::new(
        Arc::clone(&state.registry),
        ArchivePipeline::new(
            Arc::clone(&state.store),
            &state.dest_prefix,
            state.max_in_flight,
        ),
        state.session_retention,
    );
    tokio::spawn(async move {
        coordinator.run(&session_id, request.objects).await;
    });

    Json(ProcessResponse { ok: true }).into_response()
}

/// `GET /progress/:sessionId` — event stream for one session.
///
/// Replays the full history, then streams live events. An unknown id is not
/// an error: an empty session is created and the stream stays open. Closing
/// the connection detaches the sink; the session and its history survive
/// until expiry.
async fn progress(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let session = match state.registry.get(&session_id) {
        Some(session) => session,
        None => {
            // Observer-created session: no run will ever schedule expiry
            // for it, so bound its retention here. The timer spares it
            // while the stream stays attached.
            let session = state.registry.ensure(&session_id);
            state
                .registry
                .expire_after(session_id.clone(), state.session_retention);
            session
        }
    };
    let rx = session.attach();

    let stream = UnboundedReceiverStream::new(rx).map(|event| {
        Ok::<_, Infallible>(SseEvent::default().event(event.name()).data(event.to_json()))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    message: &'static str,
    timestamp: u64,
}

/// `GET /health` — liveness probe.
async fn health() -> impl IntoResponse {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    Json(HealthResponse {
        status: "OK",
        message: "ziprelay is running",
        timestamp,
    })
}
