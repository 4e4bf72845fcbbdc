use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;

use crate::broker::{BrowserEvent, CaptureBroker};
use crate::data_url::DataUrl;
use crate::session::{Session, SessionInfo, TransportKind, DEFAULT_USER};

use super::error::ApiError;
use super::AppState;

/// Keep-alive comment interval on the browser event stream.
const BROWSER_KEEP_ALIVE: Duration = Duration::from_secs(15);

/// Upper bound on one out-of-band sampling round trip.
const SAMPLING_TIMEOUT: Duration = Duration::from_secs(60);

const SAMPLING_MAX_TOKENS: u32 = 1000;

const DEFAULT_SAMPLING_PROMPT: &str = "Describe what you see in this image.";

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
    transport: TransportKind,
    sessions: usize,
    browsers: usize,
}

pub(super) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        transport: state.transport.kind(),
        sessions: state.transport.active_session_count(),
        browsers: state.broker.browser_count(),
    })
}

// ── Browser side ───────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub(super) struct UserQuery {
    user: Option<String>,
}

/// `GET /api/events`: the browser tab's command stream.
pub(super) async fn browser_events(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let user = query.user.unwrap_or_else(|| DEFAULT_USER.to_string());
    let conn = state.broker.connect_browser(&user);

    let stream = BrowserStream {
        inner: ReceiverStream::new(conn.events),
        _guard: BrowserGuard {
            broker: state.broker.clone(),
            client_id: conn.client_id,
        },
    }
    .map(|event| Event::default().json_data(event));

    Sse::new(stream).keep_alive(KeepAlive::new().interval(BROWSER_KEEP_ALIVE))
}

/// Unregisters the browser tab when its event stream is dropped.
struct BrowserGuard {
    broker: CaptureBroker,
    client_id: String,
}

impl Drop for BrowserGuard {
    fn drop(&mut self) {
        self.broker.disconnect_browser(&self.client_id);
    }
}

struct BrowserStream {
    inner: ReceiverStream<BrowserEvent>,
    _guard: BrowserGuard,
}

impl Stream for BrowserStream {
    type Item = BrowserEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CaptureResultBody {
    client_id: String,
    image: String,
}

#[derive(Serialize)]
pub(super) struct SuccessResponse {
    success: bool,
}

/// `POST /api/capture-result`. Answers for unknown or idle clients are
/// dropped; the browser is still told it succeeded.
pub(super) async fn capture_result(
    State(state): State<AppState>,
    payload: Result<Json<CaptureResultBody>, JsonRejection>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let Json(body) = payload?;
    if state.broker.resolve_capture(&body.client_id, body.image) {
        tracing::debug!(client_id = %body.client_id, "capture result delivered");
    }
    Ok(Json(SuccessResponse { success: true }))
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct BrowserFailure {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CaptureErrorBody {
    client_id: String,
    #[serde(default)]
    error: BrowserFailure,
}

pub(super) async fn capture_error(
    State(state): State<AppState>,
    payload: Result<Json<CaptureErrorBody>, JsonRejection>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let Json(body) = payload?;
    let message = body
        .error
        .message
        .unwrap_or_else(|| "Unknown error".to_string());
    tracing::warn!(client_id = %body.client_id, %message, "browser reported capture error");
    state.broker.fail_capture(&body.client_id, message);
    Ok(Json(SuccessResponse { success: true }))
}

// ── MCP sessions ───────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub(super) struct SessionsQuery {
    user: Option<String>,
    #[serde(default)]
    all: bool,
}

#[derive(Serialize)]
pub(super) struct SessionsResponse {
    sessions: Vec<SessionInfo>,
}

pub(super) async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<SessionsQuery>,
) -> Json<SessionsResponse> {
    let mut sessions = state.transport.sessions();
    if let (false, Some(user)) = (query.all, query.user.as_deref()) {
        sessions.retain(|s| s.user == user);
    }
    Json(SessionsResponse { sessions })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ProcessSampleBody {
    image: String,
    prompt: Option<String>,
    session_id: Option<String>,
}

/// `POST /api/process-sample`: ask an MCP client to describe an image.
pub(super) async fn process_sample(
    State(state): State<AppState>,
    payload: Result<Json<ProcessSampleBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = payload?;
    let image = DataUrl::parse(&body.image)?;
    let session = sampling_session(&state, body.session_id.as_deref())?;

    let prompt = body
        .prompt
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SAMPLING_PROMPT.to_string());
    let params = json!({
        "messages": [
            {
                "role": "user",
                "content": {"type": "image", "data": image.data, "mimeType": image.mime_type}
            },
            {
                "role": "user",
                "content": {"type": "text", "text": prompt}
            }
        ],
        "maxTokens": SAMPLING_MAX_TOKENS,
    });

    tracing::info!(session = %session.id, "requesting sampling from client");
    let result = session
        .server
        .create_message(params, SAMPLING_TIMEOUT)
        .await
        .map_err(|e| {
            tracing::warn!(session = %session.id, error = %e, "sampling failed");
            ApiError::SamplingFailed(e.to_string())
        })?;
    session.activity.touch();

    Ok(Json(json!({ "success": true, "result": result })))
}

/// The named session, or the longest-connected one whose client can sample.
fn sampling_session(state: &AppState, id: Option<&str>) -> Result<Session, ApiError> {
    let registry = state.transport.registry();
    match id {
        Some(id) => {
            let session = registry
                .get(id)
                .filter(|s| !s.is_closing())
                .ok_or_else(|| ApiError::SessionNotFound(id.to_string()))?;
            if !session.capabilities().sampling {
                return Err(ApiError::SamplingUnsupported(id.to_string()));
            }
            Ok(session)
        }
        None => registry
            .sessions()
            .into_iter()
            .filter(|s| !s.is_closing() && s.capabilities().sampling)
            .min_by_key(|s| s.connected_at)
            .ok_or(ApiError::NoSamplingSession),
    }
}
