use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use rmcp::ServerHandler;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::DuplexStream;
use tokio_stream::wrappers::ReceiverStream;

use super::link::{is_initialize_request, JsonRpcLink, LinkError, MessageKind, PIPE_CAPACITY};
use super::{teardown_session, Lifecycle, ServerFactory, Transport, TransportError, TransportState};
use crate::activity::ActivityTracker;
use crate::config::LivenessConfig;
use crate::liveness::RegistryHost;
use crate::protocol::ProtocolServer;
use crate::session::{
    RegistryError, Session, SessionLink, SessionRegistry, TransportKind, DEFAULT_USER,
};

/// Header carrying the session id on every request after initialize.
pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";

/// Errors returned by the `/mcp` endpoint, as JSON-RPC error envelopes.
#[derive(Debug)]
pub enum McpHttpError {
    /// 400 - No session id on a request that needs one.
    MissingSessionId,
    /// 404 - Session id not (or no longer) registered.
    SessionNotFound,
    /// 503 - Shutdown requested; no new sessions.
    ShuttingDown,
    /// 503 - Session cap reached.
    TooManySessions,
    /// 400 - Body is not JSON.
    Parse(String),
    /// 400 - Body is JSON but not a usable JSON-RPC message.
    InvalidRequest(String),
    /// 500 - Anything else.
    Internal(String),
}

impl McpHttpError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            McpHttpError::MissingSessionId => StatusCode::BAD_REQUEST,
            McpHttpError::SessionNotFound => StatusCode::NOT_FOUND,
            McpHttpError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            McpHttpError::TooManySessions => StatusCode::SERVICE_UNAVAILABLE,
            McpHttpError::Parse(_) => StatusCode::BAD_REQUEST,
            McpHttpError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            McpHttpError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON-RPC error code.
    pub fn code(&self) -> i64 {
        match self {
            McpHttpError::MissingSessionId
            | McpHttpError::ShuttingDown
            | McpHttpError::TooManySessions => -32000,
            McpHttpError::SessionNotFound => -32001,
            McpHttpError::Parse(_) => -32700,
            McpHttpError::InvalidRequest(_) => -32600,
            McpHttpError::Internal(_) => -32603,
        }
    }

    pub fn message(&self) -> String {
        match self {
            McpHttpError::MissingSessionId => {
                "Bad Request: No valid session ID provided".to_string()
            }
            McpHttpError::SessionNotFound => "Session not found".to_string(),
            McpHttpError::ShuttingDown => {
                "Server is shutting down and not accepting new sessions".to_string()
            }
            McpHttpError::TooManySessions => "Too many active sessions".to_string(),
            McpHttpError::Parse(detail) => format!("Parse error: {detail}"),
            McpHttpError::InvalidRequest(detail) => format!("Invalid request: {detail}"),
            McpHttpError::Internal(detail) => format!("Internal error: {detail}"),
        }
    }
}

impl IntoResponse for McpHttpError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "error": {
                "code": self.code(),
                "message": self.message(),
            },
            "id": null,
        });
        (self.status_code(), Json(body)).into_response()
    }
}

impl From<LinkError> for McpHttpError {
    fn from(e: LinkError) -> Self {
        match e {
            LinkError::Closed => McpHttpError::SessionNotFound,
            LinkError::DuplicateId(_) | LinkError::NotARequest => {
                McpHttpError::InvalidRequest(e.to_string())
            }
            other => McpHttpError::Internal(other.to_string()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct McpQuery {
    /// User bucket for a new session.
    pub user: Option<String>,
}

fn session_id(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(MCP_SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|id| !id.is_empty())
}

/// MCP over HTTP at `/mcp`: one protocol server per session, sessions
/// created by initialize requests and addressed by the `mcp-session-id` header.
pub struct StreamableHttpTransport<F: ServerFactory> {
    factory: F,
    config: LivenessConfig,
    registry: SessionRegistry,
    lifecycle: Lifecycle,
}

impl<F: ServerFactory> StreamableHttpTransport<F> {
    pub fn new(factory: F, config: LivenessConfig, max_sessions: usize) -> Self {
        Self {
            factory,
            config,
            registry: SessionRegistry::with_max_sessions(Some(max_sessions)),
            lifecycle: Lifecycle::new(),
        }
    }

    /// The `/mcp` routes, bound to this transport.
    pub fn routes(self: &Arc<Self>) -> Router {
        Router::new()
            .route(
                "/mcp",
                post(handle_post::<F>)
                    .get(handle_get::<F>)
                    .delete(handle_delete::<F>),
            )
            .with_state(Arc::clone(self))
    }

    /// Resolve the request's session and count the request as activity.
    fn lookup(&self, headers: &HeaderMap) -> Result<(Session, JsonRpcLink), McpHttpError> {
        let id = session_id(headers).ok_or(McpHttpError::MissingSessionId)?;
        let session = self
            .registry
            .get(id)
            .filter(|s| !s.is_closing())
            .ok_or(McpHttpError::SessionNotFound)?;
        let SessionLink::StreamableHttp(link) = &session.link else {
            return Err(McpHttpError::Internal("session has no HTTP link".into()));
        };
        let link = link.clone();
        session.activity.touch();
        Ok((session, link))
    }

    async fn post_message(
        &self,
        query: McpQuery,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Response, McpHttpError> {
        let msg: Value =
            serde_json::from_slice(body).map_err(|e| McpHttpError::Parse(e.to_string()))?;

        if session_id(headers).is_none() {
            if !self.lifecycle.accepts_new_sessions() {
                return Err(McpHttpError::ShuttingDown);
            }
            if !is_initialize_request(&msg) {
                return Err(McpHttpError::MissingSessionId);
            }
            let user = query.user.unwrap_or_else(|| DEFAULT_USER.to_string());
            return self.open_session(user, &msg).await;
        }

        let (_session, link) = self.lookup(headers)?;
        match MessageKind::of(&msg) {
            MessageKind::Request(_) => {
                let response = link.request(&msg).await?;
                Ok(Json(response).into_response())
            }
            MessageKind::Notification | MessageKind::Response(_) => {
                link.send(&msg).await?;
                Ok(StatusCode::ACCEPTED.into_response())
            }
            MessageKind::Invalid => Err(McpHttpError::InvalidRequest(
                "expected a single JSON-RPC message".into(),
            )),
        }
    }

    /// Spin up a protocol server for a new client and relay its initialize
    /// request. The session is registered only once the server has answered
    /// successfully; that is also when its id is handed to the client.
    async fn open_session(&self, user: String, init: &Value) -> Result<Response, McpHttpError> {
        if !self.registry.has_capacity() {
            return Err(McpHttpError::TooManySessions);
        }

        let activity = ActivityTracker::new();
        let (client_io, server_io) = tokio::io::duplex(PIPE_CAPACITY);
        let link = JsonRpcLink::new(client_io, activity.clone());
        let service = self.factory.create(&user);
        let session = Session::new(
            uuid::Uuid::new_v4().to_string(),
            user,
            SessionLink::StreamableHttp(link.clone()),
            ProtocolServer::new(),
            activity,
        );
        spawn_protocol_server(session.clone(), service, server_io, self.registry.clone());

        let response = match link.request(init).await {
            Ok(response) => response,
            Err(e) => {
                abandon(&session).await;
                return Err(McpHttpError::Internal(format!(
                    "protocol server did not answer initialize: {e}"
                )));
            }
        };
        if response.get("result").is_none() {
            tracing::debug!("initialize rejected by protocol server");
            abandon(&session).await;
            return Ok(Json(response).into_response());
        }

        let header = HeaderValue::from_str(&session.id)
            .map_err(|e| McpHttpError::Internal(e.to_string()))?;
        if let Err(e) = self.registry.insert(session.clone()) {
            abandon(&session).await;
            return Err(match e {
                RegistryError::MaxSessionsReached => McpHttpError::TooManySessions,
                other => McpHttpError::Internal(other.to_string()),
            });
        }

        let mut response = Json(response).into_response();
        response.headers_mut().insert(MCP_SESSION_ID_HEADER, header);
        Ok(response)
    }
}

/// Run the session's protocol server until it exits, then remove the session.
fn spawn_protocol_server<S: ServerHandler>(
    session: Session,
    service: S,
    io: DuplexStream,
    registry: SessionRegistry,
) {
    tokio::spawn(async move {
        let (reader, writer) = tokio::io::split(io);
        match session.server.serve(service, reader, writer).await {
            Ok(Some(handshake)) => {
                tracing::info!(
                    session = %session.id,
                    client = %handshake.client.name,
                    version = %handshake.client.version,
                    "client initialized"
                );
                session.record_handshake(&handshake);
            }
            Ok(None) => {}
            Err(e) => tracing::debug!(session = %session.id, error = %e, "handshake did not complete"),
        }
        session.server.finished().await;
        teardown_session(&registry, &session.id, "protocol server closed").await;
    });
}

/// Close a session that never made it into the registry.
async fn abandon(session: &Session) {
    if let Err(e) = session.link.close().await {
        tracing::debug!(error = %e, "failed to close abandoned link");
    }
    if let Err(e) = session.server.close().await {
        tracing::debug!(error = %e, "failed to close abandoned protocol server");
    }
}

async fn handle_post<F: ServerFactory>(
    State(transport): State<Arc<StreamableHttpTransport<F>>>,
    Query(query): Query<McpQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match transport.post_message(query, &headers, &body).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn handle_get<F: ServerFactory>(
    State(transport): State<Arc<StreamableHttpTransport<F>>>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, McpHttpError> {
    let (session, link) = transport.lookup(&headers)?;
    let (generation, rx) = link.attach_stream();
    tracing::debug!(session = %session.id, generation, "event stream attached");

    let guard = StreamGuard {
        registry: transport.registry.clone(),
        session_id: session.id,
        link,
        generation,
    };
    let stream = GuardedStream {
        inner: ReceiverStream::new(rx),
        _guard: guard,
    }
    .map(|msg| Ok(Event::default().event("message").data(msg.to_string())));

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(transport.config.heartbeat_interval)))
}

async fn handle_delete<F: ServerFactory>(
    State(transport): State<Arc<StreamableHttpTransport<F>>>,
    headers: HeaderMap,
) -> Result<StatusCode, McpHttpError> {
    let (session, _link) = transport.lookup(&headers)?;
    teardown_session(&transport.registry, &session.id, "client terminated session").await;
    Ok(StatusCode::OK)
}

/// Removes the session when its current event stream is dropped, i.e. when
/// the HTTP response closes or errors.
struct StreamGuard {
    registry: SessionRegistry,
    session_id: String,
    link: JsonRpcLink,
    generation: u64,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if self.link.is_closed() || !self.link.is_current_stream(self.generation) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let registry = self.registry.clone();
        let id = std::mem::take(&mut self.session_id);
        handle.spawn(async move {
            teardown_session(&registry, &id, "event stream closed").await;
        });
    }
}

struct GuardedStream<S> {
    inner: S,
    _guard: StreamGuard,
}

impl<S: Stream + Unpin> Stream for GuardedStream<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[async_trait]
impl<F: ServerFactory> Transport for StreamableHttpTransport<F> {
    fn kind(&self) -> TransportKind {
        TransportKind::StreamableHttp
    }

    fn state(&self) -> TransportState {
        self.lifecycle.state()
    }

    fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    fn stale_display_threshold(&self) -> Duration {
        self.config.stale_display_threshold()
    }

    /// Start accepting sessions and start the liveness tasks. The routes
    /// themselves come from [`StreamableHttpTransport::routes`].
    async fn initialize(&self) -> Result<(), TransportError> {
        self.lifecycle
            .start(RegistryHost::new(self.registry.clone(), true), &self.config)
    }

    async fn cleanup(&self) -> Result<(), TransportError> {
        self.lifecycle.cleanup(&self.registry).await
    }

    fn shutdown(&self) {
        self.lifecycle.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::broker::CaptureBroker;
    use crate::mcp::WebcamServerFactory;

    fn transport() -> Arc<StreamableHttpTransport<WebcamServerFactory>> {
        let factory = WebcamServerFactory::new(CaptureBroker::new(None), "http://localhost:3333");
        Arc::new(StreamableHttpTransport::new(factory, LivenessConfig::default(), 4))
    }

    async fn post(app: Router, session: Option<&str>, body: Value) -> (StatusCode, HeaderMap, Value) {
        let mut req = Request::post("/mcp").header("content-type", "application/json");
        if let Some(id) = session {
            req = req.header(MCP_SESSION_ID_HEADER, id);
        }
        let resp = app
            .oneshot(req.body(Body::from(body.to_string())).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, headers, json)
    }

    fn initialize_body() -> Value {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": "2024-11-05",
                "capabilities": {"sampling": {}},
                "clientInfo": {"name": "unit", "version": "0.0.1"}
            }
        })
    }

    #[test]
    fn error_envelope_shape() {
        let err = McpHttpError::SessionNotFound;
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.code(), -32001);
        assert_eq!(McpHttpError::MissingSessionId.code(), -32000);
    }

    #[tokio::test]
    async fn non_initialize_without_session_is_bad_request() {
        let t = transport();
        t.initialize().await.unwrap();
        let body = serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"});
        let (status, _, json) = post(t.routes(), None, body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["code"], -32000);
        assert!(json["id"].is_null());
        t.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let t = transport();
        t.initialize().await.unwrap();
        let body = serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"});
        let (status, _, _) = post(t.routes(), Some("nope"), body).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        t.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn malformed_body_is_parse_error() {
        let t = transport();
        t.initialize().await.unwrap();
        let resp = t
            .routes()
            .oneshot(Request::post("/mcp").body(Body::from("{not json")).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        t.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn initialize_after_shutdown_is_unavailable() {
        let t = transport();
        t.initialize().await.unwrap();
        t.shutdown();
        let (status, _, _) = post(t.routes(), None, initialize_body()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(t.active_session_count(), 0);
        t.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn initialize_mints_session_and_records_client() {
        let t = transport();
        t.initialize().await.unwrap();

        let (status, headers, json) = post(t.routes(), None, initialize_body()).await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["result"]["serverInfo"].is_object());
        let id = headers
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap()
            .to_string();
        assert!(t.registry().contains(&id));

        let initialized = serde_json::json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
        let (status, _, _) = post(t.routes(), Some(&id), initialized).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        // The handshake is recorded by the server task once it sees the notification.
        let session = t.registry().get(&id).unwrap();
        for _ in 0..100 {
            if session.client_meta().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(session.client_meta().unwrap().name, "unit");
        assert!(session.capabilities().sampling);

        let resp = t
            .routes()
            .oneshot(
                Request::delete("/mcp")
                    .header(MCP_SESSION_ID_HEADER, &id)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!t.registry().contains(&id));

        t.cleanup().await.unwrap();
    }
}
