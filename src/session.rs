use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::activity::ActivityTracker;
use crate::protocol::{Handshake, ProtocolServer};
use crate::transport::link::{JsonRpcLink, LinkError};

/// Session id used by the stdio transport's single session.
pub const STDIO_SESSION_ID: &str = "STDIO";

/// User bucket for sessions and browsers that don't name one.
pub const DEFAULT_USER: &str = "default";

/// Capabilities the *client* declared during initialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClientCapabilities {
    pub sampling: bool,
    pub roots: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientMeta {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Stdio,
    StreamableHttp,
}

/// The wire side of a session.
#[derive(Clone)]
pub enum SessionLink {
    /// Process stdin/stdout. The streams are owned by the protocol server's
    /// service loop, so closing the server releases them.
    Stdio,
    /// In-process JSON-RPC relay between HTTP handlers and the protocol server.
    StreamableHttp(JsonRpcLink),
}

impl SessionLink {
    pub fn kind(&self) -> TransportKind {
        match self {
            SessionLink::Stdio => TransportKind::Stdio,
            SessionLink::StreamableHttp(_) => TransportKind::StreamableHttp,
        }
    }

    pub async fn close(&self) -> Result<(), LinkError> {
        match self {
            SessionLink::Stdio => Ok(()),
            SessionLink::StreamableHttp(link) => link.close().await,
        }
    }

    /// True if an event stream was attached and its receiving end is gone.
    pub fn stream_dead(&self) -> bool {
        match self {
            SessionLink::Stdio => false,
            SessionLink::StreamableHttp(link) => link.stream_dead(),
        }
    }
}

#[derive(Debug, Default)]
struct PingState {
    failures: u32,
    last_attempt: Option<Instant>,
}

#[derive(Debug, Default)]
struct ClientRecord {
    meta: Option<ClientMeta>,
    capabilities: ClientCapabilities,
}

/// One connected MCP client.
#[derive(Clone)]
pub struct Session {
    pub id: String,
    pub user: String,
    pub connected_at: DateTime<Utc>,
    pub activity: ActivityTracker,
    pub server: ProtocolServer,
    pub link: SessionLink,
    client: Arc<RwLock<ClientRecord>>,
    ping: Arc<Mutex<PingState>>,
    ping_in_flight: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    /// Fires once teardown has finished and the session left the registry.
    removed: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user", &self.user)
            .field("transport", &self.link.kind())
            .finish_non_exhaustive()
    }
}

/// Clears the session's in-flight ping marker when dropped.
pub struct PingGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for PingGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        user: impl Into<String>,
        link: SessionLink,
        server: ProtocolServer,
        activity: ActivityTracker,
    ) -> Self {
        Self {
            id: id.into(),
            user: user.into(),
            connected_at: Utc::now(),
            activity,
            server,
            link,
            client: Arc::new(RwLock::new(ClientRecord::default())),
            ping: Arc::new(Mutex::new(PingState::default())),
            ping_in_flight: Arc::new(AtomicBool::new(false)),
            closing: Arc::new(AtomicBool::new(false)),
            removed: CancellationToken::new(),
        }
    }

    /// Record the client's initialize parameters. Only the first call sticks.
    pub fn record_handshake(&self, handshake: &Handshake) {
        let mut client = self.client.write();
        if client.meta.is_none() {
            client.meta = Some(handshake.client.clone());
            client.capabilities = handshake.capabilities;
        }
    }

    pub fn client_meta(&self) -> Option<ClientMeta> {
        self.client.read().meta.clone()
    }

    pub fn capabilities(&self) -> ClientCapabilities {
        self.client.read().capabilities
    }

    /// Claim the in-flight ping slot. `None` while a ping is outstanding.
    pub fn try_begin_ping(&self) -> Option<PingGuard> {
        self.ping_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        self.ping.lock().last_attempt = Some(Instant::now());
        Some(PingGuard {
            flag: Arc::clone(&self.ping_in_flight),
        })
    }

    pub fn ping_in_flight(&self) -> bool {
        self.ping_in_flight.load(Ordering::Acquire)
    }

    /// A ping came back: the client is reachable, so it counts as activity.
    pub fn record_ping_success(&self) {
        self.ping.lock().failures = 0;
        self.activity.touch();
    }

    /// Returns the new consecutive failure count.
    pub fn record_ping_failure(&self) -> u32 {
        let mut ping = self.ping.lock();
        ping.failures = ping.failures.saturating_add(1);
        ping.failures
    }

    pub fn ping_failures(&self) -> u32 {
        self.ping.lock().failures
    }

    pub fn last_ping_attempt(&self) -> Option<Instant> {
        self.ping.lock().last_attempt
    }

    /// Mark the session as being torn down. Returns `false` if someone else
    /// already started, so teardown runs at most once.
    pub fn begin_teardown(&self) -> bool {
        !self.closing.swap(true, Ordering::AcqRel)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Called by whoever won [`begin_teardown`](Self::begin_teardown) once
    /// the session is out of the registry.
    pub fn finish_teardown(&self) {
        self.removed.cancel();
    }

    /// Resolves once teardown has completed.
    pub async fn removed(&self) {
        self.removed.cancelled().await
    }

    /// Serializable snapshot for observability. Never carries live handles.
    pub fn info(&self, stale_after: Duration) -> SessionInfo {
        let idle = self.activity.idle_for();
        let last_activity = wall_clock_ago(idle).unwrap_or(self.connected_at);
        let last_ping_attempt = self
            .last_ping_attempt()
            .and_then(|at| wall_clock_ago(at.elapsed()));
        let client = self.client.read();
        SessionInfo {
            id: self.id.clone(),
            user: self.user.clone(),
            transport: self.link.kind(),
            connected_at: self.connected_at,
            last_activity,
            idle_ms: idle.as_millis() as u64,
            is_stale: idle > stale_after,
            capabilities: client.capabilities,
            client_info: client.meta.clone(),
            ping_failures: self.ping_failures(),
            last_ping_attempt,
        }
    }
}

/// Wall-clock time `elapsed` ago.
fn wall_clock_ago(elapsed: Duration) -> Option<DateTime<Utc>> {
    let elapsed = chrono::Duration::from_std(elapsed).ok()?;
    Utc::now().checked_sub_signed(elapsed)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub user: String,
    pub transport: TransportKind,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub idle_ms: u64,
    pub is_stale: bool,
    pub capabilities: ClientCapabilities,
    pub client_info: Option<ClientMeta>,
    pub ping_failures: u32,
    pub last_ping_attempt: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("session id already exists: {0}")]
    IdExists(String),
    #[error("maximum number of sessions reached")]
    MaxSessionsReached,
}

struct RegistryInner {
    sessions: HashMap<String, Session>,
    max_sessions: Option<usize>,
}

/// Live sessions by id, owned by the transport that created them.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Create an empty, unbounded registry.
    pub fn new() -> Self {
        Self::with_max_sessions(None)
    }

    /// Create an empty registry with an optional maximum session count.
    pub fn with_max_sessions(max_sessions: Option<usize>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                sessions: HashMap::new(),
                max_sessions,
            })),
        }
    }

    pub fn insert(&self, session: Session) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        if let Some(max) = inner.max_sessions {
            if inner.sessions.len() >= max {
                return Err(RegistryError::MaxSessionsReached);
            }
        }
        if inner.sessions.contains_key(&session.id) {
            return Err(RegistryError::IdExists(session.id));
        }
        tracing::info!(session = %session.id, user = %session.user, transport = ?session.link.kind(), "session registered");
        inner.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    /// Look up a session by id, returning a clone if found.
    pub fn get(&self, id: &str) -> Option<Session> {
        self.inner.read().sessions.get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Session> {
        self.inner.write().sessions.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().sessions.contains_key(id)
    }

    /// True if another session could be inserted right now.
    pub fn has_capacity(&self) -> bool {
        let inner = self.inner.read();
        inner
            .max_sessions
            .map_or(true, |max| inner.sessions.len() < max)
    }

    /// Clones of every live session.
    pub fn sessions(&self) -> Vec<Session> {
        self.inner.read().sessions.values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.inner.read().sessions.keys().cloned().collect()
    }

    /// Snapshot of every session, oldest first.
    pub fn infos(&self, stale_after: Duration) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions()
            .iter()
            .map(|s| s.info(stale_after))
            .collect();
        infos.sort_by(|a, b| a.connected_at.cmp(&b.connected_at).then(a.id.cmp(&b.id)));
        infos
    }

    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().sessions.is_empty()
    }
}
