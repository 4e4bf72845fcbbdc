pub mod http;
pub mod link;
pub mod stdio;

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rmcp::ServerHandler;
use tokio::task::JoinSet;

use crate::config::LivenessConfig;
use crate::liveness::{LivenessHost, LivenessSupervisor};
use crate::protocol::ProtocolError;
use crate::session::{RegistryError, SessionInfo, SessionRegistry, TransportKind};

pub use http::StreamableHttpTransport;
pub use stdio::StdioTransport;

/// Builds one protocol server per session.
pub trait ServerFactory: Send + Sync + 'static {
    type Server: ServerHandler;

    fn create(&self, user: &str) -> Self::Server;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport already initialized")]
    AlreadyInitialized,
    #[error("transport has been cleaned up")]
    CleanedUp,
    #[error("failed to register session: {0}")]
    Registry(#[from] RegistryError),
    #[error("failed to connect protocol server: {0}")]
    Connect(#[from] ProtocolError),
    #[error("{0} session teardown task(s) panicked")]
    Teardown(usize),
}

/// Lifecycle of a transport. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransportState {
    Uninitialized,
    Initialized,
    ShuttingDown,
    CleanedUp,
}

/// Common contract of the stdio and streamable-HTTP transports.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn state(&self) -> TransportState;

    /// The sessions this transport owns.
    fn registry(&self) -> &SessionRegistry;

    /// Inactivity after which `sessions()` flags a session as stale.
    fn stale_display_threshold(&self) -> Duration;

    async fn initialize(&self) -> Result<(), TransportError>;

    /// Tear down every session and stop liveness tasks. Idempotent.
    async fn cleanup(&self) -> Result<(), TransportError>;

    /// Stop admitting new sessions; existing ones keep working.
    fn shutdown(&self) {}

    fn active_session_count(&self) -> usize {
        self.registry().len()
    }

    fn sessions(&self) -> Vec<SessionInfo> {
        self.registry().infos(self.stale_display_threshold())
    }
}

/// Shared lifecycle bookkeeping for both transports: the state machine plus
/// the liveness supervisor that is started and stopped with it.
pub(crate) struct Lifecycle {
    state: Mutex<TransportState>,
    supervisor: Mutex<Option<LivenessSupervisor>>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(TransportState::Uninitialized),
            supervisor: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> TransportState {
        *self.state.lock()
    }

    pub(crate) fn accepts_new_sessions(&self) -> bool {
        self.state() == TransportState::Initialized
    }

    /// Move to `Initialized` and start the liveness tasks.
    pub(crate) fn start<H: LivenessHost>(
        &self,
        host: H,
        config: &LivenessConfig,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        match *state {
            TransportState::Uninitialized => {}
            TransportState::CleanedUp => return Err(TransportError::CleanedUp),
            _ => return Err(TransportError::AlreadyInitialized),
        }
        *state = TransportState::Initialized;
        *self.supervisor.lock() = Some(LivenessSupervisor::start(host, config.clone()));
        Ok(())
    }

    pub(crate) fn check_can_initialize(&self) -> Result<(), TransportError> {
        match self.state() {
            TransportState::Uninitialized => Ok(()),
            TransportState::CleanedUp => Err(TransportError::CleanedUp),
            _ => Err(TransportError::AlreadyInitialized),
        }
    }

    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock();
        if *state < TransportState::ShuttingDown {
            *state = TransportState::ShuttingDown;
            tracing::info!("transport shutting down; new sessions rejected");
        }
    }

    /// Stop liveness and tear down every session in `registry`. Returns
    /// `Ok` immediately if cleanup already ran.
    pub(crate) async fn cleanup(&self, registry: &SessionRegistry) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock();
            if *state == TransportState::CleanedUp {
                return Ok(());
            }
            *state = TransportState::CleanedUp;
        }
        let supervisor = self.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            supervisor.stop().await;
        }
        teardown_all(registry, "transport cleanup").await
    }
}

/// Remove one session: close its wire link, then its protocol server, and
/// only then drop it from the registry.
///
/// Safe to call any number of times and from any task. A caller that finds
/// a teardown already running waits for it to finish, so on return the
/// session is gone either way. Returns `true` if this call performed the
/// teardown.
pub async fn teardown_session(registry: &SessionRegistry, id: &str, reason: &str) -> bool {
    let Some(session) = registry.get(id) else {
        tracing::debug!(session = id, reason, "session already removed");
        return false;
    };
    if !session.begin_teardown() {
        tracing::debug!(session = id, reason, "session teardown already in progress");
        session.removed().await;
        return false;
    }

    if let Err(e) = session.link.close().await {
        tracing::warn!(session = id, error = %e, "failed to close session transport");
    }
    if let Err(e) = session.server.close().await {
        tracing::warn!(session = id, error = %e, "failed to close protocol server");
    }
    registry.remove(id);
    session.finish_teardown();
    tracing::info!(session = id, reason, "session removed");
    true
}

/// Tear down every session concurrently, waiting for all of them to settle.
pub async fn teardown_all(registry: &SessionRegistry, reason: &'static str) -> Result<(), TransportError> {
    let mut tasks = JoinSet::new();
    for id in registry.ids() {
        let registry = registry.clone();
        tasks.spawn(async move {
            teardown_session(&registry, &id, reason).await;
        });
    }

    let mut panicked = 0;
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            tracing::error!(error = %e, "session teardown task failed");
            panicked += 1;
        }
    }
    if panicked > 0 {
        return Err(TransportError::Teardown(panicked));
    }
    Ok(())
}
