use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};

use super::{Lifecycle, ServerFactory, Transport, TransportError, TransportState};
use crate::activity::{ActivityReader, ActivityTracker, ActivityWriter};
use crate::config::LivenessConfig;
use crate::liveness::RegistryHost;
use crate::protocol::ProtocolServer;
use crate::session::{
    Session, SessionLink, SessionRegistry, TransportKind, DEFAULT_USER, STDIO_SESSION_ID,
};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// MCP over the process's stdin/stdout: exactly one session, alive for as
/// long as the streams are.
pub struct StdioTransport<F: ServerFactory> {
    factory: F,
    config: LivenessConfig,
    registry: SessionRegistry,
    lifecycle: Lifecycle,
    io: Mutex<Option<(BoxedReader, BoxedWriter)>>,
}

impl<F: ServerFactory> StdioTransport<F> {
    pub fn new(factory: F, config: LivenessConfig) -> Self {
        Self::with_io(factory, config, tokio::io::stdin(), tokio::io::stdout())
    }

    /// Use arbitrary streams in place of stdin/stdout.
    pub fn with_io<R, W>(factory: F, config: LivenessConfig, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            factory,
            config,
            registry: SessionRegistry::with_max_sessions(Some(1)),
            lifecycle: Lifecycle::new(),
            io: Mutex::new(Some((Box::new(reader), Box::new(writer)))),
        }
    }

    /// Resolves once the session's streams have closed, or immediately if
    /// there is no session.
    pub async fn closed(&self) {
        if let Some(session) = self.registry.get(STDIO_SESSION_ID) {
            session.server.finished().await;
        }
    }
}

#[async_trait]
impl<F: ServerFactory> Transport for StdioTransport<F> {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    fn state(&self) -> TransportState {
        self.lifecycle.state()
    }

    fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    fn stale_display_threshold(&self) -> std::time::Duration {
        self.config.stale_display_threshold()
    }

    /// Create the session and complete the MCP handshake on stdin/stdout.
    ///
    /// Blocks until the client has initialized. On failure the session is
    /// removed again and the error returned.
    async fn initialize(&self) -> Result<(), TransportError> {
        self.lifecycle.check_can_initialize()?;
        let (reader, writer) = self
            .io
            .lock()
            .take()
            .ok_or(TransportError::AlreadyInitialized)?;

        let activity = ActivityTracker::new();
        let server = ProtocolServer::new();
        let session = Session::new(
            STDIO_SESSION_ID,
            DEFAULT_USER,
            SessionLink::Stdio,
            server.clone(),
            activity.clone(),
        );
        self.registry.insert(session.clone())?;

        let service = self.factory.create(DEFAULT_USER);
        let reader = ActivityReader::new(reader, activity.clone());
        let writer = ActivityWriter::new(writer, activity);
        match server.serve(service, reader, writer).await {
            Ok(Some(handshake)) => {
                tracing::info!(
                    client = %handshake.client.name,
                    version = %handshake.client.version,
                    "stdio client initialized"
                );
                session.record_handshake(&handshake);
            }
            Ok(None) => tracing::info!("stdio client initialized"),
            Err(e) => {
                self.registry.remove(STDIO_SESSION_ID);
                if let Err(close_err) = server.close().await {
                    tracing::debug!(error = %close_err, "failed to close protocol server after handshake failure");
                }
                return Err(e.into());
            }
        }

        // A single long-lived session is never reaped for inactivity.
        self.lifecycle
            .start(RegistryHost::new(self.registry.clone(), false), &self.config)
    }

    async fn cleanup(&self) -> Result<(), TransportError> {
        self.lifecycle.cleanup(&self.registry).await
    }

    fn shutdown(&self) {
        self.lifecycle.shutdown();
    }
}
