//! Handle to the rmcp server instance bound to one session.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use rmcp::model::{ClientInfo, ServerRequest};
use rmcp::service::Peer;
use rmcp::{RoleServer, ServerHandler, ServiceExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::session::{ClientCapabilities, ClientMeta};

/// How long `close()` waits for the service loop to wind down.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("protocol handshake failed: {0}")]
    Handshake(String),
    #[error("protocol server is not connected")]
    NotReady,
    #[error("request timed out after {0:?}")]
    TimedOut(Duration),
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid request payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
    #[error("protocol server task failed: {0}")]
    TaskFailed(String),
    #[error("protocol server did not stop within {0:?}")]
    CloseTimedOut(Duration),
}

/// What the client declared in its initialize request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub client: ClientMeta,
    pub capabilities: ClientCapabilities,
}

impl From<&ClientInfo> for Handshake {
    fn from(info: &ClientInfo) -> Self {
        Self {
            client: ClientMeta {
                name: info.client_info.name.clone(),
                version: info.client_info.version.clone(),
            },
            capabilities: ClientCapabilities {
                sampling: info.capabilities.sampling.is_some(),
                roots: info.capabilities.roots.is_some(),
            },
        }
    }
}

struct ProtocolInner {
    peer: OnceLock<Peer<RoleServer>>,
    /// Cancels the service loop.
    ct: CancellationToken,
    /// Fires once the service loop has exited, for any reason.
    finished: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle to a session's protocol server.
///
/// The server itself runs as a tokio task driving rmcp's service loop; this
/// handle can ping the client, issue sampling requests and shut the loop down.
#[derive(Clone)]
pub struct ProtocolServer {
    inner: Arc<ProtocolInner>,
}

impl Default for ProtocolServer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProtocolServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolServer")
            .field("ready", &self.is_ready())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ProtocolServer {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ProtocolInner {
                peer: OnceLock::new(),
                ct: CancellationToken::new(),
                finished: CancellationToken::new(),
                task: Mutex::new(None),
            }),
        }
    }

    /// Run the MCP handshake for `service` over the given byte streams.
    ///
    /// Returns once the client has sent `notifications/initialized`; the
    /// service loop keeps running in a background task until the stream
    /// closes or [`close`](Self::close) is called.
    pub async fn serve<S, R, W>(
        &self,
        service: S,
        reader: R,
        writer: W,
    ) -> Result<Option<Handshake>, ProtocolError>
    where
        S: ServerHandler,
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let running = match service
            .serve_with_ct((reader, writer), self.inner.ct.clone())
            .await
        {
            Ok(running) => running,
            Err(e) => {
                self.inner.finished.cancel();
                return Err(ProtocolError::Handshake(e.to_string()));
            }
        };

        let handshake = running.peer_info().map(Handshake::from);
        let _ = self.inner.peer.set(running.peer().clone());

        let finished = self.inner.finished.clone();
        let handle = tokio::spawn(async move {
            match running.waiting().await {
                Ok(reason) => tracing::debug!(?reason, "protocol server stopped"),
                Err(e) => tracing::warn!(error = %e, "protocol server task failed"),
            }
            finished.cancel();
        });
        *self.inner.task.lock() = Some(handle);

        Ok(handshake)
    }

    /// True once the handshake completed and the peer can be addressed.
    pub fn is_ready(&self) -> bool {
        self.inner.peer.get().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.ct.is_cancelled()
    }

    /// Resolves when the service loop has exited.
    pub async fn finished(&self) {
        self.inner.finished.cancelled().await
    }

    fn peer(&self) -> Result<Peer<RoleServer>, ProtocolError> {
        self.inner.peer.get().cloned().ok_or(ProtocolError::NotReady)
    }

    /// Send a protocol-level ping and wait for the client's answer.
    pub async fn ping(&self, timeout: Duration) -> Result<(), ProtocolError> {
        let peer = self.peer()?;
        let request: ServerRequest = serde_json::from_value(serde_json::json!({ "method": "ping" }))?;
        match tokio::time::timeout(timeout, peer.send_request(request)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(ProtocolError::Request(e.to_string())),
            Err(_) => Err(ProtocolError::TimedOut(timeout)),
        }
    }

    /// Ask the client to run a model completion (`sampling/createMessage`).
    ///
    /// `params` is the JSON form of the request parameters; the result comes
    /// back as JSON too.
    pub async fn create_message(
        &self,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, ProtocolError> {
        let peer = self.peer()?;
        let params = serde_json::from_value(params)?;
        match tokio::time::timeout(timeout, peer.create_message(params)).await {
            Ok(Ok(result)) => Ok(serde_json::to_value(result)?),
            Ok(Err(e)) => Err(ProtocolError::Request(e.to_string())),
            Err(_) => Err(ProtocolError::TimedOut(timeout)),
        }
    }

    /// Stand in a bare task for the rmcp service loop.
    #[cfg(test)]
    pub(crate) fn attach_task(&self, handle: JoinHandle<()>) {
        *self.inner.task.lock() = Some(handle);
    }

    /// Stop the service loop and wait for it to exit.
    ///
    /// Calling this more than once is harmless; later calls return `Ok`.
    pub async fn close(&self) -> Result<(), ProtocolError> {
        self.inner.ct.cancel();
        let handle = self.inner.task.lock().take();
        let Some(handle) = handle else {
            self.inner.finished.cancel();
            return Ok(());
        };
        match tokio::time::timeout(CLOSE_GRACE, handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.is_cancelled() => Ok(()),
            Ok(Err(e)) => Err(ProtocolError::TaskFailed(e.to_string())),
            Err(_) => Err(ProtocolError::CloseTimedOut(CLOSE_GRACE)),
        }
    }
}
