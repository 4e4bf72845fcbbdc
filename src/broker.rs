use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::data_url::{DataUrl, DataUrlError};

/// Buffered commands per browser tab. Commands are tiny and a tab only ever
/// has one capture in flight, so this is mostly headroom for the greeting.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// What the browser should grab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureKind {
    Capture,
    Screenshot,
}

impl CaptureKind {
    fn event(self) -> BrowserEvent {
        match self {
            CaptureKind::Capture => BrowserEvent::Capture,
            CaptureKind::Screenshot => BrowserEvent::Screenshot,
        }
    }
}

/// Messages pushed down a browser's SSE stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BrowserEvent {
    Connected {
        #[serde(rename = "clientId")]
        client_id: String,
    },
    Capture,
    Screenshot,
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("no browser clients connected")]
    NoClients,
    #[error("browser client not connected: {0}")]
    ClientNotFound(String),
    #[error("browser client {0} is not accepting commands")]
    Unreachable(String),
    #[error("a capture is already pending for browser client {0}")]
    AlreadyPending(String),
    #[error("browser client {0} disconnected before answering")]
    Disconnected(String),
    #[error("browser did not answer within {0:?}")]
    TimedOut(Duration),
    #[error("browser reported an error: {0}")]
    Browser(String),
    #[error(transparent)]
    InvalidImage(#[from] DataUrlError),
}

enum Settlement {
    Image(String),
    Failed(String),
    Disconnected,
}

struct Pending {
    ticket: u64,
    resolver: oneshot::Sender<Settlement>,
}

struct BrowserClient {
    user: String,
    seq: u64,
    tx: mpsc::Sender<BrowserEvent>,
}

#[derive(Default)]
struct BrokerInner {
    clients: HashMap<String, BrowserClient>,
    pending: HashMap<String, Pending>,
    next_seq: u64,
}

impl BrokerInner {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// Correlates MCP capture tool calls with the browser tab that answers them.
///
/// Browser connections and pending captures live behind one lock so a
/// disconnect can never race a capture registration.
#[derive(Clone)]
pub struct CaptureBroker {
    inner: Arc<Mutex<BrokerInner>>,
    timeout: Option<Duration>,
}

/// A browser tab's registration. Dropping the receiver ends the tab's stream;
/// call [`CaptureBroker::disconnect_browser`] to release the id.
pub struct BrowserConnection {
    pub client_id: String,
    pub events: mpsc::Receiver<BrowserEvent>,
}

impl CaptureBroker {
    /// Create a broker; `timeout` bounds how long a capture waits for the browser.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BrokerInner::default())),
            timeout,
        }
    }

    /// Register a browser tab. The first event on the returned stream is
    /// always [`BrowserEvent::Connected`] carrying the generated id.
    pub fn connect_browser(&self, user: &str) -> BrowserConnection {
        let client_id = uuid::Uuid::new_v4().to_string();
        let (tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        // Fresh channel, cannot be full.
        let _ = tx.try_send(BrowserEvent::Connected {
            client_id: client_id.clone(),
        });

        let mut inner = self.inner.lock();
        let seq = inner.next_seq();
        inner.clients.insert(
            client_id.clone(),
            BrowserClient {
                user: user.to_string(),
                seq,
                tx,
            },
        );
        drop(inner);

        tracing::info!(client_id = %client_id, user, "browser connected");
        BrowserConnection { client_id, events }
    }

    /// Forget a browser tab and fail its pending capture, if any.
    pub fn disconnect_browser(&self, client_id: &str) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.clients.remove(client_id).is_some();
        let pending = inner.pending.remove(client_id);
        drop(inner);

        if let Some(pending) = pending {
            let _ = pending.resolver.send(Settlement::Disconnected);
        }
        if removed {
            tracing::info!(client_id, "browser disconnected");
        }
        removed
    }

    pub fn browser_count(&self) -> usize {
        self.inner.lock().clients.len()
    }

    /// The most recently connected browser tab for `user`.
    pub fn latest_browser(&self, user: &str) -> Option<String> {
        self.inner
            .lock()
            .clients
            .iter()
            .filter(|(_, c)| c.user == user)
            .max_by_key(|(_, c)| c.seq)
            .map(|(id, _)| id.clone())
    }

    pub fn has_pending(&self, client_id: &str) -> bool {
        self.inner.lock().pending.contains_key(client_id)
    }

    /// Register a pending capture for `client_id` and push the command to the tab.
    ///
    /// Fails with [`CaptureError::AlreadyPending`] rather than replacing an
    /// outstanding capture; the earlier caller keeps waiting.
    pub fn begin_capture(
        &self,
        client_id: &str,
        kind: CaptureKind,
    ) -> Result<PendingCapture, CaptureError> {
        let mut inner = self.inner.lock();
        if inner.pending.contains_key(client_id) {
            return Err(CaptureError::AlreadyPending(client_id.to_string()));
        }
        let Some(client) = inner.clients.get(client_id) else {
            return Err(CaptureError::ClientNotFound(client_id.to_string()));
        };
        if client.tx.try_send(kind.event()).is_err() {
            return Err(CaptureError::Unreachable(client_id.to_string()));
        }

        let (resolver, rx) = oneshot::channel();
        let ticket = inner.next_seq();
        inner
            .pending
            .insert(client_id.to_string(), Pending { ticket, resolver });
        drop(inner);

        tracing::debug!(client_id, ?kind, "capture requested");
        Ok(PendingCapture {
            broker: self.clone(),
            client_id: client_id.to_string(),
            ticket,
            rx,
        })
    }

    /// Settle the pending capture for `client_id` with an image data URL.
    /// Returns `false` (and does nothing) if none is pending.
    pub fn resolve_capture(&self, client_id: &str, image_data_url: String) -> bool {
        self.settle(client_id, Settlement::Image(image_data_url))
    }

    /// Settle the pending capture for `client_id` with a browser-side error.
    /// Returns `false` (and does nothing) if none is pending.
    pub fn fail_capture(&self, client_id: &str, message: String) -> bool {
        self.settle(client_id, Settlement::Failed(message))
    }

    fn settle(&self, client_id: &str, settlement: Settlement) -> bool {
        let Some(pending) = self.inner.lock().pending.remove(client_id) else {
            tracing::debug!(client_id, "no pending capture; ignoring callback");
            return false;
        };
        // The waiter may have gone away between removal and send.
        let _ = pending.resolver.send(settlement);
        true
    }

    /// Ask `user`'s most recent browser tab for an image and wait for it.
    ///
    /// With no browser connected this returns [`CaptureError::NoClients`]
    /// immediately and registers nothing.
    pub async fn capture(&self, user: &str, kind: CaptureKind) -> Result<DataUrl, CaptureError> {
        let client_id = self.latest_browser(user).ok_or(CaptureError::NoClients)?;
        self.begin_capture(&client_id, kind)?.wait(self.timeout).await
    }

    fn forget(&self, client_id: &str, ticket: u64) {
        let mut inner = self.inner.lock();
        if inner
            .pending
            .get(client_id)
            .is_some_and(|p| p.ticket == ticket)
        {
            inner.pending.remove(client_id);
        }
    }
}

/// Handle to a capture registered with [`CaptureBroker::begin_capture`].
///
/// Dropping it (timeout or a cancelled tool call) withdraws the pending entry
/// so the tab can be captured again.
pub struct PendingCapture {
    broker: CaptureBroker,
    client_id: String,
    ticket: u64,
    rx: oneshot::Receiver<Settlement>,
}

impl PendingCapture {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Wait for the browser's answer and decode the image.
    pub async fn wait(mut self, timeout: Option<Duration>) -> Result<DataUrl, CaptureError> {
        let settlement = match timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut self.rx).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(client_id = %self.client_id, ?limit, "capture timed out");
                    return Err(CaptureError::TimedOut(limit));
                }
            },
            None => (&mut self.rx).await,
        };

        match settlement {
            Ok(Settlement::Image(url)) => Ok(DataUrl::parse(&url)?),
            Ok(Settlement::Failed(message)) => Err(CaptureError::Browser(message)),
            Ok(Settlement::Disconnected) | Err(_) => {
                Err(CaptureError::Disconnected(self.client_id.clone()))
            }
        }
    }
}

impl Drop for PendingCapture {
    fn drop(&mut self) {
        self.broker.forget(&self.client_id, self.ticket);
    }
}
