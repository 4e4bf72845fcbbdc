//! Newline-delimited JSON-RPC relay between HTTP handlers and an in-process
//! protocol server.
//!
//! The protocol server reads and writes one end of a `tokio::io::duplex`
//! pipe as if it were a stdio peer. [`JsonRpcLink`] owns the other end: it
//! writes client messages into the pipe, routes the server's responses back
//! to the HTTP request that is waiting for them, and forwards everything the
//! server originates (pings, sampling requests, notifications) to the
//! session's event stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::activity::ActivityTracker;

/// Capacity of each in-process pipe direction.
pub const PIPE_CAPACITY: usize = 64 * 1024;

/// Server-originated messages buffered for the event stream.
const STREAM_CAPACITY: usize = 64;

/// How long `close()` waits for an in-progress write before giving up on it.
const WRITER_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("link is closed")]
    Closed,
    #[error("message is not a JSON-RPC request")]
    NotARequest,
    #[error("request id {0} is already in flight")]
    DuplicateId(String),
    #[error("writer is busy")]
    WriterBusy,
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shape of a JSON-RPC message, as far as routing is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// Carries a method and an id; `.0` is the id's JSON text.
    Request(String),
    Notification,
    /// Carries an id and a result or error.
    Response(String),
    Invalid,
}

impl MessageKind {
    pub fn of(msg: &Value) -> Self {
        let Some(obj) = msg.as_object() else {
            return MessageKind::Invalid;
        };
        let id = obj.get("id").filter(|id| !id.is_null());
        if obj.get("method").is_some_and(Value::is_string) {
            return match id {
                Some(id) => MessageKind::Request(id.to_string()),
                None => MessageKind::Notification,
            };
        }
        match id {
            Some(id) if obj.contains_key("result") || obj.contains_key("error") => {
                MessageKind::Response(id.to_string())
            }
            _ => MessageKind::Invalid,
        }
    }
}

/// True if `msg` is an `initialize` request.
pub fn is_initialize_request(msg: &Value) -> bool {
    matches!(MessageKind::of(msg), MessageKind::Request(_))
        && msg.get("method").and_then(Value::as_str) == Some("initialize")
}

#[derive(Default)]
struct StreamSlot {
    tx: Option<mpsc::Sender<Value>>,
    generation: u64,
}

struct LinkInner {
    writer: tokio::sync::Mutex<Option<WriteHalf<DuplexStream>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    stream: Mutex<StreamSlot>,
    reader: Mutex<Option<JoinHandle<()>>>,
    closed: CancellationToken,
    activity: ActivityTracker,
}

impl LinkInner {
    fn dispatch(&self, msg: Value) {
        match MessageKind::of(&msg) {
            MessageKind::Response(id) => match self.pending.lock().remove(&id) {
                Some(waiter) => {
                    let _ = waiter.send(msg);
                }
                None => tracing::debug!(id, "response with no waiting request; dropped"),
            },
            MessageKind::Request(_) | MessageKind::Notification => self.forward_to_stream(msg),
            MessageKind::Invalid => tracing::warn!("protocol server emitted an invalid message"),
        }
    }

    fn forward_to_stream(&self, msg: Value) {
        let slot = self.stream.lock();
        match slot.tx.as_ref() {
            Some(tx) => {
                if let Err(e) = tx.try_send(msg) {
                    tracing::warn!(error = %e, "event stream not accepting messages; dropped");
                }
            }
            None => tracing::debug!("no event stream attached; server message dropped"),
        }
    }

    fn shut(&self) {
        self.closed.cancel();
        self.pending.lock().clear();
        self.stream.lock().tx = None;
    }
}

/// Client-side end of a session's in-process pipe.
#[derive(Clone)]
pub struct JsonRpcLink {
    inner: Arc<LinkInner>,
}

impl JsonRpcLink {
    /// Take ownership of one end of the pipe and start routing what the
    /// server writes to it. Every server message counts as session activity.
    pub fn new(io: DuplexStream, activity: ActivityTracker) -> Self {
        let (read_half, write_half) = tokio::io::split(io);
        let inner = Arc::new(LinkInner {
            writer: tokio::sync::Mutex::new(Some(write_half)),
            pending: Mutex::new(HashMap::new()),
            stream: Mutex::new(StreamSlot::default()),
            reader: Mutex::new(None),
            closed: CancellationToken::new(),
            activity,
        });
        let handle = tokio::spawn(read_loop(Arc::clone(&inner), read_half));
        *inner.reader.lock() = Some(handle);
        Self { inner }
    }

    /// Write a request and wait for the server's response to it.
    pub async fn request(&self, msg: &Value) -> Result<Value, LinkError> {
        let MessageKind::Request(id) = MessageKind::of(msg) else {
            return Err(LinkError::NotARequest);
        };
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock();
            if pending.contains_key(&id) {
                return Err(LinkError::DuplicateId(id));
            }
            pending.insert(id.clone(), tx);
        }

        if let Err(e) = self.send(msg).await {
            self.inner.pending.lock().remove(&id);
            return Err(e);
        }

        tokio::select! {
            biased;
            response = rx => response.map_err(|_| LinkError::Closed),
            _ = self.inner.closed.cancelled() => {
                self.inner.pending.lock().remove(&id);
                Err(LinkError::Closed)
            }
        }
    }

    /// Write a message without waiting for anything back.
    pub async fn send(&self, msg: &Value) -> Result<(), LinkError> {
        if self.inner.closed.is_cancelled() {
            return Err(LinkError::Closed);
        }
        let mut line = serde_json::to_vec(msg)?;
        line.push(b'\n');

        let mut writer = self.inner.writer.lock().await;
        let writer = writer.as_mut().ok_or(LinkError::Closed)?;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Attach a new event stream, replacing any previous one. Returns the
    /// stream's generation and its receiving end.
    pub fn attach_stream(&self) -> (u64, mpsc::Receiver<Value>) {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let mut slot = self.inner.stream.lock();
        slot.generation += 1;
        slot.tx = if self.inner.closed.is_cancelled() {
            None
        } else {
            Some(tx)
        };
        (slot.generation, rx)
    }

    /// True if `generation` is the most recently attached stream.
    pub fn is_current_stream(&self, generation: u64) -> bool {
        self.inner.stream.lock().generation == generation
    }

    /// True if a stream is attached but its receiver has been dropped.
    pub fn stream_dead(&self) -> bool {
        self.inner
            .stream
            .lock()
            .tx
            .as_ref()
            .is_some_and(|tx| tx.is_closed())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves when the link closes, from either side.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    /// Close the pipe: fail waiting requests, end the event stream and send
    /// EOF to the protocol server.
    pub async fn close(&self) -> Result<(), LinkError> {
        self.inner.shut();
        if let Some(reader) = self.inner.reader.lock().take() {
            reader.abort();
        }
        let writer = tokio::time::timeout(WRITER_LOCK_TIMEOUT, self.inner.writer.lock())
            .await
            .map_err(|_| LinkError::WriterBusy)?
            .take();
        if let Some(mut writer) = writer {
            writer.shutdown().await?;
        }
        Ok(())
    }
}

async fn read_loop(inner: Arc<LinkInner>, reader: ReadHalf<DuplexStream>) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = tokio::select! {
            _ = inner.closed.cancelled() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => {
                inner.activity.touch();
                match serde_json::from_str::<Value>(&line) {
                    Ok(msg) => inner.dispatch(msg),
                    Err(e) => tracing::warn!(error = %e, "unparseable message from protocol server"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "read from protocol server failed");
                break;
            }
        }
    }
    inner.shut();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::AsyncWriteExt;

    /// A link plus the "server" end of its pipe, split into lines in/out.
    fn pipe() -> (
        JsonRpcLink,
        tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
        WriteHalf<DuplexStream>,
        ActivityTracker,
    ) {
        let activity = ActivityTracker::new();
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        let link = JsonRpcLink::new(client, activity.clone());
        let (r, w) = tokio::io::split(server);
        (link, BufReader::new(r).lines(), w, activity)
    }

    async fn write_line(w: &mut WriteHalf<DuplexStream>, msg: Value) {
        let mut bytes = serde_json::to_vec(&msg).unwrap();
        bytes.push(b'\n');
        w.write_all(&bytes).await.unwrap();
    }

    #[test]
    fn classifies_messages() {
        assert_eq!(
            MessageKind::of(&json!({"jsonrpc":"2.0","id":1,"method":"tools/list"})),
            MessageKind::Request("1".into())
        );
        assert_eq!(
            MessageKind::of(&json!({"jsonrpc":"2.0","method":"notifications/initialized"})),
            MessageKind::Notification
        );
        assert_eq!(
            MessageKind::of(&json!({"jsonrpc":"2.0","id":"a","result":{}})),
            MessageKind::Response("\"a\"".into())
        );
        assert_eq!(MessageKind::of(&json!([1, 2])), MessageKind::Invalid);
        assert_eq!(MessageKind::of(&json!({"jsonrpc":"2.0","id":3})), MessageKind::Invalid);
    }

    #[test]
    fn detects_initialize() {
        assert!(is_initialize_request(&json!({"jsonrpc":"2.0","id":0,"method":"initialize","params":{}})));
        assert!(!is_initialize_request(&json!({"jsonrpc":"2.0","method":"initialize"})));
        assert!(!is_initialize_request(&json!({"jsonrpc":"2.0","id":0,"method":"tools/list"})));
    }

    #[tokio::test]
    async fn request_receives_matching_response() {
        let (link, mut server_in, mut server_out, activity) = pipe();

        let req = json!({"jsonrpc":"2.0","id":7,"method":"tools/list"});
        let waiter = tokio::spawn({
            let link = link.clone();
            async move { link.request(&req).await }
        });

        let line = server_in.next_line().await.unwrap().unwrap();
        let received: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(received["method"], "tools/list");

        write_line(&mut server_out, json!({"jsonrpc":"2.0","id":7,"result":{"tools":[]}})).await;
        let response = waiter.await.unwrap().unwrap();
        assert_eq!(response["result"]["tools"], json!([]));
        assert!(activity.generation() >= 1);
    }

    #[tokio::test]
    async fn server_requests_go_to_attached_stream() {
        let (link, _server_in, mut server_out, _) = pipe();
        let (_generation, mut rx) = link.attach_stream();

        write_line(&mut server_out, json!({"jsonrpc":"2.0","id":0,"method":"ping"})).await;
        let forwarded = rx.recv().await.unwrap();
        assert_eq!(forwarded["method"], "ping");
    }

    #[tokio::test]
    async fn reattaching_bumps_generation() {
        let (link, _server_in, _server_out, _) = pipe();
        let (first, first_rx) = link.attach_stream();
        let (second, _second_rx) = link.attach_stream();
        assert!(!link.is_current_stream(first));
        assert!(link.is_current_stream(second));

        drop(first_rx);
        assert!(!link.stream_dead(), "only the current stream matters");
    }

    #[tokio::test]
    async fn dropped_stream_receiver_is_reported_dead() {
        let (link, _server_in, _server_out, _) = pipe();
        assert!(!link.stream_dead());
        let (_, rx) = link.attach_stream();
        assert!(!link.stream_dead());
        drop(rx);
        assert!(link.stream_dead());
    }

    #[tokio::test]
    async fn server_eof_fails_waiting_requests() {
        let (link, server_in, server_out, _) = pipe();
        let waiter = tokio::spawn({
            let link = link.clone();
            async move { link.request(&json!({"jsonrpc":"2.0","id":1,"method":"x"})).await }
        });
        tokio::task::yield_now().await;
        drop(server_in);
        drop(server_out);

        assert!(matches!(waiter.await.unwrap(), Err(LinkError::Closed)));
        link.closed().await;
        assert!(link.is_closed());
    }

    #[tokio::test]
    async fn close_sends_eof_and_ends_stream() {
        let (link, mut server_in, _server_out, _) = pipe();
        let (_, mut rx) = link.attach_stream();

        link.close().await.unwrap();
        assert!(server_in.next_line().await.unwrap().is_none());
        assert!(rx.recv().await.is_none());
        assert!(matches!(
            link.send(&json!({"jsonrpc":"2.0","method":"x"})).await,
            Err(LinkError::Closed)
        ));
        // Closing twice is fine.
        link.close().await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_in_flight_id_is_rejected() {
        let (link, _server_in, _server_out, _) = pipe();
        let req = json!({"jsonrpc":"2.0","id":5,"method":"slow"});
        let first = tokio::spawn({
            let link = link.clone();
            let req = req.clone();
            async move { link.request(&req).await }
        });
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert!(matches!(link.request(&req).await, Err(LinkError::DuplicateId(_))));
        link.close().await.unwrap();
        assert!(first.await.unwrap().is_err());
    }
}
