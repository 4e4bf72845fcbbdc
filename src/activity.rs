use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::watch;
use tokio::time::Instant;

/// Tracks the timestamp of the last protocol traffic on a session.
///
/// Inbound requests, outbound messages and successful liveness pings all
/// count as activity. The stale sweep compares [`idle_for`](Self::idle_for)
/// against its timeout.
///
/// Each activity event increments a monotonic generation counter, which lets
/// tests and observers tell "touched again" apart from "same instant".
#[derive(Clone)]
pub struct ActivityTracker {
    tx: Arc<watch::Sender<Instant>>,
    generation: Arc<AtomicU64>,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityTracker {
    /// Create a new tracker seeded with the current instant.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Instant::now());
        Self {
            tx: Arc::new(tx),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record activity. Safe to call from blocking threads.
    pub fn touch(&self) {
        self.generation.fetch_add(1, Ordering::Release);
        self.tx.send_replace(Instant::now());
    }

    /// Current generation counter value.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Instant of the last recorded activity.
    pub fn last_activity(&self) -> Instant {
        *self.tx.borrow()
    }

    /// How long the session has gone without activity.
    pub fn idle_for(&self) -> Duration {
        self.last_activity().elapsed()
    }
}

/// `AsyncRead` adapter that touches an [`ActivityTracker`] whenever bytes arrive.
pub struct ActivityReader<R> {
    inner: R,
    activity: ActivityTracker,
}

impl<R> ActivityReader<R> {
    pub fn new(inner: R, activity: ActivityTracker) -> Self {
        Self { inner, activity }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ActivityReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            if buf.filled().len() > before {
                self.activity.touch();
            }
        }
        poll
    }
}

/// `AsyncWrite` adapter that touches an [`ActivityTracker`] on every outbound write.
pub struct ActivityWriter<W> {
    inner: W,
    activity: ActivityTracker,
}

impl<W> ActivityWriter<W> {
    pub fn new(inner: W, activity: ActivityTracker) -> Self {
        Self { inner, activity }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ActivityWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            if n > 0 {
                self.activity.touch();
            }
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
