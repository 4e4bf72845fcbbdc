//! Session liveness: stale sweep, ping keep-alive and event-stream heartbeat.
//!
//! Dead clients rarely announce themselves. A long-lived SSE response can sit
//! on a half-open TCP connection forever, and an idle stdio peer looks the
//! same as a crashed one. The supervisor therefore probes passively (activity
//! timestamps), actively (protocol pings) and structurally (is anyone still
//! reading the event stream?).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::LivenessConfig;
use crate::protocol::ProtocolError;
use crate::session::{Session, SessionRegistry};
use crate::transport::teardown_session;

/// What the supervisor needs from the transport it watches.
#[async_trait]
pub trait LivenessHost: Send + Sync + 'static {
    fn registry(&self) -> &SessionRegistry;

    /// Whether inactive sessions are reaped at all.
    fn reaps_stale_sessions(&self) -> bool {
        true
    }

    async fn remove_session(&self, id: &str, reason: &'static str) {
        teardown_session(self.registry(), id, reason).await;
    }

    async fn ping_session(&self, session: &Session, timeout: Duration) -> Result<(), ProtocolError> {
        session.server.ping(timeout).await
    }
}

/// Liveness host over a plain registry.
pub struct RegistryHost {
    registry: SessionRegistry,
    reap_stale: bool,
}

impl RegistryHost {
    pub fn new(registry: SessionRegistry, reap_stale: bool) -> Self {
        Self {
            registry,
            reap_stale,
        }
    }
}

#[async_trait]
impl LivenessHost for RegistryHost {
    fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    fn reaps_stale_sessions(&self) -> bool {
        self.reap_stale
    }
}

/// Owns the three liveness tasks. Dropping it aborts them; [`stop`](Self::stop)
/// lets in-progress removals finish first.
pub struct LivenessSupervisor {
    ct: CancellationToken,
    tasks: JoinSet<()>,
}

impl LivenessSupervisor {
    pub fn start<H: LivenessHost>(host: H, config: LivenessConfig) -> Self {
        let host = Arc::new(host);
        let ct = CancellationToken::new();
        let mut tasks = JoinSet::new();

        tasks.spawn(sweep_loop(Arc::clone(&host), config.clone(), ct.clone()));
        if config.ping_enabled {
            tasks.spawn(ping_loop(Arc::clone(&host), config.clone(), ct.clone()));
        }
        tasks.spawn(heartbeat_loop(host, config.heartbeat_interval, ct.clone()));

        tracing::debug!(?config, "liveness supervisor started");
        Self { ct, tasks }
    }

    pub async fn stop(mut self) {
        self.ct.cancel();
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    tracing::warn!(error = %e, "liveness task failed");
                }
            }
        }
        tracing::debug!("liveness supervisor stopped");
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

async fn sweep_loop<H: LivenessHost>(host: Arc<H>, config: LivenessConfig, ct: CancellationToken) {
    let mut ticks = ticker(config.stale_check_interval);
    loop {
        tokio::select! {
            _ = ct.cancelled() => break,
            _ = ticks.tick() => {}
        }
        // Not raced against `ct`: a removal aborted halfway would leave the
        // session claimed but still registered.
        sweep_stale(&host, config.stale_timeout).await;
    }
}

/// Remove every session idle for longer than `stale_timeout`.
///
/// Removals run concurrently; the sweep returns once all have settled.
/// Returns the number of sessions reaped.
pub async fn sweep_stale<H: LivenessHost>(host: &Arc<H>, stale_timeout: Duration) -> usize {
    if !host.reaps_stale_sessions() {
        return 0;
    }
    let mut removals = JoinSet::new();
    for session in host.registry().sessions() {
        let idle = session.activity.idle_for();
        if idle <= stale_timeout || session.is_closing() {
            continue;
        }
        tracing::info!(session = %session.id, idle_ms = idle.as_millis() as u64, "reaping stale session");
        let host = Arc::clone(host);
        removals.spawn(async move { host.remove_session(&session.id, "stale").await });
    }
    settle(removals).await
}

async fn ping_loop<H: LivenessHost>(host: Arc<H>, config: LivenessConfig, ct: CancellationToken) {
    let mut ticks = ticker(config.ping_interval);
    let mut in_flight = JoinSet::new();
    loop {
        tokio::select! {
            _ = ct.cancelled() => break,
            _ = ticks.tick() => {
                ping_sessions(&host, &config, &mut in_flight);
            }
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
        }
    }
    in_flight.abort_all();
}

/// Issue a ping to every session that doesn't already have one outstanding.
/// Returns the number of pings issued.
pub fn ping_sessions<H: LivenessHost>(
    host: &Arc<H>,
    config: &LivenessConfig,
    in_flight: &mut JoinSet<()>,
) -> usize {
    let mut issued = 0;
    for session in host.registry().sessions() {
        if session.is_closing() {
            continue;
        }
        let Some(guard) = session.try_begin_ping() else {
            tracing::trace!(session = %session.id, "ping still outstanding; skipping");
            continue;
        };
        issued += 1;

        let host = Arc::clone(host);
        let timeout = config.ping_timeout;
        let threshold = config.ping_failure_threshold;
        in_flight.spawn(async move {
            let _guard = guard;
            match host.ping_session(&session, timeout).await {
                Ok(()) => {
                    session.record_ping_success();
                    tracing::trace!(session = %session.id, "ping ok");
                }
                Err(ProtocolError::NotReady) => {}
                Err(e) => {
                    let failures = session.record_ping_failure();
                    if failures >= threshold {
                        tracing::warn!(session = %session.id, failures, error = %e, "session is not answering pings");
                    } else {
                        tracing::debug!(session = %session.id, failures, error = %e, "ping failed");
                    }
                }
            }
        });
    }
    issued
}

async fn heartbeat_loop<H: LivenessHost>(host: Arc<H>, period: Duration, ct: CancellationToken) {
    let mut ticks = ticker(period);
    loop {
        tokio::select! {
            _ = ct.cancelled() => break,
            _ = ticks.tick() => {}
        }
        reap_dead_streams(&host).await;
    }
}

/// Remove sessions whose event stream has lost its reader.
pub async fn reap_dead_streams<H: LivenessHost>(host: &Arc<H>) -> usize {
    let mut removals = JoinSet::new();
    for session in host.registry().sessions() {
        if session.is_closing() || !session.link.stream_dead() {
            continue;
        }
        tracing::info!(session = %session.id, "event stream is gone");
        let host = Arc::clone(host);
        removals.spawn(async move { host.remove_session(&session.id, "event stream closed").await });
    }
    settle(removals).await
}

async fn settle(mut removals: JoinSet<()>) -> usize {
    let count = removals.len();
    while let Some(result) = removals.join_next().await {
        if let Err(e) = result {
            tracing::warn!(error = %e, "session removal task failed");
        }
    }
    count
}
