//! webcam-mcp - webcam and screenshot capture for MCP clients.
//!
//! ## Modes
//!
//! **Default**: MCP over stdin/stdout. The HTTP server still runs, serving
//! the capture page and the browser event stream.
//!
//! **Streaming** (`-s`): MCP over streamable HTTP at `/mcp`, next to the
//! capture page. Many clients can connect at once.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use webcam_mcp::{
    api,
    broker::CaptureBroker,
    config::{Cli, ConfigError, ServerConfig},
    mcp::WebcamServerFactory,
    transport::{StdioTransport, StreamableHttpTransport, Transport, TransportError},
};

/// How long open HTTP connections get to finish once shutdown starts.
const HTTP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum AppError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let cli = Cli::parse();
    init_tracing();

    let mut config = ServerConfig::from_cli(&cli)?;
    let listener = TcpListener::bind((config.bind_host.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;
    if config.port == 0 && cli.mcp_host.is_none() {
        config.public_url = format!("http://{}:{}", config.bind_host, addr.port());
    }

    let broker = CaptureBroker::new(config.capture_timeout);
    let factory = WebcamServerFactory::new(broker.clone(), &config.public_url);

    if config.streaming {
        run_streaming(config, listener, addr, broker, factory).await
    } else {
        let code = run_stdio(config, listener, addr, broker, factory).await;
        // The stdin reader thread may still be parked in a read; don't wait for it.
        std::process::exit(code);
    }
}

/// Logs always go to stderr: in stdio mode stdout belongs to the protocol.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "webcam_mcp=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Serve `app` until `shutdown_rx` fires.
fn spawn_http(
    listener: TcpListener,
    app: axum::Router,
    shutdown_rx: oneshot::Receiver<()>,
) -> tokio::task::JoinHandle<std::io::Result<()>> {
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                shutdown_rx.await.ok();
            })
            .await
    })
}

/// Stop the HTTP server, giving in-flight requests a moment to finish.
/// Browser event streams never end on their own, so the wait is bounded.
async fn stop_http(
    shutdown_tx: oneshot::Sender<()>,
    handle: tokio::task::JoinHandle<std::io::Result<()>>,
) -> Result<(), AppError> {
    let _ = shutdown_tx.send(());
    match tokio::time::timeout(HTTP_DRAIN_TIMEOUT, handle).await {
        Ok(result) => result??,
        Err(_) => tracing::warn!("HTTP connections still open after shutdown; dropping them"),
    }
    Ok(())
}

// ── Streaming mode ─────────────────────────────────────────────────

async fn run_streaming(
    config: ServerConfig,
    listener: TcpListener,
    addr: SocketAddr,
    broker: CaptureBroker,
    factory: WebcamServerFactory,
) -> Result<(), AppError> {
    let transport = Arc::new(StreamableHttpTransport::new(
        factory,
        config.liveness.clone(),
        config.max_sessions,
    ));
    transport.initialize().await?;

    let state = api::AppState {
        broker,
        transport: transport.clone(),
    };
    let app = api::router(state, Some(transport.routes()));

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let http = spawn_http(listener, app, shutdown_rx);
    tracing::info!(%addr, url = %config.public_url, "webcam-mcp listening, MCP at /mcp");

    tokio::signal::ctrl_c().await?;
    tracing::info!("received Ctrl+C");

    transport.shutdown();
    let cleanup = transport.cleanup().await;
    stop_http(shutdown_tx, http).await?;
    cleanup?;
    tracing::info!("shut down cleanly");
    Ok(())
}

// ── Stdio mode ─────────────────────────────────────────────────────

/// Returns the process exit code.
async fn run_stdio(
    config: ServerConfig,
    listener: TcpListener,
    addr: SocketAddr,
    broker: CaptureBroker,
    factory: WebcamServerFactory,
) -> i32 {
    let transport = Arc::new(StdioTransport::new(factory, config.liveness.clone()));

    let state = api::AppState {
        broker,
        transport: transport.clone(),
    };
    let app = api::router(state, None);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let http = spawn_http(listener, app, shutdown_rx);
    tracing::info!(%addr, url = %config.public_url, "webcam-mcp listening, MCP on stdio");

    let code = match serve_stdio(&transport).await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "stdio transport failed");
            1
        }
    };
    // The exit code reflects session cleanup only.
    if let Err(e) = stop_http(shutdown_tx, http).await {
        tracing::warn!(error = %e, "HTTP server did not stop cleanly");
    }
    code
}

async fn serve_stdio<F>(transport: &StdioTransport<F>) -> Result<(), AppError>
where
    F: webcam_mcp::transport::ServerFactory,
{
    tokio::select! {
        result = transport.initialize() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl+C before the client initialized");
            transport.cleanup().await?;
            return Ok(());
        }
    }

    tokio::select! {
        _ = transport.closed() => tracing::info!("stdio client disconnected"),
        _ = tokio::signal::ctrl_c() => tracing::info!("received Ctrl+C"),
    }

    transport.shutdown();
    transport.cleanup().await?;
    Ok(())
}
