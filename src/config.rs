use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Args, Parser};

/// Default HTTP port for the UI, the browser event stream and `/mcp`.
pub const DEFAULT_PORT: u16 = 3333;

/// How far ahead of the sweep timeout `/api/sessions` starts reporting a
/// session as stale, so the UI doesn't flicker between sweeps.
const STALE_DISPLAY_MARGIN: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("ping failure threshold must be at least 1")]
    ZeroThreshold,
}

/// Expose a browser webcam and screen capture to MCP clients.
#[derive(Parser, Debug)]
#[command(name = "webcam-mcp", version, about)]
pub struct Cli {
    /// Serve MCP over streamable HTTP at /mcp instead of stdio
    #[arg(short = 's', long)]
    pub streaming: bool,

    /// Port for the HTTP server
    #[arg(short = 'p', long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Legacy positional port; takes precedence over --port
    #[arg(value_name = "PORT")]
    pub legacy_port: Option<u16>,

    /// Host interface to bind
    #[arg(long, env = "BIND_HOST", default_value = "localhost")]
    pub bind_host: String,

    /// Public URL of the UI, used in instructions shown to the user
    #[arg(long, env = "MCP_HOST")]
    pub mcp_host: Option<String>,

    /// Milliseconds to wait for a browser to answer a capture (0 disables)
    #[arg(long, env = "MCP_CAPTURE_TIMEOUT", default_value_t = 30_000)]
    pub capture_timeout_ms: u64,

    /// Maximum concurrent streamable-HTTP sessions
    #[arg(long, env = "MCP_MAX_SESSIONS", default_value_t = 64)]
    pub max_sessions: usize,

    #[command(flatten)]
    pub liveness: LivenessArgs,
}

/// Liveness tuning, all durations in milliseconds.
#[derive(Args, Debug, Clone)]
pub struct LivenessArgs {
    /// Interval between stale-session sweeps
    #[arg(long, env = "MCP_CLIENT_CONNECTION_CHECK", default_value_t = 20_000)]
    pub connection_check_ms: u64,

    /// Inactivity after which a session is reaped
    #[arg(long, env = "MCP_CLIENT_CONNECTION_TIMEOUT", default_value_t = 50_000)]
    pub connection_timeout_ms: u64,

    /// Interval between event-stream health checks
    #[arg(long, env = "MCP_CLIENT_HEARTBEAT_INTERVAL", default_value_t = 30_000)]
    pub heartbeat_interval_ms: u64,

    /// Send protocol pings to keep idle clients alive
    #[arg(
        long,
        env = "MCP_PING_ENABLED",
        default_value_t = true,
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub ping_enabled: bool,

    /// Interval between protocol pings
    #[arg(long, env = "MCP_PING_INTERVAL", default_value_t = 30_000)]
    pub ping_interval_ms: u64,

    /// Consecutive ping failures before a session is reported as distressed
    #[arg(long, env = "MCP_PING_FAILURE_THRESHOLD", default_value_t = 1)]
    pub ping_failure_threshold: u32,

    /// How long a single ping may take
    #[arg(long, env = "MCP_PING_TIMEOUT", default_value_t = 10_000)]
    pub ping_timeout_ms: u64,
}

/// Timers and thresholds for the liveness supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessConfig {
    pub stale_check_interval: Duration,
    pub stale_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub ping_enabled: bool,
    pub ping_interval: Duration,
    pub ping_failure_threshold: u32,
    pub ping_timeout: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            stale_check_interval: Duration::from_secs(20),
            stale_timeout: Duration::from_secs(50),
            heartbeat_interval: Duration::from_secs(30),
            ping_enabled: true,
            ping_interval: Duration::from_secs(30),
            ping_failure_threshold: 1,
            ping_timeout: Duration::from_secs(10),
        }
    }
}

impl LivenessConfig {
    pub fn from_args(args: &LivenessArgs) -> Result<Self, ConfigError> {
        let ms = |value: u64, name: &'static str| {
            if value == 0 {
                Err(ConfigError::ZeroDuration(name))
            } else {
                Ok(Duration::from_millis(value))
            }
        };
        if args.ping_failure_threshold == 0 {
            return Err(ConfigError::ZeroThreshold);
        }
        Ok(Self {
            stale_check_interval: ms(args.connection_check_ms, "connection check interval")?,
            stale_timeout: ms(args.connection_timeout_ms, "connection timeout")?,
            heartbeat_interval: ms(args.heartbeat_interval_ms, "heartbeat interval")?,
            ping_enabled: args.ping_enabled,
            ping_interval: ms(args.ping_interval_ms, "ping interval")?,
            ping_failure_threshold: args.ping_failure_threshold,
            ping_timeout: ms(args.ping_timeout_ms, "ping timeout")?,
        })
    }

    /// Inactivity after which `/api/sessions` flags a session as stale.
    pub fn stale_display_threshold(&self) -> Duration {
        self.stale_timeout.saturating_sub(STALE_DISPLAY_MARGIN)
    }
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub streaming: bool,
    pub bind_host: String,
    pub port: u16,
    /// URL users are told to open when no browser is connected.
    pub public_url: String,
    pub capture_timeout: Option<Duration>,
    pub max_sessions: usize,
    pub liveness: LivenessConfig,
}

impl ServerConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let port = cli.legacy_port.unwrap_or(cli.port);
        let public_url = cli
            .mcp_host
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", cli.bind_host, port));
        Ok(Self {
            streaming: cli.streaming,
            bind_host: cli.bind_host.clone(),
            port,
            public_url,
            capture_timeout: (cli.capture_timeout_ms > 0)
                .then(|| Duration::from_millis(cli.capture_timeout_ms)),
            max_sessions: cli.max_sessions,
            liveness: LivenessConfig::from_args(&cli.liveness)?,
        })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            streaming: false,
            bind_host: "localhost".to_string(),
            port: DEFAULT_PORT,
            public_url: format!("http://localhost:{DEFAULT_PORT}"),
            capture_timeout: Some(Duration::from_secs(30)),
            max_sessions: 64,
            liveness: LivenessConfig::default(),
        }
    }
}
