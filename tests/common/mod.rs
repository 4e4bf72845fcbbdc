#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::TcpListener;
use webcam_mcp::api::{router, AppState};
use webcam_mcp::broker::CaptureBroker;
use webcam_mcp::config::LivenessConfig;
use webcam_mcp::mcp::WebcamServerFactory;
use webcam_mcp::transport::{StreamableHttpTransport, Transport};

pub type HttpTransport = StreamableHttpTransport<WebcamServerFactory>;

/// A front door plus `/mcp`, served on an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub broker: CaptureBroker,
    pub transport: Arc<HttpTransport>,
    pub client: reqwest::Client,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(LivenessConfig::default(), 8).await
    }

    pub async fn start_with(liveness: LivenessConfig, max_sessions: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let broker = CaptureBroker::new(Some(Duration::from_secs(5)));
        let factory = WebcamServerFactory::new(broker.clone(), &format!("http://{addr}"));
        let transport = Arc::new(StreamableHttpTransport::new(factory, liveness, max_sessions));
        transport.initialize().await.unwrap();

        let state = AppState {
            broker: broker.clone(),
            transport: transport.clone(),
        };
        let app = router(state, Some(transport.routes()));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            broker,
            transport,
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// POST a JSON-RPC message to `/mcp`.
    pub async fn mcp(&self, session: Option<&str>, body: Value) -> reqwest::Response {
        let mut req = self
            .client
            .post(self.url("/mcp"))
            .header("Accept", "application/json, text/event-stream")
            .json(&body);
        if let Some(id) = session {
            req = req.header("Mcp-Session-Id", id);
        }
        req.send().await.unwrap()
    }

    /// Run the initialize handshake and return the new session id.
    pub async fn open_session(&self, name: &str, sampling: bool) -> String {
        let capabilities = if sampling {
            json!({"sampling": {}})
        } else {
            json!({})
        };
        let resp = self
            .mcp(
                None,
                json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "method": "initialize",
                    "params": {
                        "protocolVersion": "2024-11-05",
                        "capabilities": capabilities,
                        "clientInfo": {"name": name, "version": "1.0.0"}
                    }
                }),
            )
            .await;
        assert_eq!(resp.status(), 200);
        let id = resp
            .headers()
            .get("mcp-session-id")
            .expect("initialize should mint a session id")
            .to_str()
            .unwrap()
            .to_string();

        let resp = self
            .mcp(
                Some(&id),
                json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
            )
            .await;
        assert_eq!(resp.status(), 202);
        id
    }

    /// Wait until `check` holds, polling for up to two seconds.
    pub async fn eventually(&self, mut check: impl FnMut(&Self) -> bool) -> bool {
        for _ in 0..200 {
            if check(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check(self)
    }

    pub fn session_count(&self) -> usize {
        self.transport.active_session_count()
    }
}

/// Reads `data:` payloads off a server-sent event stream.
pub struct SseReader {
    response: reqwest::Response,
    buffer: String,
}

impl SseReader {
    pub fn new(response: reqwest::Response) -> Self {
        Self {
            response,
            buffer: String::new(),
        }
    }

    /// The next event's data parsed as JSON. Keep-alive comments are skipped.
    pub async fn next_json(&mut self) -> Value {
        loop {
            if let Some(end) = self.buffer.find("\n\n") {
                let block: String = self.buffer.drain(..end + 2).collect();
                let data: Vec<&str> = block
                    .lines()
                    .filter_map(|l| l.strip_prefix("data:"))
                    .map(str::trim_start)
                    .collect();
                if data.is_empty() {
                    continue;
                }
                return serde_json::from_str(&data.join("\n")).unwrap();
            }
            let chunk = tokio::time::timeout(Duration::from_secs(5), self.response.chunk())
                .await
                .expect("timed out waiting for an event")
                .unwrap()
                .expect("event stream ended");
            self.buffer.push_str(std::str::from_utf8(&chunk).unwrap());
        }
    }
}
