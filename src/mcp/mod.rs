pub mod resources;

use std::sync::Arc;

use rmcp::{
    handler::server::router::tool::ToolRouter,
    model::*,
    service::RequestContext,
    tool, tool_handler, tool_router, RoleServer, ServerHandler,
};

use crate::broker::{CaptureBroker, CaptureError, CaptureKind};
use crate::transport::ServerFactory;

// ── MCP server ─────────────────────────────────────────────────────

/// Protocol server for one MCP session: capture tools plus the current
/// webcam view as a resource, all answered by the user's browser tab.
#[derive(Clone)]
pub struct WebcamServer {
    broker: CaptureBroker,
    user: String,
    public_url: Arc<str>,
    tool_router: ToolRouter<WebcamServer>,
}

impl WebcamServer {
    pub fn new(broker: CaptureBroker, user: impl Into<String>, public_url: Arc<str>) -> Self {
        Self {
            broker,
            user: user.into(),
            public_url,
            tool_router: Self::tool_router(),
        }
    }

    /// Instructions shown when no browser tab is available to capture from.
    pub fn no_browser_message(&self) -> String {
        format!(
            "No browser is connected to the webcam server. Ask the human to open {} \
             in a web browser, switch on their webcam, and then try again.",
            self.public_url
        )
    }

    async fn grab(&self, kind: CaptureKind) -> CallToolResult {
        let (caption, verb) = match kind {
            CaptureKind::Capture => ("Here is the latest image from the Webcam", "capture webcam image"),
            CaptureKind::Screenshot => ("Here is the latest screenshot", "take screenshot"),
        };
        match self.broker.capture(&self.user, kind).await {
            Ok(image) => CallToolResult::success(vec![
                Content::text(caption),
                Content::image(image.data, image.mime_type),
            ]),
            Err(CaptureError::NoClients) => {
                CallToolResult::error(vec![Content::text(self.no_browser_message())])
            }
            Err(e) => {
                tracing::warn!(user = %self.user, error = %e, "capture failed");
                CallToolResult::error(vec![Content::text(format!("Failed to {verb}: {e}"))])
            }
        }
    }
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for WebcamServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_resources()
                .build(),
            server_info: Implementation {
                name: "webcam-mcp".to_string(),
                title: None,
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: Some(
                    "Webcam and screen capture from a browser tab, exposed over MCP.".to_string(),
                ),
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "Use `capture` to see the human through their webcam and `screenshot` to see \
                 their screen. Both need the capture page open in a browser at {}.",
                self.public_url
            )),
        }
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParams>,
        _: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, ErrorData> {
        Ok(resources::list_resources())
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParams,
        _: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, ErrorData> {
        resources::read_resource(self, request).await
    }
}

#[tool_router]
impl WebcamServer {
    #[tool(description = "Gets the latest picture from the webcam. You can use this if the human asks questions about their immediate environment, if you want to see the human or to examine an object they may be referring to or showing you.")]
    async fn capture(&self) -> Result<CallToolResult, ErrorData> {
        Ok(self.grab(CaptureKind::Capture).await)
    }

    #[tool(description = "Gets a screenshot of the current screen or window. The human chooses what to share in their browser.")]
    async fn screenshot(&self) -> Result<CallToolResult, ErrorData> {
        Ok(self.grab(CaptureKind::Screenshot).await)
    }
}

/// Builds a [`WebcamServer`] per session, bound to the session's user.
#[derive(Clone)]
pub struct WebcamServerFactory {
    broker: CaptureBroker,
    public_url: Arc<str>,
}

impl WebcamServerFactory {
    pub fn new(broker: CaptureBroker, public_url: &str) -> Self {
        Self {
            broker,
            public_url: Arc::from(public_url),
        }
    }
}

impl ServerFactory for WebcamServerFactory {
    type Server = WebcamServer;

    fn create(&self, user: &str) -> WebcamServer {
        WebcamServer::new(self.broker.clone(), user, Arc::clone(&self.public_url))
    }
}
