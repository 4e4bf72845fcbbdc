// MCP resource handlers
//
// - webcam://current -> a fresh frame from the user's webcam

use rmcp::model::*;

use super::WebcamServer;
use crate::broker::{CaptureError, CaptureKind};

/// URI of the live webcam view.
pub const CURRENT_VIEW_URI: &str = "webcam://current";

pub fn list_resources() -> ListResourcesResult {
    let mut resource = RawResource::new(CURRENT_VIEW_URI, "Current view from the Webcam");
    resource.description = Some("A fresh frame captured from the human's webcam.".to_string());
    resource.mime_type = Some("image/jpeg".to_string());

    ListResourcesResult {
        meta: None,
        next_cursor: None,
        resources: vec![resource.no_annotation()],
    }
}

/// Read a resource by URI. Only [`CURRENT_VIEW_URI`] exists.
pub async fn read_resource(
    server: &WebcamServer,
    request: ReadResourceRequestParams,
) -> Result<ReadResourceResult, ErrorData> {
    let uri = request.uri;
    if uri != CURRENT_VIEW_URI {
        return Err(ErrorData::resource_not_found(
            format!("unknown resource: {uri}"),
            None,
        ));
    }

    let image = server
        .broker
        .capture(&server.user, CaptureKind::Capture)
        .await
        .map_err(|e| match e {
            CaptureError::NoClients => ErrorData::internal_error(server.no_browser_message(), None),
            other => ErrorData::internal_error(format!("failed to capture webcam image: {other}"), None),
        })?;

    Ok(ReadResourceResult {
        contents: vec![ResourceContents::BlobResourceContents {
            uri,
            mime_type: Some(image.mime_type),
            blob: image.data,
            meta: None,
        }],
    })
}
