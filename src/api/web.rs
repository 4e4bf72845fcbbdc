use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use rust_embed::Embed;

/// The capture page: asks for the webcam or a screen share and answers
/// commands arriving on `/api/events`.
#[derive(Embed)]
#[folder = "web-dist/"]
struct WebAssets;

pub async fn web_asset(uri: Uri) -> Response {
    let path = match uri.path().trim_start_matches('/') {
        "" => "index.html",
        path => path,
    };

    let Some(content) = WebAssets::get(path) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let mime = mime_guess::from_path(path).first_or_octet_stream();

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, mime.to_string()),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        content.data.into_owned(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_page_is_embedded() {
        let page = WebAssets::get("index.html").expect("web-dist/index.html should be embedded");
        let page = std::str::from_utf8(&page.data).unwrap();
        assert!(page.contains("app.js"));

        let script = WebAssets::get("app.js").expect("web-dist/app.js should be embedded");
        let script = std::str::from_utf8(&script.data).unwrap();
        assert!(script.contains("/api/events"));
        assert!(script.contains("/api/capture-result"));
        assert!(script.contains("/api/capture-error"));
    }

    #[tokio::test]
    async fn unknown_asset_is_not_found() {
        let resp = web_asset(Uri::from_static("/nope.js")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn script_gets_javascript_mime() {
        let resp = web_asset(Uri::from_static("/app.js")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .contains("javascript"));
    }
}
