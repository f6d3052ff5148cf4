use std::path::{Component, Path};

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Uri, header},
    response::{IntoResponse, Response},
};
use tokio_util::io::ReaderStream;

use crate::{error::ApiError, routes::AppState};

/// Fallback handler: serves files from the public asset root, with
/// serve-time token substitution on HTML and script assets.
pub async fn serve_asset(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let requested = uri.path().trim_start_matches('/');
    let relative = if requested.is_empty() {
        "index.html"
    } else {
        requested
    };

    if has_traversal(relative) {
        return Err(ApiError::forbidden("Forbidden"));
    }

    // Canonicalize both ends so a symlink cannot point outside the root.
    let root = tokio::fs::canonicalize(&state.config.public_dir)
        .await
        .map_err(|_| ApiError::not_found("Not found"))?;
    let resolved = tokio::fs::canonicalize(root.join(relative))
        .await
        .map_err(|_| ApiError::not_found("Not found"))?;
    if !resolved.starts_with(&root) {
        return Err(ApiError::forbidden("Forbidden"));
    }

    let metadata = tokio::fs::metadata(&resolved)
        .await
        .map_err(|_| ApiError::not_found("Not found"))?;
    if !metadata.is_file() {
        return Err(ApiError::not_found("Not found"));
    }

    let content_type = content_type_for(&resolved);

    if is_templated(&resolved) {
        let text = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|_| ApiError::not_found("Not found"))?;
        let host = headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok());
        let rendered = substitute_tokens(&text, &state.config, host);
        return Ok(([(header::CONTENT_TYPE, content_type)], rendered).into_response());
    }

    let file = tokio::fs::File::open(&resolved)
        .await
        .map_err(|_| ApiError::not_found("Not found"))?;
    let body = Body::from_stream(ReaderStream::new(file));
    Ok(([(header::CONTENT_TYPE, content_type)], body).into_response())
}

fn has_traversal(relative: &str) -> bool {
    Path::new(relative)
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
}

fn is_templated(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("html") | Some("js")
    )
}

fn substitute_tokens(text: &str, config: &crate::config::Config, host: Option<&str>) -> String {
    text.replace("__GA_ID__", &config.ga_id)
        .replace("__ADSENSE_CLIENT__", &config.adsense_client)
        .replace("__SITE_NAME__", config.site_name_for_host(host))
}

fn content_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "html" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" => "application/javascript; charset=utf-8",
        "xml" => "application/xml; charset=utf-8",
        "txt" => "text/plain; charset=utf-8",
        "json" => "application/json; charset=utf-8",
        "svg" => "image/svg+xml; charset=utf-8",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traversal_components_are_rejected() {
        assert!(has_traversal("../etc/passwd"));
        assert!(has_traversal("a/../../b"));
        assert!(has_traversal("/etc/passwd"));
        assert!(!has_traversal("index.html"));
        assert!(!has_traversal("css/site.css"));
    }

    #[test]
    fn templated_extensions() {
        assert!(is_templated(Path::new("index.html")));
        assert!(is_templated(Path::new("app.js")));
        assert!(!is_templated(Path::new("site.css")));
        assert!(!is_templated(Path::new("logo.svg")));
    }

    #[test]
    fn content_types_match_extension_table() {
        assert_eq!(content_type_for(Path::new("a.html")), "text/html; charset=utf-8");
        assert_eq!(content_type_for(Path::new("a.MP4")), "video/mp4");
        assert_eq!(content_type_for(Path::new("a.bin")), "application/octet-stream");
        assert_eq!(content_type_for(Path::new("noext")), "application/octet-stream");
    }
}
