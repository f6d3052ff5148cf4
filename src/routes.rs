use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::{ConnectInfo, Query, Request, State},
    http::{
        HeaderMap, HeaderValue,
        header::{
            CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, REFERRER_POLICY,
            X_CONTENT_TYPE_OPTIONS,
        },
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use tower_http::{set_header::SetResponseHeaderLayer, trace::TraceLayer};
use tracing::info;
use url::Url;

use crate::{
    assets,
    config::{Config, non_empty},
    error::{ApiError, InvokeError},
    invoker::{Invoker, MediaInfo, hint_for},
    platform::PlatformTag,
    probe::ToolProbe,
    rate_limit::RateLimiter,
    store::ArtifactStore,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub probe: Arc<ToolProbe>,
    pub store: Arc<ArtifactStore>,
    pub invoker: Arc<Invoker>,
    pub limiter: Arc<RateLimiter>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/check", get(check))
        .route("/api/info", get(fetch_info))
        .route("/api/download", get(download))
        .fallback(get(assets::serve_asset))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .layer(SetResponseHeaderLayer::if_not_present(
            X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            REFERRER_POLICY,
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct MediaQuery {
    url: Option<String>,
    format_id: Option<String>,
    quality: Option<String>,
}

#[derive(Debug, Serialize)]
struct CheckResponse {
    ok: bool,
    platform: PlatformTag,
    tool_available: bool,
    transcoder_available: bool,
    message: String,
}

#[derive(Debug, Serialize)]
struct InfoResponse {
    ok: bool,
    platform: PlatformTag,
    #[serde(flatten)]
    info: MediaInfo,
}

/// Rate limit gate ahead of every handler, API and static alike.
async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let client = client_address(&request);
    if !state.limiter.check(&client).await {
        return ApiError::too_many_requests().into_response();
    }
    next.run(request).await
}

/// First `x-forwarded-for` entry, else the socket address.
fn client_address(request: &Request) -> String {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(non_empty)
    {
        return forwarded.to_string();
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// The mandatory `url` query parameter, validated as a well-formed absolute
/// URL before any component is invoked.
fn require_url(query: &MediaQuery) -> Result<Url, ApiError> {
    let raw = query
        .url
        .as_deref()
        .and_then(non_empty)
        .ok_or_else(|| ApiError::bad_request("Missing url parameter"))?;
    Url::parse(raw).map_err(|_| ApiError::bad_request("Invalid URL"))
}

async fn check(
    State(state): State<AppState>,
    Query(query): Query<MediaQuery>,
) -> Result<Json<CheckResponse>, ApiError> {
    let url = require_url(&query)?;
    let platform = PlatformTag::detect(url.as_str());

    let availability = state.probe.extractor().await;
    let transcoder_available = state.probe.transcoder().await;

    if !availability.available() {
        return Ok(Json(CheckResponse {
            ok: false,
            platform,
            tool_available: false,
            transcoder_available,
            message: "Extraction tool is not installed. Install yt-dlp to enable downloads."
                .to_string(),
        }));
    }

    Ok(Json(CheckResponse {
        ok: true,
        platform,
        tool_available: true,
        transcoder_available,
        message: format!(
            "Platform: {platform}, tool: {}, transcoder: {}",
            availability.method_name(),
            if transcoder_available {
                "available"
            } else {
                "not found"
            }
        ),
    }))
}

async fn fetch_info(
    State(state): State<AppState>,
    Query(query): Query<MediaQuery>,
) -> Result<Json<InfoResponse>, ApiError> {
    let url = require_url(&query)?;
    let platform = PlatformTag::detect(url.as_str());

    let availability = state.probe.extractor().await;
    if !availability.available() {
        return Err(ApiError::internal("Extraction tool is not available"));
    }

    let info = state
        .invoker
        .fetch_metadata(url.as_str())
        .await
        .map_err(|error| ApiError::internal(error.to_string()))?;

    Ok(Json(InfoResponse {
        ok: true,
        platform,
        info,
    }))
}

async fn download(
    State(state): State<AppState>,
    Query(query): Query<MediaQuery>,
) -> Result<Response, ApiError> {
    let url = require_url(&query)?;
    let platform = PlatformTag::detect(url.as_str());

    info!(%platform, url = %url, "download requested");

    let produced = state
        .invoker
        .download(
            url.as_str(),
            query.format_id.as_deref(),
            query.quality.as_deref(),
        )
        .await
        .map_err(|error| download_error(error, platform))?;

    let body = state
        .store
        .serve_and_delete(&produced.artifact)
        .await
        .map_err(|error| ApiError::internal(format!("Could not read the produced file: {error}")))?;

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("video/mp4"));
    headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&produced.artifact.size.to_string())
            .map_err(|_| ApiError::internal("Could not build response headers"))?,
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&produced.filename))
            .map_err(|_| ApiError::internal("Could not build response headers"))?,
    );
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));

    Ok((headers, body).into_response())
}

fn download_error(error: InvokeError, platform: PlatformTag) -> ApiError {
    match error {
        InvokeError::Io(_) => ApiError::internal("Server error"),
        error => ApiError::bad_request(error.to_string())
            .with_hint(hint_for(&error))
            .with_platform(platform),
    }
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let mut sanitized = String::with_capacity(value.len());

    for character in value.chars() {
        if character.is_ascii_alphanumeric() || matches!(character, '.' | '-' | '_') {
            sanitized.push(character);
        } else if !sanitized.ends_with('_') {
            sanitized.push('_');
        }
    }

    let compact: String = sanitized.trim_matches('_').chars().take(200).collect();
    if compact.is_empty() {
        "download.mp4".to_string()
    } else {
        compact
    }
}

#[cfg(test)]
mod router_tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request as HttpRequest, StatusCode},
    };
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct TestServer {
        router: Router,
        _public: TempDir,
        _scratch: TempDir,
    }

    fn test_server() -> TestServer {
        let public = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();

        std::fs::write(
            public.path().join("index.html"),
            "<title>__SITE_NAME__</title><script>ga('__GA_ID__')</script>",
        )
        .unwrap();
        std::fs::write(public.path().join("style.css"), "body{}").unwrap();

        let config = Arc::new(Config {
            bind_addr: "127.0.0.1:0".to_string(),
            ytdlp_path: "/nonexistent/yt-dlp".to_string(),
            python_path: "/nonexistent/python3".to_string(),
            ga_id: "G-TEST123".to_string(),
            adsense_client: "ca-pub-test".to_string(),
            default_site_name: "VidGrab".to_string(),
            domain_site_names: [("clips.example".to_string(), "Clip Site".to_string())]
                .into_iter()
                .collect(),
            public_dir: public.path().to_path_buf(),
            scratch_dir: scratch.path().to_path_buf(),
        });

        let store = Arc::new(ArtifactStore::new(config.scratch_dir.clone()));
        let probe = Arc::new(ToolProbe::new(config.clone()));
        let invoker = Arc::new(Invoker::new(config.clone(), probe.clone(), store.clone()));
        let state = AppState {
            config,
            probe,
            store,
            invoker,
            limiter: Arc::new(RateLimiter::new()),
        };

        TestServer {
            router: build_router(state),
            _public: public,
            _scratch: scratch,
        }
    }

    async fn get(server: &TestServer, uri: &str, client: &str) -> Response {
        let request = HttpRequest::builder()
            .uri(uri)
            .header("x-forwarded-for", client)
            .body(Body::empty())
            .unwrap();
        server.router.clone().oneshot(request).await.unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn missing_url_is_rejected_on_every_api_endpoint() {
        let server = test_server();

        for endpoint in ["/api/check", "/api/info", "/api/download"] {
            let response = get(&server, endpoint, "9.9.9.1").await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{endpoint}");
            let body = json_body(response).await;
            assert_eq!(body["ok"], false);
            assert!(body["error"].as_str().unwrap().contains("url"));
        }
    }

    #[tokio::test]
    async fn malformed_url_is_rejected_before_any_invocation() {
        let server = test_server();

        for endpoint in ["/api/check", "/api/info", "/api/download"] {
            let response = get(&server, &format!("{endpoint}?url=not%20a%20url"), "9.9.9.2").await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{endpoint}");
            let body = json_body(response).await;
            assert_eq!(body["error"], "Invalid URL");
        }
    }

    #[tokio::test]
    async fn rate_limit_rejects_the_101st_request() {
        let server = test_server();

        for i in 0..crate::rate_limit::RATE_LIMIT_MAX_REQUESTS {
            let response = get(&server, "/api/check", "10.0.0.1").await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "request {i}");
        }

        let response = get(&server, "/api/check", "10.0.0.1").await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = json_body(response).await;
        assert!(body["error"].as_str().is_some());

        // A different client is unaffected.
        let response = get(&server, "/api/check", "10.0.0.2").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn traversal_paths_never_escape_the_asset_root() {
        let server = test_server();

        let response = get(&server, "/../../etc/passwd", "9.9.9.3").await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        // Encoded dots stay literal and simply miss.
        let response = get(&server, "/%2e%2e/%2e%2e/etc/passwd", "9.9.9.3").await;
        assert!(matches!(
            response.status(),
            StatusCode::FORBIDDEN | StatusCode::NOT_FOUND
        ));
    }

    #[tokio::test]
    async fn missing_assets_are_404() {
        let server = test_server();
        let response = get(&server, "/nope.css", "9.9.9.4").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn index_is_served_with_tokens_substituted() {
        let server = test_server();

        let request = HttpRequest::builder()
            .uri("/")
            .header("x-forwarded-for", "9.9.9.5")
            .header("host", "clips.example")
            .body(Body::empty())
            .unwrap();
        let response = server.router.clone().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            "text/html; charset=utf-8"
        );
        assert_eq!(response.headers()[X_CONTENT_TYPE_OPTIONS], "nosniff");

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let html = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(html.contains("<title>Clip Site</title>"));
        assert!(html.contains("ga('G-TEST123')"));
        assert!(!html.contains("__SITE_NAME__"));
    }

    #[tokio::test]
    async fn untemplated_assets_are_streamed_verbatim() {
        let server = test_server();
        let response = get(&server, "/style.css", "9.9.9.6").await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/css; charset=utf-8");
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"body{}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_filenames_for_headers() {
        assert_eq!(sanitize_ascii_filename("My Video.mp4"), "My_Video.mp4");
        assert_eq!(
            sanitize_ascii_filename("clip // (final)!!.webm"),
            "clip_final_.webm"
        );
        assert_eq!(sanitize_ascii_filename("日本語タイトル"), "download.mp4");
        assert_eq!(sanitize_ascii_filename("a".repeat(300).as_str()).len(), 200);
    }

    #[test]
    fn content_disposition_carries_both_filename_forms() {
        let value = build_content_disposition("café clip.mp4");
        assert!(value.starts_with("attachment; filename=\"caf_clip.mp4\""));
        assert!(value.contains("filename*=UTF-8''caf%C3%A9%20clip.mp4"));
    }

    #[test]
    fn url_validation_rejects_relative_and_garbage() {
        let query = |url: Option<&str>| MediaQuery {
            url: url.map(ToString::to_string),
            format_id: None,
            quality: None,
        };

        assert!(require_url(&query(None)).is_err());
        assert!(require_url(&query(Some(""))).is_err());
        assert!(require_url(&query(Some("not a url"))).is_err());
        assert!(require_url(&query(Some("/relative/path"))).is_err());
        assert!(require_url(&query(Some("https://youtu.be/abc"))).is_ok());
    }

    #[test]
    fn download_errors_become_client_errors_with_hints() {
        let api = download_error(InvokeError::ExtractorNotFound, PlatformTag::Youtube);
        assert_eq!(api.status, axum::http::StatusCode::BAD_REQUEST);
        assert!(api.hint.unwrap().contains("not installed"));
        assert_eq!(api.platform, Some(PlatformTag::Youtube));

        let api = download_error(
            InvokeError::Io(std::io::Error::other("boom")),
            PlatformTag::Direct,
        );
        assert_eq!(api.status, axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        assert!(api.hint.is_none());
    }
}
