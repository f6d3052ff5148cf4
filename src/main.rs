use std::{net::SocketAddr, sync::Arc};

use tokio::net::TcpListener;
use tracing::info;

mod assets;
mod config;
mod error;
mod invoker;
mod platform;
mod probe;
mod rate_limit;
mod routes;
mod store;

use config::Config;
use error::ApiError;
use invoker::Invoker;
use probe::ToolProbe;
use rate_limit::RateLimiter;
use routes::{AppState, build_router};
use store::{ARTIFACT_MAX_AGE, ArtifactStore, SWEEP_INTERVAL};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "vidgrab=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = Arc::new(Config::from_env());

    let store = Arc::new(ArtifactStore::new(config.scratch_dir.clone()));
    store
        .ensure_scratch_dir()
        .await
        .map_err(|error| ApiError::internal(format!("Could not create scratch dir: {error}")))?;

    let probe = Arc::new(ToolProbe::new(config.clone()));
    let invoker = Arc::new(Invoker::new(config.clone(), probe.clone(), store.clone()));
    let limiter = Arc::new(RateLimiter::new());

    let availability = probe.extractor().await;
    let transcoder = probe.transcoder().await;
    info!(
        tool = availability.method_name(),
        transcoder,
        "extraction backend"
    );

    store.sweep_expired(ARTIFACT_MAX_AGE).await;
    tokio::spawn({
        let store = store.clone();
        async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                store.sweep_expired(ARTIFACT_MAX_AGE).await;
            }
        }
    });

    let state = AppState {
        config: config.clone(),
        probe,
        store,
        invoker,
        limiter,
    };
    let app = build_router(state);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|error| {
            ApiError::internal(format!("Could not bind {}: {error}", config.bind_addr))
        })?;

    info!("Listening on http://{}", config.bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}
