// src/lib.rs

pub mod admin;
pub mod cli;
pub mod client;
pub mod clock;
pub mod config;
pub mod credential;
pub mod error;
pub mod generation;
pub mod handlers;
pub mod key_manager;
pub mod metrics;
pub mod middleware;
pub mod state;
pub mod storage;
pub mod usage;

use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{HeaderValue, Request as AxumRequest},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use std::{path::PathBuf, sync::Arc, time::Duration, time::Instant};
use tower_http::timeout::TimeoutLayer;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

pub use client::{GenAiClient, GenerationResult, RetryPolicy};
pub use config::AppConfig;
pub use error::{AppError, Result};
pub use key_manager::{KeyManager, KeyStatus};
pub use state::AppState;

/// All HTTP routes over one shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.server.max_body_bytes;
    // Whole-request ceiling: every counted attempt may hit the upstream timeout.
    let request_ceiling = Duration::from_secs(
        state
            .config
            .generation
            .request_timeout_secs
            .saturating_mul(u64::from(state.config.retry.max_attempts) + 1),
    );

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/v1/generate", post(handlers::generate))
        .route("/v1/defaults", get(handlers::defaults))
        .merge(admin::admin_routes(state.clone()))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TimeoutLayer::new(request_ceiling))
        .layer(axum::middleware::from_fn(trace_requests))
        .with_state(state)
}

/// Tags every request with an id and logs its completion.
async fn trace_requests(
    mut req: AxumRequest<Body>,
    next: axum::middleware::Next,
) -> impl IntoResponse {
    let request_id = Uuid::new_v4();
    let start_time = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let span = info_span!(
        "request",
        request_id = %request_id,
        http.method = %method,
        url.path = %path,
    );

    req.extensions_mut().insert(request_id);

    async move {
        let mut response = next.run(req).await;
        let elapsed = start_time.elapsed();

        if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
            response.headers_mut().insert("X-Request-ID", value);
        }

        info!(
            http.response.duration = ?elapsed,
            http.status_code = response.status().as_u16(),
            "Finished processing request"
        );

        response
    }
    .instrument(span)
    .await
}

/// Resolves the configuration path: explicit override, then `CONFIG_PATH`,
/// then `config.yaml`.
pub fn resolve_config_path(config_path_override: Option<PathBuf>) -> PathBuf {
    config_path_override.unwrap_or_else(|| {
        std::env::var("CONFIG_PATH").map_or_else(|_| PathBuf::from("config.yaml"), PathBuf::from)
    })
}

/// Loads and validates configuration, logging a summary without secrets.
pub fn setup_configuration(config_path_override: Option<PathBuf>) -> Result<AppConfig> {
    let config_path = resolve_config_path(config_path_override);
    let config_path_display = config_path.display().to_string();

    let app_config = config::load_config(&config_path).map_err(|e| {
        error!(
            config.path = %config_path_display,
            error = ?e,
            "Failed to load or validate configuration. Exiting."
        );
        e
    })?;

    info!(
        config.path = %config_path_display,
        config.total_keys = app_config.keys.api_keys.len(),
        config.daily_quota = app_config.keys.daily_quota,
        config.default_model = %app_config.generation.default_model,
        config.redis = app_config.redis_url.is_some(),
        server.port = app_config.server.port,
        "Configuration loaded and validated successfully."
    );
    Ok(app_config)
}

/// Builds the application: configuration, state, metrics recorder and router.
pub async fn run(config_path_override: Option<PathBuf>) -> Result<(Router, AppConfig)> {
    info!("Starting Gemini key pool service...");

    let app_config = setup_configuration(config_path_override)?;

    let app_state = AppState::new(&app_config).await.map_err(|e| {
        error!(error = ?e, "Failed to initialize application state. Exiting.");
        e
    })?;
    info!(keys = app_state.key_manager.len(), "Application state initialized successfully.");

    metrics::install_recorder()?;

    Ok((create_router(Arc::new(app_state)), app_config))
}
