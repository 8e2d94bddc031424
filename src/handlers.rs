// src/handlers.rs

use crate::client::{GenerationDefaults, GenerationResult};
use crate::error::{AppError, Result};
use crate::generation::{Content, GenerationConfig, GenerationRequest};
use crate::state::AppState;
use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

const DEFAULT_SERVICE: &str = "api";
const DEFAULT_OPERATION: &str = "generate";

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub keys_total: usize,
    pub keys_available: usize,
}

/// Liveness plus a pool summary. Reads counters, so a store outage fails it.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Result<Json<HealthResponse>> {
    let statuses = state.key_manager.all_statuses().await?;
    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        keys_total: statuses.len(),
        keys_available: statuses.iter().filter(|s| s.available).count(),
    }))
}

/// Body of `POST /v1/generate`. Either `contents` or `prompt` must be given;
/// a `prompt` is appended as a final user turn.
#[derive(Debug, Deserialize)]
pub struct GenerateBody {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub contents: Vec<Content>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub config: GenerationConfig,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub actor_id: Option<String>,
}

impl GenerateBody {
    fn into_request(self) -> Result<(GenerationRequest, String, String, Option<String>)> {
        let mut contents = self.contents;
        if let Some(prompt) = self.prompt.filter(|p| !p.trim().is_empty()) {
            contents.push(Content::user(prompt));
        }
        if contents.is_empty() {
            return Err(AppError::invalid_request(
                "either `contents` or `prompt` is required",
            ));
        }

        let request = GenerationRequest {
            model: self.model,
            contents,
            config: self.config,
        };
        let service = self
            .service
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SERVICE.to_string());
        let operation = self
            .operation
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_OPERATION.to_string());
        Ok((request, service, operation, self.actor_id))
    }
}

pub async fn generate(
    State(state): State<Arc<AppState>>,
    Json(body): Json<GenerateBody>,
) -> Result<Json<GenerationResult>> {
    let (request, service, operation, actor_id) = body.into_request()?;
    debug!(
        service = %service,
        operation = %operation,
        turns = request.contents.len(),
        "Generate request received"
    );
    let result = state
        .client
        .generate(request, &service, &operation, actor_id.as_deref())
        .await?;
    Ok(Json(result))
}

pub async fn defaults(State(state): State<Arc<AppState>>) -> Json<GenerationDefaults> {
    Json(GenerationDefaults {
        model: state.client.default_model().to_string(),
        config: state.client.default_generation_config().clone(),
    })
}
