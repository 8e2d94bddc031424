// src/admin.rs

use crate::{
    error::Result,
    key_manager::KeyStatus,
    state::AppState,
    usage::{UsageRecord, UsageStats},
};
use axum::{
    extract::{Query, State},
    middleware,
    routing::{get, post},
    Json, Router,
};
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

const DEFAULT_RECENT_LIMIT: usize = 50;
const MAX_RECENT_LIMIT: usize = 1000;

/// Operator routes under `/admin`, all behind bearer-token auth.
pub fn admin_routes(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new().nest(
        "/admin",
        Router::new()
            .route("/keys", get(list_keys))
            .route("/keys/reset", post(reset_keys))
            .route("/usage/stats", get(usage_stats))
            .route("/usage/recent", get(recent_usage))
            .route_layer(middleware::from_fn_with_state(
                state,
                crate::middleware::admin_auth_middleware,
            )),
    )
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KeyPoolReport {
    pub keys: Vec<KeyStatus>,
    pub total_available_capacity: u64,
    pub available_keys: usize,
}

impl KeyPoolReport {
    pub fn from_statuses(keys: Vec<KeyStatus>) -> Self {
        let available: Vec<&KeyStatus> = keys.iter().filter(|k| k.available).collect();
        let total_available_capacity: u64 = available.iter().map(|k| k.remaining_today()).sum();
        let available_keys = available.len();
        Self {
            keys,
            total_available_capacity,
            available_keys,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResetResponse {
    pub counters_removed: u64,
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub since_hours: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<usize>,
}

/// Status of every key plus remaining capacity across available keys.
pub async fn list_keys(State(state): State<Arc<AppState>>) -> Result<Json<KeyPoolReport>> {
    let statuses = state.key_manager.all_statuses().await?;
    Ok(Json(KeyPoolReport::from_statuses(statuses)))
}

pub async fn reset_keys(State(state): State<Arc<AppState>>) -> Result<Json<ResetResponse>> {
    let counters_removed = state.key_manager.reset_all().await?;
    info!(counters_removed, "Key counters reset via admin API");
    Ok(Json(ResetResponse { counters_removed }))
}

pub async fn usage_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<UsageStats>> {
    let since = query
        .since_hours
        .map(|hours| Utc::now() - ChronoDuration::hours(i64::from(hours)));
    Ok(Json(state.usage_log.stats(since).await?))
}

pub async fn recent_usage(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<Vec<UsageRecord>>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RECENT_LIMIT)
        .min(MAX_RECENT_LIMIT);
    Ok(Json(state.usage_log.recent(limit).await?))
}
