// src/usage/mod.rs

//! Usage telemetry: one record per `generate()` call and the aggregates the
//! admin surface reports.

pub mod memory;
pub mod redis;

pub use memory::InMemoryUsageLog;
pub use redis::RedisUsageLog;

use crate::error::Result;
use crate::generation::TokenUsage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Records kept before the oldest are dropped.
pub const DEFAULT_MAX_RECORDS: usize = 100_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub service: String,
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    pub model: String,
    #[serde(default)]
    pub input_tokens: Option<u32>,
    #[serde(default)]
    pub output_tokens: Option<u32>,
    #[serde(default)]
    pub total_tokens: Option<u32>,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl UsageRecord {
    pub fn new(service: &str, operation: &str, model: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            service: service.to_string(),
            operation: operation.to_string(),
            actor_id: None,
            model: model.to_string(),
            input_tokens: None,
            output_tokens: None,
            total_tokens: None,
            duration_ms: 0,
            success: false,
            error_message: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_actor(mut self, actor_id: Option<&str>) -> Self {
        self.actor_id = actor_id.map(str::to_string);
        self
    }

    pub fn with_tokens(mut self, usage: &TokenUsage) -> Self {
        self.input_tokens = usage.input_tokens;
        self.output_tokens = usage.output_tokens;
        self.total_tokens = usage.total_tokens;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn succeeded(mut self) -> Self {
        self.success = true;
        self.error_message = None;
        self
    }

    pub fn failed(mut self, message: impl Into<String>) -> Self {
        self.success = false;
        self.error_message = Some(message.into());
        self
    }

    /// Token total, falling back to input + output when the provider omitted it.
    pub fn tokens(&self) -> u64 {
        match self.total_tokens {
            Some(total) => u64::from(total),
            None => {
                u64::from(self.input_tokens.unwrap_or(0))
                    + u64::from(self.output_tokens.unwrap_or(0))
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakdownStats {
    pub requests: u64,
    pub failures: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_tokens: u64,
    pub average_duration_ms: f64,
    /// Keyed by `service/operation`.
    pub by_operation: BTreeMap<String, BreakdownStats>,
    pub by_model: BTreeMap<String, BreakdownStats>,
}

impl UsageStats {
    pub fn from_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a UsageRecord>,
    {
        let mut stats = UsageStats::default();
        let mut total_duration_ms: u64 = 0;

        for record in records {
            stats.total_requests += 1;
            if record.success {
                stats.successful_requests += 1;
            } else {
                stats.failed_requests += 1;
            }
            let tokens = record.tokens();
            stats.total_input_tokens += u64::from(record.input_tokens.unwrap_or(0));
            stats.total_output_tokens += u64::from(record.output_tokens.unwrap_or(0));
            stats.total_tokens += tokens;
            total_duration_ms = total_duration_ms.saturating_add(record.duration_ms);

            let op_key = format!("{}/{}", record.service, record.operation);
            for entry in [
                stats.by_operation.entry(op_key).or_default(),
                stats.by_model.entry(record.model.clone()).or_default(),
            ] {
                entry.requests += 1;
                entry.total_tokens += tokens;
                if !record.success {
                    entry.failures += 1;
                }
            }
        }

        if stats.total_requests > 0 {
            stats.success_rate = stats.successful_requests as f64 / stats.total_requests as f64;
            stats.average_duration_ms = total_duration_ms as f64 / stats.total_requests as f64;
        }
        stats
    }
}

/// Append-only sink for usage records.
#[async_trait]
pub trait UsageLog: Send + Sync {
    async fn record(&self, record: &UsageRecord) -> Result<()>;

    /// Newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<UsageRecord>>;

    /// Aggregates over records created at or after `since`, or all of them.
    async fn stats(&self, since: Option<DateTime<Utc>>) -> Result<UsageStats>;
}
