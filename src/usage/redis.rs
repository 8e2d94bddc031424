// src/usage/redis.rs

use super::{UsageLog, UsageRecord, UsageStats, DEFAULT_MAX_RECORDS};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Connection as RedisConnection, Pool};
use redis::AsyncCommands;
use tracing::{trace, warn};

const USAGE_LOG_SUFFIX: &str = "usage_log";

/// Usage log kept as a capped Redis list of JSON records, oldest at the head.
#[derive(Clone)]
pub struct RedisUsageLog {
    pool: Pool,
    list_key: String,
    max_records: usize,
}

impl RedisUsageLog {
    pub fn new(pool: Pool, key_prefix: &str) -> Self {
        Self {
            pool,
            list_key: format!("{key_prefix}{USAGE_LOG_SUFFIX}"),
            max_records: DEFAULT_MAX_RECORDS,
        }
    }

    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = max_records.max(1);
        self
    }

    async fn get_connection(&self) -> Result<RedisConnection> {
        self.pool.get().await.map_err(Into::into)
    }

    fn decode(raw: Vec<String>) -> Vec<UsageRecord> {
        raw.into_iter()
            .filter_map(|entry| match serde_json::from_str::<UsageRecord>(&entry) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed usage record");
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl UsageLog for RedisUsageLog {
    async fn record(&self, record: &UsageRecord) -> Result<()> {
        let payload = serde_json::to_string(record)?;
        let mut conn = self.get_connection().await?;
        let keep_from = -(isize::try_from(self.max_records).unwrap_or(isize::MAX));
        let _: () = redis::pipe()
            .rpush(&self.list_key, payload)
            .ignore()
            .ltrim(&self.list_key, keep_from, -1)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| AppError::RedisOperation {
                operation: "usage_log_record".to_string(),
                message: e.to_string(),
            })?;
        trace!(id = %record.id, "Usage record appended");
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<UsageRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.get_connection().await?;
        let start = -(isize::try_from(limit).unwrap_or(isize::MAX));
        let raw: Vec<String> = conn.lrange(&self.list_key, start, -1).await?;
        let mut records = Self::decode(raw);
        records.reverse();
        Ok(records)
    }

    async fn stats(&self, since: Option<DateTime<Utc>>) -> Result<UsageStats> {
        let mut conn = self.get_connection().await?;
        let raw: Vec<String> = conn.lrange(&self.list_key, 0, -1).await?;
        let records = Self::decode(raw);
        Ok(UsageStats::from_records(
            records
                .iter()
                .filter(|r| since.map_or(true, |s| r.created_at >= s)),
        ))
    }
}
