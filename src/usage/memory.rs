// src/usage/memory.rs

use super::{UsageLog, UsageRecord, UsageStats, DEFAULT_MAX_RECORDS};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Bounded in-process usage log. Oldest records are dropped first.
#[derive(Debug, Clone)]
pub struct InMemoryUsageLog {
    records: Arc<RwLock<VecDeque<UsageRecord>>>,
    max_records: usize,
}

impl InMemoryUsageLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_RECORDS)
    }

    pub fn with_capacity(max_records: usize) -> Self {
        Self {
            records: Arc::new(RwLock::new(VecDeque::new())),
            max_records: max_records.max(1),
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

impl Default for InMemoryUsageLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UsageLog for InMemoryUsageLog {
    async fn record(&self, record: &UsageRecord) -> Result<()> {
        let mut records = self.records.write().await;
        records.push_back(record.clone());
        while records.len() > self.max_records {
            records.pop_front();
        }
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<UsageRecord>> {
        let records = self.records.read().await;
        Ok(records.iter().rev().take(limit).cloned().collect())
    }

    async fn stats(&self, since: Option<DateTime<Utc>>) -> Result<UsageStats> {
        let records = self.records.read().await;
        Ok(UsageStats::from_records(
            records
                .iter()
                .filter(|r| since.map_or(true, |s| r.created_at >= s)),
        ))
    }
}
