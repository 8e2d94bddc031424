// src/storage/memory.rs

use crate::clock::{Clock, SystemClock};
use crate::error::{AppError, Result};
use crate::storage::CounterStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::trace;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Process-local counter store. Counters are not shared between processes, so
/// this is meant for tests and single-instance deployments without Redis.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    fn expiry_from(&self, ttl: Duration) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(ttl)
            .ok()
            .map(|ttl| self.clock.now() + ttl)
    }

    fn parse_counter(key: &str, value: &str) -> Result<i64> {
        value.parse::<i64>().map_err(|e| {
            AppError::storage(
                "parse_counter",
                format!("value at '{key}' is not an integer: {e}"),
            )
        })
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for InMemoryStore {
    async fn get_counter(&self, key: &str) -> Result<i64> {
        match self.get_value(key).await? {
            Some(value) => Self::parse_counter(key, &value),
            None => Ok(0),
        }
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn init_counter(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        trace!("InMemoryStore::init_counter: waiting for write lock");
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: "0".to_string(),
                expires_at: self.expiry_from(ttl),
            },
        );
        Ok(true)
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64> {
        let now = self.clock.now();
        trace!("InMemoryStore::incr: waiting for write lock");
        let mut entries = self.entries.write().await;

        let next = match entries.get_mut(key).filter(|entry| entry.is_live(now)) {
            Some(entry) => {
                let next = Self::parse_counter(key, &entry.value)? + 1;
                entry.value = next.to_string();
                next
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: "1".to_string(),
                        expires_at: self.expiry_from(ttl),
                    },
                );
                1
            }
        };
        Ok(next)
    }

    async fn set_value(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let expires_at = self.expiry_from(ttl);
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let removed = keys
            .iter()
            .filter_map(|key| entries.remove(key))
            .filter(|entry| entry.is_live(now))
            .count();
        Ok(removed as u64)
    }
}
