// src/storage/traits.rs

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Shared counter store backing the key pool.
///
/// Every mutation is a single atomic operation against the backend. There are
/// no transactions spanning multiple keys.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Current integer value, `0` when the key is absent or expired.
    async fn get_counter(&self, key: &str) -> Result<i64>;

    /// Raw string value, `None` when absent or expired.
    async fn get_value(&self, key: &str) -> Result<Option<String>>;

    /// Creates the counter at `0` with the given TTL unless it already exists.
    /// Returns `true` when the counter was created.
    async fn init_counter(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Increments the counter by one and returns the new value. When the
    /// increment creates the key, `ttl` is applied in the same atomic step;
    /// an existing key keeps its expiry.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64>;

    /// Overwrites a value and its TTL.
    async fn set_value(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Deletes the given keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64>;
}
