// src/storage/redis.rs

use crate::error::Result;
use crate::storage::CounterStore;
use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Connection as RedisConnection, Pool, Runtime};
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{info, trace};

/// Builds a connection pool and checks that the server answers.
pub async fn create_pool(redis_url: &str) -> Result<Pool> {
    let pool = PoolConfig::from_url(redis_url).create_pool(Some(Runtime::Tokio1))?;
    let mut conn = pool.get().await?;
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;
    info!("Redis connection pool created and reachable.");
    Ok(pool)
}

/// Redis implementation of the counter store.
///
/// Counter creation and its TTL go through a single `MULTI`/`EXEC` block
/// (`SET key 0 NX EX ttl` followed by `INCR key`), so a counter can never
/// exist without its expiry.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
}

impl RedisStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn get_connection(&self) -> Result<RedisConnection> {
        self.pool.get().await.map_err(Into::into)
    }

    fn ttl_secs(ttl: Duration) -> u64 {
        ttl.as_secs().max(1)
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn get_counter(&self, key: &str) -> Result<i64> {
        let mut conn = self.get_connection().await?;
        let value: Option<i64> = conn.get(key).await?;
        Ok(value.unwrap_or(0))
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.get_connection().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn init_counter(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(0)
            .arg("NX")
            .arg("EX")
            .arg(Self::ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        trace!(key, created = reply.is_some(), "RedisStore::init_counter");
        Ok(reply.is_some())
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64> {
        let mut conn = self.get_connection().await?;
        let (count,): (i64,) = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(key)
            .arg(0)
            .arg("NX")
            .arg("EX")
            .arg(Self::ttl_secs(ttl))
            .ignore()
            .cmd("INCR")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        trace!(key, count, "RedisStore::incr");
        Ok(count)
    }

    async fn set_value(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(Self::ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.get_connection().await?;
        let removed: u64 = conn.del(keys).await?;
        Ok(removed)
    }
}
