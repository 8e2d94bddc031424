// src/state.rs

use crate::client::GenAiClient;
use crate::config::AppConfig;
use crate::error::Result;
use crate::generation::{GeminiProvider, GenerationProvider};
use crate::key_manager::KeyManager;
use crate::storage::{create_pool, CounterStore, InMemoryStore, RedisStore};
use crate::usage::{InMemoryUsageLog, RedisUsageLog, UsageLog};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Shared application state, one instance per process.
pub struct AppState {
    pub config: AppConfig,
    pub key_manager: Arc<KeyManager>,
    pub client: Arc<GenAiClient>,
    pub usage_log: Arc<dyn UsageLog>,
    pub start_time: Instant,
}

impl AppState {
    /// Wires storage, the key pool and the client from configuration.
    ///
    /// With `redis_url` set, counters and usage records go to Redis. Otherwise
    /// both stay in process memory, which is only correct for a single instance.
    pub async fn new(config: &AppConfig) -> Result<Self> {
        let (store, usage_log) = Self::build_backends(config).await?;
        let provider: Arc<dyn GenerationProvider> =
            Arc::new(GeminiProvider::from_settings(&config.generation)?);
        Self::with_components(config, store, usage_log, provider).await
    }

    /// Same wiring with caller-supplied backends and provider.
    pub async fn with_components(
        config: &AppConfig,
        store: Arc<dyn CounterStore>,
        usage_log: Arc<dyn UsageLog>,
        provider: Arc<dyn GenerationProvider>,
    ) -> Result<Self> {
        let key_manager = Arc::new(KeyManager::from_config(config, store).await?);
        let client = Arc::new(GenAiClient::from_config(
            config,
            key_manager.clone(),
            provider,
            usage_log.clone(),
        ));

        Ok(Self {
            config: config.clone(),
            key_manager,
            client,
            usage_log,
            start_time: Instant::now(),
        })
    }

    async fn build_backends(
        config: &AppConfig,
    ) -> Result<(Arc<dyn CounterStore>, Arc<dyn UsageLog>)> {
        match &config.redis_url {
            Some(redis_url) => {
                let pool = create_pool(redis_url).await?;
                info!(
                    redis.key_prefix = %config.key_prefix(),
                    "Using Redis for key counters and usage records"
                );
                Ok((
                    Arc::new(RedisStore::new(pool.clone())),
                    Arc::new(RedisUsageLog::new(pool, &config.key_prefix())),
                ))
            }
            None => {
                warn!("REDIS_URL not set: key counters are process-local and not shared across instances");
                Ok((
                    Arc::new(InMemoryStore::new()),
                    Arc::new(InMemoryUsageLog::new()),
                ))
            }
        }
    }

    pub fn admin_token(&self) -> Option<&str> {
        self.config
            .server
            .admin_token
            .as_deref()
            .filter(|t| !t.is_empty())
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("key_manager", &self.key_manager)
            .field("client", &self.client)
            .field("uptime_secs", &self.start_time.elapsed().as_secs())
            .finish_non_exhaustive()
    }
}
