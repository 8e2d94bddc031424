// src/key_manager.rs

use crate::clock::{until_next_utc_midnight, Clock, SystemClock};
use crate::config::{app::DEFAULT_KEY_PREFIX, AppConfig};
use crate::credential::Credential;
use crate::error::{AppError, Result};
use crate::metrics;
use crate::storage::CounterStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const REQUESTS_SUFFIX: &str = "requests";
const LAST_USED_SUFFIX: &str = "last_used";
const FAILURES_SUFFIX: &str = "failures";

/// Read-only projection of one key's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyStatus {
    pub fingerprint: String,
    pub requests_today: u64,
    pub daily_quota: u64,
    pub consecutive_failures: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub available: bool,
}

impl KeyStatus {
    pub fn remaining_today(&self) -> u64 {
        self.daily_quota.saturating_sub(self.requests_today)
    }
}

/// Limits applied to every key in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyLimits {
    pub daily_quota: u64,
    pub max_consecutive_failures: u64,
    pub failure_window: Duration,
}

impl Default for KeyLimits {
    fn default() -> Self {
        Self {
            daily_quota: 1500,
            max_consecutive_failures: 5,
            failure_window: Duration::from_secs(3600),
        }
    }
}

/// Round-robin pool over the configured API keys.
///
/// Usage and failure counters live in a [`CounterStore`] so that several
/// processes can share one quota budget. The cursor is process-local and
/// deliberately unsynchronized across a scan: the store's atomic increments
/// are the only correctness boundary.
pub struct KeyManager {
    credentials: Vec<Credential>,
    cursor: AtomicUsize,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    limits: KeyLimits,
}

impl KeyManager {
    /// Builds the pool from configuration and seeds today's usage counters.
    #[instrument(skip_all, name = "key_manager_init")]
    pub async fn from_config(config: &AppConfig, store: Arc<dyn CounterStore>) -> Result<Self> {
        let limits = KeyLimits {
            daily_quota: u64::from(config.keys.daily_quota),
            max_consecutive_failures: u64::from(config.keys.max_consecutive_failures),
            failure_window: Duration::from_secs(config.keys.failure_window_secs),
        };
        Self::new(
            &config.keys.api_keys,
            limits,
            store,
            Arc::new(SystemClock),
            config.key_prefix(),
        )
        .await
    }

    pub async fn new(
        api_keys: &[String],
        limits: KeyLimits,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        key_prefix: impl Into<String>,
    ) -> Result<Self> {
        let credentials: Vec<Credential> = api_keys
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(Credential::new)
            .collect();

        if credentials.is_empty() {
            return Err(AppError::config_validation(
                "No usable API key configured",
                Some("keys.api_keys"),
            ));
        }

        let key_prefix = key_prefix.into();
        let manager = Self {
            credentials,
            cursor: AtomicUsize::new(0),
            store,
            clock,
            key_prefix: if key_prefix.is_empty() {
                DEFAULT_KEY_PREFIX.to_string()
            } else {
                key_prefix
            },
            limits,
        };

        let ttl = manager.until_midnight();
        let mut seeded = 0usize;
        for credential in &manager.credentials {
            if manager
                .store
                .init_counter(&manager.requests_key(credential), ttl)
                .await?
            {
                seeded += 1;
            }
        }

        info!(
            keys.total = manager.credentials.len(),
            keys.seeded = seeded,
            daily_quota = manager.limits.daily_quota,
            max_consecutive_failures = manager.limits.max_consecutive_failures,
            "Key pool initialized"
        );
        Ok(manager)
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    fn counter_key(&self, credential: &Credential, suffix: &str) -> String {
        format!("{}{}:{}", self.key_prefix, credential.fingerprint(), suffix)
    }

    fn requests_key(&self, credential: &Credential) -> String {
        self.counter_key(credential, REQUESTS_SUFFIX)
    }

    fn last_used_key(&self, credential: &Credential) -> String {
        self.counter_key(credential, LAST_USED_SUFFIX)
    }

    fn failures_key(&self, credential: &Credential) -> String {
        self.counter_key(credential, FAILURES_SUFFIX)
    }

    fn until_midnight(&self) -> Duration {
        until_next_utc_midnight(self.clock.now())
    }

    /// Selects the next available key in round-robin order and charges one
    /// request against its daily quota.
    #[instrument(level = "debug", skip(self))]
    pub async fn next(&self) -> Result<Credential> {
        let pool_size = self.credentials.len();
        let start = self.cursor.load(Ordering::Relaxed) % pool_size;

        for offset in 0..pool_size {
            let index = (start + offset) % pool_size;
            let credential = &self.credentials[index];
            let status = self.status(credential).await?;

            if !status.available {
                debug!(
                    key.fingerprint = %credential.fingerprint(),
                    requests_today = status.requests_today,
                    consecutive_failures = status.consecutive_failures,
                    "Skipping unavailable key"
                );
                continue;
            }

            let ttl = self.until_midnight();
            let requests_today = self.store.incr(&self.requests_key(credential), ttl).await?;
            self.store
                .set_value(
                    &self.last_used_key(credential),
                    &self.clock.now().to_rfc3339(),
                    ttl,
                )
                .await?;
            self.cursor.store((index + 1) % pool_size, Ordering::Relaxed);

            metrics::record_key_selected(credential.fingerprint());
            debug!(
                key.fingerprint = %credential.fingerprint(),
                index,
                requests_today,
                "Selected API key (round-robin)"
            );
            return Ok(credential.clone());
        }

        metrics::record_keys_exhausted();
        warn!(
            keys.total = pool_size,
            "All API keys are over quota or temporarily disabled"
        );
        Err(AppError::AllKeysExhausted)
    }

    /// Clears the failure streak of a key.
    pub async fn mark_success(&self, credential: &Credential) -> Result<()> {
        let removed = self.store.delete(&[self.failures_key(credential)]).await?;
        if removed > 0 {
            debug!(key.fingerprint = %credential.fingerprint(), "Failure streak cleared");
        }
        Ok(())
    }

    /// Records a failure. Once the streak reaches the configured maximum the
    /// key is skipped by [`KeyManager::next`] until the window expires or a
    /// success clears it.
    pub async fn mark_failure(&self, credential: &Credential, reason: &str) -> Result<u64> {
        let failures = self
            .store
            .incr(&self.failures_key(credential), self.limits.failure_window)
            .await?;
        let failures = u64::try_from(failures).unwrap_or(0);

        metrics::record_key_failure(credential.fingerprint(), reason);
        if failures >= self.limits.max_consecutive_failures {
            warn!(
                key.fingerprint = %credential.fingerprint(),
                failures,
                reason,
                window_secs = self.limits.failure_window.as_secs(),
                "API key disabled after consecutive failures"
            );
        } else {
            warn!(
                key.fingerprint = %credential.fingerprint(),
                failures,
                reason,
                "API key failure recorded"
            );
        }
        Ok(failures)
    }

    /// Current counters for one key.
    pub async fn status(&self, credential: &Credential) -> Result<KeyStatus> {
        let requests_today = self.store.get_counter(&self.requests_key(credential)).await?;
        let consecutive_failures = self.store.get_counter(&self.failures_key(credential)).await?;
        let last_used_at = self
            .store
            .get_value(&self.last_used_key(credential))
            .await?
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let requests_today = u64::try_from(requests_today).unwrap_or(0);
        let consecutive_failures = u64::try_from(consecutive_failures).unwrap_or(0);
        let available = requests_today < self.limits.daily_quota
            && consecutive_failures < self.limits.max_consecutive_failures;

        Ok(KeyStatus {
            fingerprint: credential.fingerprint().to_string(),
            requests_today,
            daily_quota: self.limits.daily_quota,
            consecutive_failures,
            last_used_at,
            available,
        })
    }

    /// Status of every configured key, in configuration order.
    pub async fn all_statuses(&self) -> Result<Vec<KeyStatus>> {
        let mut statuses = Vec::with_capacity(self.credentials.len());
        for credential in &self.credentials {
            statuses.push(self.status(credential).await?);
        }
        metrics::record_pool_availability(
            statuses.len(),
            statuses.iter().filter(|s| s.available).count(),
        );
        Ok(statuses)
    }

    /// Requests still allowed today across the keys that are currently available.
    pub async fn total_available_capacity(&self) -> Result<u64> {
        Ok(self
            .all_statuses()
            .await?
            .iter()
            .filter(|s| s.available)
            .map(KeyStatus::remaining_today)
            .sum())
    }

    /// Drops every usage and failure counter. Operational recovery only.
    pub async fn reset_all(&self) -> Result<u64> {
        let keys: Vec<String> = self
            .credentials
            .iter()
            .flat_map(|c| {
                [
                    self.requests_key(c),
                    self.last_used_key(c),
                    self.failures_key(c),
                ]
            })
            .collect();
        let removed = self.store.delete(&keys).await?;
        info!(
            keys.total = self.credentials.len(),
            counters.removed = removed,
            "Reset all key usage and failure counters"
        );
        Ok(removed)
    }
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("keys", &self.credentials.len())
            .field("key_prefix", &self.key_prefix)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}
