//! Common test utilities and fixtures
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use gemini_key_pool::{
    clock::ManualClock,
    config::AppConfig,
    credential::{fingerprint, Credential},
    error::{AppError, Result},
    generation::{
        Content, GenerationConfig, GenerationProvider, ProviderError, ProviderResponse,
        TokenUsage,
    },
    key_manager::{KeyLimits, KeyManager},
    storage::{CounterStore, InMemoryStore},
    usage::{UsageLog, UsageRecord, UsageStats},
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub type Outcome = std::result::Result<ProviderResponse, ProviderError>;

/// Test configuration builder
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.config.keys.api_keys.push(key.into());
        self
    }

    pub fn with_daily_quota(mut self, quota: u32) -> Self {
        self.config.keys.daily_quota = quota;
        self
    }

    pub fn with_max_failures(mut self, max: u32) -> Self {
        self.config.keys.max_consecutive_failures = max;
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, base_delay_ms: u64) -> Self {
        self.config.retry.max_attempts = max_attempts;
        self.config.retry.base_delay_ms = base_delay_ms;
        self
    }

    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.config.server.admin_token = Some(token.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.generation.base_url = url.into();
        self
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.config.redis_url = Some(url.into());
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Noon on a fixed day, so midnight is twelve hours away.
pub fn fixed_noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap()
}

pub fn keys(names: &[&str]) -> Vec<String> {
    names.iter().map(|k| k.to_string()).collect()
}

/// Key pool over an in-memory store that shares one manual clock.
pub struct TestPool {
    pub manager: Arc<KeyManager>,
    pub clock: Arc<ManualClock>,
    pub store: Arc<InMemoryStore>,
}

impl TestPool {
    pub async fn new(names: &[&str], limits: KeyLimits) -> Self {
        let clock = Arc::new(ManualClock::new(fixed_noon()));
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let manager = KeyManager::new(&keys(names), limits, store.clone(), clock.clone(), "test:")
            .await
            .expect("pool should initialize");
        Self {
            manager: Arc::new(manager),
            clock,
            store,
        }
    }

    pub fn credential(name: &str) -> Credential {
        Credential::new(name)
    }
}

pub fn limits(daily_quota: u64, max_consecutive_failures: u64) -> KeyLimits {
    KeyLimits {
        daily_quota,
        max_consecutive_failures,
        failure_window: Duration::from_secs(3600),
    }
}

pub fn ok(text: &str) -> Outcome {
    Ok(ProviderResponse {
        text: text.to_string(),
        usage: TokenUsage {
            input_tokens: Some(12),
            output_tokens: Some(8),
            total_tokens: Some(20),
        },
    })
}

pub fn err(status: Option<u16>, message: &str) -> Outcome {
    Err(ProviderError::new(status, message))
}

/// Provider whose answers are scripted per API key.
///
/// Queued outcomes are consumed first; afterwards the key's fallback repeats.
/// Keys with no script succeed.
#[derive(Default)]
pub struct ScriptedProvider {
    queued: Mutex<HashMap<String, VecDeque<Outcome>>>,
    fallback: Mutex<HashMap<String, Outcome>>,
    calls: Mutex<Vec<String>>,
    call_times: Mutex<Vec<tokio::time::Instant>>,
    last_request: Mutex<Option<(String, GenerationConfig)>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn always(self, key: &str, outcome: Outcome) -> Self {
        self.fallback.lock().insert(fingerprint(key), outcome);
        self
    }

    pub fn then(self, key: &str, outcome: Outcome) -> Self {
        self.queued
            .lock()
            .entry(fingerprint(key))
            .or_default()
            .push_back(outcome);
        self
    }

    /// Fingerprints of the keys used, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Gaps between consecutive calls, on the tokio clock.
    pub fn call_gaps(&self) -> Vec<Duration> {
        self.call_times
            .lock()
            .windows(2)
            .map(|w| w[1] - w[0])
            .collect()
    }

    pub fn last_request(&self) -> Option<(String, GenerationConfig)> {
        self.last_request.lock().clone()
    }
}

#[async_trait]
impl GenerationProvider for ScriptedProvider {
    async fn generate(
        &self,
        credential: &Credential,
        model: &str,
        _contents: &[Content],
        config: &GenerationConfig,
    ) -> Outcome {
        let fp = credential.fingerprint().to_string();
        self.calls.lock().push(fp.clone());
        self.call_times.lock().push(tokio::time::Instant::now());
        *self.last_request.lock() = Some((model.to_string(), config.clone()));

        if let Some(outcome) = self.queued.lock().get_mut(&fp).and_then(VecDeque::pop_front) {
            return outcome;
        }
        self.fallback
            .lock()
            .get(&fp)
            .cloned()
            .unwrap_or_else(|| ok("default"))
    }
}

/// Usage log whose writes always fail.
#[derive(Default)]
pub struct FailingUsageLog {
    pub attempts: Mutex<usize>,
}

#[async_trait]
impl UsageLog for FailingUsageLog {
    async fn record(&self, _record: &UsageRecord) -> Result<()> {
        *self.attempts.lock() += 1;
        Err(AppError::storage("usage_log_record", "sink unavailable"))
    }

    async fn recent(&self, _limit: usize) -> Result<Vec<UsageRecord>> {
        Ok(Vec::new())
    }

    async fn stats(&self, _since: Option<DateTime<Utc>>) -> Result<UsageStats> {
        Ok(UsageStats::default())
    }
}

/// In-memory store with switchable failures for store-error paths.
pub struct FlakyStore {
    inner: InMemoryStore,
    fail_delete: bool,
    fail_failure_incr: bool,
    reads_left: AtomicUsize,
}

impl FlakyStore {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            inner: InMemoryStore::with_clock(clock),
            fail_delete: false,
            fail_failure_incr: false,
            reads_left: AtomicUsize::new(usize::MAX),
        }
    }

    pub fn failing_delete(mut self) -> Self {
        self.fail_delete = true;
        self
    }

    pub fn failing_failure_incr(mut self) -> Self {
        self.fail_failure_incr = true;
        self
    }

    /// Allows `n` more counter reads, then fails every read.
    pub fn failing_reads_after(self, n: usize) -> Self {
        self.reads_left.store(n, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl CounterStore for FlakyStore {
    async fn get_counter(&self, key: &str) -> Result<i64> {
        let allowed = self
            .reads_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !allowed {
            return Err(AppError::storage("get", "redis down"));
        }
        self.inner.get_counter(key).await
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        self.inner.get_value(key).await
    }

    async fn init_counter(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.inner.init_counter(key, ttl).await
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64> {
        if self.fail_failure_incr && key.ends_with(":failures") {
            return Err(AppError::storage("incr", "redis down"));
        }
        self.inner.incr(key, ttl).await
    }

    async fn set_value(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.inner.set_value(key, value, ttl).await
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if self.fail_delete {
            return Err(AppError::storage("del", "redis down"));
        }
        self.inner.delete(keys).await
    }
}

/// Test utilities for HTTP requests
pub mod http {
    use axum::{body::Body, http::Request};
    use serde_json::Value;

    pub fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    pub fn get_request(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    pub fn authed(method: &str, uri: &str, token: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap()
    }
}

/// Test assertions and utilities
pub mod assertions {
    use axum::{body::to_bytes, response::Response};
    use serde_json::Value;

    pub async fn assert_json_response(response: Response, expected_status: u16) -> Value {
        assert_eq!(response.status().as_u16(), expected_status);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).expect("Response body should be valid JSON")
    }

    pub async fn assert_error_response(
        response: Response,
        expected_status: u16,
        error_type: &str,
    ) -> Value {
        let json = assert_json_response(response, expected_status).await;
        assert_eq!(json["type"].as_str().unwrap(), error_type, "Error type mismatch");
        json
    }
}

/// Test utilities for Redis
pub mod redis {
    pub fn get_test_redis_url() -> String {
        std::env::var("TEST_REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379/15".to_string())
    }

    pub fn unique_prefix() -> String {
        format!("test:{}:", uuid::Uuid::new_v4())
    }
}
