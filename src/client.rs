// src/client.rs

use crate::config::{AppConfig, GenerationSettings, RetryConfig};
use crate::credential::Credential;
use crate::error::{AppError, Result};
use crate::generation::{
    classify, FailureKind, GenerationConfig, GenerationProvider, GenerationRequest,
    ProviderError, TokenUsage,
};
use crate::key_manager::KeyManager;
use crate::metrics;
use crate::usage::{UsageLog, UsageRecord};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Backoff budget for transient failures. Quota rotations do not consume it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// `base_delay * 2^attempt`, with `attempt` counted from zero.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
        }
    }
}

/// Model and sampling parameters applied when a request leaves them unset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationDefaults {
    pub model: String,
    pub config: GenerationConfig,
}

impl From<&GenerationSettings> for GenerationDefaults {
    fn from(settings: &GenerationSettings) -> Self {
        Self {
            model: settings.default_model.clone(),
            config: GenerationConfig {
                temperature: Some(settings.temperature),
                top_p: Some(settings.top_p),
                top_k: settings.top_k,
                max_output_tokens: Some(settings.max_output_tokens),
                system_instruction: None,
                response_mime_type: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationResult {
    pub text: String,
    pub model: String,
    pub usage: TokenUsage,
    pub duration_ms: u64,
    pub key_fingerprint: String,
    /// Provider calls that counted against the retry budget, including the successful one.
    pub attempts: u32,
    pub key_rotations: u32,
}

/// Caller identity and bookkeeping for one `generate()` call.
struct CallContext<'a> {
    service: &'a str,
    operation: &'a str,
    actor_id: Option<&'a str>,
    model: String,
    started: Instant,
}

impl CallContext<'_> {
    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn record(&self) -> UsageRecord {
        UsageRecord::new(self.service, self.operation, &self.model)
            .with_actor(self.actor_id)
            .with_duration_ms(self.elapsed_ms())
    }
}

/// Retrying generation client on top of the key pool.
///
/// Quota errors rotate to the next key without spending an attempt. Transient
/// errors back off exponentially up to [`RetryPolicy::max_attempts`]. Anything
/// else fails at once. Each call that reaches the provider writes exactly one
/// usage record; a pool that is exhausted up front writes none.
pub struct GenAiClient {
    key_manager: Arc<KeyManager>,
    provider: Arc<dyn GenerationProvider>,
    usage_log: Arc<dyn UsageLog>,
    defaults: GenerationDefaults,
    retry: RetryPolicy,
}

impl GenAiClient {
    pub fn new(
        key_manager: Arc<KeyManager>,
        provider: Arc<dyn GenerationProvider>,
        usage_log: Arc<dyn UsageLog>,
        defaults: GenerationDefaults,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            key_manager,
            provider,
            usage_log,
            defaults,
            retry,
        }
    }

    pub fn from_config(
        config: &AppConfig,
        key_manager: Arc<KeyManager>,
        provider: Arc<dyn GenerationProvider>,
        usage_log: Arc<dyn UsageLog>,
    ) -> Self {
        Self::new(
            key_manager,
            provider,
            usage_log,
            GenerationDefaults::from(&config.generation),
            RetryPolicy::from(&config.retry),
        )
    }

    pub fn default_model(&self) -> &str {
        &self.defaults.model
    }

    pub fn default_generation_config(&self) -> &GenerationConfig {
        &self.defaults.config
    }

    #[instrument(skip(self, request, actor_id))]
    pub async fn generate(
        &self,
        request: GenerationRequest,
        service: &str,
        operation: &str,
        actor_id: Option<&str>,
    ) -> Result<GenerationResult> {
        if request.contents.is_empty() {
            return Err(AppError::invalid_request("contents cannot be empty"));
        }

        let model = request
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.defaults.model)
            .to_string();
        let config = request.config.merged_over(&self.defaults.config);
        let ctx = CallContext {
            service,
            operation,
            actor_id,
            model,
            started: Instant::now(),
        };

        let mut attempt: u32 = 0;
        let mut rotations: u32 = 0;

        loop {
            let credential = match self.key_manager.next().await {
                Ok(credential) => credential,
                Err(e) => {
                    // The call already reached the provider: still one record for it.
                    if rotations > 0 || attempt > 0 {
                        self.abandon(&ctx, &e, attempt, rotations).await;
                    }
                    return Err(e);
                }
            };
            let call_started = Instant::now();
            let outcome = self
                .provider
                .generate(&credential, &ctx.model, &request.contents, &config)
                .await;
            debug!(
                key.fingerprint = %credential.fingerprint(),
                call_ms = call_started.elapsed().as_millis() as u64,
                ok = outcome.is_ok(),
                "Provider call finished"
            );

            let failure = match outcome {
                Ok(response) => {
                    let result = GenerationResult {
                        text: response.text,
                        model: ctx.model.clone(),
                        usage: response.usage,
                        duration_ms: ctx.elapsed_ms(),
                        key_fingerprint: credential.fingerprint().to_string(),
                        attempts: attempt + 1,
                        key_rotations: rotations,
                    };
                    let record = ctx
                        .record()
                        .with_tokens(&result.usage)
                        .with_metadata(json!({
                            "attempts": result.attempts,
                            "key_rotations": rotations,
                            "key_fingerprint": result.key_fingerprint,
                        }))
                        .succeeded();
                    self.write_usage(&record).await;
                    metrics::record_generation(service, "success", ctx.started.elapsed());
                    info!(
                        model = %result.model,
                        attempts = result.attempts,
                        key_rotations = rotations,
                        duration_ms = result.duration_ms,
                        "Generation succeeded"
                    );
                    // The record is already written; a store error still surfaces.
                    self.key_manager.mark_success(&credential).await?;
                    return Ok(result);
                }
                Err(failure) => failure,
            };

            match classify(&failure) {
                FailureKind::QuotaExceeded => {
                    rotations += 1;
                    if let Err(e) = self
                        .key_manager
                        .mark_failure(&credential, "quota exceeded")
                        .await
                    {
                        self.abandon(&ctx, &e, attempt, rotations).await;
                        return Err(e);
                    }
                    metrics::record_retry("quota");
                    warn!(
                        key.fingerprint = %credential.fingerprint(),
                        key_rotations = rotations,
                        error = %failure,
                        "Quota exceeded, rotating to the next key"
                    );
                }
                FailureKind::Transient => {
                    let delay = self.retry.delay_for(attempt);
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        let err = self
                            .give_up(&ctx, &credential, &failure, FailureKind::Transient, attempt, rotations)
                            .await;
                        return Err(err);
                    }
                    metrics::record_retry("transient");
                    warn!(
                        key.fingerprint = %credential.fingerprint(),
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "Transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                FailureKind::Fatal => {
                    let attempts = attempt + 1;
                    let err = self
                        .give_up(&ctx, &credential, &failure, FailureKind::Fatal, attempts, rotations)
                        .await;
                    return Err(err);
                }
            }
        }
    }

    /// Writes the terminal failure record and builds the error returned to the caller.
    async fn give_up(
        &self,
        ctx: &CallContext<'_>,
        credential: &Credential,
        failure: &ProviderError,
        kind: FailureKind,
        attempts: u32,
        rotations: u32,
    ) -> AppError {
        let record = ctx
            .record()
            .with_metadata(json!({
                "attempts": attempts,
                "key_rotations": rotations,
                "key_fingerprint": credential.fingerprint(),
                "status_code": failure.status_code,
                "failure_kind": kind.as_str(),
            }))
            .failed(failure.message.clone());
        self.write_usage(&record).await;

        let outcome = match kind {
            FailureKind::Transient => "exhausted_retries",
            _ => "fatal",
        };
        metrics::record_generation(ctx.service, outcome, ctx.started.elapsed());
        error!(
            key.fingerprint = %credential.fingerprint(),
            failure_kind = %kind,
            status_code = ?failure.status_code,
            attempts,
            error = %failure,
            "Generation failed"
        );

        AppError::GenerationFailed {
            message: failure.message.clone(),
            status_code: failure.status_code,
            attempts,
        }
    }

    /// Records a call that stopped on a pool error after reaching the provider.
    async fn abandon(
        &self,
        ctx: &CallContext<'_>,
        cause: &AppError,
        attempts: u32,
        rotations: u32,
    ) {
        let kind = match cause {
            AppError::AllKeysExhausted => "keys_exhausted",
            _ => "store_error",
        };
        let record = ctx
            .record()
            .with_metadata(json!({
                "attempts": attempts,
                "key_rotations": rotations,
                "failure_kind": kind,
            }))
            .failed(cause.to_string());
        self.write_usage(&record).await;
        metrics::record_generation(ctx.service, kind, ctx.started.elapsed());
        warn!(
            attempts,
            key_rotations = rotations,
            failure_kind = kind,
            error = %cause,
            "Generation stopped by the key pool"
        );
    }

    async fn write_usage(&self, record: &UsageRecord) {
        if let Err(e) = self.usage_log.record(record).await {
            error!(
                record.id = %record.id,
                error = %e,
                "Failed to write usage record"
            );
        }
    }
}

impl std::fmt::Debug for GenAiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenAiClient")
            .field("key_manager", &self.key_manager)
            .field("defaults", &self.defaults)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
