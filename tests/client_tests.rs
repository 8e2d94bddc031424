// tests/client_tests.rs

mod common;

use common::{err, fixed_noon, keys, limits, ok, FailingUsageLog, FlakyStore, ScriptedProvider, TestPool};
use gemini_key_pool::{
    client::{GenAiClient, GenerationDefaults, RetryPolicy},
    clock::ManualClock,
    config::GenerationSettings,
    credential::{fingerprint, Credential},
    error::AppError,
    generation::{GenerationConfig, GenerationRequest},
    key_manager::KeyManager,
    usage::{InMemoryUsageLog, UsageLog},
};
use std::sync::Arc;
use std::time::Duration;

const BASE_DELAY: Duration = Duration::from_millis(100);

struct Harness {
    pool: TestPool,
    provider: Arc<ScriptedProvider>,
    usage: Arc<InMemoryUsageLog>,
    client: GenAiClient,
}

async fn harness(names: &[&str], max_failures: u64, provider: ScriptedProvider) -> Harness {
    let pool = TestPool::new(names, limits(100, max_failures)).await;
    let provider = Arc::new(provider);
    let usage = Arc::new(InMemoryUsageLog::new());
    let client = GenAiClient::new(
        pool.manager.clone(),
        provider.clone(),
        usage.clone(),
        GenerationDefaults::from(&GenerationSettings::default()),
        RetryPolicy {
            max_attempts: 3,
            base_delay: BASE_DELAY,
        },
    );
    Harness {
        pool,
        provider,
        usage,
        client,
    }
}

/// Client over a store that fails in the given ways.
async fn flaky_client(
    names: &[&str],
    store: impl FnOnce(Arc<ManualClock>) -> FlakyStore,
    provider: ScriptedProvider,
) -> (GenAiClient, Arc<ScriptedProvider>, Arc<InMemoryUsageLog>) {
    let clock = Arc::new(ManualClock::new(fixed_noon()));
    let manager = KeyManager::new(
        &keys(names),
        limits(100, 5),
        Arc::new(store(clock.clone())),
        clock,
        "test:",
    )
    .await
    .unwrap();
    let provider = Arc::new(provider);
    let usage = Arc::new(InMemoryUsageLog::new());
    let client = GenAiClient::new(
        Arc::new(manager),
        provider.clone(),
        usage.clone(),
        GenerationDefaults::from(&GenerationSettings::default()),
        RetryPolicy {
            max_attempts: 3,
            base_delay: BASE_DELAY,
        },
    );
    (client, provider, usage)
}

fn prompt() -> GenerationRequest {
    GenerationRequest::from_prompt("Explain photosynthesis")
}

#[tokio::test]
async fn test_quota_error_rotates_without_spending_an_attempt() {
    let provider = ScriptedProvider::new().always("keyA", err(Some(429), "Too Many Requests"));
    let h = harness(&["keyA", "keyB"], 5, provider).await;

    let result = h
        .client
        .generate(prompt(), "tutor", "explain", Some("student-1"))
        .await
        .unwrap();

    assert_eq!(result.attempts, 1);
    assert_eq!(result.key_rotations, 1);
    assert_eq!(result.key_fingerprint, fingerprint("keyB"));
    assert_eq!(
        h.provider.calls(),
        vec![fingerprint("keyA"), fingerprint("keyB")]
    );

    // The failure lands on the key that was actually used.
    let a = h.pool.manager.status(&Credential::new("keyA")).await.unwrap();
    let b = h.pool.manager.status(&Credential::new("keyB")).await.unwrap();
    assert_eq!(a.consecutive_failures, 1);
    assert_eq!(b.consecutive_failures, 0);
}

#[tokio::test]
async fn test_quota_on_every_key_ends_in_exhaustion() {
    let provider = ScriptedProvider::new()
        .always("keyA", err(Some(429), "quota exceeded"))
        .always("keyB", err(None, "Rate limit reached"));
    let h = harness(&["keyA", "keyB"], 2, provider).await;

    let result = h.client.generate(prompt(), "tutor", "explain", None).await;
    assert!(matches!(result, Err(AppError::AllKeysExhausted)));
    // Two keys, two failures each before they drop out.
    assert_eq!(h.provider.call_count(), 4);

    let records = h.usage.recent(10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(!records[0].success);
    assert_eq!(records[0].metadata["key_rotations"], 4);
}

#[tokio::test(start_paused = true)]
async fn test_transient_errors_back_off_exponentially_then_fail() {
    let provider = ScriptedProvider::new().always("only", err(Some(503), "The model is overloaded"));
    let h = harness(&["only"], 5, provider).await;

    let started = tokio::time::Instant::now();
    let result = h.client.generate(prompt(), "tutor", "explain", None).await;

    match result {
        Err(AppError::GenerationFailed {
            status_code,
            attempts,
            message,
        }) => {
            assert_eq!(status_code, Some(503));
            assert_eq!(attempts, 3);
            assert!(message.contains("overloaded"));
        }
        other => panic!("expected GenerationFailed, got {other:?}"),
    }

    assert_eq!(h.provider.call_count(), 3);
    assert_eq!(h.provider.call_gaps(), vec![BASE_DELAY, BASE_DELAY * 2]);
    assert!(started.elapsed() >= BASE_DELAY * 3);

    let records = h.usage.recent(10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(!records[0].success);
    assert_eq!(records[0].metadata["failure_kind"], "transient");
    assert_eq!(records[0].metadata["attempts"], 3);

    // Transient failures do not count against the key.
    let status = h.pool.manager.status(&Credential::new("only")).await.unwrap();
    assert_eq!(status.consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_transient_then_success() {
    let provider = ScriptedProvider::new()
        .then("only", err(None, "request timeout: operation timed out"))
        .then("only", ok("recovered"));
    let h = harness(&["only"], 5, provider).await;

    let result = h
        .client
        .generate(prompt(), "tutor", "explain", None)
        .await
        .unwrap();
    assert_eq!(result.text, "recovered");
    assert_eq!(result.attempts, 2);

    let records = h.usage.recent(10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].success);
}

#[tokio::test]
async fn test_fatal_error_fails_immediately() {
    let provider = ScriptedProvider::new().always("keyA", err(Some(400), "API key not valid"));
    let h = harness(&["keyA", "keyB"], 5, provider).await;

    let result = h.client.generate(prompt(), "grader", "score", None).await;
    match result {
        Err(AppError::GenerationFailed { attempts, .. }) => assert_eq!(attempts, 1),
        other => panic!("expected GenerationFailed, got {other:?}"),
    }
    assert_eq!(h.provider.call_count(), 1);

    let records = h.usage.recent(10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(!records[0].success);
    assert_eq!(records[0].error_message.as_deref(), Some("API key not valid"));
    assert_eq!(records[0].metadata["failure_kind"], "fatal");
    assert_eq!(records[0].metadata["status_code"], 400);
}

#[tokio::test]
async fn test_exhausted_pool_makes_no_call_and_no_record() {
    let provider = ScriptedProvider::new();
    let h = harness(&["only"], 5, provider).await;
    let only = Credential::new("only");
    for _ in 0..5 {
        h.pool.manager.mark_failure(&only, "parked").await.unwrap();
    }

    let result = h.client.generate(prompt(), "tutor", "explain", None).await;
    assert!(matches!(result, Err(AppError::AllKeysExhausted)));
    assert_eq!(h.provider.call_count(), 0);
    assert!(h.usage.is_empty().await);
}

#[tokio::test]
async fn test_usage_write_failure_is_swallowed() {
    let pool = TestPool::new(&["only"], limits(100, 5)).await;
    let usage = Arc::new(FailingUsageLog::default());
    let client = GenAiClient::new(
        pool.manager.clone(),
        Arc::new(ScriptedProvider::new()),
        usage.clone(),
        GenerationDefaults::from(&GenerationSettings::default()),
        RetryPolicy::default(),
    );

    let result = client.generate(prompt(), "tutor", "explain", None).await;
    assert!(result.is_ok());
    assert_eq!(*usage.attempts.lock(), 1);
}

#[tokio::test]
async fn test_success_record_round_trip() {
    let provider = ScriptedProvider::new().always("only", ok("Plants convert light."));
    let h = harness(&["only"], 5, provider).await;

    let result = h
        .client
        .generate(prompt(), "tutor", "explain", Some("student-42"))
        .await
        .unwrap();

    let record = h.usage.recent(1).await.unwrap().remove(0);
    assert!(record.success);
    assert!(record.error_message.is_none());
    assert_eq!(record.input_tokens, result.usage.input_tokens);
    assert_eq!(record.output_tokens, Some(8));
    assert_eq!(record.total_tokens, Some(20));
    assert_eq!(record.service, "tutor");
    assert_eq!(record.operation, "explain");
    assert_eq!(record.actor_id.as_deref(), Some("student-42"));
    assert_eq!(record.model, h.client.default_model());
    assert_eq!(record.metadata["key_fingerprint"], fingerprint("only"));

    let json = serde_json::to_string(&record).unwrap();
    let back: gemini_key_pool::usage::UsageRecord = serde_json::from_str(&json).unwrap();
    assert_eq!(back, record);
}

#[tokio::test]
async fn test_success_clears_failure_streak() {
    let h = harness(&["only"], 5, ScriptedProvider::new()).await;
    let only = Credential::new("only");
    h.pool.manager.mark_failure(&only, "earlier").await.unwrap();

    h.client
        .generate(prompt(), "tutor", "explain", None)
        .await
        .unwrap();
    let status = h.pool.manager.status(&only).await.unwrap();
    assert_eq!(status.consecutive_failures, 0);
}

#[tokio::test]
async fn test_request_values_override_defaults() {
    let h = harness(&["only"], 5, ScriptedProvider::new()).await;
    let request = prompt()
        .with_model("gemini-1.5-pro")
        .with_config(GenerationConfig {
            temperature: Some(0.1),
            ..Default::default()
        });

    h.client
        .generate(request, "tutor", "explain", None)
        .await
        .unwrap();

    let (model, config) = h.provider.last_request().unwrap();
    assert_eq!(model, "gemini-1.5-pro");
    assert_eq!(config.temperature, Some(0.1));
    assert_eq!(config.top_p, h.client.default_generation_config().top_p);
    assert_eq!(
        config.max_output_tokens,
        h.client.default_generation_config().max_output_tokens
    );
}

#[tokio::test]
async fn test_empty_contents_rejected_before_selection() {
    let h = harness(&["only"], 5, ScriptedProvider::new()).await;
    let request = GenerationRequest {
        model: None,
        contents: Vec::new(),
        config: GenerationConfig::default(),
    };

    let result = h.client.generate(request, "tutor", "explain", None).await;
    assert!(matches!(result, Err(AppError::InvalidRequest { .. })));
    let status = h.pool.manager.status(&Credential::new("only")).await.unwrap();
    assert_eq!(status.requests_today, 0);
}

#[test]
fn test_defaults_are_returned_verbatim() {
    let settings = GenerationSettings {
        default_model: "gemini-2.5-flash".to_string(),
        temperature: 0.3,
        top_p: 0.8,
        max_output_tokens: 1024,
        ..Default::default()
    };
    let defaults = GenerationDefaults::from(&settings);
    assert_eq!(defaults.model, "gemini-2.5-flash");
    assert_eq!(defaults.config.temperature, Some(0.3));
    assert_eq!(defaults.config.top_p, Some(0.8));
    assert_eq!(defaults.config.max_output_tokens, Some(1024));
}

#[tokio::test]
async fn test_store_error_after_success_still_records_usage() {
    let (client, provider, usage) = flaky_client(
        &["only"],
        |clock| FlakyStore::new(clock).failing_delete(),
        ScriptedProvider::new(),
    )
    .await;

    let result = client.generate(prompt(), "tutor", "explain", None).await;
    assert!(matches!(result, Err(AppError::Storage { .. })));
    assert_eq!(provider.call_count(), 1);

    let records = usage.recent(10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].success);
    assert_eq!(records[0].total_tokens, Some(20));
}

#[tokio::test]
async fn test_store_error_on_quota_failure_records_once() {
    let (client, provider, usage) = flaky_client(
        &["keyA", "keyB"],
        |clock| FlakyStore::new(clock).failing_failure_incr(),
        ScriptedProvider::new().always("keyA", err(Some(429), "quota exceeded")),
    )
    .await;

    let result = client.generate(prompt(), "tutor", "explain", None).await;
    assert!(matches!(result, Err(AppError::Storage { .. })));
    assert_eq!(provider.call_count(), 1);

    let records = usage.recent(10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(!records[0].success);
    assert_eq!(records[0].metadata["failure_kind"], "store_error");
}

#[tokio::test]
async fn test_store_error_during_rotation_is_not_reported_as_exhaustion() {
    // First scan reads two counters for keyA; the scan after the rotation fails.
    let (client, provider, usage) = flaky_client(
        &["keyA", "keyB"],
        |clock| FlakyStore::new(clock).failing_reads_after(2),
        ScriptedProvider::new().always("keyA", err(Some(429), "quota exceeded")),
    )
    .await;

    let result = client.generate(prompt(), "tutor", "explain", None).await;
    assert!(matches!(result, Err(AppError::Storage { .. })));
    assert_eq!(provider.call_count(), 1);

    let records = usage.recent(10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].metadata["failure_kind"], "store_error");
    assert_eq!(records[0].metadata["key_rotations"], 1);
}
