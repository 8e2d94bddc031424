// src/config/validation.rs

use crate::config::AppConfig;
use crate::error::{AppError, Result};
use std::collections::HashSet;
use tracing::{debug, warn};
use url::Url;

pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &AppConfig) -> Result<()> {
        debug!("Starting configuration validation");

        if let Err(e) = Self::validate_keys(config) {
            warn!("Key pool validation failed: {}", e);
            return Err(e);
        }

        if let Err(e) = Self::validate_generation(config) {
            warn!("Generation settings validation failed: {}", e);
            return Err(e);
        }

        if let Err(e) = Self::validate_retry(config) {
            warn!("Retry settings validation failed: {}", e);
            return Err(e);
        }

        if let Some(redis_url) = &config.redis_url {
            Self::validate_url(redis_url, "redis_url")?;
        }

        debug!("Configuration validation completed successfully");
        Ok(())
    }

    fn validate_keys(config: &AppConfig) -> Result<()> {
        let keys = &config.keys;
        let usable: Vec<&str> = keys
            .api_keys
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .collect();

        if usable.is_empty() {
            return Err(AppError::config_validation(
                "At least one API key must be configured (GEMINI_API_KEYS or keys.api_keys)",
                Some("keys.api_keys"),
            ));
        }

        let mut seen = HashSet::new();
        for key in &usable {
            if !seen.insert(*key) {
                return Err(AppError::config_validation(
                    format!(
                        "Duplicate API key with fingerprint {}",
                        crate::credential::fingerprint(key)
                    ),
                    Some("keys.api_keys"),
                ));
            }
        }

        if keys.daily_quota == 0 {
            return Err(AppError::config_validation(
                "Daily quota per key must be greater than 0",
                Some("keys.daily_quota"),
            ));
        }
        if keys.max_consecutive_failures == 0 {
            return Err(AppError::config_validation(
                "Max consecutive failures must be greater than 0",
                Some("keys.max_consecutive_failures"),
            ));
        }
        if keys.failure_window_secs == 0 {
            return Err(AppError::config_validation(
                "Failure window cannot be 0",
                Some("keys.failure_window_secs"),
            ));
        }

        debug!("Validated key pool with {} keys", usable.len());
        Ok(())
    }

    fn validate_generation(config: &AppConfig) -> Result<()> {
        let generation = &config.generation;
        Self::validate_url(&generation.base_url, "generation.base_url")?;

        if generation.default_model.trim().is_empty() {
            return Err(AppError::config_validation(
                "Default model cannot be empty",
                Some("generation.default_model"),
            ));
        }
        if !(0.0..=2.0).contains(&generation.temperature) {
            return Err(AppError::config_validation(
                format!("Temperature {} is outside 0.0..=2.0", generation.temperature),
                Some("generation.temperature"),
            ));
        }
        if !(0.0..=1.0).contains(&generation.top_p) {
            return Err(AppError::config_validation(
                format!("top_p {} is outside 0.0..=1.0", generation.top_p),
                Some("generation.top_p"),
            ));
        }
        if generation.max_output_tokens == 0 {
            return Err(AppError::config_validation(
                "Max output tokens must be greater than 0",
                Some("generation.max_output_tokens"),
            ));
        }
        if generation.connect_timeout_secs == 0 || generation.request_timeout_secs == 0 {
            return Err(AppError::config_validation(
                "Timeouts cannot be 0",
                Some("generation.request_timeout_secs"),
            ));
        }
        Ok(())
    }

    fn validate_retry(config: &AppConfig) -> Result<()> {
        if config.retry.max_attempts == 0 {
            return Err(AppError::config_validation(
                "Retry max attempts must be at least 1",
                Some("retry.max_attempts"),
            ));
        }
        // 2^attempt grows fast; keep the shift well inside u64.
        if config.retry.max_attempts > 16 {
            return Err(AppError::config_validation(
                "Retry max attempts cannot exceed 16",
                Some("retry.max_attempts"),
            ));
        }
        Ok(())
    }

    fn validate_url(url_str: &str, field_name: &str) -> Result<()> {
        Url::parse(url_str).map_err(|e| {
            AppError::config_validation(
                format!("Invalid URL in {field_name}: {url_str} - {e}"),
                Some(field_name),
            )
        })?;
        Ok(())
    }
}
