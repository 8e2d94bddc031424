// src/config/loader.rs

use crate::config::{AppConfig, ConfigValidator};
use crate::credential::parse_credential_list;
use crate::error::{AppError, Result};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Load configuration from an optional YAML file, apply environment overrides
/// and validate the result.
pub fn load_config(config_path: &Path) -> Result<AppConfig> {
    let mut config = if config_path.exists() {
        info!("Loading configuration from file: {}", config_path.display());
        load_from_file(config_path)?
    } else {
        info!("Configuration file not found, using defaults");
        AppConfig::default()
    };

    override_with_env(&mut config);

    ConfigValidator::validate(&config)?;

    debug!("Configuration loaded and validated successfully");
    Ok(config)
}

fn load_from_file(config_path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(config_path).map_err(|_| AppError::ConfigNotFound {
        path: config_path.display().to_string(),
    })?;

    serde_yaml::from_str(&content).map_err(|e| AppError::ConfigParse {
        message: format!("Failed to parse config file: {e}"),
        line: e.location().map(|loc| loc.line()),
    })
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => {
            info!("Overriding configuration from environment variable {}", name);
            Some(value)
        }
        Err(_) => {
            warn!("Invalid {} environment variable: {}", name, raw);
            None
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn override_with_env(config: &mut AppConfig) {
    if let Some(raw_keys) = env_string("GEMINI_API_KEYS") {
        let keys = parse_credential_list(&raw_keys);
        info!(
            keys.count = keys.len(),
            "Overriding API keys from GEMINI_API_KEYS"
        );
        config.keys.api_keys = keys;
    }
    if let Some(quota) = env_parse("GEMINI_DAILY_QUOTA_PER_KEY") {
        config.keys.daily_quota = quota;
    }
    if let Some(max_failures) = env_parse("GEMINI_MAX_CONSECUTIVE_FAILURES") {
        config.keys.max_consecutive_failures = max_failures;
    }

    if let Some(model) = env_string("GEMINI_MODEL") {
        info!("Overriding default model from environment: {}", model);
        config.generation.default_model = model;
    }
    if let Some(temperature) = env_parse("GEMINI_TEMPERATURE") {
        config.generation.temperature = temperature;
    }
    if let Some(top_p) = env_parse("GEMINI_TOP_P") {
        config.generation.top_p = top_p;
    }
    if let Some(max_tokens) = env_parse("GEMINI_MAX_OUTPUT_TOKENS") {
        config.generation.max_output_tokens = max_tokens;
    }
    if let Some(base_url) = env_string("GEMINI_BASE_URL") {
        config.generation.base_url = base_url;
    }

    if let Some(delay) = env_parse("GEMINI_RETRY_BASE_DELAY_MS") {
        config.retry.base_delay_ms = delay;
    }
    if let Some(attempts) = env_parse("GEMINI_RETRY_MAX_ATTEMPTS") {
        config.retry.max_attempts = attempts;
    }

    if let Some(redis_url) = env_string("REDIS_URL") {
        info!("Overriding Redis URL from environment variable");
        config.redis_url = Some(redis_url);
    }
    if let Some(prefix) = env_string("REDIS_KEY_PREFIX") {
        config.redis_key_prefix = Some(prefix);
    }
    if let Some(port) = env_parse("PORT") {
        config.server.port = port;
    }
    if let Some(token) = env_string("ADMIN_TOKEN") {
        config.server.admin_token = Some(token);
    }

    // YAML lists may still carry padded or blank entries.
    config.keys.api_keys = config
        .keys
        .api_keys
        .iter()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect();
}
