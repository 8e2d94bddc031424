// src/config/app.rs

use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Clone, PartialEq, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub admin_token: Option<String>,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            admin_token: None,
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Key pool settings: the credential list and the per-key limits.
#[derive(Debug, Deserialize, Clone, PartialEq, Serialize)]
pub struct KeyPoolConfig {
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default = "default_daily_quota")]
    pub daily_quota: u32,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,
}

impl Default for KeyPoolConfig {
    fn default() -> Self {
        Self {
            api_keys: Vec::new(),
            daily_quota: default_daily_quota(),
            max_consecutive_failures: default_max_consecutive_failures(),
            failure_window_secs: default_failure_window_secs(),
        }
    }
}

/// Upstream endpoint and the default generation parameters.
#[derive(Debug, Deserialize, Clone, PartialEq, Serialize)]
pub struct GenerationSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            default_model: default_model(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: None,
            max_output_tokens: default_max_output_tokens(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Default, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub keys: KeyPoolConfig,
    #[serde(default)]
    pub generation: GenerationSettings,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default)]
    pub redis_key_prefix: Option<String>,
}

impl AppConfig {
    pub fn key_prefix(&self) -> String {
        self.redis_key_prefix
            .clone()
            .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string())
    }
}

pub const DEFAULT_KEY_PREFIX: &str = "gemini_keys:";

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_body_bytes() -> usize {
    2 * 1024 * 1024
}

fn default_daily_quota() -> u32 {
    1500
}

fn default_max_consecutive_failures() -> u32 {
    5
}

fn default_failure_window_secs() -> u64 {
    3600
}

fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_model() -> String {
    "gemini-2.0-flash".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.95
}

fn default_max_output_tokens() -> u32 {
    8192
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    120
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}
