// src/config/mod.rs

pub mod app;
pub mod loader;
pub mod validation;

pub use app::{AppConfig, GenerationSettings, KeyPoolConfig, RetryConfig, ServerConfig};
pub use loader::load_config;
pub use validation::ConfigValidator;
