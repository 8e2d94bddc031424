// src/generation/mod.rs

//! Provider-neutral generation types and the capability trait the retrying
//! client talks to.

pub mod classify;
pub mod gemini;

pub use classify::{classify, FailureKind};
pub use gemini::GeminiProvider;

use crate::credential::Credential;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Model,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }
}

/// One conversational turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub role: Role,
    pub text: String,
}

impl Content {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_mime_type: Option<String>,
}

impl GenerationConfig {
    /// Fields left unset here are taken from `defaults`.
    pub fn merged_over(&self, defaults: &GenerationConfig) -> GenerationConfig {
        GenerationConfig {
            temperature: self.temperature.or(defaults.temperature),
            top_p: self.top_p.or(defaults.top_p),
            top_k: self.top_k.or(defaults.top_k),
            max_output_tokens: self.max_output_tokens.or(defaults.max_output_tokens),
            system_instruction: self
                .system_instruction
                .clone()
                .or_else(|| defaults.system_instruction.clone()),
            response_mime_type: self
                .response_mime_type
                .clone()
                .or_else(|| defaults.response_mime_type.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Falls back to the configured default model when absent.
    #[serde(default)]
    pub model: Option<String>,
    pub contents: Vec<Content>,
    #[serde(default)]
    pub config: GenerationConfig,
}

impl GenerationRequest {
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            model: None,
            contents: vec![Content::user(prompt)],
            config: GenerationConfig::default(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_config(mut self, config: GenerationConfig) -> Self {
        self.config = config;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResponse {
    pub text: String,
    pub usage: TokenUsage,
}

/// Failure reported by a provider: an optional HTTP-like status and a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub status_code: Option<u16>,
    pub message: String,
}

impl ProviderError {
    pub fn new(status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status_code,
            message: message.into(),
        }
    }

    pub fn with_status(status_code: u16, message: impl Into<String>) -> Self {
        Self::new(Some(status_code), message)
    }
}

/// The one capability the client needs from an upstream model API.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    async fn generate(
        &self,
        credential: &Credential,
        model: &str,
        contents: &[Content],
        config: &GenerationConfig,
    ) -> Result<ProviderResponse, ProviderError>;
}
