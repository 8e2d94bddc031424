// src/generation/gemini.rs

use super::{
    Content, GenerationConfig, GenerationProvider, ProviderError, ProviderResponse, TokenUsage,
};
use crate::config::GenerationSettings;
use crate::credential::Credential;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use reqwest::{Client, ClientBuilder};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

const API_KEY_HEADER: &str = "x-goog-api-key";
const MAX_ERROR_BODY_CHARS: usize = 512;

/// `generateContent` over the Gemini REST API.
#[derive(Debug, Clone)]
pub struct GeminiProvider {
    http: Client,
    base_url: String,
}

impl GeminiProvider {
    pub fn from_settings(settings: &GenerationSettings) -> Result<Self> {
        let http = configure_builder(
            Client::builder(),
            Duration::from_secs(settings.connect_timeout_secs),
            Duration::from_secs(settings.request_timeout_secs),
        )
        .build()
        .map_err(|e| AppError::internal(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(http, &settings.base_url))
    }

    pub fn with_client(http: Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, model: &str) -> String {
        let model = model.trim().trim_start_matches("models/");
        format!("{}/v1beta/models/{}:generateContent", self.base_url, model)
    }
}

fn configure_builder(
    builder: ClientBuilder,
    connect_timeout: Duration,
    request_timeout: Duration,
) -> ClientBuilder {
    builder
        .connect_timeout(connect_timeout)
        .timeout(request_timeout)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Some(Duration::from_secs(60)))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest<'a> {
    contents: Vec<WireContent<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<WireContent<'a>>,
    generation_config: WireGenerationConfig<'a>,
}

#[derive(Serialize)]
struct WireContent<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<WirePart<'a>>,
}

#[derive(Serialize)]
struct WirePart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireGenerationConfig<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'a str>,
}

impl<'a> WireRequest<'a> {
    fn build(contents: &'a [Content], config: &'a GenerationConfig) -> Self {
        Self {
            contents: contents
                .iter()
                .map(|c| WireContent {
                    role: Some(c.role.as_str()),
                    parts: vec![WirePart { text: &c.text }],
                })
                .collect(),
            system_instruction: config.system_instruction.as_deref().map(|text| WireContent {
                role: None,
                parts: vec![WirePart { text }],
            }),
            generation_config: WireGenerationConfig {
                temperature: config.temperature,
                top_p: config.top_p,
                top_k: config.top_k,
                max_output_tokens: config.max_output_tokens,
                response_mime_type: config.response_mime_type.as_deref(),
            },
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u32>,
    candidates_token_count: Option<u32>,
    total_token_count: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
    status: Option<String>,
}

fn transport_error(err: reqwest::Error) -> ProviderError {
    let status = err.status().map(|s| s.as_u16());
    let message = if err.is_timeout() {
        format!("request timeout: {err}")
    } else if err.is_connect() || err.is_request() {
        format!("network error: {err}")
    } else {
        format!("upstream call failed: {err}")
    };
    ProviderError::new(status, message)
}

fn error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(ErrorEnvelope { error }) => match (error.status, error.message) {
            (Some(status), Some(message)) => format!("{status}: {message}"),
            (None, Some(message)) => message,
            (Some(status), None) => status,
            (None, None) => "upstream returned an empty error".to_string(),
        },
        Err(_) => body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
    }
}

fn into_response(wire: WireResponse) -> std::result::Result<ProviderResponse, ProviderError> {
    let usage = wire
        .usage_metadata
        .map(|u| TokenUsage {
            input_tokens: u.prompt_token_count,
            output_tokens: u.candidates_token_count,
            total_tokens: u.total_token_count,
        })
        .unwrap_or_default();

    let Some(candidate) = wire.candidates.into_iter().next() else {
        let reason = wire
            .prompt_feedback
            .and_then(|f| f.block_reason)
            .unwrap_or_else(|| "no candidates returned".to_string());
        return Err(ProviderError::new(None, format!("empty response: {reason}")));
    };

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if text.is_empty() {
        if let Some(reason) = candidate.finish_reason {
            debug!(finish_reason = %reason, "Candidate finished without text");
        }
    }

    Ok(ProviderResponse { text, usage })
}

#[async_trait]
impl GenerationProvider for GeminiProvider {
    async fn generate(
        &self,
        credential: &Credential,
        model: &str,
        contents: &[Content],
        config: &GenerationConfig,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let url = self.endpoint(model);
        let body = WireRequest::build(contents, config);

        debug!(
            url = %url,
            key.fingerprint = %credential.fingerprint(),
            turns = contents.len(),
            "Calling generateContent"
        );

        let response = self
            .http
            .post(&url)
            .header(API_KEY_HEADER, credential.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = error_message(&text);
            warn!(
                status = status.as_u16(),
                key.fingerprint = %credential.fingerprint(),
                error = %message,
                "Upstream returned an error status"
            );
            return Err(ProviderError::with_status(status.as_u16(), message));
        }

        let wire: WireResponse = response.json().await.map_err(|e| {
            ProviderError::new(None, format!("invalid upstream response: {e}"))
        })?;
        into_response(wire)
    }
}
