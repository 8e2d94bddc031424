// src/error.rs

//! Error handling for the key pool and the generation client.
//!
//! Only three conditions are meant to cross the library boundary during normal
//! operation: configuration errors, [`AppError::AllKeysExhausted`] and
//! [`AppError::GenerationFailed`]. Store failures propagate as well, since quota
//! accounting is never allowed to silently degrade.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;

/// Error body following RFC 7807 Problem Details.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(rename = "type")]
    pub error_type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub instance: String,
    pub request_id: Option<String>,
}

#[derive(Error, Debug)]
pub enum AppError {
    // Configuration errors
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    #[error("Configuration parse error: {message}")]
    ConfigParse { message: String, line: Option<usize> },

    // Key pool
    #[error("All API keys are exhausted or temporarily disabled")]
    AllKeysExhausted,

    // Generation
    #[error("Generation failed after {attempts} attempt(s): {message}")]
    GenerationFailed {
        message: String,
        status_code: Option<u16>,
        attempts: u32,
    },

    // Storage errors
    #[error("Redis connection failed: {message}")]
    RedisConnection { message: String },

    #[error("Redis operation failed: {operation} - {message}")]
    RedisOperation { operation: String, message: String },

    #[error("Storage operation failed: {operation} - {message}")]
    Storage { operation: String, message: String },

    // Request handling
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Unauthorized")]
    Unauthorized,

    // System errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("IO operation failed: {operation} - {message}")]
    Io { operation: String, message: String },

    #[error("Internal server error: {message}")]
    Internal { message: String },
}

impl AppError {
    pub fn config_validation(message: impl Into<String>, field: Option<impl Into<String>>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
            field: field.map(Into::into),
        }
    }

    pub fn storage(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ConfigParse { .. } | Self::InvalidRequest { .. } | Self::Serialization { .. } => {
                StatusCode::BAD_REQUEST
            }

            Self::Unauthorized => StatusCode::UNAUTHORIZED,

            Self::ConfigNotFound { .. } => StatusCode::NOT_FOUND,

            Self::ConfigValidation { .. }
            | Self::Internal { .. }
            | Self::Io { .. }
            | Self::RedisConnection { .. }
            | Self::RedisOperation { .. }
            | Self::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,

            // Callers see "try again later", never the internal classification.
            Self::AllKeysExhausted | Self::GenerationFailed { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::ConfigValidation { .. } | Self::ConfigNotFound { .. } | Self::ConfigParse { .. } => {
                "https://gemini-key-pool.dev/errors/configuration"
            }
            Self::RedisConnection { .. } | Self::RedisOperation { .. } | Self::Storage { .. } => {
                "https://gemini-key-pool.dev/errors/storage"
            }
            Self::AllKeysExhausted | Self::GenerationFailed { .. } => {
                "https://gemini-key-pool.dev/errors/service-unavailable"
            }
            Self::InvalidRequest { .. } | Self::Serialization { .. } => {
                "https://gemini-key-pool.dev/errors/validation"
            }
            Self::Unauthorized => "https://gemini-key-pool.dev/errors/authentication",
            _ => "https://gemini-key-pool.dev/errors/internal",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::ConfigValidation { .. } | Self::ConfigNotFound { .. } | Self::ConfigParse { .. } => {
                "Configuration Error"
            }
            Self::RedisConnection { .. } | Self::RedisOperation { .. } | Self::Storage { .. } => {
                "Storage Error"
            }
            Self::AllKeysExhausted | Self::GenerationFailed { .. } => "Service Unavailable",
            Self::InvalidRequest { .. } | Self::Serialization { .. } => "Validation Error",
            Self::Unauthorized => "Authentication Error",
            _ => "Internal Server Error",
        }
    }

    /// Message safe to return to HTTP clients.
    fn public_detail(&self) -> String {
        match self {
            Self::AllKeysExhausted | Self::GenerationFailed { .. } => {
                "The generation service is temporarily unavailable. Please retry later.".to_string()
            }
            Self::RedisConnection { .. } | Self::RedisOperation { .. } | Self::Storage { .. } => {
                "Internal error with data storage".to_string()
            }
            Self::Internal { .. } | Self::Io { .. } | Self::ConfigValidation { .. } => {
                "An unexpected internal error occurred".to_string()
            }
            other => other.to_string(),
        }
    }

    pub fn log(&self, request_id: Option<&str>) {
        let request_id = request_id.unwrap_or("unknown");

        if self.status_code().is_server_error() {
            error!(
                error = %self,
                request_id = request_id,
                error_type = self.error_type(),
                "Application error occurred"
            );
        } else {
            warn!(
                error = %self,
                request_id = request_id,
                error_type = self.error_type(),
                "Client error occurred"
            );
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = Uuid::new_v4().to_string();
        self.log(Some(&request_id));

        let status = self.status_code();
        let body = ErrorResponse {
            error_type: self.error_type().to_string(),
            title: self.title().to_string(),
            status: status.as_u16(),
            detail: self.public_detail(),
            instance: format!("/errors/{request_id}"),
            request_id: Some(request_id),
        };

        (status, Json(body)).into_response()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            operation: "io_operation".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::ConfigParse {
            message: err.to_string(),
            line: err.location().map(|loc| loc.line()),
        }
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_dropped() || err.is_connection_refusal() {
            Self::RedisConnection {
                message: err.to_string(),
            }
        } else {
            Self::RedisOperation {
                operation: err.code().unwrap_or("redis_operation").to_string(),
                message: err.to_string(),
            }
        }
    }
}

impl From<deadpool_redis::PoolError> for AppError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::RedisConnection {
            message: err.to_string(),
        }
    }
}

impl From<deadpool_redis::CreatePoolError> for AppError {
    fn from(err: deadpool_redis::CreatePoolError) -> Self {
        Self::RedisConnection {
            message: format!("Failed to create Redis pool: {err}"),
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::Internal {
            message: format!("HTTP client error: {err}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
