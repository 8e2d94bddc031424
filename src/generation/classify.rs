// src/generation/classify.rs

use super::ProviderError;
use std::fmt;

/// How the retry loop treats a failed provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The key ran out of quota. Rotate to another key without spending an attempt.
    QuotaExceeded,
    /// Network, timeout or overload. Back off and retry.
    Transient,
    /// Anything else. Fail immediately.
    Fatal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::QuotaExceeded => "quota_exceeded",
            FailureKind::Transient => "transient",
            FailureKind::Fatal => "fatal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const QUOTA_PATTERNS: &[&str] = &["quota", "rate limit"];

// "econnreset"/"econnrefused" come from Node-style upstream messages; the
// spelled-out forms are what Rust transports report.
const TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "econnreset",
    "econnrefused",
    "network",
    "connection reset",
    "connection refused",
];

/// Quota first, then transient, fatal by default.
pub fn classify(error: &ProviderError) -> FailureKind {
    let message = error.message.to_lowercase();

    if error.status_code == Some(429) || QUOTA_PATTERNS.iter().any(|p| message.contains(p)) {
        return FailureKind::QuotaExceeded;
    }

    if matches!(error.status_code, Some(503) | Some(504))
        || TRANSIENT_PATTERNS.iter().any(|p| message.contains(p))
    {
        return FailureKind::Transient;
    }

    FailureKind::Fatal
}
