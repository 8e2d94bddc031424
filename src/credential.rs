// src/credential.rs

use secrecy::{ExposeSecret, Secret};
use sha2::{Digest, Sha256};
use std::fmt;

const FINGERPRINT_LEN: usize = 16;

/// A single API key. The secret never leaves memory; everything that is logged
/// or persisted refers to the key by its fingerprint.
#[derive(Clone)]
pub struct Credential {
    secret: Secret<String>,
    fingerprint: String,
}

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        let secret = secret.into();
        let fingerprint = fingerprint(&secret);
        Self {
            secret: Secret::new(secret),
            fingerprint,
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn expose_secret(&self) -> &str {
        self.secret.expose_secret()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Credential {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint
    }
}

impl Eq for Credential {}

/// SHA-256 of the secret, hex encoded and truncated to 16 characters.
pub fn fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    let mut encoded = hex::encode(digest);
    encoded.truncate(FINGERPRINT_LEN);
    encoded
}

/// Splits a comma separated key list, trimming entries and dropping empty ones.
pub fn parse_credential_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
