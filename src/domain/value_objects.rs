//! # Domain Value Objects
//!
//! Immutable value types that represent concepts in the scraping domain.
//! Value objects are defined by their attributes rather than identity.

use serde::{Deserialize, Serialize};

/// Deterministic URL fingerprint used for dedup within a source
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UrlFingerprint(String);

impl UrlFingerprint {
    /// blake3 of the URL string, hex encoded
    #[must_use]
    pub fn of(url: &str) -> Self {
        Self(blake3::hash(url.as_bytes()).to_hex().to_string())
    }

    /// Wraps a fingerprint loaded from storage
    #[must_use]
    pub const fn from_stored(value: String) -> Self {
        Self(value)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UrlFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// URL validation errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UrlError {
    #[error("URL cannot be empty")]
    Empty,
    #[error("URL format is invalid")]
    InvalidFormat,
    #[error("URL scheme must be http or https")]
    UnsupportedScheme,
    #[error("URL must have a valid host")]
    NoHost,
}

/// Normalized http(s) URL value object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NormalizedUrl {
    url: url::Url,
    host: String,
}

impl NormalizedUrl {
    /// Trims, requires an http/https scheme and a host, drops the fragment
    pub fn parse(raw: &str) -> Result<Self, UrlError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(UrlError::Empty);
        }

        let mut url = url::Url::parse(trimmed).map_err(|_| UrlError::InvalidFormat)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(UrlError::UnsupportedScheme);
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or(UrlError::NoHost)?
            .to_ascii_lowercase();

        url.set_fragment(None);
        Ok(Self { url, host })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    /// Lowercased host
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn fingerprint(&self) -> UrlFingerprint {
        UrlFingerprint::of(self.as_str())
    }

    /// Case-insensitive host comparison
    #[must_use]
    pub fn is_same_host(&self, host: &str) -> bool {
        self.host.eq_ignore_ascii_case(host)
    }
}
