//! Error types for character sheet generation.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest upstream error text kept in user-visible messages.
const MAX_ERROR_MESSAGE_CHARS: usize = 500;

/// Errors that can occur while validating, resolving, or running a generation.
#[derive(Debug, thiserror::Error)]
pub enum CharsheetError {
    /// Caller-supplied data is malformed or missing.
    #[error("invalid request: {0}")]
    Validation(String),

    /// No implementation is registered for this provider id.
    #[error("provider '{0}' not implemented")]
    UnknownProvider(String),

    /// Credential absent or rejected by the provider's config check.
    #[error("invalid configuration for provider '{provider}': {reason}")]
    InvalidProviderConfig {
        /// Provider id whose configuration failed.
        provider: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Rate limit exceeded.
    #[error("rate limit exceeded{}", retry_hint(.retry_after))]
    RateLimited {
        /// Server-suggested wait, when one was sent.
        retry_after: Option<Duration>,
    },

    /// API key missing or rejected upstream.
    #[error("invalid API key: {0}")]
    Unauthorized(String),

    /// Provider answered but produced no image.
    #[error("no image returned: {0}")]
    NoImageReturned(String),

    /// Content was blocked by safety filters.
    #[error("content blocked: {0}")]
    ContentBlocked(String),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Sanitized response text.
        message: String,
    },

    /// Operation timed out (selection deadline or provider polling).
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The invocation was cancelled before this call finished.
    #[error("generation cancelled")]
    Cancelled,

    /// Network or HTTP error.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Failed to decode base64 or image data.
    #[error("failed to decode: {0}")]
    Decode(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error (e.g., saving file).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Every selection of an invocation settled as a failure.
    #[error("all {total} selections failed to generate")]
    AllSelectionsFailed {
        /// Number of selections in the invocation.
        total: usize,
    },
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(", retry after {}s", d.as_secs()),
        None => String::new(),
    }
}

/// Coarse failure category carried by every failed outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Upstream quota or rate limit hit.
    RateLimited,
    /// Credential rejected upstream.
    Unauthorized,
    /// Call succeeded but yielded no image.
    NoImageReturned,
    /// Provider id has no registered implementation.
    UnknownProvider,
    /// Credential missing or malformed before any call was made.
    InvalidProviderConfig,
    /// Anything else.
    Generic,
}

impl ErrorCategory {
    /// Returns the wire name of this category (e.g. `rate_limited`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Unauthorized => "unauthorized",
            Self::NoImageReturned => "no_image_returned",
            Self::UnknownProvider => "unknown_provider",
            Self::InvalidProviderConfig => "invalid_provider_config",
            Self::Generic => "generic",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CharsheetError {
    /// Maps this error onto the coarse category reported to callers.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::RateLimited { .. } => ErrorCategory::RateLimited,
            Self::Unauthorized(_) => ErrorCategory::Unauthorized,
            Self::NoImageReturned(_) => ErrorCategory::NoImageReturned,
            Self::UnknownProvider(_) => ErrorCategory::UnknownProvider,
            Self::InvalidProviderConfig { .. } => ErrorCategory::InvalidProviderConfig,
            Self::Api { status, message } => classify_failure(Some(*status), message),
            Self::Network(e) => classify_failure(e.status().map(|s| s.as_u16()), &e.to_string()),
            _ => ErrorCategory::Generic,
        }
    }

    /// Returns true if this error is likely transient.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Timeout(_) | Self::Network(_)
        )
    }

    /// Returns the suggested retry delay, if available.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            Self::Timeout(_) => Some(Duration::from_secs(1)),
            Self::Network(_) => Some(Duration::from_secs(2)),
            _ => None,
        }
    }
}

/// Classifies an upstream failure from its status code and message text.
///
/// Status codes win over message text. Pure and deterministic: the same
/// `(status, message)` always lands in the same category.
pub fn classify_failure(status: Option<u16>, message: &str) -> ErrorCategory {
    match status {
        Some(429) => return ErrorCategory::RateLimited,
        Some(401) | Some(403) => return ErrorCategory::Unauthorized,
        _ => {}
    }

    let lower = message.to_lowercase();
    if lower.contains("rate limit")
        || lower.contains("resource_exhausted")
        || lower.contains("quota")
        || lower.contains("too many requests")
    {
        return ErrorCategory::RateLimited;
    }
    if lower.contains("authentication")
        || lower.contains("unauthorized")
        || lower.contains("api key not valid")
        || lower.contains("api_key_invalid")
        || lower.contains("invalid api key")
        || lower.contains("401")
    {
        return ErrorCategory::Unauthorized;
    }
    if lower.contains("no image") {
        return ErrorCategory::NoImageReturned;
    }
    ErrorCategory::Generic
}

/// Cleans upstream error text before it is shown to users.
///
/// Collapses whitespace, redacts credential-looking tokens, and truncates.
pub fn sanitize_error_message(text: &str) -> String {
    let cleaned = text
        .split_whitespace()
        .map(|word| {
            let bare = word.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '_');
            if looks_like_secret(bare) {
                word.replace(bare, "[REDACTED]")
            } else {
                word.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ");

    if cleaned.chars().count() > MAX_ERROR_MESSAGE_CHARS {
        let truncated: String = cleaned.chars().take(MAX_ERROR_MESSAGE_CHARS).collect();
        format!("{truncated}...")
    } else {
        cleaned
    }
}

fn looks_like_secret(token: &str) -> bool {
    (token.starts_with("AIza") && token.len() >= 30)
        || (token.starts_with("r8_") && token.len() >= 20)
        || (token.starts_with("sk-") && token.len() >= 20)
}

/// Parses a `Retry-After` header given in seconds.
pub fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Result type alias for character sheet operations.
pub type Result<T> = std::result::Result<T, CharsheetError>;
