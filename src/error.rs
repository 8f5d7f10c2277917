//! Custom error types for rustpubfill.
//!
//! `PubfillError` covers everything that can escalate past a single record:
//! session setup, the search backend, configuration. Failures that stay inside
//! one record's enrichment use the closed per-component enums
//! ([`crate::browser::FetchError`], [`crate::extractor::ExtractError`],
//! [`crate::mirrors::MirrorError`]) and end up as strings in the record's
//! `error` list.

use thiserror::Error;

/// Main error type for rustpubfill operations.
#[derive(Debug, Error)]
pub enum PubfillError {
    /// Browser launch or tab operation failed outside a record task
    #[error("Browser error: {0}")]
    Browser(String),

    /// Network/HTTP request error
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// HTML parsing error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Rate limited by external API
    #[error("Rate limited, retry after {0}s")]
    RateLimited(u64),

    /// External API returned an error
    #[error("API error: {code} - {message}")]
    Api {
        /// Error code from API
        code: i32,
        /// Error message from API
        message: String,
    },

    /// CAPTCHA detected
    #[error("CAPTCHA detected, please refresh cookies")]
    Captcha,

    /// File I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Config error: {0}")]
    Config(String),

    /// Parameter validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Session authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The search backend could not be queried and nothing was registered
    #[error("Search source unavailable: {0}")]
    SourceUnavailable(String),

    /// Session transport failed to deliver a message
    #[error("Transport error: {0}")]
    Transport(String),

    /// The governing task was cancelled
    #[error("Cancelled")]
    Cancelled,
}

/// Result type alias using `PubfillError`
pub type Result<T> = std::result::Result<T, PubfillError>;
