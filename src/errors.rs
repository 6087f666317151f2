// ABOUTME: Unified error taxonomy for the Memoria client core
// ABOUTME: Maps transport, HTTP status, and decode failures into a small typed error set
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Memoria

//! # Client Error Taxonomy
//!
//! Every fallible operation in this crate surfaces an [`ApiError`]. Resource
//! accessors propagate the taxonomy directly to their callers; the chat
//! session engine narrows all of it into a single errored-message outcome and
//! keeps the distinction only for logging.

use thiserror::Error;

/// Unified error type for the client core
#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing or rejected credentials (HTTP 401 after a refresh attempt)
    #[error("authentication required")]
    Unauthorized,

    /// Authenticated but not allowed (HTTP 403)
    #[error("access denied")]
    Forbidden,

    /// Resource does not exist (HTTP 404)
    #[error("resource not found")]
    NotFound,

    /// Plan or rate quota exhausted (HTTP 429)
    #[error("rate limit exceeded")]
    RateLimited,

    /// Backend reported a failure (HTTP 5xx)
    #[error("server error: {0}")]
    Server(String),

    /// Connection-level failure: reset, timeout, DNS, TLS
    #[error("network error: {0}")]
    Network(String),

    /// Response body could not be decoded into the expected shape
    #[error("decode error: {0}")]
    Decoding(String),

    /// Anything that does not fit the categories above
    #[error("unexpected error: {0}")]
    Unknown(String),
}

impl ApiError {
    /// Map a non-2xx HTTP status code (plus response body) into the taxonomy.
    ///
    /// The body is carried only for server errors, where the backend includes
    /// a human-readable detail worth logging.
    #[must_use]
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            429 => Self::RateLimited,
            500..=599 => Self::Server(extract_detail(body)),
            _ => Self::Unknown(format!("unexpected HTTP status {status}")),
        }
    }

    /// Server error with a detail string
    pub fn server(detail: impl Into<String>) -> Self {
        Self::Server(detail.into())
    }

    /// Network/transport error with a detail string
    pub fn network(detail: impl Into<String>) -> Self {
        Self::Network(detail.into())
    }

    /// Decode failure with a detail string
    pub fn decoding(detail: impl Into<String>) -> Self {
        Self::Decoding(detail.into())
    }

    /// Catch-all error with a detail string
    pub fn unknown(detail: impl Into<String>) -> Self {
        Self::Unknown(detail.into())
    }

    /// Whether a single credential refresh and retry is worth attempting
    #[must_use]
    pub const fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }

    /// Short display string suitable for an errored message bubble.
    ///
    /// Taxonomy detail is for logging; users get one stable sentence per
    /// category.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Unauthorized => "Your session has expired. Please sign in again.".to_owned(),
            Self::Forbidden => "You don't have access to this resource.".to_owned(),
            Self::NotFound => "That resource no longer exists.".to_owned(),
            Self::RateLimited => {
                "You've reached your message limit. Please try again later.".to_owned()
            }
            Self::Server(_) | Self::Unknown(_) => {
                "Something went wrong. Please try again.".to_owned()
            }
            Self::Network(_) => "Connection lost. Check your network and try again.".to_owned(),
            Self::Decoding(_) => "Received an unexpected response. Please try again.".to_owned(),
        }
    }
}

/// Pull a `detail`/`message`/`error` field out of a JSON error body, falling
/// back to the raw body (truncated) when it is not JSON.
fn extract_detail(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for field in ["detail", "message", "error"] {
            if let Some(text) = value.get(field).and_then(serde_json::Value::as_str) {
                return text.to_owned();
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "no detail provided".to_owned()
    } else {
        trimmed.chars().take(200).collect()
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Network(format!("request timed out: {error}"))
        } else if error.is_connect() {
            Self::Network(format!("connection failed: {error}"))
        } else if error.is_decode() {
            Self::Decoding(error.to_string())
        } else {
            Self::Network(error.to_string())
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(error: serde_json::Error) -> Self {
        Self::Decoding(error.to_string())
    }
}

/// Result type alias for convenience
pub type ApiResult<T> = Result<T, ApiError>;
