// ABOUTME: Environment-driven configuration for the Memoria client core
// ABOUTME: Base URL, request timeout, and cache directory with sensible defaults
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Memoria

//! Client configuration loaded from the environment.
//!
//! Environment-only configuration keeps deployments reproducible: every knob
//! has a `MEMORIA_*` variable and a default that works against production.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{ApiError, ApiResult};

/// Environment variable for the API base URL
const BASE_URL_ENV: &str = "MEMORIA_API_BASE_URL";

/// Environment variable for the request timeout in seconds
const REQUEST_TIMEOUT_ENV: &str = "MEMORIA_REQUEST_TIMEOUT_SECS";

/// Environment variable overriding the durable cache directory
const CACHE_DIR_ENV: &str = "MEMORIA_CACHE_DIR";

/// Default production API base URL
const DEFAULT_BASE_URL: &str = "https://api.memoria.chat/v1";

/// Default timeout for simple (non-streaming) requests
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Directory name under the platform cache dir for durable envelopes
const CACHE_DIR_NAME: &str = "memoria";

/// Client configuration assembled from the environment
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL all request paths are joined onto
    pub base_url: String,
    /// Timeout applied to simple requests and uploads (not the event stream)
    pub request_timeout: Duration,
    /// Directory holding durable cache envelopes
    pub cache_dir: PathBuf,
}

impl ClientConfig {
    /// Load configuration from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if `MEMORIA_REQUEST_TIMEOUT_SECS` is set but not a
    /// positive integer, or if no cache directory can be determined.
    pub fn from_env() -> ApiResult<Self> {
        let base_url = env_or(BASE_URL_ENV, DEFAULT_BASE_URL);

        let request_timeout_secs = match env::var(REQUEST_TIMEOUT_ENV) {
            Ok(raw) => raw.parse::<u64>().map_err(|_| {
                ApiError::unknown(format!("{REQUEST_TIMEOUT_ENV} must be a positive integer, got '{raw}'"))
            })?,
            Err(_) => DEFAULT_REQUEST_TIMEOUT_SECS,
        };

        let cache_dir = match env::var(CACHE_DIR_ENV) {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => dirs::cache_dir()
                .ok_or_else(|| ApiError::unknown("no platform cache directory available"))?
                .join(CACHE_DIR_NAME),
        };

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            request_timeout: Duration::from_secs(request_timeout_secs.max(1)),
            cache_dir,
        })
    }

    /// Join a request path onto the base URL
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

/// Read an environment variable with a default fallback
fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}
