// ABOUTME: Logging configuration and structured logging setup for the client core
// ABOUTME: Configures log levels and output formats via tracing-subscriber
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Memoria

//! Structured logging setup built on `tracing`.
//!
//! The host application calls [`init_logging`] once at startup. Log level is
//! controlled by `RUST_LOG` (falling back to `info`), format by
//! `MEMORIA_LOG_FORMAT` (`pretty`, `compact`, or `json`).

use std::env;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable multi-line output for development
    Pretty,
    /// Single-line output for terminals
    Compact,
    /// Structured JSON for log aggregation
    Json,
}

impl LogFormat {
    /// Read the format from `MEMORIA_LOG_FORMAT`, defaulting to compact
    #[must_use]
    pub fn from_env() -> Self {
        match env::var("MEMORIA_LOG_FORMAT").as_deref() {
            Ok("pretty") => Self::Pretty,
            Ok("json") => Self::Json,
            _ => Self::Compact,
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// Safe to call once per process; subsequent calls return an error from the
/// underlying registry, which callers may ignore in tests.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_logging(format: LogFormat) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().pretty())
            .try_init()?,
        LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .try_init()?,
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()?,
    }

    tracing::debug!("logging initialized with format {:?}", format);
    Ok(())
}
