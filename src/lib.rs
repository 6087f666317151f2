// ABOUTME: Main library entry point for the Memoria chat client core
// ABOUTME: Streaming session engine, event-driven cache, domain bus, resource accessors
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Memoria

#![deny(unsafe_code)]

//! # Memoria Client
//!
//! Client-side core of the Memoria personal-memory chat assistant: everything
//! between the UI layer and the HTTP backend, with no rendering or navigation
//! concerns.
//!
//! ## Subsystems
//!
//! - **Session** ([`session`]): the streaming chat session engine. Owns the
//!   ordered message log, uploads attachments, opens one server-sent-event
//!   stream per turn, applies decoded events with token coalescing, and
//!   handles cancellation, retry, and regeneration.
//! - **Stream** ([`stream`]): the line-oriented event protocol decoder that
//!   turns raw `data:` lines into typed [`stream::StreamEvent`]s.
//! - **Cache** ([`cache`]): TTL cache over read-mostly server resources with
//!   event-driven invalidation and a disk-backed fallback for durable keys.
//! - **Bus** ([`bus`]): synchronous in-process domain event fan-out wiring
//!   the session, cache, and accessors together without direct coupling.
//! - **API** ([`api`]): authenticated request, stream-open, and upload
//!   functions over an opaque credential provider.
//! - **Resources** ([`resources`]): conversation, topic, settings, and usage
//!   accessors layered on the cache and API client.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use memoria_client::api::{ApiClient, CredentialProvider};
//! use memoria_client::bus::EventBus;
//! use memoria_client::cache::{CacheConfig, CacheStore};
//! use memoria_client::config::ClientConfig;
//! use memoria_client::errors::ApiResult;
//!
//! fn build(credentials: Arc<dyn CredentialProvider>) -> ApiResult<()> {
//!     let config = ClientConfig::from_env()?;
//!     let bus = EventBus::new();
//!     let cache = CacheStore::new(CacheConfig::new(config.cache_dir.clone()), &bus);
//!     let api = Arc::new(ApiClient::new(config, credentials)?);
//!     let _ = (cache, bus, api);
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod bus;
pub mod cache;
pub mod config;
pub mod errors;
pub mod logging;
pub mod models;
pub mod resources;
pub mod session;
pub mod stream;

pub use bus::{DomainEvent, EventBus};
pub use errors::{ApiError, ApiResult};
pub use session::{ChatSessionEngine, SessionPhase};
pub use stream::StreamEvent;
