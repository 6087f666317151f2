// ABOUTME: Resource accessors: thin read/write operations over the API client and cache
// ABOUTME: Reads are cache-first; writes publish domain events so the cache reacts
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Memoria

//! # Resource Accessors
//!
//! Read-mostly server resources (conversations, topics and facts, settings,
//! usage) layered on [`CacheStore`](crate::cache::CacheStore) and
//! [`ApiClient`](crate::api::ApiClient). Reads consult the cache first and
//! populate it on a miss; write operations go straight to the backend and
//! publish the matching [`DomainEvent`](crate::bus::DomainEvent) so cached
//! reads invalidate before the write call returns.

pub mod conversations;
pub mod settings;
pub mod topics;

pub use conversations::ConversationsResource;
pub use settings::SettingsResource;
pub use topics::TopicsResource;
