// ABOUTME: Settings and usage accessor, model switching, and sign-out
// ABOUTME: Settings and usage are the durable cache keys; writes publish ModelChanged/SignedOut
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Memoria

//! Settings and usage accessor. These two reads back the durable cache keys,
//! so a fresh process can serve them from disk within the original TTL.

use std::sync::Arc;

use reqwest::Method;
use serde_json::json;
use tracing::info;

use crate::api::ApiClient;
use crate::bus::{DomainEvent, EventBus};
use crate::cache::{CacheResource, CacheStore};
use crate::errors::ApiResult;
use crate::models::{ChatSettings, UsageSummary};

/// Accessor for user settings, usage counters, and account-level writes
pub struct SettingsResource {
    api: Arc<ApiClient>,
    cache: CacheStore,
    bus: EventBus,
}

impl SettingsResource {
    #[must_use]
    pub fn new(api: Arc<ApiClient>, cache: CacheStore, bus: EventBus) -> Self {
        Self { api, cache, bus }
    }

    /// Persisted chat settings, served from the durable cache when possible
    pub async fn settings(&self) -> ApiResult<ChatSettings> {
        if let Some(cached) = self.cache.get::<ChatSettings>(&CacheResource::Settings) {
            return Ok(cached);
        }
        let settings: ChatSettings = self.api.request(Method::GET, "settings", None).await?;
        self.cache.set(&CacheResource::Settings, &settings);
        Ok(settings)
    }

    /// Usage counters for the current billing period
    pub async fn usage(&self) -> ApiResult<UsageSummary> {
        if let Some(cached) = self.cache.get::<UsageSummary>(&CacheResource::Usage) {
            return Ok(cached);
        }
        let usage: UsageSummary = self.api.request(Method::GET, "usage", None).await?;
        self.cache.set(&CacheResource::Usage, &usage);
        Ok(usage)
    }

    /// Switch the active provider/model pair. Publishes
    /// [`DomainEvent::ModelChanged`] so the cached settings invalidate before
    /// this returns; the next settings read reflects the change.
    pub async fn set_model(&self, provider: &str, model: &str) -> ApiResult<()> {
        self.api
            .request_empty(
                Method::PATCH,
                "settings/model",
                Some(&json!({ "provider": provider, "model": model })),
            )
            .await?;
        self.bus.publish(&DomainEvent::ModelChanged {
            provider: provider.to_owned(),
            model: model.to_owned(),
        });
        Ok(())
    }

    /// Clear stored credentials and publish [`DomainEvent::SignedOut`],
    /// which blanket-invalidates the cache, memory and disk both.
    pub async fn sign_out(&self) {
        self.api.clear_credentials().await;
        info!("signed out, cache cleared");
        self.bus.publish(&DomainEvent::SignedOut);
    }
}
