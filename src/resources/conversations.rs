// ABOUTME: Conversation list and history accessor with rename and delete writes
// ABOUTME: List reads are cached; rename publishes ConversationRenamed for invalidation
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Memoria

//! Conversation accessor: cached list reads, uncached history fetches, and
//! rename/delete writes.

use std::sync::Arc;

use reqwest::Method;
use serde_json::json;
use tracing::debug;

use crate::api::ApiClient;
use crate::bus::{DomainEvent, EventBus};
use crate::cache::{CacheResource, CacheStore};
use crate::errors::ApiResult;
use crate::models::{ConversationSummary, Message};

/// Accessor for the conversation list and per-conversation history
pub struct ConversationsResource {
    api: Arc<ApiClient>,
    cache: CacheStore,
    bus: EventBus,
}

impl ConversationsResource {
    #[must_use]
    pub fn new(api: Arc<ApiClient>, cache: CacheStore, bus: EventBus) -> Self {
        Self { api, cache, bus }
    }

    /// Conversation summaries, newest first. Cache-first with a short TTL;
    /// creation and rename events invalidate it between fetches.
    pub async fn list(&self) -> ApiResult<Vec<ConversationSummary>> {
        if let Some(cached) = self.cache.get::<Vec<ConversationSummary>>(&CacheResource::ConversationList) {
            debug!(count = cached.len(), "conversation list served from cache");
            return Ok(cached);
        }
        let conversations: Vec<ConversationSummary> =
            self.api.request(Method::GET, "conversations", None).await?;
        self.cache.set(&CacheResource::ConversationList, &conversations);
        Ok(conversations)
    }

    /// Full message history of one conversation. Never cached: the log is
    /// installed into the session engine, which owns it from then on.
    pub async fn messages(&self, conversation_id: &str) -> ApiResult<Vec<Message>> {
        self.api
            .request(Method::GET, &format!("conversations/{conversation_id}/messages"), None)
            .await
    }

    /// Rename a conversation and announce it so list caches invalidate
    pub async fn rename(&self, conversation_id: &str, title: &str) -> ApiResult<()> {
        self.api
            .request_empty(
                Method::PATCH,
                &format!("conversations/{conversation_id}"),
                Some(&json!({ "title": title })),
            )
            .await?;
        self.bus.publish(&DomainEvent::ConversationRenamed {
            id: conversation_id.to_owned(),
            title: title.to_owned(),
        });
        Ok(())
    }

    /// Delete a conversation. The list cache is invalidated directly; no
    /// domain event exists for deletion because nothing else reacts to it.
    pub async fn delete(&self, conversation_id: &str) -> ApiResult<()> {
        self.api
            .request_empty(Method::DELETE, &format!("conversations/{conversation_id}"), None)
            .await?;
        self.cache.invalidate(&CacheResource::ConversationList);
        Ok(())
    }
}
