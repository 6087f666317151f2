// ABOUTME: Topic tree, stats, and per-topic detail accessor plus fact deletion
// ABOUTME: All reads are cached; fact deletion publishes FactsUpdated
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Memoria

//! Topic and fact accessor over the memory graph endpoints.

use std::sync::Arc;

use reqwest::Method;
use tracing::debug;

use crate::api::ApiClient;
use crate::bus::{DomainEvent, EventBus};
use crate::cache::{CacheResource, CacheStore};
use crate::errors::ApiResult;
use crate::models::{TopicDetail, TopicNode, TopicStats};

/// Accessor for the extracted-topic hierarchy and its facts
pub struct TopicsResource {
    api: Arc<ApiClient>,
    cache: CacheStore,
    bus: EventBus,
}

impl TopicsResource {
    #[must_use]
    pub fn new(api: Arc<ApiClient>, cache: CacheStore, bus: EventBus) -> Self {
        Self { api, cache, bus }
    }

    /// Root-level topic tree
    pub async fn tree(&self) -> ApiResult<Vec<TopicNode>> {
        if let Some(cached) = self.cache.get::<Vec<TopicNode>>(&CacheResource::TopicTree) {
            return Ok(cached);
        }
        let tree: Vec<TopicNode> = self.api.request(Method::GET, "topics/tree", None).await?;
        self.cache.set(&CacheResource::TopicTree, &tree);
        Ok(tree)
    }

    /// Aggregate counts across the whole graph
    pub async fn stats(&self) -> ApiResult<TopicStats> {
        if let Some(cached) = self.cache.get::<TopicStats>(&CacheResource::TopicStats) {
            return Ok(cached);
        }
        let stats: TopicStats = self.api.request(Method::GET, "topics/stats", None).await?;
        self.cache.set(&CacheResource::TopicStats, &stats);
        Ok(stats)
    }

    /// One topic and its facts, cached per id
    pub async fn detail(&self, topic_id: &str) -> ApiResult<TopicDetail> {
        let key = CacheResource::TopicDetail {
            topic_id: topic_id.to_owned(),
        };
        if let Some(cached) = self.cache.get::<TopicDetail>(&key) {
            return Ok(cached);
        }
        let detail: TopicDetail = self
            .api
            .request(Method::GET, &format!("topics/{topic_id}"), None)
            .await?;
        self.cache.set(&key, &detail);
        Ok(detail)
    }

    /// Delete one fact. Publishes [`DomainEvent::FactsUpdated`], which
    /// invalidates every cached topic detail plus the tree and stats, since
    /// fact counts roll up the hierarchy.
    pub async fn delete_fact(&self, topic_id: &str, fact_id: &str) -> ApiResult<()> {
        self.api
            .request_empty(
                Method::DELETE,
                &format!("topics/{topic_id}/facts/{fact_id}"),
                None,
            )
            .await?;
        debug!(topic_id, fact_id, "fact deleted");
        self.bus.publish(&DomainEvent::FactsUpdated);
        Ok(())
    }
}
