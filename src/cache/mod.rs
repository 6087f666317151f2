// ABOUTME: TTL-keyed resource cache with durable disk fallback and bus-driven invalidation
// ABOUTME: Typed key enumeration prevents callers from persisting arbitrary payloads
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Memoria

//! # Cache Store
//!
//! Keeps read-mostly server resources (conversation list, topic tree, topic
//! detail, settings, usage) fresh with TTL expiry, event-driven invalidation,
//! and a disk-backed fallback for a fixed allow-list of keys.
//!
//! Each [`CacheResource`] carries a fixed TTL and a fixed durability
//! classification defined by static tables, never by caller choice, so a
//! call site cannot accidentally persist sensitive or oversized payloads.
//!
//! The store subscribes to the [`EventBus`] at construction; the reaction
//! table in [`CacheStore::apply_event`] is the primary correctness surface of
//! this module: a missing reaction is a stale-data bug.

pub mod disk;

use std::fmt;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::bus::{DomainEvent, EventBus};
use disk::DiskCacheStore;

/// Default bound on in-memory entries
const DEFAULT_CACHE_MAX_ENTRIES: usize = 256;

/// Conversation list TTL (seconds)
const TTL_CONVERSATION_LIST_SECS: u64 = 60;
/// Topic tree TTL (seconds)
const TTL_TOPIC_TREE_SECS: u64 = 300;
/// Topic stats TTL (seconds)
const TTL_TOPIC_STATS_SECS: u64 = 300;
/// Topic detail TTL (seconds)
const TTL_TOPIC_DETAIL_SECS: u64 = 300;
/// Settings TTL (seconds); durable, survives restarts within this window
const TTL_SETTINGS_SECS: u64 = 86_400;
/// Usage stats TTL (seconds); durable
const TTL_USAGE_SECS: u64 = 900;

/// Closed set of cacheable resources.
///
/// The key namespace doubles as the disk file name for durable entries and
/// the glob target for group invalidation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheResource {
    /// The user's conversation list
    ConversationList,
    /// The full topic tree
    TopicTree,
    /// Aggregate topic/fact counters
    TopicStats,
    /// One topic's detail view, keyed by topic id
    TopicDetail {
        /// Server topic id
        topic_id: String,
    },
    /// User settings (durable)
    Settings,
    /// Usage counters (durable)
    Usage,
}

impl CacheResource {
    /// Whether this key is persisted to disk in addition to memory.
    ///
    /// Fixed allow-list: settings and usage only. Everything else is
    /// memory-only regardless of caller.
    #[must_use]
    pub const fn is_durable(&self) -> bool {
        matches!(self, Self::Settings | Self::Usage)
    }

    /// Glob pattern matching every topic-detail key
    #[must_use]
    pub const fn topic_detail_pattern() -> &'static str {
        "topic_detail:*"
    }
}

impl fmt::Display for CacheResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConversationList => write!(f, "conversation_list"),
            Self::TopicTree => write!(f, "topic_tree"),
            Self::TopicStats => write!(f, "topic_stats"),
            Self::TopicDetail { topic_id } => write!(f, "topic_detail:{topic_id}"),
            Self::Settings => write!(f, "settings"),
            Self::Usage => write!(f, "usage"),
        }
    }
}

/// Per-resource TTLs, overridable for tests
#[derive(Debug, Clone)]
pub struct CacheTtlConfig {
    /// Conversation list TTL in seconds
    pub conversation_list_secs: u64,
    /// Topic tree TTL in seconds
    pub topic_tree_secs: u64,
    /// Topic stats TTL in seconds
    pub topic_stats_secs: u64,
    /// Topic detail TTL in seconds
    pub topic_detail_secs: u64,
    /// Settings TTL in seconds
    pub settings_secs: u64,
    /// Usage TTL in seconds
    pub usage_secs: u64,
}

impl Default for CacheTtlConfig {
    fn default() -> Self {
        Self {
            conversation_list_secs: TTL_CONVERSATION_LIST_SECS,
            topic_tree_secs: TTL_TOPIC_TREE_SECS,
            topic_stats_secs: TTL_TOPIC_STATS_SECS,
            topic_detail_secs: TTL_TOPIC_DETAIL_SECS,
            settings_secs: TTL_SETTINGS_SECS,
            usage_secs: TTL_USAGE_SECS,
        }
    }
}

impl CacheTtlConfig {
    /// TTL for a specific resource kind
    #[must_use]
    pub const fn ttl_for_resource(&self, resource: &CacheResource) -> Duration {
        match resource {
            CacheResource::ConversationList => Duration::from_secs(self.conversation_list_secs),
            CacheResource::TopicTree => Duration::from_secs(self.topic_tree_secs),
            CacheResource::TopicStats => Duration::from_secs(self.topic_stats_secs),
            CacheResource::TopicDetail { .. } => Duration::from_secs(self.topic_detail_secs),
            CacheResource::Settings => Duration::from_secs(self.settings_secs),
            CacheResource::Usage => Duration::from_secs(self.usage_secs),
        }
    }
}

/// Cache construction parameters
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of in-memory entries
    pub max_entries: usize,
    /// Directory for durable envelopes
    pub cache_dir: PathBuf,
    /// Per-resource TTLs
    pub ttl: CacheTtlConfig,
}

impl CacheConfig {
    /// Production defaults rooted at the given cache directory
    #[must_use]
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            cache_dir,
            ttl: CacheTtlConfig::default(),
        }
    }
}

/// In-memory entry: encoded value plus absolute expiry
#[derive(Debug, Clone)]
struct MemoryEntry {
    value: serde_json::Value,
    expires_at: DateTime<Utc>,
}

impl MemoryEntry {
    fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// TTL-keyed memory cache with durable disk fallback.
///
/// Cheap to clone; clones share state. All mutating operations are atomic
/// single-threaded operations behind one mutex with no partial-write visibility.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    memory: Mutex<LruCache<String, MemoryEntry>>,
    disk: DiskCacheStore,
    ttl: CacheTtlConfig,
}

impl CacheStore {
    /// Fallback capacity when the config asks for zero entries
    const DEFAULT_CAPACITY: NonZeroUsize = match NonZeroUsize::new(DEFAULT_CACHE_MAX_ENTRIES) {
        Some(n) => n,
        None => unreachable!(),
    };

    /// Create a store and subscribe it to `bus` for event-driven
    /// invalidation.
    #[must_use]
    pub fn new(config: CacheConfig, bus: &EventBus) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(Self::DEFAULT_CAPACITY);
        let store = Self {
            inner: Arc::new(CacheInner {
                memory: Mutex::new(LruCache::new(capacity)),
                disk: DiskCacheStore::open(config.cache_dir),
                ttl: config.ttl,
            }),
        };

        let reactor = store.clone();
        bus.subscribe(move |event| reactor.apply_event(event));

        store
    }

    /// Fetch a cached value, or `None` on a miss.
    ///
    /// Memory is consulted first. For durable keys a memory miss falls back
    /// to the disk envelope; a successful disk load is promoted into memory
    /// with the *same* stored expiry, so a restart never extends staleness.
    #[must_use]
    pub fn get<T: DeserializeOwned>(&self, resource: &CacheResource) -> Option<T> {
        let key = resource.to_string();

        {
            let mut memory = self.lock_memory();
            if let Some(entry) = memory.get(&key) {
                if entry.is_expired() {
                    memory.pop(&key);
                } else {
                    let value = entry.value.clone();
                    drop(memory);
                    return decode(&key, value);
                }
            }
        }

        if !resource.is_durable() {
            return None;
        }

        let (value, expires_at) = self.inner.disk.load(&key)?;
        self.lock_memory().push(
            key.clone(),
            MemoryEntry {
                value: value.clone(),
                expires_at,
            },
        );
        decode(&key, value)
    }

    /// Store a value under its resource key with the key's fixed TTL.
    ///
    /// Serialization failures are swallowed here deliberately: cache
    /// durability is best-effort and a miss just triggers a network fetch.
    pub fn set<T: Serialize>(&self, resource: &CacheResource, value: &T) {
        let key = resource.to_string();
        let encoded = match serde_json::to_value(value) {
            Ok(encoded) => encoded,
            Err(error) => {
                debug!(key, %error, "failed to encode cache value, skipping");
                return;
            }
        };

        let ttl = self.inner.ttl.ttl_for_resource(resource);
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(0));

        self.lock_memory().push(
            key.clone(),
            MemoryEntry {
                value: encoded.clone(),
                expires_at,
            },
        );

        if resource.is_durable() {
            self.inner.disk.store(&key, &encoded, expires_at);
        }
    }

    /// Remove one entry (memory and, for durable keys, disk)
    pub fn invalidate(&self, resource: &CacheResource) {
        let key = resource.to_string();
        self.lock_memory().pop(&key);
        if resource.is_durable() {
            self.inner.disk.remove(&key);
        }
    }

    /// Remove every memory entry whose key matches a glob pattern, returning
    /// the number removed. Disk is untouched: no durable group exists.
    pub fn invalidate_pattern(&self, pattern: &str) -> u64 {
        let Ok(glob_pattern) = glob::Pattern::new(pattern) else {
            debug!(pattern, "invalid cache invalidation pattern");
            return 0;
        };

        let mut memory = self.lock_memory();
        let matching: Vec<String> = memory
            .iter()
            .filter(|(key, _)| glob_pattern.matches(key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &matching {
            memory.pop(key);
        }
        matching.len() as u64
    }

    /// Drop everything: memory and disk
    pub fn invalidate_all(&self) {
        self.lock_memory().clear();
        self.inner.disk.clear();
    }

    /// Absolute expiry of an entry, if present and unexpired. Peeks without
    /// touching LRU order; used by tests asserting that promotion preserves
    /// the persisted expiry.
    #[must_use]
    pub fn expires_at(&self, resource: &CacheResource) -> Option<DateTime<Utc>> {
        let key = resource.to_string();
        let memory = self.lock_memory();
        memory
            .peek(&key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.expires_at)
    }

    /// Fixed reaction table for domain events.
    ///
    /// Exhaustive over [`DomainEvent`]: adding a variant forces a decision
    /// here.
    fn apply_event(&self, event: &DomainEvent) {
        match event {
            DomainEvent::ConversationCreated { .. } | DomainEvent::ConversationRenamed { .. } => {
                self.invalidate(&CacheResource::ConversationList);
            }
            DomainEvent::TopicsUpdated => {
                self.invalidate(&CacheResource::TopicTree);
                self.invalidate(&CacheResource::TopicStats);
            }
            DomainEvent::FactsUpdated => {
                self.invalidate_pattern(CacheResource::topic_detail_pattern());
                self.invalidate(&CacheResource::TopicTree);
                self.invalidate(&CacheResource::TopicStats);
            }
            DomainEvent::ModelChanged { .. } | DomainEvent::EmailVerified => {
                self.invalidate(&CacheResource::Settings);
            }
            DomainEvent::SignedOut => {
                self.invalidate_all();
            }
            DomainEvent::NavigateToMessage { .. } => {}
        }
    }

    fn lock_memory(&self) -> std::sync::MutexGuard<'_, LruCache<String, MemoryEntry>> {
        self.inner
            .memory
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Decode a cached value, swallowing failures as a miss. This is the one
/// call site where cache deserialization errors are deliberately discarded.
fn decode<T: DeserializeOwned>(key: &str, value: serde_json::Value) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(decoded) => Some(decoded),
        Err(error) => {
            debug!(key, %error, "failed to decode cached value, treating as miss");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_namespace() {
        assert_eq!(CacheResource::ConversationList.to_string(), "conversation_list");
        assert_eq!(
            CacheResource::TopicDetail {
                topic_id: "t-9".to_owned()
            }
            .to_string(),
            "topic_detail:t-9"
        );
    }

    #[test]
    fn test_durability_allow_list() {
        assert!(CacheResource::Settings.is_durable());
        assert!(CacheResource::Usage.is_durable());
        assert!(!CacheResource::ConversationList.is_durable());
        assert!(!CacheResource::TopicTree.is_durable());
        assert!(!CacheResource::TopicStats.is_durable());
        assert!(!CacheResource::TopicDetail {
            topic_id: "t".to_owned()
        }
        .is_durable());
    }

    #[test]
    fn test_topic_detail_pattern_matches_namespace() {
        let pattern = glob::Pattern::new(CacheResource::topic_detail_pattern()).unwrap();
        assert!(pattern.matches("topic_detail:abc"));
        assert!(!pattern.matches("topic_tree"));
    }
}
