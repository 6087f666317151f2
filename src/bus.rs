// ABOUTME: Process-wide domain event bus with synchronous in-order fan-out
// ABOUTME: Decouples producers (writes, stream events) from consumers (cache, list views)
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Memoria

//! # Domain Event Bus
//!
//! Coarse-grained facts ("a conversation was created", "topics changed")
//! broadcast to every subscriber registered at publish time, in subscription
//! order, before `publish` returns. No persistence: subscribers registered
//! after a publish never see it.
//!
//! Delivery is synchronous by contract: the cache's invalidation reactions
//! must be visible to the very next `get`. Subscribers therefore perform only
//! local state updates, never blocking I/O.

use std::sync::{Arc, Mutex};

use tracing::debug;

/// A coarse-grained fact broadcast to all current subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    /// A conversation gained a server identity; re-published when a late
    /// title arrives so list views can pick it up
    ConversationCreated {
        /// Server conversation id
        id: String,
        /// Title if already known
        title: Option<String>,
    },
    /// A conversation was renamed via the accessor
    ConversationRenamed {
        /// Server conversation id
        id: String,
        /// New title
        title: String,
    },
    /// The topic tree changed (extraction or topic write)
    TopicsUpdated,
    /// Facts changed under one or more topics
    FactsUpdated,
    /// The active provider/model changed
    ModelChanged {
        /// Provider identifier (opaque)
        provider: String,
        /// Model identifier (opaque)
        model: String,
    },
    /// The user signed out; all cached state must be dropped
    SignedOut,
    /// The user's email address was verified
    EmailVerified,
    /// UI request to scroll a conversation to a specific message
    NavigateToMessage {
        /// Conversation holding the message
        conversation_id: String,
        /// Target message id
        message_id: String,
    },
}

type Subscriber = Arc<dyn Fn(&DomainEvent) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`], usable to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// Process-wide publish/subscribe channel for [`DomainEvent`]s.
///
/// Cheap to clone; clones share the subscriber list. Constructed once at the
/// application's composition root and injected, never a static.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

#[derive(Default)]
struct BusInner {
    next_id: u64,
    subscribers: Vec<(u64, Subscriber)>,
}

impl EventBus {
    /// Create an empty bus
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. Delivery order follows subscription order.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&DomainEvent) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push((id, Arc::new(callback)));
        SubscriptionId(id)
    }

    /// Remove a subscriber; no-op if already removed
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.subscribers.retain(|(sub_id, _)| *sub_id != id.0);
    }

    /// Deliver `event` to every subscriber registered right now, in order.
    ///
    /// The subscriber list is snapshotted before dispatch and the lock
    /// released, so a subscriber may register or remove subscriptions (or
    /// publish again) without corrupting iteration. Changes take effect for
    /// the next publish.
    pub fn publish(&self, event: &DomainEvent) {
        let snapshot: Vec<Subscriber> = {
            let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            inner.subscribers.iter().map(|(_, s)| Arc::clone(s)).collect()
        };

        debug!(subscribers = snapshot.len(), event = ?event, "publishing domain event");
        for subscriber in snapshot {
            subscriber(event);
        }
    }

    /// Number of currently registered subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .subscribers
            .len()
    }
}
