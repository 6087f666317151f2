// ABOUTME: Core data model for the Memoria client: messages, attachments, topics, facts
// ABOUTME: Plus server resource payloads (conversations, settings, usage) consumed by accessors
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Memoria

//! Domain data structures shared across the session engine, cache, and
//! resource accessors.
//!
//! [`Message`] is the only mutable entity here and is owned exclusively by the
//! active chat session: it grows during streaming and becomes immutable once
//! `is_streaming` drops to `false`.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role of a message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// End-user message
    User,
    /// Assistant reply (streamed)
    Assistant,
    /// System instruction
    System,
}

impl MessageRole {
    /// String form used on the wire
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

/// A single entry in the session message log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Opaque id: client-generated for optimistic entries, server-assigned once persisted
    pub id: String,
    /// Author role
    pub role: MessageRole,
    /// Text content; grows in place while streaming
    pub content: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Attachments referenced by this message (post-upload, URL only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<UploadedAttachment>,
    /// True while this message is the live streaming placeholder
    #[serde(default)]
    pub is_streaming: bool,
    /// True when the turn ended in an error; content holds the display string
    #[serde(default)]
    pub is_error: bool,
    /// Topics the backend extracted from this exchange, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topics: Option<Vec<ExtractedTopic>>,
    /// Web search sources attached to this reply, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<SearchSource>>,
}

impl Message {
    /// Optimistic user message appended when a turn starts
    #[must_use]
    pub fn user(content: impl Into<String>, attachments: Vec<UploadedAttachment>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: MessageRole::User,
            content: content.into(),
            created_at: Utc::now(),
            attachments,
            is_streaming: false,
            is_error: false,
            topics: None,
            sources: None,
        }
    }

    /// Empty assistant placeholder that stream events are applied to
    #[must_use]
    pub fn assistant_placeholder() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: MessageRole::Assistant,
            content: String::new(),
            created_at: Utc::now(),
            attachments: Vec::new(),
            is_streaming: true,
            is_error: false,
            topics: None,
            sources: None,
        }
    }
}

/// Attachment kind distinguishing render treatment and upload endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    /// Inline-renderable image
    Image,
    /// Generic file
    File,
}

/// Local-only attachment picked by the user but not yet uploaded.
///
/// Holds the raw bytes; discarded on successful send, returned to the pending
/// list when any upload in the batch fails.
#[derive(Debug, Clone)]
pub struct PendingAttachment {
    /// Client-generated id for list reconciliation
    pub id: String,
    /// Image or file
    pub kind: AttachmentKind,
    /// Raw content read from the picker
    pub data: Bytes,
    /// Original file name
    pub file_name: String,
    /// MIME type reported by the picker
    pub mime_type: String,
}

impl PendingAttachment {
    /// Wrap picked bytes into a pending attachment
    #[must_use]
    pub fn new(
        kind: AttachmentKind,
        data: Bytes,
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            data,
            file_name: file_name.into(),
            mime_type: mime_type.into(),
        }
    }
}

/// Server-side record of an uploaded attachment, referenced by messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedAttachment {
    /// Image or file
    pub kind: AttachmentKind,
    /// Server URL of the stored blob
    pub url: String,
    /// Original file name
    pub file_name: String,
    /// MIME type
    pub mime_type: String,
}

/// A topic the backend extracted from the conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedTopic {
    /// Hierarchical path, e.g. `health/sleep`
    pub path: String,
    /// Display name (defaults to the path on the wire)
    pub name: String,
    /// Whether this topic was created by this exchange
    pub is_new: bool,
    /// Number of facts added under this topic
    pub facts_added: u32,
}

/// A web search source cited by the assistant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchSource {
    /// Page title
    pub title: String,
    /// Page URL
    pub url: String,
}

// ============================================================================
// Server resource payloads (read via the resource accessors)
// ============================================================================

/// Conversation list entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    /// Server conversation id
    pub id: String,
    /// Title, absent until the backend names the conversation
    #[serde(default)]
    pub title: Option<String>,
    /// Last activity timestamp
    pub updated_at: DateTime<Utc>,
}

/// Node in the topic tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicNode {
    /// Server topic id
    pub id: String,
    /// Hierarchical path
    pub path: String,
    /// Display name
    pub name: String,
    /// Number of facts directly under this topic
    #[serde(default)]
    pub fact_count: u32,
    /// Child topics
    #[serde(default)]
    pub children: Vec<TopicNode>,
}

/// Aggregate topic statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicStats {
    /// Total number of topics
    pub topic_count: u32,
    /// Total number of facts across all topics
    pub fact_count: u32,
}

/// A single extracted fact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fact {
    /// Server fact id
    pub id: String,
    /// Fact text
    pub content: String,
    /// Extraction timestamp
    pub created_at: DateTime<Utc>,
}

/// Detail view of one topic and its facts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicDetail {
    /// Server topic id
    pub id: String,
    /// Hierarchical path
    pub path: String,
    /// Display name
    pub name: String,
    /// Facts stored under this topic
    #[serde(default)]
    pub facts: Vec<Fact>,
}

/// Memory behavior for new turns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryMode {
    /// Extract and recall facts automatically
    Auto,
    /// Recall only, no new extraction
    RecallOnly,
    /// Memory disabled for this session
    Off,
}

/// User settings consumed by the engine at session start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSettings {
    /// Active AI provider identifier (opaque)
    pub provider: String,
    /// Active model identifier (opaque)
    pub model: String,
    /// Memory behavior
    pub memory_mode: MemoryMode,
    /// Subscription tier (opaque)
    pub plan_tier: String,
    /// Voice input enabled
    #[serde(default)]
    pub voice_enabled: bool,
    /// Image uploads enabled
    #[serde(default)]
    pub image_uploads_enabled: bool,
    /// Show per-message memory extraction indicators
    #[serde(default)]
    pub show_memory_indicators: bool,
}

/// Usage counters for the current billing period
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSummary {
    /// Subscription tier (opaque)
    pub plan_tier: String,
    /// Messages consumed this period
    pub messages_used: u32,
    /// Message allowance for the period, absent for unlimited plans
    #[serde(default)]
    pub messages_limit: Option<u32>,
    /// When the current period resets
    pub period_end: DateTime<Utc>,
}

/// Result of a successful attachment upload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadInfo {
    /// Server URL of the stored blob
    pub url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_starts_streaming_and_empty() {
        let message = Message::assistant_placeholder();
        assert!(message.is_streaming);
        assert!(!message.is_error);
        assert!(message.content.is_empty());
        assert_eq!(message.role, MessageRole::Assistant);
    }

    #[test]
    fn test_role_wire_format() {
        assert_eq!(MessageRole::User.as_str(), "user");
        assert_eq!(
            serde_json::to_string(&MessageRole::Assistant).unwrap(),
            "\"assistant\""
        );
    }
}
