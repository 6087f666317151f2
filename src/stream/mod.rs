// ABOUTME: Typed stream events for the Memoria chat wire protocol
// ABOUTME: Defines the StreamEvent union and the boxed EventStream alias
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Memoria

//! # Chat Stream Events
//!
//! The backend pushes incremental assistant output and extraction progress as
//! newline-delimited `data:` lines. [`decoder`] turns the raw byte stream into
//! an ordered, finite sequence of [`StreamEvent`]s; the session engine applies
//! them to the live message log.

pub mod decoder;

use std::pin::Pin;

use tokio_stream::Stream;

use crate::errors::ApiResult;
use crate::models::{ExtractedTopic, SearchSource};

/// One decoded event from the chat stream.
///
/// Transient: applied to a [`crate::models::Message`] or published to the
/// domain event bus, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Server assigned (or confirmed) the conversation id
    ConversationId(String),
    /// Server named the conversation
    ConversationTitle(String),
    /// Incremental assistant text
    Token(String),
    /// Web search started
    Searching,
    /// Web search finished with the query used and any sources found
    SearchComplete {
        /// Search query the backend ran
        query: String,
        /// Cited sources; entries missing a field were dropped individually
        sources: Vec<SearchSource>,
    },
    /// Background topic/fact extraction started
    Extracting,
    /// Extraction finished with a summary of the affected topics
    TopicsExtracted(Vec<ExtractedTopic>),
    /// In-band protocol error; the message carried is shown inline
    Error(String),
    /// Terminal event; the stream produces nothing after this
    Done,
}

/// Ordered, finite stream of decoded events.
///
/// `Err` items are transport-level failures (connection reset, timeout),
/// distinct from in-band [`StreamEvent::Error`] events, which mean the server
/// itself reported a problem.
pub type EventStream = Pin<Box<dyn Stream<Item = ApiResult<StreamEvent>> + Send>>;
