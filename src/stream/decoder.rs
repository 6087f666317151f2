// ABOUTME: Line-buffering decoder for the Memoria chat event protocol
// ABOUTME: Reassembles data lines split across chunks and yields typed events in order
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Memoria

//! # Event Protocol Decoder
//!
//! Turns the raw line-oriented byte stream into typed [`StreamEvent`]s. Two
//! correctness concerns are handled here once, for every transport:
//!
//! 1. **Multiple events per TCP chunk**: when network buffers batch several
//!    `data:` lines into one chunk, all of them are emitted.
//! 2. **Partial lines across TCP boundaries**: a JSON payload split across
//!    two chunks accumulates in the line buffer until the terminating `\n`
//!    arrives.
//!
//! Unlike generic SSE there are no blank-line event separators; each `data:`
//! line is self-contained. Unknown event types and malformed payloads are
//! skipped silently for forward compatibility; only transport failures end
//! the stream with an `Err` item.

use std::collections::VecDeque;
use std::mem;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::stream::unfold;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tracing::{debug, trace};

use super::{EventStream, StreamEvent};
use crate::errors::ApiError;
use crate::models::{ExtractedTopic, SearchSource};

/// Prefix marking lines that carry an event payload
const DATA_PREFIX: &str = "data:";

/// Sentinel payload that terminates the stream
const DONE_SENTINEL: &str = "[DONE]";

/// Fallback shown when an in-band error event carries no message
const ERROR_FALLBACK: &str = "Something went wrong while generating a response.";

/// Line-buffering parser that handles partial lines across chunk boundaries.
///
/// Feed raw bytes in, get complete decoded events out. A trailing partial
/// line stays buffered until the next `feed` or the final `flush`.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: String,
}

impl LineBuffer {
    /// Create a new empty line buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes from a chunk, returning events for every complete line
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        let text = String::from_utf8_lossy(bytes);
        self.buffer.push_str(&text);

        let mut events = Vec::new();
        while let Some(newline_pos) = self.buffer.find('\n') {
            let line = self.buffer[..newline_pos].trim_end_matches('\r').to_owned();
            self.buffer = self.buffer[newline_pos + 1..].to_owned();

            if let Some(event) = parse_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing unterminated line when the byte stream ends
    pub fn flush(&mut self) -> Option<StreamEvent> {
        let remaining = mem::take(&mut self.buffer);
        parse_line(&remaining)
    }
}

/// Parse one protocol line into an event.
///
/// Lines without the `data:` prefix, undecodable payloads, and unknown event
/// types all yield `None`, dropped rather than fatal.
#[must_use]
pub fn parse_line(line: &str) -> Option<StreamEvent> {
    let trimmed = line.trim();
    let payload = trimmed.strip_prefix(DATA_PREFIX)?.trim();

    if payload.is_empty() {
        return None;
    }
    if payload == DONE_SENTINEL {
        return Some(StreamEvent::Done);
    }

    let Ok(value) = serde_json::from_str::<Value>(payload) else {
        trace!("skipping undecodable event payload");
        return None;
    };
    let event_type = value.get("type")?.as_str()?;

    match event_type {
        "conversation_id" => {
            // Required field: skip the whole event if absent
            let id = value.get("id")?.as_str()?;
            Some(StreamEvent::ConversationId(id.to_owned()))
        }
        "conversation_title" => {
            let title = value.get("title")?.as_str()?;
            Some(StreamEvent::ConversationTitle(title.to_owned()))
        }
        "token" => Some(StreamEvent::Token(string_field(&value, "content"))),
        "searching" => Some(StreamEvent::Searching),
        "search_complete" => Some(StreamEvent::SearchComplete {
            query: string_field(&value, "query"),
            sources: parse_sources(value.get("sources")),
        }),
        "extracting" => Some(StreamEvent::Extracting),
        "topics_extracted" => Some(StreamEvent::TopicsExtracted(parse_topics(
            value.get("topics"),
        ))),
        "error" => {
            let message = value
                .get("content")
                .and_then(Value::as_str)
                .or_else(|| value.get("message").and_then(Value::as_str))
                .unwrap_or(ERROR_FALLBACK);
            Some(StreamEvent::Error(message.to_owned()))
        }
        "done" => Some(StreamEvent::Done),
        other => {
            trace!(event_type = other, "skipping unknown event type");
            None
        }
    }
}

/// Read a string field, treating absent or wrong-typed values as empty
fn string_field(value: &Value, field: &str) -> String {
    value
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned()
}

/// Parse search sources, dropping entries missing `title` or `url`
fn parse_sources(value: Option<&Value>) -> Vec<SearchSource> {
    let Some(entries) = value.and_then(Value::as_array) else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            let title = entry.get("title")?.as_str()?;
            let url = entry.get("url")?.as_str()?;
            Some(SearchSource {
                title: title.to_owned(),
                url: url.to_owned(),
            })
        })
        .collect()
}

/// Parse extracted topics, dropping malformed entries individually.
///
/// `path` is required; `name` defaults to the path, `is_new` to false,
/// `facts_added` to zero. Both snake_case and camelCase spellings of the
/// optional fields are accepted (older backends used camelCase).
fn parse_topics(value: Option<&Value>) -> Vec<ExtractedTopic> {
    let Some(entries) = value.and_then(Value::as_array) else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            let path = entry.get("path")?.as_str()?.to_owned();
            let name = entry
                .get("name")
                .and_then(Value::as_str)
                .map_or_else(|| path.clone(), ToOwned::to_owned);
            let is_new = bool_field(entry, "is_new", "isNew");
            let facts_added = entry
                .get("facts_added")
                .or_else(|| entry.get("factsAdded"))
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32;
            Some(ExtractedTopic {
                path,
                name,
                is_new,
                facts_added,
            })
        })
        .collect()
}

fn bool_field(value: &Value, snake: &str, camel: &str) -> bool {
    value
        .get(snake)
        .or_else(|| value.get(camel))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Wrap a raw byte stream into a decoded [`EventStream`].
///
/// The produced sequence ends when a [`StreamEvent::Done`] is emitted, when
/// the byte stream ends, or when a transport failure is yielded as an `Err`
/// item. Nothing is produced after any of those, even if more bytes follow.
pub fn decode_stream<S>(byte_stream: S) -> EventStream
where
    S: Stream<Item = Result<Bytes, ApiError>> + Send + 'static,
{
    let state = DecodeState {
        parser: LineBuffer::new(),
        pending: VecDeque::new(),
        ended: false,
    };

    // unfold keeps the parser state across async iterations: each step either
    // drains a pending event or reads the next chunk.
    let stream = unfold(
        (
            Box::pin(byte_stream) as Pin<Box<dyn Stream<Item = Result<Bytes, ApiError>> + Send>>,
            state,
        ),
        |(mut byte_stream, mut state)| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    if matches!(event, StreamEvent::Done) {
                        state.ended = true;
                        state.pending.clear();
                    }
                    return Some((Ok(event), (byte_stream, state)));
                }

                if state.ended {
                    return None;
                }

                match byte_stream.next().await {
                    Some(Ok(bytes)) => {
                        state.pending.extend(state.parser.feed(&bytes));
                    }
                    Some(Err(error)) => {
                        debug!(%error, "chat stream transport failure");
                        state.ended = true;
                        return Some((Err(error), (byte_stream, state)));
                    }
                    None => {
                        state.ended = true;
                        if let Some(event) = state.parser.flush() {
                            return Some((Ok(event), (byte_stream, state)));
                        }
                        return None;
                    }
                }
            }
        },
    );

    Box::pin(stream)
}

struct DecodeState {
    parser: LineBuffer,
    pending: VecDeque<StreamEvent>,
    ended: bool,
}
