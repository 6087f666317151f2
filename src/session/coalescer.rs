// ABOUTME: Interval-gated token buffer bounding message-log update frequency
// ABOUTME: Preserves text order exactly; batching only, never reordering or dropping
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Memoria

//! Token coalescing for render efficiency.
//!
//! Streams can deliver hundreds of tokens per second; mutating the message
//! log for each one floods the UI with updates. The coalescer buffers token
//! text and releases it at most once per interval. The interval timer resets
//! on every flush. Callers must force a [`TokenCoalescer::flush`] before
//! applying any non-token event and when the stream ends, so indicator events
//! never appear ahead of text they should follow.

use std::mem;
use std::time::{Duration, Instant};

/// Buffers incoming token text, flushing at most once per interval
#[derive(Debug)]
pub struct TokenCoalescer {
    buffer: String,
    interval: Duration,
    last_flush: Instant,
}

impl TokenCoalescer {
    /// Create a coalescer. The first token flushes immediately so display
    /// latency starts at zero and only subsequent tokens are batched.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            buffer: String::new(),
            interval,
            last_flush: Instant::now().checked_sub(interval).unwrap_or_else(Instant::now),
        }
    }

    /// Append token text; returns buffered text when the interval has
    /// elapsed since the last flush, `None` while still batching.
    pub fn push(&mut self, text: &str) -> Option<String> {
        self.buffer.push_str(text);
        if self.last_flush.elapsed() >= self.interval {
            Some(self.take())
        } else {
            None
        }
    }

    /// Release any buffered text immediately, regardless of the interval
    pub fn flush(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.take())
        }
    }

    fn take(&mut self) -> String {
        self.last_flush = Instant::now();
        mem::take(&mut self.buffer)
    }
}
