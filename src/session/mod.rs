// ABOUTME: Chat session engine: owns the live message log and drives the turn lifecycle
// ABOUTME: Optimistic append, sequential uploads, stream consumption, cancellation, log surgery
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Memoria

//! # Chat Session Engine
//!
//! Owns the message log for the currently open conversation and drives each
//! user turn: optimistic append → upload attachments → open stream → apply
//! events → finalize. A single logical owner mutates all session state; the
//! stream is consumed one event at a time so the log never sees concurrent
//! mutation.
//!
//! Invariants:
//! - at most one message has `is_streaming = true` at any time;
//! - every turn is finalized exactly once, whether it ends in `done`, an
//!   in-band error, a transport failure, or cancellation;
//! - token coalescing batches text but never drops, reorders, or duplicates
//!   it, and any buffered text is flushed before a non-token event applies.

pub mod coalescer;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::api::{ChatBackend, ChatStreamRequest, HistoryMessage};
use crate::bus::{DomainEvent, EventBus};
use crate::models::{
    ChatSettings, Message, MessageRole, PendingAttachment, UploadedAttachment,
};
use crate::stream::StreamEvent;
use coalescer::TokenCoalescer;

/// Default flush interval for token coalescing (~one display frame)
const DEFAULT_COALESCE_INTERVAL: Duration = Duration::from_millis(16);

/// Request lifecycle phase of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// No turn in flight
    Idle,
    /// Uploading pending attachments, `current` of `total`
    UploadingAttachments {
        /// 1-based index of the attachment being uploaded
        current: usize,
        /// Total attachments in this turn
        total: usize,
    },
    /// Consuming the event stream
    Streaming,
    /// A stop was requested; the stream consumer winds the turn down and
    /// transitions to `Idle`. Reachable from `Streaming` only.
    Cancelling,
}

/// Mutable session state, guarded by one mutex with no await while held
struct SessionState {
    messages: Vec<Message>,
    conversation_id: Option<String>,
    conversation_title: Option<String>,
    input_text: String,
    pending_attachments: Vec<PendingAttachment>,
    topic_focus: Option<String>,
    phase: SessionPhase,
    searching: bool,
    extracting: bool,
    input_locked: bool,
    thinking_since: Option<DateTime<Utc>>,
    last_send_error: Option<String>,
    /// Generation counter: each accepted send bumps it, and every mutation
    /// from the consume loop is keyed to its generation
    turn: u64,
    /// Whether the current generation has already been finalized
    finalized: bool,
    /// Cooperative cancellation flag, checked before each upload and event
    cancel_requested: bool,
    /// Per-turn wakeup so a cancel interrupts a blocked stream read
    cancel_signal: Arc<Notify>,
    /// The creation event is published at most once per conversation id
    creation_announced: bool,
}

impl SessionState {
    fn new() -> Self {
        Self {
            messages: Vec::new(),
            conversation_id: None,
            conversation_title: None,
            input_text: String::new(),
            pending_attachments: Vec::new(),
            topic_focus: None,
            phase: SessionPhase::Idle,
            searching: false,
            extracting: false,
            input_locked: false,
            thinking_since: None,
            last_send_error: None,
            turn: 0,
            finalized: true,
            cancel_requested: false,
            cancel_signal: Arc::new(Notify::new()),
            creation_announced: false,
        }
    }

    /// Append `text` to the live streaming placeholder, if any
    fn append_to_placeholder(&mut self, text: &str) {
        if let Some(message) = self.messages.iter_mut().rev().find(|m| m.is_streaming) {
            message.content.push_str(text);
        }
    }

    fn placeholder_mut(&mut self) -> Option<&mut Message> {
        self.messages.iter_mut().rev().find(|m| m.is_streaming)
    }

    /// Single finalize path; guarded by the `finalized` flag so cancellation,
    /// completion, and failure cannot double-finalize.
    fn finalize(&mut self, error: Option<String>) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        self.searching = false;
        self.extracting = false;
        self.input_locked = false;
        self.thinking_since = None;
        self.phase = SessionPhase::Idle;

        if let Some(message) = self.placeholder_mut() {
            message.is_streaming = false;
            if let Some(description) = error {
                message.is_error = true;
                if message.content.is_empty() {
                    message.content = description;
                } else {
                    // Partial output stays visible; the failure is appended
                    // rather than replacing tokens the user already saw.
                    message.content.push_str("\n\n");
                    message.content.push_str(&description);
                }
            }
        }
    }
}

/// Per-turn values captured when a send is accepted
struct TurnContext {
    turn: u64,
    show_memory_indicators: bool,
}

/// Streaming chat session engine.
///
/// Constructed once per open conversation view by the composition root and
/// shared via `Arc`. UI layers observe it through [`ChatSessionEngine::changes`]
/// and the snapshot accessors; they never hold references into the log.
pub struct ChatSessionEngine {
    backend: Arc<dyn ChatBackend>,
    bus: EventBus,
    settings: Mutex<ChatSettings>,
    state: Mutex<SessionState>,
    revision: watch::Sender<u64>,
    coalesce_interval: Duration,
}

impl ChatSessionEngine {
    /// Create an engine over a backend, bus, and the settings snapshot taken
    /// at session start.
    #[must_use]
    pub fn new(backend: Arc<dyn ChatBackend>, bus: EventBus, settings: ChatSettings) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            backend,
            bus,
            settings: Mutex::new(settings),
            state: Mutex::new(SessionState::new()),
            revision,
            coalesce_interval: DEFAULT_COALESCE_INTERVAL,
        }
    }

    /// Override the token coalescing interval (tests use very small values)
    #[must_use]
    pub fn with_coalesce_interval(mut self, interval: Duration) -> Self {
        self.coalesce_interval = interval;
        self
    }

    // ====================================================================
    // Observation
    // ====================================================================

    /// Receiver that changes whenever session state mutates. The value is a
    /// revision counter; observers re-read the snapshot accessors on change.
    #[must_use]
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Snapshot of the message log
    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.lock_state().messages.clone()
    }

    /// Current lifecycle phase
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.lock_state().phase
    }

    /// Established conversation id, if any
    #[must_use]
    pub fn conversation_id(&self) -> Option<String> {
        self.lock_state().conversation_id.clone()
    }

    /// Conversation title, if the backend has named it
    #[must_use]
    pub fn conversation_title(&self) -> Option<String> {
        self.lock_state().conversation_title.clone()
    }

    /// Current composer text
    #[must_use]
    pub fn input_text(&self) -> String {
        self.lock_state().input_text.clone()
    }

    /// Attachments picked but not yet sent
    #[must_use]
    pub fn pending_attachments(&self) -> Vec<PendingAttachment> {
        self.lock_state().pending_attachments.clone()
    }

    /// Whether a web search is in progress
    #[must_use]
    pub fn is_searching(&self) -> bool {
        self.lock_state().searching
    }

    /// Whether background topic extraction is in progress
    #[must_use]
    pub fn is_extracting(&self) -> bool {
        self.lock_state().extracting
    }

    /// Whether the composer should reject a new turn. Extraction unlocks
    /// this early, before the stream fully completes.
    #[must_use]
    pub fn input_locked(&self) -> bool {
        self.lock_state().input_locked
    }

    /// When the current turn started waiting for its first token
    #[must_use]
    pub fn thinking_since(&self) -> Option<DateTime<Utc>> {
        self.lock_state().thinking_since
    }

    /// Upload progress `(current, total)` while uploading
    #[must_use]
    pub fn upload_progress(&self) -> Option<(usize, usize)> {
        match self.lock_state().phase {
            SessionPhase::UploadingAttachments { current, total } => Some((current, total)),
            _ => None,
        }
    }

    /// Human-readable description of the last send rejection (upload
    /// failures), cleared when the next send is accepted
    #[must_use]
    pub fn last_send_error(&self) -> Option<String> {
        self.lock_state().last_send_error.clone()
    }

    // ====================================================================
    // Input editing
    // ====================================================================

    /// Replace the composer text
    pub fn set_input(&self, text: impl Into<String>) {
        self.lock_state().input_text = text.into();
        self.notify();
    }

    /// Add a picked attachment to the pending list
    pub fn add_attachment(&self, attachment: PendingAttachment) {
        self.lock_state().pending_attachments.push(attachment);
        self.notify();
    }

    /// Remove a pending attachment by id; no-op if absent
    pub fn remove_attachment(&self, attachment_id: &str) {
        self.lock_state()
            .pending_attachments
            .retain(|a| a.id != attachment_id);
        self.notify();
    }

    /// Scope the next turn to one topic path, or clear the focus
    pub fn set_topic_focus(&self, path: Option<String>) {
        self.lock_state().topic_focus = path;
        self.notify();
    }

    /// Replace the settings snapshot used for subsequent turns
    pub fn update_settings(&self, settings: ChatSettings) {
        *self
            .settings
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = settings;
    }

    // ====================================================================
    // Turn lifecycle
    // ====================================================================

    /// Send the current composer content as one turn.
    ///
    /// Returns `false` when the send was rejected outright: empty input with
    /// no attachments, or a turn already in flight. Upload failures and
    /// stream errors are not rejections; they surface on the message log
    /// and [`Self::last_send_error`].
    pub async fn send(&self) -> bool {
        let (context, text, attachments, topic_focus, settings) = {
            let mut state = self.lock_state();
            if state.phase != SessionPhase::Idle {
                debug!("send rejected: turn already in flight");
                return false;
            }
            let text = state.input_text.trim().to_owned();
            if text.is_empty() && state.pending_attachments.is_empty() {
                debug!("send rejected: nothing to send");
                return false;
            }

            // Snapshot and clear the composer immediately so the UI cannot
            // double-submit while uploads run.
            let attachments = std::mem::take(&mut state.pending_attachments);
            let topic_focus = state.topic_focus.take();
            state.input_text.clear();
            state.last_send_error = None;
            state.turn += 1;
            state.finalized = false;
            state.cancel_requested = false;
            // Fresh signal per turn so a permit left by a previous cancel
            // cannot abort this one.
            state.cancel_signal = Arc::new(Notify::new());
            state.input_locked = true;
            if attachments.is_empty() {
                state.phase = SessionPhase::Streaming;
            } else {
                state.phase = SessionPhase::UploadingAttachments {
                    current: 0,
                    total: attachments.len(),
                };
            }

            let settings = self
                .settings
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone();
            let context = TurnContext {
                turn: state.turn,
                show_memory_indicators: settings.show_memory_indicators,
            };
            (context, text, attachments, topic_focus, settings)
        };
        self.notify();

        let uploaded = match self
            .upload_all(&context, &text, &attachments, topic_focus.clone())
            .await
        {
            Some(uploaded) => uploaded,
            None => return true, // aborted; upload_all settled the state
        };

        self.run_stream_turn(context, text, uploaded, topic_focus, settings)
            .await;
        true
    }

    /// Upload attachments sequentially, tracking progress. All-or-nothing:
    /// any failure aborts the turn and restores the composer, because a
    /// message with attachments silently missing is worse than a retry.
    async fn upload_all(
        &self,
        context: &TurnContext,
        text: &str,
        attachments: &[PendingAttachment],
        topic_focus: Option<String>,
    ) -> Option<Vec<UploadedAttachment>> {
        let total = attachments.len();
        let mut uploaded = Vec::with_capacity(total);
        let mut failures = 0usize;

        for (index, attachment) in attachments.iter().enumerate() {
            {
                let mut state = self.lock_state();
                if state.turn != context.turn || state.cancel_requested {
                    state.finalize(None);
                    return None;
                }
                state.phase = SessionPhase::UploadingAttachments {
                    current: index + 1,
                    total,
                };
            }
            self.notify();

            match self.backend.upload_attachment(attachment).await {
                Ok(info) => uploaded.push(UploadedAttachment {
                    kind: attachment.kind,
                    url: info.url,
                    file_name: attachment.file_name.clone(),
                    mime_type: attachment.mime_type.clone(),
                }),
                Err(error) => {
                    warn!(%error, file = %attachment.file_name, "attachment upload failed");
                    failures += 1;
                }
            }
        }

        if failures > 0 {
            let mut state = self.lock_state();
            if state.turn == context.turn {
                state.input_text = text.to_owned();
                state.pending_attachments = attachments.to_vec();
                state.topic_focus = topic_focus;
                state.last_send_error = Some(if failures == 1 {
                    "1 attachment failed to upload".to_owned()
                } else {
                    format!("{failures} attachments failed to upload")
                });
                state.finalize(None);
            }
            drop(state);
            self.notify();
            return None;
        }

        Some(uploaded)
    }

    /// Append the optimistic pair, open the stream, and consume it to
    /// completion, cancellation, or failure.
    async fn run_stream_turn(
        &self,
        context: TurnContext,
        text: String,
        attachments: Vec<UploadedAttachment>,
        topic_focus: Option<String>,
        settings: ChatSettings,
    ) {
        let (request, cancel) = {
            let mut state = self.lock_state();
            if state.turn != context.turn || state.cancel_requested {
                state.finalize(None);
                return;
            }
            let cancel = Arc::clone(&state.cancel_signal);

            // History excludes errored and empty messages, and the two
            // entries about to be appended.
            let history: Vec<HistoryMessage> = state
                .messages
                .iter()
                .filter(|m| !m.is_error && !m.content.trim().is_empty())
                .map(|m| HistoryMessage {
                    role: m.role.as_str().to_owned(),
                    content: m.content.clone(),
                })
                .collect();

            state.messages.push(Message::user(text.clone(), attachments.clone()));
            state.messages.push(Message::assistant_placeholder());
            state.thinking_since = Some(Utc::now());
            state.phase = SessionPhase::Streaming;

            let request = ChatStreamRequest {
                message: text,
                history,
                conversation_id: state.conversation_id.clone(),
                attachments,
                topic_focus,
                provider: settings.provider,
                model: settings.model,
                memory_mode: settings.memory_mode,
            };
            (request, cancel)
        };
        self.notify();

        let mut stream = match self.backend.open_chat_stream(&request).await {
            Ok(stream) => stream,
            Err(error) => {
                warn!(%error, "failed to open chat stream");
                self.finalize_turn(context.turn, Some(error.user_message()));
                return;
            }
        };

        let mut coalescer = TokenCoalescer::new(self.coalesce_interval);
        loop {
            // Racing the read against the cancel signal keeps every "next
            // event" suspension point cancellable, even when the transport
            // never yields again. Biased so a cancel beats a ready event.
            let item = tokio::select! {
                biased;
                () = cancel.notified() => {
                    // Buffered coalescer text is dropped on cancel.
                    self.finalize_turn(context.turn, None);
                    return;
                }
                item = stream.next() => item,
            };
            let Some(item) = item else {
                break;
            };
            if self.turn_finished(context.turn) {
                // Superseded while an event was in flight: stop consuming,
                // drop buffered text, mutate nothing.
                return;
            }
            match item {
                Ok(event) => {
                    if self.apply_event(&context, &mut coalescer, event) {
                        return;
                    }
                }
                Err(error) => {
                    self.flush_tokens(context.turn, &mut coalescer);
                    self.finalize_turn(context.turn, Some(error.user_message()));
                    return;
                }
            }
        }

        // Stream exhausted without a terminal event: treat as done.
        self.flush_tokens(context.turn, &mut coalescer);
        self.finalize_turn(context.turn, None);
    }

    /// Apply one decoded event to the session. Returns true when the event
    /// was terminal for this turn.
    fn apply_event(
        &self,
        context: &TurnContext,
        coalescer: &mut TokenCoalescer,
        event: StreamEvent,
    ) -> bool {
        let mut to_publish: Vec<DomainEvent> = Vec::new();
        let terminal = {
            let mut state = self.lock_state();
            if state.turn != context.turn || state.finalized {
                return true;
            }

            match event {
                StreamEvent::Token(text) => {
                    state.thinking_since = None;
                    if let Some(flushed) = coalescer.push(&text) {
                        state.append_to_placeholder(&flushed);
                    }
                    false
                }
                other => {
                    // A non-token event always flushes buffered text first so
                    // indicators never appear ahead of the text they follow.
                    if let Some(flushed) = coalescer.flush() {
                        state.append_to_placeholder(&flushed);
                    }
                    Self::apply_non_token_event(&mut state, context, other, &mut to_publish)
                }
            }
        };

        for event in &to_publish {
            self.bus.publish(event);
        }
        self.notify();
        terminal
    }

    fn apply_non_token_event(
        state: &mut SessionState,
        context: &TurnContext,
        event: StreamEvent,
        to_publish: &mut Vec<DomainEvent>,
    ) -> bool {
        match event {
            StreamEvent::ConversationId(id) => {
                // First-write-wins: a reconnect must not clobber an
                // established id.
                if state.conversation_id.is_none() {
                    state.conversation_id = Some(id.clone());
                    if !state.creation_announced {
                        state.creation_announced = true;
                        to_publish.push(DomainEvent::ConversationCreated {
                            id,
                            title: state.conversation_title.clone(),
                        });
                    }
                }
                false
            }
            StreamEvent::ConversationTitle(title) => {
                state.conversation_title = Some(title.clone());
                // Re-publish with the title so list views pick up a
                // late-arriving name without a second id event.
                if let Some(id) = state.conversation_id.clone() {
                    to_publish.push(DomainEvent::ConversationCreated {
                        id,
                        title: Some(title),
                    });
                }
                false
            }
            StreamEvent::Searching => {
                state.searching = true;
                false
            }
            StreamEvent::SearchComplete { query, sources } => {
                debug!(query, sources = sources.len(), "search complete");
                state.searching = false;
                if !sources.is_empty() {
                    if let Some(message) = state.placeholder_mut() {
                        message.sources = Some(sources);
                    }
                }
                false
            }
            StreamEvent::Extracting => {
                state.extracting = true;
                // Deliberate UX decision: extraction runs in the background,
                // so the user may start composing the next turn now.
                state.input_locked = false;
                false
            }
            StreamEvent::TopicsExtracted(topics) => {
                state.extracting = false;
                if context.show_memory_indicators {
                    if let Some(message) = state.placeholder_mut() {
                        message.topics = Some(topics);
                    }
                }
                // The cache must invalidate even when the indicator is
                // suppressed by user preference.
                to_publish.push(DomainEvent::TopicsUpdated);
                false
            }
            StreamEvent::Error(message) => {
                info!("stream reported in-band error");
                state.finalize(Some(message));
                true
            }
            StreamEvent::Done => {
                state.finalize(None);
                true
            }
            StreamEvent::Token(_) => false, // handled by the caller
        }
    }

    /// Request cancellation of the in-flight stream.
    ///
    /// Only a `Streaming` turn can be stopped; during attachment uploads the
    /// call is a no-op, because aborting there would have to throw away the
    /// composed turn the all-or-nothing upload policy protects. The phase
    /// moves to `Cancelling` and the stream consumer finalizes the turn at
    /// its next suspension point. Idempotent: a second call sees a phase
    /// other than `Streaming` and returns.
    pub fn stop_streaming(&self) {
        {
            let mut state = self.lock_state();
            if state.phase != SessionPhase::Streaming {
                return;
            }
            state.phase = SessionPhase::Cancelling;
            state.cancel_requested = true;
            state.cancel_signal.notify_one();
        }
        info!("streaming stopped by user");
        self.notify();
    }

    /// Cancel any in-flight stream and clear the session: message log,
    /// conversation identity and title, composer, pending attachments.
    pub fn new_chat(&self) {
        {
            let mut state = self.lock_state();
            state.cancel_requested = true;
            state.cancel_signal.notify_one();
            state.finalize(None);
            state.messages.clear();
            state.conversation_id = None;
            state.conversation_title = None;
            state.creation_announced = false;
            state.input_text.clear();
            state.pending_attachments.clear();
            state.topic_focus = None;
            state.last_send_error = None;
        }
        self.notify();
    }

    /// Switch to a previously fetched conversation, cancelling any in-flight
    /// stream first.
    pub fn load_conversation(&self, id: String, title: Option<String>, messages: Vec<Message>) {
        {
            let mut state = self.lock_state();
            state.cancel_requested = true;
            state.cancel_signal.notify_one();
            state.finalize(None);
            state.messages = messages;
            state.conversation_id = Some(id);
            state.conversation_title = title;
            // An installed conversation already exists server-side.
            state.creation_announced = true;
            state.input_text.clear();
            state.pending_attachments.clear();
            state.topic_focus = None;
            state.last_send_error = None;
        }
        self.notify();
    }

    /// Remove the last assistant message and the user message that preceded
    /// it, restore that text to the composer, and re-send.
    pub async fn regenerate_last(&self) {
        if !self.pop_last_exchange(None) {
            return;
        }
        self.send().await;
    }

    /// Remove the specified errored message and the user message that
    /// preceded it, restore that text to the composer, and re-send.
    pub async fn retry_error(&self, message_id: &str) {
        if !self.pop_last_exchange(Some(message_id)) {
            return;
        }
        self.send().await;
    }

    /// Remove the last user message and everything after it, restoring its
    /// text to the composer without resending.
    pub fn edit_last_user_message(&self) {
        {
            let mut state = self.lock_state();
            if state.phase != SessionPhase::Idle {
                return;
            }
            let Some(index) = state
                .messages
                .iter()
                .rposition(|m| m.role == MessageRole::User)
            else {
                return;
            };
            let text = state.messages[index].content.clone();
            state.messages.truncate(index);
            state.input_text = text;
        }
        self.notify();
    }

    /// Remove an assistant message (the last one, or a specific errored one)
    /// plus its preceding user message, restoring the user text. Returns
    /// false when there is nothing to remove or a turn is in flight.
    fn pop_last_exchange(&self, errored_id: Option<&str>) -> bool {
        let removed = {
            let mut state = self.lock_state();
            if state.phase != SessionPhase::Idle {
                return false;
            }

            let assistant_index = match errored_id {
                Some(id) => state.messages.iter().rposition(|m| m.id == id && m.is_error),
                None => state
                    .messages
                    .iter()
                    .rposition(|m| m.role == MessageRole::Assistant),
            };
            let Some(assistant_index) = assistant_index else {
                return false;
            };

            let user_index = state.messages[..assistant_index]
                .iter()
                .rposition(|m| m.role == MessageRole::User);

            state.messages.remove(assistant_index);
            if let Some(user_index) = user_index {
                let user_message = state.messages.remove(user_index);
                state.input_text = user_message.content;
            }
            true
        };
        if removed {
            self.notify();
        }
        removed
    }

    // ====================================================================
    // Internals
    // ====================================================================

    fn turn_finished(&self, turn: u64) -> bool {
        let state = self.lock_state();
        state.turn != turn || state.finalized
    }

    fn flush_tokens(&self, turn: u64, coalescer: &mut TokenCoalescer) {
        if let Some(flushed) = coalescer.flush() {
            let mut state = self.lock_state();
            if state.turn == turn && !state.finalized {
                state.append_to_placeholder(&flushed);
            }
        }
    }

    fn finalize_turn(&self, turn: u64, error: Option<String>) {
        {
            let mut state = self.lock_state();
            if state.turn != turn {
                return;
            }
            state.finalize(error);
        }
        self.notify();
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn notify(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }
}
