// ABOUTME: Tests for the chat session engine over a scripted mock backend
// ABOUTME: Covers turn lifecycle, ordering, upload failure restore, cancellation, retry
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Memoria

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use memoria_client::api::{ChatBackend, ChatStreamRequest};
use memoria_client::bus::{DomainEvent, EventBus};
use memoria_client::errors::{ApiError, ApiResult};
use memoria_client::models::{
    AttachmentKind, ChatSettings, MemoryMode, Message, MessageRole, PendingAttachment, UploadInfo,
};
use memoria_client::session::{ChatSessionEngine, SessionPhase};
use memoria_client::stream::{EventStream, StreamEvent};

/// One scripted turn: the items the opened stream will yield, optionally
/// followed by a never-resolving tail (for cancellation tests).
struct TurnScript {
    items: Vec<ApiResult<StreamEvent>>,
    hang_after: bool,
}

impl TurnScript {
    fn events(events: Vec<StreamEvent>) -> Self {
        Self {
            items: events.into_iter().map(Ok).collect(),
            hang_after: false,
        }
    }

    fn hanging(events: Vec<StreamEvent>) -> Self {
        Self {
            items: events.into_iter().map(Ok).collect(),
            hang_after: true,
        }
    }
}

#[derive(Default)]
struct MockBackend {
    turns: Mutex<VecDeque<TurnScript>>,
    upload_failures: Mutex<VecDeque<bool>>,
    requests: Mutex<Vec<ChatStreamRequest>>,
    uploads: Mutex<Vec<String>>,
}

impl MockBackend {
    fn scripted(turns: Vec<TurnScript>) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into()),
            ..Self::default()
        })
    }

    /// Script upload outcomes: `true` fails the corresponding upload
    fn with_upload_failures(self: Arc<Self>, failures: Vec<bool>) -> Arc<Self> {
        *self.upload_failures.lock().unwrap() = failures.into();
        self
    }

    fn recorded_requests(&self) -> Vec<ChatStreamRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatBackend for MockBackend {
    async fn open_chat_stream(&self, request: &ChatStreamRequest) -> ApiResult<EventStream> {
        self.requests.lock().unwrap().push(request.clone());
        let script = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| TurnScript::events(vec![StreamEvent::Done]));
        let head = stream::iter(script.items);
        if script.hang_after {
            Ok(Box::pin(head.chain(stream::pending())))
        } else {
            Ok(Box::pin(head))
        }
    }

    async fn upload_attachment(&self, attachment: &PendingAttachment) -> ApiResult<UploadInfo> {
        self.uploads.lock().unwrap().push(attachment.file_name.clone());
        let fail = self
            .upload_failures
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(false);
        if fail {
            Err(ApiError::network("upload refused"))
        } else {
            Ok(UploadInfo {
                url: format!("https://cdn.test/{}", attachment.file_name),
            })
        }
    }
}

fn settings(show_indicators: bool) -> ChatSettings {
    ChatSettings {
        provider: "anthropic".to_owned(),
        model: "claude-sonnet".to_owned(),
        memory_mode: MemoryMode::Auto,
        plan_tier: "pro".to_owned(),
        voice_enabled: false,
        image_uploads_enabled: true,
        show_memory_indicators: show_indicators,
    }
}

fn engine_with(backend: Arc<MockBackend>) -> ChatSessionEngine {
    ChatSessionEngine::new(backend, EventBus::new(), settings(true))
        .with_coalesce_interval(Duration::ZERO)
}

fn image(name: &str) -> PendingAttachment {
    PendingAttachment::new(
        AttachmentKind::Image,
        Bytes::from_static(b"\x89PNG"),
        name.to_owned(),
        "image/png".to_owned(),
    )
}

#[tokio::test]
async fn test_send_appends_user_and_assistant_in_order() {
    let backend = MockBackend::scripted(vec![TurnScript::events(vec![
        StreamEvent::Token("Hello".to_owned()),
        StreamEvent::Token(" there".to_owned()),
        StreamEvent::Done,
    ])]);
    let engine = engine_with(backend);

    engine.set_input("hi");
    assert!(engine.send().await);

    let messages = engine.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[0].content, "hi");
    assert_eq!(messages[1].role, MessageRole::Assistant);
    assert_eq!(messages[1].content, "Hello there");
    assert!(!messages[1].is_streaming);
    assert_eq!(engine.phase(), SessionPhase::Idle);
    assert!(engine.input_text().is_empty());
}

#[tokio::test]
async fn test_empty_input_is_rejected() {
    let engine = engine_with(MockBackend::scripted(vec![]));
    engine.set_input("   ");
    assert!(!engine.send().await);
    assert!(engine.messages().is_empty());
}

#[tokio::test]
async fn test_at_most_one_streaming_message() {
    let backend = MockBackend::scripted(vec![
        TurnScript::events(vec![StreamEvent::Token("one".to_owned()), StreamEvent::Done]),
        TurnScript::events(vec![StreamEvent::Token("two".to_owned()), StreamEvent::Done]),
    ]);
    let engine = engine_with(backend);

    engine.set_input("first");
    engine.send().await;
    engine.set_input("second");
    engine.send().await;

    let streaming = engine
        .messages()
        .iter()
        .filter(|m| m.is_streaming)
        .count();
    assert_eq!(streaming, 0);
    assert_eq!(engine.messages().len(), 4);
}

#[tokio::test]
async fn test_in_band_error_marks_message_and_keeps_partial_output() {
    let backend = MockBackend::scripted(vec![TurnScript::events(vec![
        StreamEvent::Token("partial answer".to_owned()),
        StreamEvent::Error("model overloaded".to_owned()),
    ])]);
    let engine = engine_with(backend);

    engine.set_input("question");
    engine.send().await;

    let messages = engine.messages();
    let reply = &messages[1];
    assert!(reply.is_error);
    assert!(reply.content.starts_with("partial answer"));
    assert!(reply.content.contains("model overloaded"));
    assert_eq!(engine.phase(), SessionPhase::Idle);
}

#[tokio::test]
async fn test_open_stream_failure_becomes_errored_message() {
    let backend: Arc<FailingOpenBackend> = Arc::new(FailingOpenBackend);
    let engine = ChatSessionEngine::new(backend, EventBus::new(), settings(true))
        .with_coalesce_interval(Duration::ZERO);

    engine.set_input("hi");
    assert!(engine.send().await);

    let messages = engine.messages();
    assert_eq!(messages.len(), 2);
    assert!(messages[1].is_error);
    assert!(!messages[1].content.is_empty());
}

struct FailingOpenBackend;

#[async_trait]
impl ChatBackend for FailingOpenBackend {
    async fn open_chat_stream(&self, _request: &ChatStreamRequest) -> ApiResult<EventStream> {
        Err(ApiError::server("boom"))
    }

    async fn upload_attachment(&self, _attachment: &PendingAttachment) -> ApiResult<UploadInfo> {
        Err(ApiError::server("no uploads here"))
    }
}

#[tokio::test]
async fn test_upload_failure_restores_input_and_attachments() {
    let backend = MockBackend::scripted(vec![]).with_upload_failures(vec![false, true]);
    let engine = engine_with(backend.clone());

    engine.set_input("see my photos");
    engine.add_attachment(image("a.png"));
    engine.add_attachment(image("b.png"));

    assert!(engine.send().await);

    // No stream was opened, nothing was appended, everything is restored.
    assert!(backend.recorded_requests().is_empty());
    assert!(engine.messages().is_empty());
    assert_eq!(engine.input_text(), "see my photos");
    assert_eq!(engine.pending_attachments().len(), 2);
    assert_eq!(engine.phase(), SessionPhase::Idle);
    assert_eq!(
        engine.last_send_error(),
        Some("1 attachment failed to upload".to_owned())
    );
}

struct SlowUploadBackend;

#[async_trait]
impl ChatBackend for SlowUploadBackend {
    async fn open_chat_stream(&self, _request: &ChatStreamRequest) -> ApiResult<EventStream> {
        Ok(Box::pin(stream::iter(vec![
            Ok(StreamEvent::Token("reply".to_owned())),
            Ok(StreamEvent::Done),
        ])))
    }

    async fn upload_attachment(&self, attachment: &PendingAttachment) -> ApiResult<UploadInfo> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(UploadInfo {
            url: format!("https://cdn.test/{}", attachment.file_name),
        })
    }
}

#[tokio::test]
async fn test_stop_during_upload_is_a_no_op_and_keeps_the_composed_turn() {
    let backend: Arc<SlowUploadBackend> = Arc::new(SlowUploadBackend);
    let engine = Arc::new(
        ChatSessionEngine::new(backend, EventBus::new(), settings(true))
            .with_coalesce_interval(Duration::ZERO),
    );

    engine.set_input("my carefully typed message");
    engine.add_attachment(image("a.png"));

    let sender = Arc::clone(&engine);
    let turn = tokio::spawn(async move { sender.send().await });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while engine.upload_progress().is_none() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "upload phase never observed"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Stop is only valid while streaming; during uploads it must not
    // destroy the composed turn.
    engine.stop_streaming();
    assert!(matches!(
        engine.phase(),
        SessionPhase::UploadingAttachments { .. }
    ));

    assert!(turn.await.unwrap());
    let messages = engine.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].content, "my carefully typed message");
    assert_eq!(messages[0].attachments.len(), 1);
    assert_eq!(messages[1].content, "reply");
    assert_eq!(engine.phase(), SessionPhase::Idle);
}

#[tokio::test]
async fn test_successful_uploads_are_attached_to_the_user_message() {
    let backend = MockBackend::scripted(vec![TurnScript::events(vec![StreamEvent::Done])]);
    let engine = engine_with(backend.clone());

    engine.set_input("photo");
    engine.add_attachment(image("cat.png"));
    engine.send().await;

    let messages = engine.messages();
    assert_eq!(messages[0].attachments.len(), 1);
    assert_eq!(messages[0].attachments[0].url, "https://cdn.test/cat.png");
    assert_eq!(*backend.uploads.lock().unwrap(), vec!["cat.png".to_owned()]);
}

#[tokio::test]
async fn test_conversation_id_is_first_write_wins_and_published_once() {
    let bus = EventBus::new();
    let created = Arc::new(Mutex::new(Vec::new()));
    let created_clone = Arc::clone(&created);
    bus.subscribe(move |event| {
        if let DomainEvent::ConversationCreated { id, .. } = event {
            created_clone.lock().unwrap().push(id.clone());
        }
    });

    let backend = MockBackend::scripted(vec![TurnScript::events(vec![
        StreamEvent::ConversationId("c-1".to_owned()),
        StreamEvent::ConversationId("c-2".to_owned()),
        StreamEvent::Done,
    ])]);
    let engine = ChatSessionEngine::new(backend, bus, settings(true))
        .with_coalesce_interval(Duration::ZERO);

    engine.set_input("hello");
    engine.send().await;

    assert_eq!(engine.conversation_id(), Some("c-1".to_owned()));
    assert_eq!(*created.lock().unwrap(), vec!["c-1".to_owned()]);
}

#[tokio::test]
async fn test_second_turn_carries_conversation_id_and_history() {
    let backend = MockBackend::scripted(vec![
        TurnScript::events(vec![
            StreamEvent::ConversationId("c-7".to_owned()),
            StreamEvent::Token("first reply".to_owned()),
            StreamEvent::Done,
        ]),
        TurnScript::events(vec![StreamEvent::Done]),
    ]);
    let engine = engine_with(backend.clone());

    engine.set_input("first");
    engine.send().await;
    engine.set_input("second");
    engine.send().await;

    let requests = backend.recorded_requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].conversation_id, None);
    assert_eq!(requests[1].conversation_id, Some("c-7".to_owned()));
    let history: Vec<&str> = requests[1].history.iter().map(|h| h.content.as_str()).collect();
    assert_eq!(history, vec!["first", "first reply"]);
}

#[tokio::test]
async fn test_topics_extracted_publishes_even_when_indicators_hidden() {
    let bus = EventBus::new();
    let published = Arc::new(Mutex::new(0usize));
    let published_clone = Arc::clone(&published);
    bus.subscribe(move |event| {
        if matches!(event, DomainEvent::TopicsUpdated) {
            *published_clone.lock().unwrap() += 1;
        }
    });

    let topics = vec![memoria_client::models::ExtractedTopic {
        path: "food/coffee".to_owned(),
        name: "Coffee".to_owned(),
        is_new: true,
        facts_added: 2,
    }];
    let backend = MockBackend::scripted(vec![TurnScript::events(vec![
        StreamEvent::Token("noted".to_owned()),
        StreamEvent::Extracting,
        StreamEvent::TopicsExtracted(topics),
        StreamEvent::Done,
    ])]);
    // Indicators disabled by user preference.
    let engine = ChatSessionEngine::new(backend, bus, settings(false))
        .with_coalesce_interval(Duration::ZERO);

    engine.set_input("i love coffee");
    engine.send().await;

    // The invalidation event fires regardless of the display preference...
    assert_eq!(*published.lock().unwrap(), 1);
    // ...but the message carries no indicator payload.
    assert!(engine.messages()[1].topics.is_none());
}

#[tokio::test]
async fn test_search_sources_attach_to_the_reply() {
    let sources = vec![memoria_client::models::SearchSource {
        title: "Example".to_owned(),
        url: "https://example.com".to_owned(),
    }];
    let backend = MockBackend::scripted(vec![TurnScript::events(vec![
        StreamEvent::Searching,
        StreamEvent::SearchComplete {
            query: "example".to_owned(),
            sources,
        },
        StreamEvent::Token("found it".to_owned()),
        StreamEvent::Done,
    ])]);
    let engine = engine_with(backend);

    engine.set_input("search something");
    engine.send().await;

    assert!(!engine.is_searching());
    let reply = &engine.messages()[1];
    assert_eq!(reply.sources.as_ref().map(Vec::len), Some(1));
}

#[tokio::test]
async fn test_stop_streaming_finalizes_and_keeps_partial_text() {
    let backend = MockBackend::scripted(vec![TurnScript::hanging(vec![StreamEvent::Token(
        "partial".to_owned(),
    )])]);
    let engine = Arc::new(engine_with(backend));

    engine.set_input("long question");
    let sender = Arc::clone(&engine);
    let turn = tokio::spawn(async move {
        sender.send().await;
    });

    // Wait for the token to land before cancelling.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let ready = engine
            .messages()
            .iter()
            .any(|m: &Message| m.content == "partial");
        if ready {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "token never arrived");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    engine.stop_streaming();

    // Tests run on a current-thread runtime, so the consumer task has not
    // run since the stop request: the wind-down phase is observable here.
    assert_eq!(engine.phase(), SessionPhase::Cancelling);

    // The consumer interrupts its blocked read and finalizes, which also
    // lets the send call return even though the transport never ends.
    turn.await.unwrap();

    assert_eq!(engine.phase(), SessionPhase::Idle);
    let messages = engine.messages();
    assert_eq!(messages[1].content, "partial");
    assert!(!messages[1].is_streaming);
    assert!(!messages[1].is_error);

    // Calling stop again is a no-op.
    engine.stop_streaming();
    assert_eq!(engine.phase(), SessionPhase::Idle);
}

#[tokio::test]
async fn test_new_chat_clears_session() {
    let backend = MockBackend::scripted(vec![TurnScript::events(vec![
        StreamEvent::ConversationId("c-1".to_owned()),
        StreamEvent::Token("hi".to_owned()),
        StreamEvent::Done,
    ])]);
    let engine = engine_with(backend);

    engine.set_input("hello");
    engine.send().await;
    engine.new_chat();

    assert!(engine.messages().is_empty());
    assert_eq!(engine.conversation_id(), None);
    assert!(engine.input_text().is_empty());
}

#[tokio::test]
async fn test_load_conversation_installs_history() {
    let engine = engine_with(MockBackend::scripted(vec![]));

    let history = vec![
        Message::user("old question", Vec::new()),
        Message::user("another", Vec::new()),
    ];
    engine.load_conversation("c-5".to_owned(), Some("Old chat".to_owned()), history);

    assert_eq!(engine.conversation_id(), Some("c-5".to_owned()));
    assert_eq!(engine.conversation_title(), Some("Old chat".to_owned()));
    assert_eq!(engine.messages().len(), 2);
}

#[tokio::test]
async fn test_regenerate_resends_the_last_user_message() {
    let backend = MockBackend::scripted(vec![
        TurnScript::events(vec![StreamEvent::Token("v1".to_owned()), StreamEvent::Done]),
        TurnScript::events(vec![StreamEvent::Token("v2".to_owned()), StreamEvent::Done]),
    ]);
    let engine = engine_with(backend.clone());

    engine.set_input("question");
    engine.send().await;
    engine.regenerate_last().await;

    let messages = engine.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].content, "question");
    assert_eq!(messages[1].content, "v2");
    assert_eq!(backend.recorded_requests().len(), 2);
}

#[tokio::test]
async fn test_retry_error_replaces_the_errored_exchange() {
    let backend = MockBackend::scripted(vec![
        TurnScript::events(vec![StreamEvent::Error("flaky".to_owned())]),
        TurnScript::events(vec![StreamEvent::Token("worked".to_owned()), StreamEvent::Done]),
    ]);
    let engine = engine_with(backend);

    engine.set_input("try this");
    engine.send().await;

    let errored_id = engine.messages()[1].id.clone();
    assert!(engine.messages()[1].is_error);

    engine.retry_error(&errored_id).await;

    let messages = engine.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, "worked");
    assert!(!messages[1].is_error);
}

#[tokio::test]
async fn test_edit_last_user_message_restores_text_without_resending() {
    let backend = MockBackend::scripted(vec![TurnScript::events(vec![
        StreamEvent::Token("reply".to_owned()),
        StreamEvent::Done,
    ])]);
    let engine = engine_with(backend.clone());

    engine.set_input("typo mesage");
    engine.send().await;
    engine.edit_last_user_message();

    assert!(engine.messages().is_empty());
    assert_eq!(engine.input_text(), "typo mesage");
    assert_eq!(backend.recorded_requests().len(), 1);
}

#[tokio::test]
async fn test_extracting_unlocks_input_before_done() {
    let backend = MockBackend::scripted(vec![TurnScript::hanging(vec![
        StreamEvent::Token("answer".to_owned()),
        StreamEvent::Extracting,
    ])]);
    let engine = Arc::new(engine_with(backend));

    engine.set_input("remember this");
    let sender = Arc::clone(&engine);
    let turn = tokio::spawn(async move {
        sender.send().await;
    });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if engine.is_extracting() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "extracting never observed"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // The stream is still open, yet the composer is already unlocked.
    assert!(!engine.input_locked());
    assert_eq!(engine.phase(), SessionPhase::Streaming);
    turn.abort();
}

#[tokio::test]
async fn test_revision_watch_signals_changes() {
    let engine = engine_with(MockBackend::scripted(vec![]));
    let mut changes = engine.changes();
    let before = *changes.borrow_and_update();

    engine.set_input("typed");

    changes.changed().await.unwrap();
    assert!(*changes.borrow() > before);
}
