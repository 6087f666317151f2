// ABOUTME: Authenticated HTTP client: requests with 401 refresh-retry, stream open, uploads
// ABOUTME: Defines the CredentialProvider and ChatBackend seams the engine is built against
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Memoria

//! # API Client
//!
//! Narrow transport surface the core depends on:
//!
//! - [`ApiClient::request`]: authenticated JSON request; transparently
//!   refreshes the credential and retries exactly once on a 401.
//! - [`ApiClient::open_stream`]: opens the chat event stream. No transparent
//!   retry: a stream failure surfaces to the caller.
//! - [`ApiClient::upload`]: multipart attachment upload.
//!
//! Credentials come from an opaque [`CredentialProvider`]; keychain mechanics
//! live behind that trait, outside this crate. The session engine consumes
//! the client through the [`ChatBackend`] trait so tests can script streams.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::TryStreamExt;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::config::ClientConfig;
use crate::errors::{ApiError, ApiResult};
use crate::models::{AttachmentKind, MemoryMode, PendingAttachment, UploadInfo, UploadedAttachment};
use crate::stream::{decoder, EventStream};

/// Opaque credential source (keychain-backed in the real app).
///
/// The client reads a bearer token per request and asks for a refresh after
/// an authorization failure; storage mechanics are implementation-defined.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Current access token, if signed in
    async fn access_token(&self) -> Option<String>;

    /// Exchange the refresh token for a new access token
    async fn refresh_access_token(&self) -> ApiResult<String>;

    /// Drop both tokens (sign-out or unrecoverable auth failure)
    async fn clear_credentials(&self);

    /// Whether credentials are present
    async fn is_authenticated(&self) -> bool;
}

/// One prior turn included in the stream request history
#[derive(Debug, Clone, Serialize)]
pub struct HistoryMessage {
    /// Author role on the wire (`user`/`assistant`/`system`)
    pub role: String,
    /// Message text
    pub content: String,
}

/// Body of a chat stream open request
#[derive(Debug, Clone, Serialize)]
pub struct ChatStreamRequest {
    /// The new user message
    pub message: String,
    /// Prior non-error, non-empty messages, oldest first
    pub history: Vec<HistoryMessage>,
    /// Established conversation id, absent for a fresh conversation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Uploaded attachment references
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<UploadedAttachment>,
    /// Optional topic path this turn is scoped to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic_focus: Option<String>,
    /// Active provider identifier (opaque)
    pub provider: String,
    /// Active model identifier (opaque)
    pub model: String,
    /// Memory behavior for this turn
    pub memory_mode: MemoryMode,
}

/// Seam between the session engine and the network.
///
/// [`ApiClient`] is the production implementation; tests provide scripted
/// streams and failing uploads through the same trait.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Open the event stream for one user turn
    async fn open_chat_stream(&self, request: &ChatStreamRequest) -> ApiResult<EventStream>;

    /// Upload one pending attachment, returning its server record
    async fn upload_attachment(&self, attachment: &PendingAttachment) -> ApiResult<UploadInfo>;
}

/// Authenticated HTTP client over the Memoria backend
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    config: ClientConfig,
    credentials: Arc<dyn CredentialProvider>,
}

impl ApiClient {
    /// Build a client from configuration and a credential source.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be constructed.
    pub fn new(config: ClientConfig, credentials: Arc<dyn CredentialProvider>) -> ApiResult<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ApiError::unknown(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            config,
            credentials,
        })
    }

    /// Drop the stored access and refresh tokens
    pub async fn clear_credentials(&self) {
        self.credentials.clear_credentials().await;
    }

    /// Whether a credential is currently stored
    pub async fn is_authenticated(&self) -> bool {
        self.credentials.is_authenticated().await
    }

    /// Streaming requests must not inherit the simple-request timeout: the
    /// stream stays open for the whole turn.
    fn stream_client() -> ApiResult<Client> {
        Client::builder()
            .connect_timeout(std::time::Duration::from_secs(15))
            .build()
            .map_err(|e| ApiError::unknown(format!("failed to build stream client: {e}")))
    }

    /// Authenticated JSON request.
    ///
    /// Attaches the bearer credential, sends, and maps non-2xx statuses into
    /// the error taxonomy. On a 401 the credential is refreshed and the
    /// request retried exactly once; a second 401 surfaces as
    /// [`ApiError::Unauthorized`].
    #[instrument(skip(self, body))]
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> ApiResult<T> {
        let text = self.request_text(method, path, body).await?;
        if text.trim().is_empty() {
            // Endpoints returning 204 decode into types with all-default
            // fields; anything stricter is a decode error, as it should be.
            return serde_json::from_str("null").map_err(ApiError::from);
        }
        serde_json::from_str(&text).map_err(ApiError::from)
    }

    /// Authenticated request where the response body is ignored
    pub async fn request_empty(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> ApiResult<()> {
        self.request_text(method, path, body).await.map(|_| ())
    }

    async fn request_text(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> ApiResult<String> {
        let token = self.credentials.access_token().await;
        let (status, text) = self.send_once(method.clone(), path, body, token.as_deref()).await?;

        if status == StatusCode::UNAUTHORIZED {
            debug!(path, "401 from backend, refreshing credential and retrying once");
            let refreshed = self.credentials.refresh_access_token().await?;
            let (status, text) = self.send_once(method, path, body, Some(&refreshed)).await?;
            if !status.is_success() {
                return Err(ApiError::from_status(status.as_u16(), &text));
            }
            return Ok(text);
        }

        if !status.is_success() {
            return Err(ApiError::from_status(status.as_u16(), &text));
        }
        Ok(text)
    }

    async fn send_once(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        token: Option<&str>,
    ) -> ApiResult<(StatusCode, String)> {
        let mut builder = self.http.request(method, self.config.url(path));
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;
        Ok((status, text))
    }

    /// Open the chat event stream for one turn.
    ///
    /// Same credential attachment as [`Self::request`], but no transparent
    /// retry on 401; a failed handshake surfaces to the caller, who owns
    /// the errored-message outcome.
    #[instrument(skip(self, body))]
    pub async fn open_stream(&self, path: &str, body: &Value) -> ApiResult<EventStream> {
        let mut builder = Self::stream_client()?.post(self.config.url(path)).json(body);
        if let Some(token) = self.credentials.access_token().await {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(path, status = status.as_u16(), "stream handshake rejected");
            return Err(ApiError::from_status(status.as_u16(), &text));
        }

        let bytes = response.bytes_stream().map_err(ApiError::from);
        Ok(decoder::decode_stream(bytes))
    }

    /// Upload raw bytes as a multipart form, returning the stored URL
    #[instrument(skip(self, data), fields(size = data.len()))]
    pub async fn upload(
        &self,
        path: &str,
        data: Bytes,
        name: &str,
        mime_type: &str,
    ) -> ApiResult<UploadInfo> {
        let part = reqwest::multipart::Part::stream(reqwest::Body::from(data))
            .file_name(name.to_owned())
            .mime_str(mime_type)
            .map_err(|e| ApiError::unknown(format!("invalid MIME type '{mime_type}': {e}")))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let mut builder = self.http.post(self.config.url(path)).multipart(form);
        if let Some(token) = self.credentials.access_token().await {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ApiError::from_status(status.as_u16(), &text));
        }
        serde_json::from_str(&text).map_err(ApiError::from)
    }
}

#[async_trait]
impl ChatBackend for ApiClient {
    async fn open_chat_stream(&self, request: &ChatStreamRequest) -> ApiResult<EventStream> {
        let body = serde_json::to_value(request)?;
        self.open_stream("chat/stream", &body).await
    }

    async fn upload_attachment(&self, attachment: &PendingAttachment) -> ApiResult<UploadInfo> {
        let path = match attachment.kind {
            AttachmentKind::Image => "uploads/images",
            AttachmentKind::File => "uploads/files",
        };
        self.upload(
            path,
            attachment.data.clone(),
            &attachment.file_name,
            &attachment.mime_type,
        )
        .await
    }
}
