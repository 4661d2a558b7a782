//! Client side of the messaging REST API.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, Url};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use workit_types::api::{
    CreateConversationRequest, ErrorEnvelope, MarkReadRequest, UnreadCountResponse, fields,
};
use workit_types::models::{Conversation, Message};

use crate::config::StoreConfig;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("invalid API URL {0}")]
    InvalidUrl(String),
}

/// Attachment supplied by the user when sending.
#[derive(Debug, Clone)]
pub enum OutgoingAttachment {
    File {
        name: String,
        content_type: String,
        data: Bytes,
    },
    Link {
        url: String,
        name: Option<String>,
    },
}

/// Payload of a message submission.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub content: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub attachments: Vec<OutgoingAttachment>,
}

/// Server-side copy of conversations and messages. Every call may fail or
/// stall; callers must not rely on it for local state.
#[async_trait]
pub trait RemoteService: Send + Sync {
    async fn fetch_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, RemoteError>;

    /// Oldest first.
    async fn fetch_messages(&self, conversation_id: &str) -> Result<Vec<Message>, RemoteError>;

    /// Deduplicated server-side by exact participant set.
    async fn create_conversation(
        &self,
        participants: &[String],
        title: Option<&str>,
    ) -> Result<Conversation, RemoteError>;

    async fn post_message(
        &self,
        conversation_id: &str,
        message: &NewMessage,
    ) -> Result<Message, RemoteError>;

    async fn mark_read(&self, conversation_id: &str, user_id: &str) -> Result<(), RemoteError>;

    async fn unread_count(&self, user_id: &str) -> Result<u64, RemoteError>;
}

/// [`RemoteService`] over HTTP.
pub struct HttpRemote {
    http: Client,
    base_url: Url,
}

impl HttpRemote {
    pub fn new(config: &StoreConfig) -> Result<Self, RemoteError> {
        let base_url = Url::parse(&config.api_url)
            .map_err(|e| RemoteError::InvalidUrl(format!("{}: {}", config.api_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(RemoteError::InvalidUrl(config.api_url.clone()));
        }
        let http = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self { http, base_url })
    }

    /// Appends `segments` to the base URL, percent-encoding each one so ids
    /// containing `/`, `?` or `#` stay a single path segment.
    fn url(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| RemoteError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, RemoteError> {
        let resp = Self::check(resp).await?;
        Ok(resp.json::<T>().await?)
    }

    /// Turns non-2xx responses into [`RemoteError::Status`], keeping the
    /// server's `message` when it sent one.
    async fn check(resp: Response) -> Result<Response, RemoteError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = match resp.json::<ErrorEnvelope>().await {
            Ok(envelope) => envelope.message,
            Err(_) => status.canonical_reason().unwrap_or("unknown error").to_string(),
        };
        Err(RemoteError::Status {
            status: status.as_u16(),
            message,
        })
    }
}

fn multipart_form(message: &NewMessage) -> Result<Form, RemoteError> {
    let mut form = Form::new()
        .text(fields::CONTENT, message.content.clone())
        .text(fields::SENDER_ID, message.sender_id.clone())
        .text(fields::RECEIVER_ID, message.receiver_id.clone());

    for att in &message.attachments {
        form = match att {
            OutgoingAttachment::File {
                name,
                content_type,
                data,
            } => {
                let part = Part::bytes(data.to_vec())
                    .file_name(name.clone())
                    .mime_str(content_type)?;
                form.part(fields::ATTACHMENTS, part)
            }
            OutgoingAttachment::Link { url, .. } => form.text(fields::LINK, url.clone()),
        };
    }
    Ok(form)
}

#[async_trait]
impl RemoteService for HttpRemote {
    async fn fetch_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, RemoteError> {
        let resp = self
            .http
            .get(self.url(&["conversations", user_id])?)
            .send()
            .await?;
        Self::decode(resp).await
    }

    async fn fetch_messages(&self, conversation_id: &str) -> Result<Vec<Message>, RemoteError> {
        let resp = self
            .http
            .get(self.url(&["conversations", conversation_id, "messages"])?)
            .send()
            .await?;
        Self::decode(resp).await
    }

    async fn create_conversation(
        &self,
        participants: &[String],
        title: Option<&str>,
    ) -> Result<Conversation, RemoteError> {
        let body = CreateConversationRequest {
            participants: participants.to_vec(),
            title: title.map(str::to_string),
        };
        let resp = self
            .http
            .post(self.url(&["conversations"])?)
            .json(&body)
            .send()
            .await?;
        Self::decode(resp).await
    }

    async fn post_message(
        &self,
        conversation_id: &str,
        message: &NewMessage,
    ) -> Result<Message, RemoteError> {
        let form = multipart_form(message)?;
        debug!(
            "Posting message to {} ({} attachments)",
            conversation_id,
            message.attachments.len()
        );
        let resp = self
            .http
            .post(self.url(&["conversations", conversation_id, "messages"])?)
            .multipart(form)
            .send()
            .await?;
        Self::decode(resp).await
    }

    async fn mark_read(&self, conversation_id: &str, user_id: &str) -> Result<(), RemoteError> {
        let body = MarkReadRequest {
            user_id: Some(user_id.to_string()),
        };
        let resp = self
            .http
            .put(self.url(&["conversations", conversation_id, "read"])?)
            .json(&body)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn unread_count(&self, user_id: &str) -> Result<u64, RemoteError> {
        let resp = self
            .http
            .get(self.url(&["unread", user_id])?)
            .send()
            .await?;
        let body: UnreadCountResponse = Self::decode(resp).await?;
        Ok(body.count)
    }
}
