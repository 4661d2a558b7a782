//! Database row types. These map directly to SQLite rows and are converted
//! into `workit-types` models at the edge of this crate.

use chrono::{DateTime, SecondsFormat, Utc};
use workit_types::models::{Attachment, AttachmentKind, Conversation, Message};

pub struct ConversationRow {
    pub id: String,
    pub title: Option<String>,
    pub created_at: String,
    pub last_activity: String,
    pub participants: Vec<String>,
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub is_read: bool,
    pub timestamp: String,
    pub attachments: Vec<AttachmentRow>,
}

pub struct AttachmentRow {
    pub kind: String,
    pub url: String,
    pub name: Option<String>,
    pub content_type: Option<String>,
    pub size: Option<i64>,
}

/// Timestamps are stored as fixed-width RFC 3339 so they sort as text.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

impl ConversationRow {
    pub fn into_conversation(self) -> Conversation {
        Conversation {
            id: self.id,
            participants: self.participants,
            title: self.title,
            last_message: None,
            created_at: Some(parse_ts(&self.created_at)),
            last_activity: Some(parse_ts(&self.last_activity)),
            is_typing: None,
        }
    }
}

impl MessageRow {
    pub fn into_message(self) -> Message {
        Message {
            id: self.id,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            conversation_id: self.conversation_id,
            content: self.content,
            attachments: self
                .attachments
                .into_iter()
                .map(AttachmentRow::into_attachment)
                .collect(),
            timestamp: parse_ts(&self.timestamp),
            is_read: self.is_read,
        }
    }
}

impl AttachmentRow {
    pub fn from_attachment(att: &Attachment) -> Self {
        Self {
            kind: att.kind.as_str().to_string(),
            url: att.url.clone(),
            name: att.name.clone(),
            content_type: att.content_type.clone(),
            size: att.size.map(|s| s as i64),
        }
    }

    pub fn into_attachment(self) -> Attachment {
        Attachment {
            kind: AttachmentKind::parse(&self.kind).unwrap_or(AttachmentKind::File),
            url: self.url,
            name: self.name,
            size: self.size.and_then(|s| u64::try_from(s).ok()),
            content_type: self.content_type,
        }
    }
}
