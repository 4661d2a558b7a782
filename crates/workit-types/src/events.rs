use serde::{Deserialize, Serialize};

use crate::models::{Conversation, Message};

/// Change feed published by the message store for the UI layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum StoreEvent {
    /// Session state was (re)loaded from some tier
    Loaded { conversations: usize },

    /// A conversation was added to the list
    ConversationCreate { conversation: Conversation },

    /// A conversation and its messages were removed
    ConversationDelete { conversation_id: String },

    /// A message was appended, either sent by us or received
    MessageCreate { message: Message },

    /// A single message was removed
    MessageDelete {
        conversation_id: String,
        message_id: String,
    },

    /// Messages addressed to the current user were marked read
    MessagesRead {
        conversation_id: String,
        count: usize,
    },

    /// A user started typing
    TypingStart {
        conversation_id: String,
        user_id: String,
    },

    /// A typing indicator was cleared or expired
    TypingStop { conversation_id: String },

    /// The derived unread count changed
    UnreadCount { count: usize },
}

impl StoreEvent {
    /// Returns the conversation this event is scoped to, if any.
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            Self::ConversationCreate { conversation } => Some(&conversation.id),
            Self::ConversationDelete { conversation_id }
            | Self::MessageDelete { conversation_id, .. }
            | Self::MessagesRead { conversation_id, .. }
            | Self::TypingStart { conversation_id, .. }
            | Self::TypingStop { conversation_id } => Some(conversation_id),
            Self::MessageCreate { message } => Some(&message.conversation_id),
            Self::Loaded { .. } | Self::UnreadCount { .. } => None,
        }
    }
}
