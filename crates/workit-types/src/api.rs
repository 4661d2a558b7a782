use serde::{Deserialize, Serialize};

// -- Conversations --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationRequest {
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

// -- Messages --

/// Multipart field names for `POST /conversations/{id}/messages`.
pub mod fields {
    pub const CONTENT: &str = "content";
    pub const SENDER_ID: &str = "senderId";
    pub const RECEIVER_ID: &str = "receiverId";
    pub const ATTACHMENTS: &str = "attachments";
    pub const LINK: &str = "link";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadRequest {
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkReadResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnreadCountResponse {
    pub count: u64,
}

// -- Errors --

/// Body of every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub message: String,
}
