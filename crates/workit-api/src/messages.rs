use axum::{
    Json,
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::{debug, info};
use uuid::Uuid;

use workit_db::models::{AttachmentRow, MessageRow, format_ts};
use workit_types::api::{
    MarkReadRequest, MarkReadResponse, UnreadCountResponse, fields,
};
use workit_types::models::{Attachment, AttachmentKind, Message};

use crate::error::ApiError;
use crate::state::{AppState, run_db};
use crate::uploads::{IncomingFile, MAX_FILES};

/// GET /conversations/{id}/messages, oldest first.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let rows = run_db(&state, move |db| {
        if db.get_conversation(&conversation_id)?.is_none() {
            return Ok(None);
        }
        db.get_messages(&conversation_id).map(Some)
    })
    .await?
    .ok_or_else(ApiError::conversation_not_found)?;

    Ok(Json(rows.into_iter().map(|r| r.into_message()).collect()))
}

/// Parsed multipart body of a message submission.
#[derive(Default)]
struct MessageForm {
    content: String,
    sender_id: String,
    receiver_id: String,
    files: Vec<IncomingFile>,
    links: Vec<String>,
}

async fn read_form(mut multipart: Multipart) -> Result<MessageForm, ApiError> {
    let mut form = MessageForm::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            fields::ATTACHMENTS => {
                if form.files.len() >= MAX_FILES {
                    return Err(ApiError::BadRequest(format!(
                        "At most {} attachments are allowed",
                        MAX_FILES
                    )));
                }
                let original_name = field.file_name().unwrap_or("attachment").to_string();
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.body_text()))?;
                let file = IncomingFile {
                    original_name,
                    content_type,
                    data,
                };
                file.validate()?;
                form.files.push(file);
            }
            other => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.body_text()))?;
                match other {
                    fields::CONTENT => form.content = text,
                    fields::SENDER_ID => form.sender_id = text.trim().to_string(),
                    fields::RECEIVER_ID => form.receiver_id = text.trim().to_string(),
                    fields::LINK if !text.trim().is_empty() => {
                        form.links.push(text.trim().to_string())
                    }
                    _ => debug!("Ignoring multipart field {:?}", other),
                }
            }
        }
    }

    Ok(form)
}

/// POST /conversations/{id}/messages (multipart)
pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let form = read_form(multipart).await?;

    let has_payload =
        !form.content.trim().is_empty() || !form.files.is_empty() || !form.links.is_empty();
    if form.sender_id.is_empty() || form.receiver_id.is_empty() || !has_payload {
        return Err(ApiError::BadRequest(
            "Content, senderId, and receiverId are required".into(),
        ));
    }

    let cid = conversation_id.clone();
    let conversation = run_db(&state, move |db| db.get_conversation(&cid))
        .await?
        .ok_or_else(ApiError::conversation_not_found)?;

    let participants = &conversation.participants;
    if !participants.contains(&form.sender_id) || !participants.contains(&form.receiver_id) {
        return Err(ApiError::BadRequest(
            "senderId and receiverId must be participants of the conversation".into(),
        ));
    }

    let mut attachments: Vec<Attachment> = Vec::with_capacity(form.files.len() + form.links.len());
    for file in &form.files {
        match state.uploads.save(file).await {
            Ok(att) => attachments.push(att),
            Err(e) => {
                state.uploads.discard(&attachments).await;
                return Err(e.into());
            }
        }
    }
    for url in form.links {
        attachments.push(Attachment {
            kind: AttachmentKind::Link,
            url,
            name: None,
            size: None,
            content_type: None,
        });
    }

    let row = MessageRow {
        id: Uuid::new_v4().to_string(),
        conversation_id,
        sender_id: form.sender_id,
        receiver_id: form.receiver_id,
        content: form.content,
        is_read: false,
        timestamp: format_ts(chrono::Utc::now()),
        attachments: attachments.iter().map(AttachmentRow::from_attachment).collect(),
    };

    let stored = run_db(&state, move |db| {
        db.insert_message(&row)?;
        Ok(row)
    })
    .await;
    let row = match stored {
        Ok(row) => row,
        Err(e) => {
            state.uploads.discard(&attachments).await;
            return Err(e);
        }
    };

    info!(
        "Message {} posted to {} ({} attachments)",
        row.id,
        row.conversation_id,
        row.attachments.len()
    );

    Ok((StatusCode::CREATED, Json(row.into_message())))
}

/// PUT /conversations/{id}/read
pub async fn mark_read(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Json(req): Json<MarkReadRequest>,
) -> Result<Json<MarkReadResponse>, ApiError> {
    let user_id = req
        .user_id
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ApiError::BadRequest("userId is required".into()))?;

    let changed = run_db(&state, move |db| {
        if db.get_conversation(&conversation_id)?.is_none() {
            return Ok(None);
        }
        db.mark_read(&conversation_id, &user_id).map(Some)
    })
    .await?
    .ok_or_else(ApiError::conversation_not_found)?;

    debug!("Marked {} messages read", changed);
    Ok(Json(MarkReadResponse { success: true }))
}

/// GET /unread/{user_id}
pub async fn unread_count(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<UnreadCountResponse>, ApiError> {
    let count = run_db(&state, move |db| db.unread_count(&user_id)).await?;
    Ok(Json(UnreadCountResponse { count }))
}
