use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::{debug, info};
use uuid::Uuid;

use workit_db::models::format_ts;
use workit_types::api::CreateConversationRequest;
use workit_types::models::Conversation;

use crate::error::ApiError;
use crate::state::{AppState, run_db};

/// GET /conversations/{user_id}
pub async fn list_conversations(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<Conversation>>, ApiError> {
    let rows = run_db(&state, move |db| db.list_conversations_for_user(&user_id)).await?;
    Ok(Json(rows.into_iter().map(|r| r.into_conversation()).collect()))
}

/// POST /conversations
///
/// Returns 200 with the existing conversation when one already has exactly
/// the requested participant set, 201 with a new one otherwise.
pub async fn create_conversation(
    State(state): State<AppState>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let participants = normalize_participants(req.participants);
    if participants.len() < 2 {
        return Err(ApiError::BadRequest(
            "At least two participants are required".into(),
        ));
    }

    let title = req.title.filter(|t| !t.trim().is_empty());

    let id = Uuid::new_v4().to_string();
    let now = format_ts(chrono::Utc::now());
    let (row, created) = run_db(&state, move |db| {
        db.find_or_insert_conversation(&id, &participants, title.as_deref(), &now)
    })
    .await?;

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    if created {
        info!("Created conversation {} ({} participants)", row.id, row.participants.len());
    } else {
        debug!("Reusing conversation {}", row.id);
    }

    Ok((status, Json(row.into_conversation())))
}

/// Trims ids, drops blanks and repeats, keeps first-seen order.
fn normalize_participants(raw: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(raw.len());
    for p in raw {
        let p = p.trim();
        if !p.is_empty() && !out.iter().any(|seen| seen == p) {
            out.push(p.to_string());
        }
    }
    out
}
