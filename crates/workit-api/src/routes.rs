use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post, put},
};
use tower_http::services::ServeDir;

use crate::conversations;
use crate::messages;
use crate::state::AppState;
use crate::uploads::{MAX_FILE_SIZE, MAX_FILES};

/// Headroom for text fields and multipart framing on top of the file payload.
const FORM_OVERHEAD: usize = 64 * 1024;

/// Messaging API mounted at `/api/messages`, plus static attachment files
/// at `/uploads`.
pub fn router(state: AppState) -> Router {
    let uploads = ServeDir::new(state.uploads.root());

    // `{id}` is a user id on the bare path and a conversation id below it;
    // both share a name so the router accepts them side by side.
    let api = Router::new()
        .route("/conversations", post(conversations::create_conversation))
        .route("/conversations/{id}", get(conversations::list_conversations))
        .route(
            "/conversations/{id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .route("/conversations/{id}/read", put(messages::mark_read))
        .route("/unread/{user_id}", get(messages::unread_count))
        .layer(DefaultBodyLimit::max(MAX_FILE_SIZE * MAX_FILES + FORM_OVERHEAD))
        .with_state(state);

    Router::new()
        .nest("/api/messages", api)
        .nest_service("/uploads", uploads)
}
