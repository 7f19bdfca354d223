//! Thin HTTP entry points (feature `http-server`).
//!
//! Two routes front the conversation manager:
//!
//! - `POST /conversations` — `{ "conversation_id", "initial_context"? }`:
//!   create (or revive) a conversation and fire the presentation trigger.
//! - `POST /messages` — `{ "conversation_id", "text" }`: enqueue one user
//!   message.
//!
//! Responses travel over the configured [`PushChannel`](crate::morgana::push_channel::PushChannel)
//! (which typically attaches per-conversation client groups), not the HTTP
//! response — both routes answer `202 Accepted` as soon as the work is
//! enqueued.

use crate::morgana::manager::ConversationManager;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct CreateConversationRequest {
    conversation_id: String,
    #[serde(default)]
    initial_context: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct PostMessageRequest {
    conversation_id: String,
    text: String,
}

/// Build the HTTP router over a shared conversation manager.
pub fn router(manager: Arc<ConversationManager>) -> Router {
    Router::new()
        .route("/conversations", post(create_conversation))
        .route("/messages", post(post_message))
        // Intake is cheap (actors do the work) but unbounded concurrency
        // still amplifies a flood; excess requests queue here.
        .layer(tower::limit::ConcurrencyLimitLayer::new(1024))
        .with_state(manager)
}

/// Bind and serve until the listener fails.
pub async fn serve(
    manager: Arc<ConversationManager>,
    addr: std::net::SocketAddr,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("http surface listening on {}", addr);
    axum::serve(listener, router(manager)).await
}

async fn create_conversation(
    State(manager): State<Arc<ConversationManager>>,
    Json(request): Json<CreateConversationRequest>,
) -> StatusCode {
    if request.conversation_id.is_empty() {
        return StatusCode::BAD_REQUEST;
    }
    manager
        .create_conversation(&request.conversation_id, request.initial_context)
        .await;
    StatusCode::ACCEPTED
}

async fn post_message(
    State(manager): State<Arc<ConversationManager>>,
    Json(request): Json<PostMessageRequest>,
) -> StatusCode {
    if request.conversation_id.is_empty() || request.text.is_empty() {
        return StatusCode::BAD_REQUEST;
    }
    match manager
        .handle_message(&request.conversation_id, &request.text)
        .await
    {
        Ok(()) => StatusCode::ACCEPTED,
        Err(e) => {
            log::error!("message intake failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
