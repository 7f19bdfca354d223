//! Outbound push channel to end-user clients.
//!
//! The core never renders UI — it pushes [`ConversationResponse`] shapes
//! through the [`PushChannel`] trait and lets the hosting application own the
//! wire format (WebSocket groups, SSE, a message queue…).
//!
//! Two operations cover the contract: [`PushChannel::send_plain`] for bare
//! text (errors, stream fallbacks) and [`PushChannel::send_structured`] for
//! full assistant/presentation messages. Streaming deltas go through
//! [`PushChannel::send_chunk`], which defaults to `send_plain` so minimal
//! implementations get forwarding for free.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;

/// Kind of a structured outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Assistant,
    Presentation,
    System,
    Error,
}

/// One tappable reply offered to the user.
///
/// The `termination` field is carried through opaquely: the core neither
/// reads nor interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuickReply {
    pub id: String,
    pub label: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination: Option<serde_json::Value>,
}

/// The outward shape pushed to clients at the end of a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationResponse {
    /// The assistant's text for this turn.
    pub response: String,
    /// Intent the turn was classified as, when classification ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<String>,
    /// Classifier metadata (including downgrade diagnostics).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
    /// Display name of the answering agent (e.g. `"Morgana (Billing)"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    /// Whether the agent considers the interaction complete.
    pub agent_completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quick_replies: Option<Vec<QuickReply>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rich_card: Option<serde_json::Value>,
    /// Timestamp of the user message that started the turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_timestamp: Option<DateTime<Utc>>,
}

/// Outbound delivery to the client(s) attached to a conversation.
#[async_trait]
pub trait PushChannel: Send + Sync {
    /// Push bare text. `error_reason` is set when the text is an error
    /// surface rather than assistant content.
    async fn send_plain(
        &self,
        conversation_id: &str,
        text: &str,
        error_reason: Option<&str>,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Push a structured message.
    #[allow(clippy::too_many_arguments)]
    async fn send_structured(
        &self,
        conversation_id: &str,
        text: &str,
        message_type: MessageType,
        quick_replies: Option<Vec<QuickReply>>,
        error_reason: Option<&str>,
        agent_name: Option<&str>,
        agent_completed: bool,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Forward one streaming delta. Defaults to [`send_plain`](PushChannel::send_plain).
    async fn send_chunk(
        &self,
        conversation_id: &str,
        delta: &str,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.send_plain(conversation_id, delta, None).await
    }

    /// Push a full turn response. Default implementation maps onto
    /// [`send_structured`](PushChannel::send_structured); channels with a
    /// richer wire format override this to carry the card and metadata.
    async fn send_response(
        &self,
        conversation_id: &str,
        response: &ConversationResponse,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.send_structured(
            conversation_id,
            &response.response,
            MessageType::Assistant,
            response.quick_replies.clone(),
            None,
            response.agent_name.as_deref(),
            response.agent_completed,
        )
        .await
    }
}
