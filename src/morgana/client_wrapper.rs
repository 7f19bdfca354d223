//! Shared primitives for provider-agnostic LLM clients.
//!
//! The orchestration core never talks to a vendor API directly: every model
//! interaction goes through the [`ClientWrapper`] trait and the lightweight
//! data types defined in this module. The trait abstracts over concrete
//! provider implementations while the supporting structs describe chat
//! messages, streaming chunks, and the tool schemas forwarded with a request.
//!
//! Three call shapes cover everything the core needs:
//!
//! - [`ClientWrapper::complete`] — one-shot system + user prompt, used by the
//!   guard, the classifier, and the presentation trigger.
//! - [`ClientWrapper::run`] — full message-history chat turn, used by agents.
//! - [`ClientWrapper::run_stream`] — streaming variant of `run`; providers
//!   without streaming support inherit the default `Ok(None)` and the caller
//!   falls back to the batch path.
//!
//! The core treats model output as opaque text. Consumers that expect JSON
//! (classifier, presentation) pass the raw response through
//! [`clean_json_response`] first, which tolerates the markdown fences many
//! models wrap around structured output.

use async_trait::async_trait;
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::pin::Pin;

/// Represents the possible roles for a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A system authored message that primes or constrains assistant behaviour.
    System,
    /// A user authored message (mirror of a human end-user request).
    User,
    /// An assistant authored message (model responses).
    Assistant,
    /// The deterministic result string of a tool invocation, fed back to the model.
    Tool,
}

/// A single entry in an agent's conversation history.
///
/// Histories are append-only during a turn and are what gets persisted, so
/// the type is fully serde-serializable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// The role associated with the message.
    pub role: Role,
    /// The message body.
    pub content: String,
}

impl ChatMessage {
    /// Convenience constructor used throughout the agent runtime.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Provider-agnostic tool schema passed to the LLM along with a chat request.
///
/// Derived from [`ToolMetadata`](crate::morgana::tool_protocol::ToolMetadata)
/// via [`ToolMetadata::to_tool_definition`](crate::morgana::tool_protocol::ToolMetadata::to_tool_definition);
/// serialised by the concrete client into whatever wire format its provider
/// expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name as it will appear to the model.
    pub name: String,
    /// Human-readable description surfaced to the LLM to aid tool selection.
    pub description: String,
    /// JSON Schema object describing the accepted parameters.
    pub parameters_schema: serde_json::Value,
}

/// Represents a chunk of content in a streaming response.
#[derive(Clone, Debug)]
pub struct MessageChunk {
    /// The incremental content delta in this chunk. May be empty for chunks
    /// that only carry a finish reason.
    pub content: String,
    /// Optional finish reason mirroring the provider specific completion status.
    pub finish_reason: Option<String>,
}

/// Type alias for a stream of message chunks compatible with `Send` executors.
pub type MessageChunkStream =
    Pin<Box<dyn Stream<Item = Result<MessageChunk, Box<dyn Error + Send + Sync>>> + Send>>;

/// Type alias for the future returned by [`ClientWrapper::run_stream`].
pub type MessageStreamFuture<'a> = Pin<
    Box<
        dyn std::future::Future<
                Output = Result<Option<MessageChunkStream>, Box<dyn Error + Send + Sync>>,
            > + Send
            + 'a,
    >,
>;

/// Trait-driven abstraction for a concrete LLM provider.
///
/// A [`ClientWrapper`] instance is responsible for translating core requests
/// into the provider specific wire format and for returning responses in a
/// uniform shape. The abstraction deliberately excludes any conversation
/// bookkeeping: histories live in
/// [`AgentSession`](crate::morgana::session::AgentSession).
///
/// All implementations must be thread-safe (`Send + Sync`) so they can be
/// shared between actor tasks via `Arc<dyn ClientWrapper>`.
#[async_trait]
pub trait ClientWrapper: Send + Sync {
    /// One-shot completion: a system prompt plus a single user prompt.
    ///
    /// Used by the guard, the classifier, and the presentation trigger. The
    /// `conversation_id` is forwarded so providers can correlate requests;
    /// the core attaches no meaning to it.
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        conversation_id: &str,
    ) -> Result<String, Box<dyn Error + Send + Sync>>;

    /// Full chat turn over an explicit message history.
    ///
    /// The `messages` slice must include any system priming messages the
    /// caller wishes to send. `tools` carries the schemas of every tool the
    /// agent exposes this turn; providers that do not support native tool
    /// calling may ignore it (the agent runtime also renders tools into the
    /// prompt text and parses call requests out of the response).
    async fn run(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatMessage, Box<dyn Error + Send + Sync>>;

    /// Request a streaming response from the provider.
    ///
    /// Implementors that sit in front of providers without streaming support
    /// can inherit the default implementation which simply resolves to
    /// `Ok(None)`; the agent runtime then falls back to [`run`](ClientWrapper::run).
    ///
    /// Returning a boxed future avoids imposing `async_trait`'s lifetime
    /// gymnastics on implementations that build the stream lazily.
    fn run_stream<'a>(
        &'a self,
        _messages: &'a [ChatMessage],
        _tools: &'a [ToolDefinition],
    ) -> MessageStreamFuture<'a> {
        Box::pin(async { Ok(None) })
    }

    /// Return the identifier used to select the upstream model (e.g. `"gpt-4.1"`).
    fn model_name(&self) -> &str;
}

/// Strip markdown fences and surrounding prose from a model response that is
/// expected to contain a single JSON value.
///
/// Models routinely wrap structured output in ```` ```json ```` fences or
/// prefix it with a sentence of commentary. This helper extracts the most
/// plausible JSON payload:
///
/// 1. If the trimmed text is fenced, the fence lines are removed.
/// 2. Otherwise the substring from the first `{` or `[` to the matching last
///    `}` or `]` is returned.
/// 3. If neither applies the trimmed input is returned unchanged and the
///    caller's parse error stands.
///
/// # Example
///
/// ```rust
/// use morgana::client_wrapper::clean_json_response;
///
/// let raw = "```json\n{\"intent\": \"billing\"}\n```";
/// assert_eq!(clean_json_response(raw), "{\"intent\": \"billing\"}");
/// ```
pub fn clean_json_response(raw: &str) -> String {
    let trimmed = raw.trim();

    if trimmed.starts_with("```") {
        // Drop the opening fence line (which may carry a language tag) and a
        // trailing fence if present.
        let without_open = match trimmed.find('\n') {
            Some(idx) => &trimmed[idx + 1..],
            None => "",
        };
        let without_close = without_open
            .trim_end()
            .trim_end_matches("```")
            .trim_end();
        return without_close.trim().to_string();
    }

    let open_obj = trimmed.find('{');
    let open_arr = trimmed.find('[');
    let (open, close) = match (open_obj, open_arr) {
        (Some(o), Some(a)) if a < o => (Some(a), trimmed.rfind(']')),
        (Some(o), _) => (Some(o), trimmed.rfind('}')),
        (None, Some(a)) => (Some(a), trimmed.rfind(']')),
        (None, None) => (None, None),
    };

    if let (Some(start), Some(end)) = (open, close) {
        if end >= start {
            return trimmed[start..=end].to_string();
        }
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_json_passthrough() {
        assert_eq!(clean_json_response("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn test_clean_json_fenced() {
        let raw = "```json\n{\"compliant\": true}\n```";
        assert_eq!(clean_json_response(raw), "{\"compliant\": true}");
    }

    #[test]
    fn test_clean_json_fence_without_language() {
        let raw = "```\n[1, 2, 3]\n```";
        assert_eq!(clean_json_response(raw), "[1, 2, 3]");
    }

    #[test]
    fn test_clean_json_with_prose() {
        let raw = "Sure, here you go: {\"intent\": \"billing\", \"confidence\": 0.9} Hope that helps!";
        assert_eq!(
            clean_json_response(raw),
            "{\"intent\": \"billing\", \"confidence\": 0.9}"
        );
    }

    #[test]
    fn test_clean_json_array_with_prose() {
        let raw = "replies below\n[{\"id\":\"1\"}]";
        assert_eq!(clean_json_response(raw), "[{\"id\":\"1\"}]");
    }

    #[test]
    fn test_chat_message_roundtrip() {
        let msg = ChatMessage::new(Role::Tool, "stored");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"tool\""));
        let back: ChatMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.role, Role::Tool);
        assert_eq!(back.content, "stored");
    }
}
