//! Per-(agent, conversation) session state.
//!
//! An [`AgentSession`] holds everything one agent knows about one
//! conversation: the append-only message history, the context-variable store,
//! and the queue of shared-context updates that arrived before the agent's
//! first turn. Sessions are created lazily on the first routed turn, or
//! restored from an opaque persisted blob.
//!
//! The serialized payload ([`SessionSnapshot`]) carries the history, the
//! context variables, and the shared-name set. Pending merges are never
//! persisted — they are consumed at the start of the next turn — and the
//! ephemeral UI keys have already been dropped by the agent runtime before a
//! save happens.

use crate::morgana::client_wrapper::ChatMessage;
use crate::morgana::context::{ContextStore, ContextUpdate};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt;

/// Identity of one agent within one conversation.
///
/// The rendered key, `"{intent}-{conversation_id}"`, is the primary key for
/// both the live actor and the persisted blob: at most one of each exists per
/// identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentIdentifier {
    pub intent: String,
    pub conversation_id: String,
}

impl AgentIdentifier {
    pub fn new(intent: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            intent: intent.into(),
            conversation_id: conversation_id.into(),
        }
    }

    /// The persistence key for this identifier.
    pub fn key(&self) -> String {
        format!("{}-{}", self.intent, self.conversation_id)
    }
}

impl fmt::Display for AgentIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.intent, self.conversation_id)
    }
}

/// The serialized view of a session. This is the entire persisted payload;
/// the blob handed to the store is its JSON encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub message_history: Vec<ChatMessage>,
    pub context_variables: HashMap<String, serde_json::Value>,
    pub shared_variable_names: HashSet<String>,
}

/// Mutable per-agent conversation state. Owned exclusively by the agent's
/// actor task; no locking is needed.
pub struct AgentSession {
    history: Vec<ChatMessage>,
    /// Context-variable store (shared/private scoping, broadcast hook).
    pub context: ContextStore,
    pending_merges: Vec<ContextUpdate>,
}

impl AgentSession {
    /// Create a fresh session with the shared-name set derived from the
    /// agent's tool definitions.
    pub fn new(shared_names: HashSet<String>) -> Self {
        Self {
            history: Vec::new(),
            context: ContextStore::new(shared_names),
            pending_merges: Vec::new(),
        }
    }

    /// Rebuild a session from its snapshot.
    ///
    /// The broadcast hook is not part of the serialized state; the agent
    /// runtime re-wires it after restoring.
    pub fn from_snapshot(snapshot: SessionSnapshot) -> Self {
        let mut context = ContextStore::new(snapshot.shared_variable_names);
        for (name, value) in snapshot.context_variables {
            context.set_local(name, value);
        }
        Self {
            history: snapshot.message_history,
            context,
            pending_merges: Vec::new(),
        }
    }

    /// Append a message. Histories are append-only during a turn and never
    /// reordered.
    pub fn push_message(&mut self, message: ChatMessage) {
        self.history.push(message);
    }

    /// The full message history (what gets persisted; reducers only shape the
    /// view sent to the LLM).
    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Queue a shared-context update that arrived while no turn was running.
    /// Order is preserved.
    pub fn queue_merge(&mut self, update: ContextUpdate) {
        self.pending_merges.push(update);
    }

    /// Apply all queued updates in arrival order with first-write-wins
    /// semantics, clearing the queue. Returns the number of accepted values.
    pub fn drain_pending_merges(&mut self) -> usize {
        let mut accepted = 0;
        let pending = std::mem::take(&mut self.pending_merges);
        for update in pending {
            accepted += self.context.merge(&update.updates);
        }
        accepted
    }

    /// How many updates are currently queued (diagnostics).
    pub fn pending_merge_count(&self) -> usize {
        self.pending_merges.len()
    }

    /// Produce the serializable view of this session.
    ///
    /// Pending merges are excluded by design; callers are expected to have
    /// already harvested the ephemeral UI keys.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            message_history: self.history.clone(),
            context_variables: self.context.variables().clone(),
            shared_variable_names: self.context.shared_names().clone(),
        }
    }

    /// Encode the session as the opaque blob handed to the session store.
    pub fn to_blob(&self) -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
        let bytes = serde_json::to_vec(&self.snapshot())?;
        Ok(bytes)
    }

    /// Decode a session from a persisted blob.
    pub fn from_blob(bytes: &[u8]) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let snapshot: SessionSnapshot = serde_json::from_slice(bytes)?;
        Ok(Self::from_snapshot(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::morgana::client_wrapper::Role;
    use serde_json::json;

    #[test]
    fn test_identifier_key_shape() {
        let id = AgentIdentifier::new("billing", "conv-42");
        assert_eq!(id.key(), "billing-conv-42");
        assert_eq!(id.to_string(), "billing-conv-42");
    }

    #[test]
    fn test_blob_round_trip_preserves_observable_state() {
        let shared: HashSet<String> = ["user_id".to_string()].iter().cloned().collect();
        let mut session = AgentSession::new(shared);
        session.push_message(ChatMessage::new(Role::User, "show my last invoice"));
        session.push_message(ChatMessage::new(Role::Assistant, "Here it is."));
        session.context.set_local("user_id", json!("P994E"));
        session.context.set_local("invoice", json!("INV-001"));

        let blob = session.to_blob().unwrap();
        let restored = AgentSession::from_blob(&blob).unwrap();

        assert_eq!(restored.history().len(), 2);
        assert_eq!(restored.history()[0].content, "show my last invoice");
        assert_eq!(restored.context.get("user_id"), Some(&json!("P994E")));
        assert_eq!(restored.context.get("invoice"), Some(&json!("INV-001")));
        assert!(restored.context.is_shared("user_id"));
        assert!(!restored.context.is_shared("invoice"));
    }

    #[test]
    fn test_pending_merges_apply_in_order_first_write_wins() {
        let mut session = AgentSession::new(HashSet::new());
        session.queue_merge(ContextUpdate {
            source_intent: "billing".to_string(),
            updates: vec![("user_id".to_string(), json!("FIRST"))],
        });
        session.queue_merge(ContextUpdate {
            source_intent: "contracts".to_string(),
            updates: vec![
                ("user_id".to_string(), json!("SECOND")),
                ("region".to_string(), json!("EU")),
            ],
        });

        let accepted = session.drain_pending_merges();
        assert_eq!(accepted, 2);
        assert_eq!(session.context.get("user_id"), Some(&json!("FIRST")));
        assert_eq!(session.context.get("region"), Some(&json!("EU")));
        assert_eq!(session.pending_merge_count(), 0);
    }

    #[test]
    fn test_snapshot_excludes_pending_merges() {
        let mut session = AgentSession::new(HashSet::new());
        session.queue_merge(ContextUpdate {
            source_intent: "billing".to_string(),
            updates: vec![("user_id".to_string(), json!("X"))],
        });

        let snapshot = session.snapshot();
        assert!(snapshot.context_variables.is_empty());
    }
}
