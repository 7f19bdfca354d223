//! Per-session context-variable store with shared/private scoping.
//!
//! Every agent session owns one [`ContextStore`]. Variables written through
//! the tool surface land here; a variable whose name is in the session's
//! shared-name set additionally triggers the broadcast hook so the router can
//! fan the value out to sibling agents.
//!
//! Incoming values from siblings are merged with **first-write-wins**
//! semantics: an incoming value is accepted iff the key is absent locally.
//! Local writes are explicit and may overwrite; merges never do.
//!
//! Two reserved keys stage ephemeral per-turn UI artifacts
//! ([`QUICK_REPLIES_KEY`], [`RICH_CARD_KEY`]); the agent runtime extracts and
//! drops them at the end of every turn so they never reach persistence.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Reserved key under which `set_quick_replies` stages its payload.
pub const QUICK_REPLIES_KEY: &str = "quick_replies";
/// Reserved key under which `set_rich_card` stages its payload.
pub const RICH_CARD_KEY: &str = "rich_card";

/// Hook invoked after a shared variable is written. Implementations send a
/// broadcast message to the router; the hook must be cheap and non-blocking.
pub type BroadcastHook = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// A batch of shared-context values travelling between agents.
///
/// `source_intent` identifies the writing agent so the router can exclude it
/// from the fan-out; updates preserve write order per source.
#[derive(Debug, Clone)]
pub struct ContextUpdate {
    /// Intent of the agent that produced the values. Empty for updates seeded
    /// by the client at conversation creation.
    pub source_intent: String,
    /// `(name, value)` pairs in write order.
    pub updates: Vec<(String, Value)>,
}

/// The context-variable store of one agent session.
pub struct ContextStore {
    variables: HashMap<String, Value>,
    shared_names: HashSet<String>,
    broadcast: Option<BroadcastHook>,
}

impl ContextStore {
    /// Create an empty store with the given shared-name set.
    ///
    /// The set is derived once at agent construction from the agent's tool
    /// definitions and never changes afterwards.
    pub fn new(shared_names: HashSet<String>) -> Self {
        Self {
            variables: HashMap::new(),
            shared_names,
            broadcast: None,
        }
    }

    /// Wire the broadcast hook. Called at agent construction, and again after
    /// a session is deserialized (hooks are not part of the persisted state).
    pub fn set_broadcast_hook(&mut self, hook: BroadcastHook) {
        self.broadcast = Some(hook);
    }

    /// Read a variable. The read path logs HIT/MISS for observability.
    pub fn get(&self, name: &str) -> Option<&Value> {
        match self.variables.get(name) {
            Some(value) => {
                log::debug!("context read HIT: {}", name);
                Some(value)
            }
            None => {
                log::debug!("context read MISS: {}", name);
                None
            }
        }
    }

    /// Write a variable. If the name is shared, the broadcast hook fires
    /// exactly once per set operation — including overwrites.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        let is_shared = self.shared_names.contains(&name);
        self.variables.insert(name.clone(), value);
        if is_shared {
            if let Some(hook) = &self.broadcast {
                // The hook only enqueues a router message; safe from the
                // owning actor's task.
                let stored = &self.variables[&name];
                hook(&name, stored);
            }
        }
    }

    /// Write a variable without ever broadcasting. Used when restoring a
    /// snapshot and when applying merged values from siblings (re-broadcasting
    /// a merge would loop traffic through the bus).
    pub fn set_local(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    /// Merge incoming values with first-write-wins semantics.
    ///
    /// Returns the number of accepted values; rejected keys (already present
    /// locally) are ignored silently.
    pub fn merge(&mut self, updates: &[(String, Value)]) -> usize {
        let mut accepted = 0;
        for (name, value) in updates {
            if !self.variables.contains_key(name) {
                self.variables.insert(name.clone(), value.clone());
                accepted += 1;
            }
        }
        accepted
    }

    /// Remove a variable, returning its value if present. Used to harvest the
    /// reserved ephemeral keys at the end of a turn.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.variables.remove(name)
    }

    /// Whether a variable is currently set (no HIT/MISS logging).
    pub fn contains(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    /// Whether writes to this name are broadcast to siblings.
    pub fn is_shared(&self, name: &str) -> bool {
        self.shared_names.contains(name)
    }

    /// Borrow the full variable map (persistence snapshot).
    pub fn variables(&self) -> &HashMap<String, Value> {
        &self.variables
    }

    /// Borrow the immutable shared-name set.
    pub fn shared_names(&self) -> &HashSet<String> {
        &self.shared_names
    }
}
