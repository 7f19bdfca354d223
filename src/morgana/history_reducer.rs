//! Pluggable view reducers for the message list sent to the LLM.
//!
//! A reducer shapes **only the view**: the full history always stays in the
//! session and is what gets persisted. Absence of a reducer means the full
//! history is sent. Reducers are applied lazily, at invoke time.
//!
//! Implementations must be pure and side-effect-free, idempotent
//! (`reduce(reduce(h)) == reduce(h)`), and monotone (never increase the
//! message count).

use crate::morgana::client_wrapper::{ChatMessage, Role};

/// A pure `history → history` view function.
pub trait HistoryReducer: Send + Sync {
    /// Produce the reduced view of `history`. The input is never mutated.
    fn reduce(&self, history: &[ChatMessage]) -> Vec<ChatMessage>;

    /// Human-readable name for logging and diagnostics.
    fn name(&self) -> &str;
}

/// Keeps every leading system message plus the last `max_messages`
/// non-system messages.
///
/// The cheapest useful reducer: long multi-turn sessions stay within the
/// model's practical context without losing the priming messages.
///
/// # Example
///
/// ```rust
/// use morgana::client_wrapper::{ChatMessage, Role};
/// use morgana::history_reducer::{HistoryReducer, WindowReducer};
///
/// let reducer = WindowReducer::new(2);
/// let history = vec![
///     ChatMessage::new(Role::System, "You are Morgana."),
///     ChatMessage::new(Role::User, "one"),
///     ChatMessage::new(Role::Assistant, "two"),
///     ChatMessage::new(Role::User, "three"),
/// ];
/// let view = reducer.reduce(&history);
/// assert_eq!(view.len(), 3); // system + last two
/// ```
pub struct WindowReducer {
    /// How many trailing non-system messages survive the reduction.
    pub max_messages: usize,
}

impl WindowReducer {
    /// Create a reducer keeping the last `max_messages` non-system messages.
    pub fn new(max_messages: usize) -> Self {
        Self { max_messages }
    }
}

impl HistoryReducer for WindowReducer {
    fn reduce(&self, history: &[ChatMessage]) -> Vec<ChatMessage> {
        let system_prefix: Vec<ChatMessage> = history
            .iter()
            .take_while(|m| m.role == Role::System)
            .cloned()
            .collect();

        let rest: Vec<&ChatMessage> = history
            .iter()
            .skip(system_prefix.len())
            .filter(|m| m.role != Role::System)
            .collect();

        let keep_from = rest.len().saturating_sub(self.max_messages);
        let mut view = system_prefix;
        view.extend(rest[keep_from..].iter().map(|m| (*m).clone()));
        view
    }

    fn name(&self) -> &str {
        "WindowReducer"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_history() -> Vec<ChatMessage> {
        vec![
            ChatMessage::new(Role::System, "priming"),
            ChatMessage::new(Role::User, "a"),
            ChatMessage::new(Role::Assistant, "b"),
            ChatMessage::new(Role::User, "c"),
            ChatMessage::new(Role::Assistant, "d"),
        ]
    }

    #[test]
    fn test_window_keeps_system_prefix_and_tail() {
        let reducer = WindowReducer::new(2);
        let view = reducer.reduce(&sample_history());
        assert_eq!(view.len(), 3);
        assert_eq!(view[0].role, Role::System);
        assert_eq!(view[1].content, "c");
        assert_eq!(view[2].content, "d");
    }

    #[test]
    fn test_window_is_idempotent() {
        let reducer = WindowReducer::new(2);
        let once = reducer.reduce(&sample_history());
        let twice = reducer.reduce(&once);
        assert_eq!(once.len(), twice.len());
        for (a, b) in once.iter().zip(twice.iter()) {
            assert_eq!(a.content, b.content);
        }
    }

    #[test]
    fn test_window_is_monotone() {
        let reducer = WindowReducer::new(100);
        let history = sample_history();
        assert!(reducer.reduce(&history).len() <= history.len());
    }

    #[test]
    fn test_window_on_empty_history() {
        let reducer = WindowReducer::new(4);
        assert!(reducer.reduce(&[]).is_empty());
    }
}
