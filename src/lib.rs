// src/lib.rs

// Import the top-level `morgana` module.
pub mod morgana;

// Re-export the submodules at the crate root so callers write
// `morgana::supervisor::…` instead of `morgana::morgana::supervisor::…`.
pub use morgana::{
    agent, classifier, client_wrapper, config, context, guard, history_reducer, manager,
    persistence, prompts, push_channel, rate_limit, registry, rich_card, router, session,
    supervisor, tool_protocol, tools,
};

#[cfg(feature = "http-server")]
pub use morgana::http_server;

// Re-exporting key items for easier external access.
pub use morgana::client_wrapper::{ChatMessage, ClientWrapper, Role};
pub use morgana::config::MorganaConfig;
pub use morgana::manager::{ConversationManager, MorganaRuntime};
pub use morgana::prompts::{Prompt, PromptStore};
pub use morgana::push_channel::{ConversationResponse, MessageType, PushChannel};
pub use morgana::session::{AgentIdentifier, AgentSession};
