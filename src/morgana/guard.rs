//! Content moderation guard.
//!
//! A thin adapter over [`ClientWrapper::complete`] with a dedicated system
//! prompt. The model answers with a JSON verdict; the guard only requires
//! that the output satisfies the schema and that non-compliant verdicts carry
//! a human-readable violation description.
//!
//! The guard never suppresses traffic on its own failures — the supervisor
//! owns the fail-open decision when the moderation call itself errors.

use crate::morgana::client_wrapper::{clean_json_response, ClientWrapper};
use crate::morgana::prompts::Prompt;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::sync::Arc;

/// Outcome of a moderation check. `violation` is present iff `!compliant`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardVerdict {
    pub compliant: bool,
    #[serde(default)]
    pub violation: Option<String>,
}

/// The per-conversation moderation adapter.
pub struct Guard {
    client: Arc<dyn ClientWrapper>,
    prompt: Prompt,
}

impl Guard {
    pub fn new(client: Arc<dyn ClientWrapper>, prompt: Prompt) -> Self {
        Self { client, prompt }
    }

    /// Check raw user text. Errors from the underlying call are returned
    /// as-is; deciding what a failed check means is the caller's job.
    pub async fn check(
        &self,
        conversation_id: &str,
        text: &str,
    ) -> Result<GuardVerdict, Box<dyn Error + Send + Sync>> {
        let raw = self
            .client
            .complete(&self.prompt.instructions, text, conversation_id)
            .await?;
        let cleaned = clean_json_response(&raw);
        let mut verdict: GuardVerdict = serde_json::from_str(&cleaned)?;

        // Normalize the invariant: violation present iff non-compliant.
        if verdict.compliant {
            verdict.violation = None;
        } else if verdict.violation.is_none() {
            verdict.violation = Some("content policy violation".to_string());
        }

        if !verdict.compliant {
            log::info!(
                "guard rejected message: conversation={} violation={:?}",
                conversation_id,
                verdict.violation
            );
        }
        Ok(verdict)
    }
}
