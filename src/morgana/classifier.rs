//! Intent classification.
//!
//! A thin adapter over [`ClientWrapper::complete`]: the configured intents
//! (minus the reserved `"other"`) are rendered into the prompt, the model
//! answers with a JSON classification, and the output is accepted verbatim —
//! the router is the authority on whether an intent is actually bound to an
//! agent. `"other"` is a legal output meaning "no handler".

use crate::morgana::client_wrapper::{clean_json_response, ClientWrapper};
use crate::morgana::prompts::{keys, IntentDefinition, Prompt, OTHER_INTENT};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

/// The classifier's judgement for one user message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub intent: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Classification {
    /// The synthesized downgrade used when classification itself fails: the
    /// turn continues through the `"other"` handler and the failure travels
    /// in the metadata.
    pub fn other_with_error(error: &str) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert(
            "error".to_string(),
            format!("classification_failed: {}", error),
        );
        Self {
            intent: OTHER_INTENT.to_string(),
            confidence: 0.0,
            metadata,
        }
    }
}

/// The per-conversation classification adapter.
pub struct Classifier {
    client: Arc<dyn ClientWrapper>,
    prompt: Prompt,
    intents: Vec<IntentDefinition>,
}

impl Classifier {
    /// `intents` is the configured list minus `"other"` (the catalog never
    /// contains it).
    pub fn new(client: Arc<dyn ClientWrapper>, prompt: Prompt, intents: Vec<IntentDefinition>) -> Self {
        Self {
            client,
            prompt,
            intents,
        }
    }

    /// Classify raw user text. Errors are returned to the caller, which
    /// downgrades them to [`Classification::other_with_error`].
    pub async fn classify(
        &self,
        conversation_id: &str,
        text: &str,
    ) -> Result<Classification, Box<dyn Error + Send + Sync>> {
        let system_prompt = self.render_system_prompt();
        let raw = self
            .client
            .complete(&system_prompt, text, conversation_id)
            .await?;
        let cleaned = clean_json_response(&raw);
        let mut classification: Classification = serde_json::from_str(&cleaned)?;
        classification.intent = classification.intent.to_lowercase();

        log::debug!(
            "classified conversation={} intent={} confidence={:.2}",
            conversation_id,
            classification.intent,
            classification.confidence
        );
        Ok(classification)
    }

    fn render_system_prompt(&self) -> String {
        let mut prompt = self.prompt.instructions.clone();

        // A configured intent list property takes precedence; otherwise the
        // catalog is rendered inline.
        if let Some(preamble) = self.prompt.property_str(keys::INTENTS) {
            prompt.push_str("\n\n");
            prompt.push_str(preamble);
        } else {
            prompt.push_str("\n\nKnown intents:\n");
            for intent in &self.intents {
                prompt.push_str(&format!("- {}: {}\n", intent.name, intent.description));
            }
        }
        prompt.push_str(&format!(
            "\nAnswer with JSON: {{\"intent\": \"<name>\", \"confidence\": <0..1>, \"metadata\": {{}}}}. \
             Use \"{}\" when no known intent applies.",
            OTHER_INTENT
        ));
        prompt
    }
}
