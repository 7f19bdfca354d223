//! Prompt store, framework templates, and the intent configuration document.
//!
//! Prompts are resolved by id from a [`PromptStore`] during runtime
//! initialization — never from inside an actor loop, so actor construction
//! performs no I/O. A [`Prompt`] bundles the instructions sent to the model
//! with a typed bag of `additional_properties` the framework reads by key:
//! error templates, tool-parameter guidance texts, the fallback presentation
//! message, and so on (see [`keys`]).
//!
//! Error and policy templates use double-parenthesis placeholders —
//! `((llm_error))`, `((violation))`, `((intents))` — substituted by
//! [`render_template`]. Every template has a process-wide default so a
//! sparsely configured prompt store still yields deterministic user-facing
//! strings.
//!
//! The intent configuration source is a JSON document
//! `{ "intents": [IntentDefinition…], "agents": [Prompt…] }` parsed into an
//! [`IntentCatalog`]. Intent names are lowercase-normalized on load; the
//! reserved name `"other"` is excluded from catalog membership but remains a
//! legal classifier output meaning "no handler".

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;

/// Reserved classifier fallback intent. Never bound to a concrete agent.
pub const OTHER_INTENT: &str = "other";

/// Display name of the assistant as pushed to clients.
pub const ASSISTANT_NAME: &str = "Morgana";

/// Well-known prompt ids resolved by the framework itself.
pub const FRAMEWORK_PROMPT_ID: &str = "framework";
/// Prompt id for the content-moderation guard.
pub const GUARD_PROMPT_ID: &str = "guard";
/// Prompt id for the intent classifier.
pub const CLASSIFIER_PROMPT_ID: &str = "classifier";
/// Prompt id for the one-shot conversation presentation.
pub const PRESENTATION_PROMPT_ID: &str = "presentation";

/// Keys of the typed property bag carried by [`Prompt::additional_properties`].
pub mod keys {
    /// Declared tool definitions for an agent prompt (JSON array).
    pub const TOOLS: &str = "Tools";
    /// Policy text appended to every agent system prompt.
    pub const GLOBAL_POLICIES: &str = "GlobalPolicies";
    /// Generic error answer returned when an agent turn fails.
    pub const ERROR_ANSWERS: &str = "ErrorAnswers";
    /// Intent list rendered into the classifier prompt.
    pub const INTENTS: &str = "Intents";
    /// Deterministic presentation fallback message (`((intents))` placeholder).
    pub const FALLBACK_MESSAGE: &str = "FallbackMessage";
    /// Guidance suffix for `scope = context` tool parameters.
    pub const TOOL_PARAMETER_CONTEXT_GUIDANCE: &str = "ToolParameterContextGuidance";
    /// Guidance suffix for `scope = request` tool parameters.
    pub const TOOL_PARAMETER_REQUEST_GUIDANCE: &str = "ToolParameterRequestGuidance";
    /// Router answer when a request arrives without a classification.
    pub const MISSING_CLASSIFICATION_ERROR: &str = "MissingClassificationError";
    /// Router answer when the classified intent has no registered agent.
    pub const UNRECOGNIZED_INTENT_ERROR: &str = "UnrecognizedIntentError";
    /// Answer template for LLM transport failures (`((llm_error))` placeholder).
    pub const LLM_SERVICE_ERROR: &str = "LLMServiceError";
    /// Answer template for guard violations (`((violation))` placeholder).
    pub const GUARD_ANSWER: &str = "GuardAnswer";
}

lazy_static! {
    /// Process-wide defaults for every template key, used when the resolved
    /// prompt does not carry the property.
    static ref DEFAULT_TEMPLATES: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        m.insert(
            keys::ERROR_ANSWERS,
            "Something went wrong while processing your request. Please try again.",
        );
        m.insert(
            keys::FALLBACK_MESSAGE,
            "Hi, I'm Morgana. Here is what I can help you with: ((intents))",
        );
        m.insert(
            keys::TOOL_PARAMETER_CONTEXT_GUIDANCE,
            " Before asking the user for this value, call get_context_variable to check whether it is already known.",
        );
        m.insert(
            keys::TOOL_PARAMETER_REQUEST_GUIDANCE,
            " Take this value directly from the user's message.",
        );
        m.insert(
            keys::MISSING_CLASSIFICATION_ERROR,
            "I could not understand your request. Please try rephrasing it.",
        );
        m.insert(
            keys::UNRECOGNIZED_INTENT_ERROR,
            "No assistant is available for this kind of request.",
        );
        m.insert(
            keys::LLM_SERVICE_ERROR,
            "The language model service failed: ((llm_error))",
        );
        m.insert(
            keys::GUARD_ANSWER,
            "I can't help with that: ((violation))",
        );
        m
    };
}

/// A resolved prompt: target model hints, instructions, optional personality,
/// and a typed bag of additional properties accessed by key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    /// Identifier the prompt is resolved by (also the agent intent for agent prompts).
    pub id: String,
    /// Deployment target hint (model/profile name); opaque to the core.
    #[serde(default)]
    pub target: String,
    /// Instruction body sent as the system prompt.
    #[serde(default)]
    pub instructions: String,
    /// Optional persona hints appended to the system prompt.
    #[serde(default)]
    pub personality: Option<String>,
    /// Typed bag of framework properties, accessed via [`keys`].
    #[serde(default)]
    pub additional_properties: HashMap<String, serde_json::Value>,
}

impl Prompt {
    /// Create a minimal prompt with the given id and instructions.
    pub fn new(id: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            target: String::new(),
            instructions: instructions.into(),
            personality: None,
            additional_properties: HashMap::new(),
        }
    }

    /// Attach a property to the bag (builder pattern).
    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.additional_properties.insert(key.into(), value);
        self
    }

    /// Borrow a string property from the bag.
    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.additional_properties.get(key).and_then(|v| v.as_str())
    }

    /// Borrow a raw property value from the bag.
    pub fn property(&self, key: &str) -> Option<&serde_json::Value> {
        self.additional_properties.get(key)
    }

    /// Resolve a template property, falling back to the process-wide default
    /// for the key when the bag does not carry it.
    pub fn template(&self, key: &str) -> String {
        match self.property_str(key) {
            Some(text) => text.to_string(),
            None => default_template(key),
        }
    }
}

/// Return the built-in default for a template key (empty string for unknown keys).
pub fn default_template(key: &str) -> String {
    DEFAULT_TEMPLATES.get(key).copied().unwrap_or("").to_string()
}

/// Substitute `((name))` placeholders in a template.
///
/// Unknown placeholders are left untouched so a misconfigured template
/// degrades visibly instead of silently.
///
/// # Example
///
/// ```rust
/// use morgana::prompts::render_template;
///
/// let out = render_template(
///     "The language model service failed: ((llm_error))",
///     &[("llm_error", "timeout")],
/// );
/// assert_eq!(out, "The language model service failed: timeout");
/// ```
pub fn render_template(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (name, value) in values {
        out = out.replace(&format!("(({}))", name), value);
    }
    out
}

/// Store of prompts resolvable by id.
///
/// Resolution happens during runtime initialization (before the actor tree
/// starts), so the trait is synchronous; remote-backed implementations are
/// expected to prefetch.
pub trait PromptStore: Send + Sync {
    /// Resolve a prompt by id. `None` means the id is unknown.
    fn resolve(&self, prompt_id: &str) -> Option<Prompt>;
}

/// In-memory [`PromptStore`] backed by a map, typically loaded from the
/// intent configuration document.
#[derive(Debug, Clone, Default)]
pub struct StaticPromptStore {
    prompts: HashMap<String, Prompt>,
}

impl StaticPromptStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from an iterator of prompts, keyed by their id.
    pub fn from_prompts(prompts: impl IntoIterator<Item = Prompt>) -> Self {
        let mut map = HashMap::new();
        for prompt in prompts {
            map.insert(prompt.id.clone(), prompt);
        }
        Self { prompts: map }
    }

    /// Insert or replace a prompt.
    pub fn insert(&mut self, prompt: Prompt) {
        self.prompts.insert(prompt.id.clone(), prompt);
    }
}

impl PromptStore for StaticPromptStore {
    fn resolve(&self, prompt_id: &str) -> Option<Prompt> {
        self.prompts.get(prompt_id).cloned()
    }
}

/// Declaration of a single classifiable intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentDefinition {
    /// Lowercase intent name; `"other"` is reserved and never a member.
    pub name: String,
    /// Description offered to the classifier.
    #[serde(default)]
    pub description: String,
    /// Display label used in agent names and presentation quick replies.
    #[serde(default)]
    pub label: Option<String>,
    /// Optional default quick-reply value for presentation.
    #[serde(default)]
    pub default_value: Option<String>,
}

/// The parsed intent configuration document:
/// `{ "intents": [...], "agents": [...] }`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IntentCatalog {
    #[serde(default)]
    intents: Vec<IntentDefinition>,
    /// Agent prompts keyed by intent via their `id`.
    #[serde(default)]
    pub agents: Vec<Prompt>,
}

impl IntentCatalog {
    /// Parse the catalog from its JSON document, lowercase-normalizing intent
    /// names and dropping any entry that tries to register `"other"`.
    pub fn from_json(raw: &str) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let mut catalog: IntentCatalog = serde_json::from_str(raw)?;
        catalog.normalize();
        Ok(catalog)
    }

    /// Build a catalog from already-parsed definitions (tests, embedders).
    pub fn from_definitions(intents: Vec<IntentDefinition>, agents: Vec<Prompt>) -> Self {
        let mut catalog = IntentCatalog { intents, agents };
        catalog.normalize();
        catalog
    }

    fn normalize(&mut self) {
        for intent in &mut self.intents {
            intent.name = intent.name.to_lowercase();
        }
        self.intents.retain(|i| {
            if i.name == OTHER_INTENT {
                log::warn!(
                    "intent catalog declares reserved intent '{}'; entry ignored",
                    OTHER_INTENT
                );
                false
            } else {
                true
            }
        });
    }

    /// All configured intents (never includes `"other"`).
    pub fn intents(&self) -> &[IntentDefinition] {
        &self.intents
    }

    /// Look up an intent definition by (case-insensitive) name.
    pub fn find(&self, name: &str) -> Option<&IntentDefinition> {
        let lowered = name.to_lowercase();
        self.intents.iter().find(|i| i.name == lowered)
    }

    /// Intents that carry a display label, in declaration order. These are
    /// what the presentation offers as quick replies.
    pub fn displayable(&self) -> Vec<&IntentDefinition> {
        self.intents.iter().filter(|i| i.label.is_some()).collect()
    }

    /// Resolve the agent prompt declared for an intent, if any.
    pub fn agent_prompt(&self, intent: &str) -> Option<&Prompt> {
        let lowered = intent.to_lowercase();
        self.agents.iter().find(|p| p.id == lowered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_template_placeholders() {
        let out = render_template(
            "I can't help with that: ((violation))",
            &[("violation", "harassment")],
        );
        assert_eq!(out, "I can't help with that: harassment");
    }

    #[test]
    fn test_render_template_unknown_placeholder_untouched() {
        let out = render_template("((missing)) stays", &[("other", "x")]);
        assert_eq!(out, "((missing)) stays");
    }

    #[test]
    fn test_prompt_template_falls_back_to_default() {
        let prompt = Prompt::new("framework", "be helpful");
        assert_eq!(
            prompt.template(keys::LLM_SERVICE_ERROR),
            "The language model service failed: ((llm_error))"
        );
    }

    #[test]
    fn test_prompt_template_prefers_configured_value() {
        let prompt = Prompt::new("framework", "be helpful").with_property(
            keys::LLM_SERVICE_ERROR,
            serde_json::json!("model down: ((llm_error))"),
        );
        assert_eq!(
            prompt.template(keys::LLM_SERVICE_ERROR),
            "model down: ((llm_error))"
        );
    }

    #[test]
    fn test_catalog_normalizes_and_excludes_other() {
        let catalog = IntentCatalog::from_json(
            r#"{
                "intents": [
                    {"name": "Billing", "description": "invoices", "label": "Billing"},
                    {"name": "other", "description": "fallback"}
                ],
                "agents": []
            }"#,
        )
        .unwrap();

        assert_eq!(catalog.intents().len(), 1);
        assert_eq!(catalog.intents()[0].name, "billing");
        assert!(catalog.find("BILLING").is_some());
        assert!(catalog.find(OTHER_INTENT).is_none());
    }

    #[test]
    fn test_catalog_agent_prompt_lookup() {
        let catalog = IntentCatalog::from_json(
            r#"{
                "intents": [{"name": "billing", "label": "Billing"}],
                "agents": [{"id": "billing", "instructions": "You handle invoices."}]
            }"#,
        )
        .unwrap();

        let prompt = catalog.agent_prompt("billing").unwrap();
        assert_eq!(prompt.instructions, "You handle invoices.");
    }
}
