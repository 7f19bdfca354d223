//! Agent and domain-tool registries with bidirectional startup validation.
//!
//! Discovery is explicit: at program startup each intent handler registers an
//! [`AgentBlueprint`] and each domain tool implementation registers a
//! [`ToolBundle`], both keyed by (case-insensitive) intent. The reflection
//! scan of the original design is gone; the behavioural contract is what
//! survives:
//!
//! - Every configured intent must have exactly one agent blueprint, and every
//!   blueprint's intent must be configured — either direction failing is a
//!   fatal startup error ([`validate_registries`]).
//! - At most one tool bundle per intent; duplicates are startup errors.
//!   Intents without a bundle are fine (that agent has no domain
//!   capabilities); a bundle whose intent has no agent is a warning, not an
//!   error.

use crate::morgana::history_reducer::HistoryReducer;
use crate::morgana::prompts::{IntentCatalog, OTHER_INTENT};
use crate::morgana::tool_protocol::{ToolBundle, ToolError};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Everything needed to build the agent for one intent: domain
/// specialization is a strategy (prompt id + optional reducer + the tool
/// bundle looked up separately), not a subtype.
#[derive(Clone)]
pub struct AgentBlueprint {
    /// Intent this agent handles; lowercase, never `"other"`.
    pub intent: String,
    /// Prompt id resolved through the prompt store / intent catalog.
    pub prompt_id: String,
    /// Display label override; falls back to the catalog's intent label.
    pub display_label: Option<String>,
    /// Optional view reducer for the message list sent to the LLM.
    pub reducer: Option<Arc<dyn HistoryReducer>>,
}

impl AgentBlueprint {
    /// Blueprint whose prompt id equals the intent name (the common case).
    pub fn new(intent: impl Into<String>) -> Self {
        let intent = intent.into().to_lowercase();
        Self {
            prompt_id: intent.clone(),
            intent,
            display_label: None,
            reducer: None,
        }
    }

    /// Override the prompt id (builder pattern).
    pub fn with_prompt_id(mut self, prompt_id: impl Into<String>) -> Self {
        self.prompt_id = prompt_id.into();
        self
    }

    /// Override the display label (builder pattern).
    pub fn with_display_label(mut self, label: impl Into<String>) -> Self {
        self.display_label = Some(label.into());
        self
    }

    /// Attach a history view reducer (builder pattern).
    pub fn with_reducer(mut self, reducer: Arc<dyn HistoryReducer>) -> Self {
        self.reducer = Some(reducer);
        self
    }
}

/// Errors raised by registration and startup validation. All fatal: the
/// process refuses to start on any of them.
#[derive(Debug)]
pub enum RegistryError {
    /// A configured intent has no registered agent.
    UnhandledIntent { intent: String },
    /// A registered agent's intent is not in the configuration.
    UnknownAgentIntent { intent: String },
    /// Two agents registered for the same intent.
    DuplicateAgent { intent: String },
    /// Two tool bundles registered for the same intent.
    DuplicateToolBundle { intent: String },
    /// Something tried to register for the reserved `"other"` intent.
    ReservedIntent,
    /// A declared tool failed validation against its handlers.
    Tool(ToolError),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::UnhandledIntent { intent } => {
                write!(f, "configured intent '{}' has no registered agent", intent)
            }
            RegistryError::UnknownAgentIntent { intent } => write!(
                f,
                "agent registered for intent '{}' which is not configured",
                intent
            ),
            RegistryError::DuplicateAgent { intent } => {
                write!(f, "duplicate agent registration for intent '{}'", intent)
            }
            RegistryError::DuplicateToolBundle { intent } => {
                write!(f, "duplicate tool bundle for intent '{}'", intent)
            }
            RegistryError::ReservedIntent => write!(
                f,
                "the reserved intent '{}' cannot have a registered handler",
                OTHER_INTENT
            ),
            RegistryError::Tool(e) => write!(f, "tool validation failed: {}", e),
        }
    }
}

impl Error for RegistryError {}

impl From<ToolError> for RegistryError {
    fn from(e: ToolError) -> Self {
        RegistryError::Tool(e)
    }
}

/// Intent → agent blueprint table.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    by_intent: HashMap<String, AgentBlueprint>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a blueprint. Duplicate intents and the reserved `"other"`
    /// intent are rejected.
    pub fn register(&mut self, blueprint: AgentBlueprint) -> Result<(), RegistryError> {
        let intent = blueprint.intent.to_lowercase();
        if intent == OTHER_INTENT {
            return Err(RegistryError::ReservedIntent);
        }
        if self.by_intent.contains_key(&intent) {
            return Err(RegistryError::DuplicateAgent { intent });
        }
        self.by_intent.insert(intent, blueprint);
        Ok(())
    }

    /// Look up a blueprint by (case-insensitive) intent.
    pub fn get(&self, intent: &str) -> Option<&AgentBlueprint> {
        self.by_intent.get(&intent.to_lowercase())
    }

    /// All registered intents, sorted for deterministic iteration.
    pub fn intents(&self) -> Vec<String> {
        let mut intents: Vec<String> = self.by_intent.keys().cloned().collect();
        intents.sort();
        intents
    }

    pub fn len(&self) -> usize {
        self.by_intent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_intent.is_empty()
    }
}

/// Intent → domain tool bundle table.
#[derive(Clone, Default)]
pub struct DomainToolRegistry {
    by_intent: HashMap<String, ToolBundle>,
}

impl DomainToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a bundle. At most one bundle per intent.
    pub fn register(&mut self, bundle: ToolBundle) -> Result<(), RegistryError> {
        let intent = bundle.intent.to_lowercase();
        if intent == OTHER_INTENT {
            return Err(RegistryError::ReservedIntent);
        }
        if self.by_intent.contains_key(&intent) {
            return Err(RegistryError::DuplicateToolBundle { intent });
        }
        self.by_intent.insert(intent, bundle);
        Ok(())
    }

    /// Look up a bundle by (case-insensitive) intent.
    pub fn get(&self, intent: &str) -> Option<&ToolBundle> {
        self.by_intent.get(&intent.to_lowercase())
    }

    /// All intents with a bundle.
    pub fn intents(&self) -> Vec<String> {
        let mut intents: Vec<String> = self.by_intent.keys().cloned().collect();
        intents.sort();
        intents
    }
}

/// Bidirectional startup validation.
///
/// Fails iff the symmetric difference of `configured intents` and
/// `registered agent intents` is non-empty. Surplus tool bundles (bundle
/// without an agent) produce a warning only.
pub fn validate_registries(
    catalog: &IntentCatalog,
    agents: &AgentRegistry,
    tools: &DomainToolRegistry,
) -> Result<(), RegistryError> {
    for intent in catalog.intents() {
        if agents.get(&intent.name).is_none() {
            return Err(RegistryError::UnhandledIntent {
                intent: intent.name.clone(),
            });
        }
    }
    for intent in agents.intents() {
        if catalog.find(&intent).is_none() {
            return Err(RegistryError::UnknownAgentIntent { intent });
        }
    }
    for intent in tools.intents() {
        if agents.get(&intent).is_none() {
            log::warn!(
                "tool bundle registered for intent '{}' which has no agent; bundle will be unused",
                intent
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::morgana::prompts::IntentDefinition;

    fn catalog(names: &[&str]) -> IntentCatalog {
        IntentCatalog::from_definitions(
            names
                .iter()
                .map(|n| IntentDefinition {
                    name: n.to_string(),
                    description: String::new(),
                    label: None,
                    default_value: None,
                })
                .collect(),
            Vec::new(),
        )
    }

    #[test]
    fn test_registration_is_case_insensitive_and_unique() {
        let mut registry = AgentRegistry::new();
        registry.register(AgentBlueprint::new("Billing")).unwrap();
        assert!(registry.get("BILLING").is_some());

        let err = registry.register(AgentBlueprint::new("billing")).unwrap_err();
        match err {
            RegistryError::DuplicateAgent { intent } => assert_eq!(intent, "billing"),
            other => panic!("unexpected: {}", other),
        }
    }

    #[test]
    fn test_other_is_not_registrable() {
        let mut registry = AgentRegistry::new();
        assert!(matches!(
            registry.register(AgentBlueprint::new("other")),
            Err(RegistryError::ReservedIntent)
        ));
    }

    #[test]
    fn test_validation_fails_on_unhandled_intent() {
        let mut agents = AgentRegistry::new();
        agents.register(AgentBlueprint::new("billing")).unwrap();

        let err = validate_registries(
            &catalog(&["billing", "contracts"]),
            &agents,
            &DomainToolRegistry::new(),
        )
        .unwrap_err();
        match err {
            RegistryError::UnhandledIntent { intent } => assert_eq!(intent, "contracts"),
            other => panic!("unexpected: {}", other),
        }
    }

    #[test]
    fn test_validation_fails_on_unknown_agent_intent() {
        let mut agents = AgentRegistry::new();
        agents.register(AgentBlueprint::new("billing")).unwrap();
        agents.register(AgentBlueprint::new("legacy")).unwrap();

        let err = validate_registries(&catalog(&["billing"]), &agents, &DomainToolRegistry::new())
            .unwrap_err();
        match err {
            RegistryError::UnknownAgentIntent { intent } => assert_eq!(intent, "legacy"),
            other => panic!("unexpected: {}", other),
        }
    }

    #[test]
    fn test_validation_passes_on_exact_symmetry() {
        let mut agents = AgentRegistry::new();
        agents.register(AgentBlueprint::new("billing")).unwrap();
        agents.register(AgentBlueprint::new("contracts")).unwrap();

        assert!(validate_registries(
            &catalog(&["billing", "contracts"]),
            &agents,
            &DomainToolRegistry::new()
        )
        .is_ok());
    }

    #[test]
    fn test_surplus_tool_bundle_is_non_fatal() {
        let mut agents = AgentRegistry::new();
        agents.register(AgentBlueprint::new("billing")).unwrap();

        let mut tools = DomainToolRegistry::new();
        tools
            .register(ToolBundle {
                intent: "orphan".to_string(),
                definitions: Vec::new(),
                handlers: Vec::new(),
            })
            .unwrap();

        assert!(validate_registries(&catalog(&["billing"]), &agents, &tools).is_ok());
    }
}
