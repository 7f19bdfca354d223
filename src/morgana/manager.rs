//! The process-global conversation manager and the runtime builder.
//!
//! [`MorganaRuntime::builder`] is the explicit registration point the
//! original design's reflection scan collapses into: embedders hand over the
//! collaborators (LLM client, prompt store, push channel, session store,
//! rate limiter), register agent blueprints and tool bundles per intent, and
//! `build()` performs the fatal startup validation — registry symmetry,
//! duplicate detection, tool/handler shape checks — before any actor starts.
//! Prompt and configuration loading happen here, in the init phase; actor
//! construction performs no I/O.
//!
//! [`ConversationManager`] owns the set of live conversations. A supervisor
//! subtree is created lazily on the first message for a conversation id, rate
//! limiting is enforced *before* supervisor dispatch, and dead supervisors
//! (idle-stopped or terminated) are pruned and recreated on demand — the
//! recreate path resumes sticky state from persistence.

use crate::morgana::agent::TurnTrace;
use crate::morgana::client_wrapper::ClientWrapper;
use crate::morgana::config::MorganaConfig;
use crate::morgana::persistence::{FileSessionStore, InMemorySessionStore, SessionStore};
use crate::morgana::prompts::{
    IntentCatalog, Prompt, PromptStore, StaticPromptStore, FRAMEWORK_PROMPT_ID,
};
use crate::morgana::push_channel::PushChannel;
use crate::morgana::rate_limit::{
    window_message, InMemoryRateLimiter, NoopRateLimiter, RateLimiter,
};
use crate::morgana::registry::{
    validate_registries, AgentBlueprint, AgentRegistry, DomainToolRegistry, RegistryError,
};
use crate::morgana::supervisor::{Supervisor, SupervisorHandle, UserMessage};
use crate::morgana::tool_protocol::{validate_tools, ToolBundle};
use chrono::Utc;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Immutable collaborators and configuration shared by every actor in the
/// process. Built once by the runtime builder, then only read.
pub struct RuntimeDeps {
    pub client: Arc<dyn ClientWrapper>,
    pub prompt_store: Arc<dyn PromptStore>,
    pub push: Arc<dyn PushChannel>,
    pub store: Arc<dyn SessionStore>,
    pub catalog: Arc<IntentCatalog>,
    pub agents: Arc<AgentRegistry>,
    pub tools: Arc<DomainToolRegistry>,
    /// The resolved framework prompt (templates, guidance texts, policies).
    pub framework_prompt: Prompt,
    pub config: MorganaConfig,
}

/// Why the runtime refused to start.
#[derive(Debug)]
pub enum BuildError {
    MissingClient,
    MissingPushChannel,
    Registry(RegistryError),
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::MissingClient => write!(f, "no LLM client configured"),
            BuildError::MissingPushChannel => write!(f, "no push channel configured"),
            BuildError::Registry(e) => write!(f, "startup validation failed: {}", e),
        }
    }
}

impl Error for BuildError {}

impl From<RegistryError> for BuildError {
    fn from(e: RegistryError) -> Self {
        BuildError::Registry(e)
    }
}

/// Entry point for assembling a Morgana runtime.
pub struct MorganaRuntime;

impl MorganaRuntime {
    /// Start the explicit registration phase.
    pub fn builder() -> MorganaRuntimeBuilder {
        MorganaRuntimeBuilder::new()
    }
}

/// Collects collaborators and registrations, then validates and builds the
/// [`ConversationManager`].
pub struct MorganaRuntimeBuilder {
    client: Option<Arc<dyn ClientWrapper>>,
    prompt_store: Option<Arc<dyn PromptStore>>,
    push: Option<Arc<dyn PushChannel>>,
    store: Option<Arc<dyn SessionStore>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    catalog: IntentCatalog,
    agents: AgentRegistry,
    tools: DomainToolRegistry,
    config: MorganaConfig,
}

impl Default for MorganaRuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MorganaRuntimeBuilder {
    pub fn new() -> Self {
        Self {
            client: None,
            prompt_store: None,
            push: None,
            store: None,
            rate_limiter: None,
            catalog: IntentCatalog::default(),
            agents: AgentRegistry::new(),
            tools: DomainToolRegistry::new(),
            config: MorganaConfig::default(),
        }
    }

    /// The LLM client every adapter calls through. Required.
    pub fn with_client(mut self, client: Arc<dyn ClientWrapper>) -> Self {
        self.client = Some(client);
        self
    }

    /// The prompt store. Defaults to an empty static store (built-in
    /// defaults then apply everywhere).
    pub fn with_prompt_store(mut self, store: Arc<dyn PromptStore>) -> Self {
        self.prompt_store = Some(store);
        self
    }

    /// The outbound push channel. Required.
    pub fn with_push_channel(mut self, push: Arc<dyn PushChannel>) -> Self {
        self.push = Some(push);
        self
    }

    /// The session store. Defaults to the file store when a storage path is
    /// configured, the in-memory store otherwise.
    pub fn with_session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the rate limiter (e.g. a shared-store implementation).
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// The parsed intent configuration document.
    pub fn with_catalog(mut self, catalog: IntentCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Runtime configuration.
    pub fn with_config(mut self, config: MorganaConfig) -> Self {
        self.config = config;
        self
    }

    /// Register the agent blueprint for one intent.
    pub fn register_agent(mut self, blueprint: AgentBlueprint) -> Result<Self, RegistryError> {
        self.agents.register(blueprint)?;
        Ok(self)
    }

    /// Register the domain tool bundle for one intent.
    pub fn register_tool_bundle(mut self, bundle: ToolBundle) -> Result<Self, RegistryError> {
        self.tools.register(bundle)?;
        Ok(self)
    }

    /// Validate everything and build the manager. Any validation failure is
    /// fatal: the process refuses to start.
    pub fn build(self) -> Result<ConversationManager, BuildError> {
        let client = self.client.ok_or(BuildError::MissingClient)?;
        let push = self.push.ok_or(BuildError::MissingPushChannel)?;

        validate_registries(&self.catalog, &self.agents, &self.tools)?;

        // Tool bundle shape problems are startup errors too, not first-turn
        // surprises.
        for intent in self.tools.intents() {
            if let Some(bundle) = self.tools.get(&intent) {
                validate_tools(&bundle.definitions, &bundle.handlers)
                    .map_err(RegistryError::from)?;
            }
        }

        let prompt_store: Arc<dyn PromptStore> = self
            .prompt_store
            .unwrap_or_else(|| Arc::new(StaticPromptStore::new()));

        let framework_prompt = prompt_store
            .resolve(FRAMEWORK_PROMPT_ID)
            .unwrap_or_else(|| Prompt::new(FRAMEWORK_PROMPT_ID, ""));

        let store: Arc<dyn SessionStore> = match self.store {
            Some(store) => store,
            None => match &self.config.persistence.storage_path {
                Some(path) => Arc::new(FileSessionStore::new(path.clone())),
                None => Arc::new(InMemorySessionStore::new()),
            },
        };

        let rate_limiter: Arc<dyn RateLimiter> = match self.rate_limiter {
            Some(limiter) => limiter,
            None if self.config.rate_limiting.enabled => Arc::new(InMemoryRateLimiter::new(
                self.config.rate_limiting.clone(),
            )),
            None => Arc::new(NoopRateLimiter),
        };

        log::info!(
            "runtime validated: {} intent(s), {} tool bundle(s)",
            self.agents.len(),
            self.tools.intents().len()
        );

        let deps = Arc::new(RuntimeDeps {
            client,
            prompt_store,
            push,
            store,
            catalog: Arc::new(self.catalog),
            agents: Arc::new(self.agents),
            tools: Arc::new(self.tools),
            framework_prompt,
            config: self.config,
        });

        Ok(ConversationManager {
            deps,
            rate_limiter,
            supervisors: RwLock::new(HashMap::new()),
        })
    }
}

/// Process-global owner of the live conversation set.
pub struct ConversationManager {
    deps: Arc<RuntimeDeps>,
    rate_limiter: Arc<dyn RateLimiter>,
    supervisors: RwLock<HashMap<String, SupervisorHandle>>,
}

impl ConversationManager {
    /// Create (or revive) a conversation, optionally seeding client-provided
    /// context, and fire the one-shot presentation trigger.
    pub async fn create_conversation(
        &self,
        conversation_id: &str,
        initial_context: Option<HashMap<String, serde_json::Value>>,
    ) {
        let supervisor = self.supervisor_for(conversation_id).await;
        if let Some(values) = initial_context {
            if !values.is_empty() {
                supervisor.seed_context(values);
            }
        }
        supervisor.generate_presentation();
    }

    /// Process one user message: rate limit, then hand the turn to the
    /// conversation's supervisor.
    pub async fn handle_message(
        &self,
        conversation_id: &str,
        text: &str,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let decision = self.rate_limiter.check_and_record(conversation_id).await;
        if !decision.allowed {
            let message = decision
                .violated_window
                .map(|window| window_message(&self.deps.config.rate_limiting, window))
                .unwrap_or_else(|| {
                    "Message rate limit reached. Please try again later.".to_string()
                });
            self.deps
                .push
                .send_plain(conversation_id, &message, Some("rate_limited"))
                .await?;
            return Ok(());
        }

        let message = UserMessage {
            conversation_id: conversation_id.to_string(),
            text: text.to_string(),
            timestamp: Utc::now(),
            trace: TurnTrace::new(),
        };

        let supervisor = self.supervisor_for(conversation_id).await;
        if !supervisor.handle_message(message.clone()) {
            // The supervisor idled out between lookup and send; recreate it
            // (resume path) and retry once.
            self.supervisors.write().await.remove(conversation_id);
            let supervisor = self.supervisor_for(conversation_id).await;
            if !supervisor.handle_message(message) {
                return Err("supervisor unavailable".into());
            }
        }
        Ok(())
    }

    /// Explicit teardown of one conversation subtree.
    pub async fn terminate_conversation(&self, conversation_id: &str) {
        if let Some(supervisor) = self.supervisors.write().await.remove(conversation_id) {
            supervisor.terminate();
            log::info!("conversation torn down: {}", conversation_id);
        }
    }

    /// Number of live conversations (diagnostics and tests).
    pub async fn conversation_count(&self) -> usize {
        self.supervisors.read().await.len()
    }

    /// Get-or-create the supervisor for a conversation id, pruning a dead
    /// handle if one is found.
    async fn supervisor_for(&self, conversation_id: &str) -> SupervisorHandle {
        {
            let supervisors = self.supervisors.read().await;
            if let Some(handle) = supervisors.get(conversation_id) {
                if handle.is_alive() {
                    return handle.clone();
                }
            }
        }

        let mut supervisors = self.supervisors.write().await;
        // Double-checked: another task may have created it meanwhile.
        if let Some(handle) = supervisors.get(conversation_id) {
            if handle.is_alive() {
                return handle.clone();
            }
        }

        log::info!("conversation created: {}", conversation_id);
        let handle = Supervisor::spawn(conversation_id.to_string(), Arc::clone(&self.deps));
        supervisors.insert(conversation_id.to_string(), handle.clone());
        handle
    }
}
