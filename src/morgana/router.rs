//! The per-conversation router: intent → agent dispatch and the broadcast bus.
//!
//! On startup the router materializes one lazy slot per registered intent.
//! Agents are created on first reference — a dispatch *or* a broadcast counts
//! as a reference, so a shared value written before an agent's first turn
//! still reaches it (it lands in the agent's pending-merge queue).
//!
//! Dispatch contract: a request without a classification, or whose intent has
//! no slot (including the reserved `"other"`), is answered directly with a
//! deterministic error template and `is_completed = true`; the supervisor
//! treats it like any terminal response. Dispatched turns carry a 60 s
//! deadline, enforced by a spawned correlation task so the router's mailbox
//! keeps draining (broadcasts must flow while a turn is in flight).
//!
//! The broadcast bus is fire-and-forget: updates are forwarded to every slot
//! except the source, in arrival order, with no acknowledgement.

use crate::morgana::agent::{
    AgentHandle, AgentRequest, AgentResponse, AgentRuntime, AgentSpec, AgentStreamChunk,
};
use crate::morgana::context::ContextUpdate;
use crate::morgana::manager::RuntimeDeps;
use crate::morgana::prompts::{keys, render_template, Prompt};
use crate::morgana::tool_protocol::{ToolMetadata, ToolSet};
use crate::morgana::tools::framework_tools;
use crate::morgana::session::AgentIdentifier;
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Deadline for one router → agent dispatch.
pub const DISPATCH_TIMEOUT: Duration = Duration::from_secs(60);

enum RouterMsg {
    Dispatch {
        request: AgentRequest,
        chunk_tx: mpsc::UnboundedSender<AgentStreamChunk>,
        reply: oneshot::Sender<AgentResponse>,
    },
    Broadcast(ContextUpdate),
    Restore {
        intent: String,
        reply: oneshot::Sender<Option<AgentHandle>>,
    },
    Shutdown,
}

/// Cheap, cloneable address of a conversation's router actor.
#[derive(Clone)]
pub struct RouterHandle {
    tx: mpsc::UnboundedSender<RouterMsg>,
}

impl RouterHandle {
    /// Route a classified request. The terminal [`AgentResponse`] arrives on
    /// the returned receiver; streaming deltas on `chunk_tx`.
    pub fn dispatch(
        &self,
        request: AgentRequest,
        chunk_tx: mpsc::UnboundedSender<AgentStreamChunk>,
    ) -> oneshot::Receiver<AgentResponse> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(RouterMsg::Dispatch {
            request,
            chunk_tx,
            reply: reply_tx,
        });
        reply_rx
    }

    /// Publish a shared-context update onto the bus. Fire-and-forget.
    pub fn broadcast(&self, update: ContextUpdate) {
        let _ = self.tx.send(RouterMsg::Broadcast(update));
    }

    /// Rebind the agent for `intent` (supervisor resume). `None` means the
    /// agent could not be rebuilt and the caller should clear its sticky
    /// state.
    pub async fn restore_agent(&self, intent: &str) -> Option<AgentHandle> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(RouterMsg::Restore {
                intent: intent.to_string(),
                reply: reply_tx,
            })
            .is_err()
        {
            return None;
        }
        reply_rx.await.unwrap_or(None)
    }

    /// Stop the router and every agent under it.
    pub fn shutdown(&self) {
        let _ = self.tx.send(RouterMsg::Shutdown);
    }
}

/// The actor state behind a [`RouterHandle`].
pub struct Router {
    conversation_id: String,
    deps: Arc<RuntimeDeps>,
    /// One slot per registered intent; `None` until first reference.
    slots: HashMap<String, Option<AgentHandle>>,
    /// The router's own address, handed to agents for broadcasting.
    self_tx: mpsc::UnboundedSender<RouterMsg>,
}

impl Router {
    /// Spawn the router actor for one conversation.
    pub fn spawn(conversation_id: String, deps: Arc<RuntimeDeps>) -> RouterHandle {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = RouterHandle { tx: tx.clone() };

        let mut slots = HashMap::new();
        for intent in deps.agents.intents() {
            slots.insert(intent, None);
        }

        let mut router = Router {
            conversation_id,
            deps,
            slots,
            self_tx: tx,
        };

        tokio::spawn(async move {
            let idle = Duration::from_secs(router.deps.config.idle_receive_timeout_secs);
            loop {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(RouterMsg::Dispatch { request, chunk_tx, reply }) => {
                            router.handle_dispatch(request, chunk_tx, reply);
                        }
                        Some(RouterMsg::Broadcast(update)) => {
                            router.handle_broadcast(update);
                        }
                        Some(RouterMsg::Restore { intent, reply }) => {
                            let _ = reply.send(router.agent_for(&intent));
                        }
                        Some(RouterMsg::Shutdown) | None => {
                            for handle in router.slots.values().flatten() {
                                handle.shutdown();
                            }
                            log::debug!("router stopped: conversation={}", router.conversation_id);
                            break;
                        }
                    },
                    _ = tokio::time::sleep(idle) => {
                        log::trace!("router idle: conversation={}", router.conversation_id);
                    }
                }
            }
        });

        handle
    }

    fn handle_dispatch(
        &mut self,
        request: AgentRequest,
        chunk_tx: mpsc::UnboundedSender<AgentStreamChunk>,
        reply: oneshot::Sender<AgentResponse>,
    ) {
        let framework = self.deps.framework_prompt.clone();

        let intent = match &request.classification {
            None => {
                let _ = reply.send(terminal(framework.template(keys::MISSING_CLASSIFICATION_ERROR)));
                return;
            }
            Some(classification) => classification.intent.clone(),
        };

        if !self.slots.contains_key(&intent) {
            // Covers both unknown intents and the reserved "other" fallback:
            // the graceful refusal is this deterministic template.
            log::info!(
                "no agent for intent '{}' in conversation {}",
                intent,
                self.conversation_id
            );
            let _ = reply.send(terminal(framework.template(keys::UNRECOGNIZED_INTENT_ERROR)));
            return;
        }

        let handle = match self.agent_for(&intent) {
            Some(handle) => handle,
            None => {
                let _ = reply.send(terminal(framework.template(keys::UNRECOGNIZED_INTENT_ERROR)));
                return;
            }
        };

        let dispatch_error = render_template(
            &framework.template(keys::LLM_SERVICE_ERROR),
            &[("llm_error", "agent dispatch timed out")],
        );
        let turn_rx = handle.execute_turn(request, chunk_tx);

        // The deadline runs in its own task so the router mailbox keeps
        // draining while the agent works.
        tokio::spawn(async move {
            match tokio::time::timeout(DISPATCH_TIMEOUT, turn_rx).await {
                Ok(Ok(response)) => {
                    let _ = reply.send(response);
                }
                Ok(Err(_)) | Err(_) => {
                    let _ = reply.send(terminal(dispatch_error));
                }
            }
        });
    }

    fn handle_broadcast(&mut self, update: ContextUpdate) {
        let recipients: Vec<String> = self
            .slots
            .keys()
            .filter(|intent| **intent != update.source_intent)
            .cloned()
            .collect();

        for intent in recipients {
            // A broadcast is a reference: materialize the slot so the value
            // waits in the agent's merge queue.
            if let Some(handle) = self.agent_for(&intent) {
                handle.receive_context_update(update.clone());
            }
        }
    }

    /// Get or lazily create the agent for an intent. `None` when the intent
    /// has no slot or the agent cannot be built.
    fn agent_for(&mut self, intent: &str) -> Option<AgentHandle> {
        match self.slots.get(intent) {
            Some(Some(handle)) => Some(handle.clone()),
            Some(None) => match self.build_agent(intent) {
                Ok(handle) => {
                    self.slots.insert(intent.to_string(), Some(handle.clone()));
                    Some(handle)
                }
                Err(e) => {
                    log::error!(
                        "failed to build agent for intent '{}' in conversation {}: {}",
                        intent,
                        self.conversation_id,
                        e
                    );
                    None
                }
            },
            None => None,
        }
    }

    fn build_agent(&self, intent: &str) -> Result<AgentHandle, Box<dyn Error + Send + Sync>> {
        let deps = &self.deps;
        let blueprint = deps
            .agents
            .get(intent)
            .ok_or_else(|| format!("no blueprint for intent '{}'", intent))?;

        // Agent prompt: the prompt store wins, the intent catalog's agents
        // section is the fallback.
        let agent_prompt = deps
            .prompt_store
            .resolve(&blueprint.prompt_id)
            .or_else(|| deps.catalog.agent_prompt(&blueprint.prompt_id).cloned())
            .unwrap_or_else(|| {
                log::warn!(
                    "no prompt found for '{}'; agent runs with an empty instruction set",
                    blueprint.prompt_id
                );
                Prompt::new(blueprint.prompt_id.clone(), "")
            });

        let framework = &deps.framework_prompt;
        let bundle = deps.tools.get(intent);

        // Declared tools come from the agent prompt's Tools property; a
        // bundle that self-describes is the fallback.
        let declared: Vec<ToolMetadata> = match agent_prompt.property(keys::TOOLS) {
            Some(value) => serde_json::from_value(value.clone())?,
            None => bundle.map(|b| b.definitions.clone()).unwrap_or_default(),
        };

        let tool_set = ToolSet::build(
            framework_tools(),
            declared,
            bundle,
            framework.template(keys::TOOL_PARAMETER_CONTEXT_GUIDANCE),
            framework.template(keys::TOOL_PARAMETER_REQUEST_GUIDANCE),
        )?;

        let mut system_prompt = agent_prompt.instructions.clone();
        if let Some(personality) = &agent_prompt.personality {
            system_prompt.push_str("\n\n");
            system_prompt.push_str(personality);
        }
        if let Some(policies) = framework.property_str(keys::GLOBAL_POLICIES) {
            system_prompt.push_str("\n\n");
            system_prompt.push_str(policies);
        }

        let label = blueprint
            .display_label
            .clone()
            .or_else(|| deps.catalog.find(intent).and_then(|i| i.label.clone()));
        let display_name = match label {
            Some(label) => format!("{} ({})", crate::morgana::prompts::ASSISTANT_NAME, label),
            None => crate::morgana::prompts::ASSISTANT_NAME.to_string(),
        };

        let spec = AgentSpec {
            identifier: AgentIdentifier::new(intent, self.conversation_id.clone()),
            display_name,
            system_prompt,
            tool_set: Arc::new(tool_set),
            reducer: blueprint.reducer.clone(),
            error_answer: framework.template(keys::ERROR_ANSWERS),
            streaming_enabled: deps.config.streaming.enabled,
        };

        let bus = self.self_tx.clone();
        let handle = AgentRuntime::spawn(
            spec,
            Arc::clone(&deps.client),
            Arc::clone(&deps.store),
            Arc::new(move |update| {
                let _ = bus.send(RouterMsg::Broadcast(update));
            }),
            Duration::from_secs(deps.config.idle_receive_timeout_secs),
        );

        log::info!(
            "agent created: intent={} conversation={}",
            intent,
            self.conversation_id
        );
        Ok(handle)
    }
}

fn terminal(text: String) -> AgentResponse {
    AgentResponse {
        response_text: text,
        is_completed: true,
        quick_replies: None,
        rich_card: None,
    }
}
