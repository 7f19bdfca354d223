//! The per-conversation supervisor: single owner of a turn.
//!
//! The supervisor is an actor whose mailbox serializes turn processing — at
//! most one turn is in flight per conversation, by construction. A turn walks
//! the finite-state machine:
//!
//! ```text
//! Idle ──user msg──▶ AwaitingGuard ──non-compliant──▶ push guard answer ──▶ Idle
//!                        │ compliant (or guard error: fail open)
//!                        ├── sticky agent ──▶ AwaitingFollowUp ─┐
//!                        └── otherwise ──▶ AwaitingClassification ──▶ AwaitingAgent ─┤
//!                                                                                    ▼
//!                                                  push response / timeout ──▶ Idle
//! ```
//!
//! Policies owned here:
//!
//! - **Fail open** on guard infrastructure errors (the guard itself never
//!   suppresses traffic).
//! - **Classifier downgrade**: a classifier failure becomes
//!   `intent = "other"` with the failure recorded in the metadata; the turn
//!   continues and the router's deterministic refusal answers it.
//! - **Sticky agent**: a terminal response with `is_completed = false` pins
//!   the agent; the next message bypasses classification and goes straight to
//!   it after the guard check. Any completed response or follow-up timeout
//!   clears the pin.
//! - **90 s agent deadline**, reset on every streaming chunk.
//! - **Presentation trigger**: one-shot and idempotent; falls back to a
//!   deterministic message + quick replies synthesized from the intent
//!   catalog when the model's JSON is unusable.
//!
//! Sticky state survives restarts: the supervisor persists a small resume
//! record through the session store and rebinds the sticky agent via the
//! router on startup (a failed rebind clears the pin).

use crate::morgana::agent::{
    AgentRequest, AgentResponse, AgentStreamChunk, TurnTrace,
};
use crate::morgana::classifier::{Classification, Classifier};
use crate::morgana::guard::Guard;
use crate::morgana::manager::RuntimeDeps;
use crate::morgana::prompts::{
    keys, render_template, Prompt, ASSISTANT_NAME, CLASSIFIER_PROMPT_ID, GUARD_PROMPT_ID,
    PRESENTATION_PROMPT_ID,
};
use crate::morgana::push_channel::{ConversationResponse, MessageType, QuickReply};
use crate::morgana::router::{Router, RouterHandle};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Deadline for one agent turn, reset on each streaming chunk.
pub const AGENT_TURN_TIMEOUT: Duration = Duration::from_secs(90);

/// Fixed answer pushed when an agent misses its deadline.
pub const TIMEOUT_MESSAGE: &str = "The assistant took too long to reply. Please try again.";

/// Entry value for a turn.
#[derive(Debug, Clone)]
pub struct UserMessage {
    pub conversation_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub trace: TurnTrace,
}

/// The supervisor's turn-processing states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    AwaitingGuard,
    AwaitingClassification,
    AwaitingAgent,
    AwaitingFollowUp,
}

/// The resume record persisted through the session store under
/// `"supervisor-{conversation_id}"`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SupervisorSnapshot {
    sticky_intent: Option<String>,
    presentation_done: bool,
}

enum SupervisorMsg {
    User(UserMessage),
    GeneratePresentation,
    SeedContext(HashMap<String, serde_json::Value>),
    Terminate,
}

/// Cheap, cloneable address of a conversation's supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::UnboundedSender<SupervisorMsg>,
}

impl SupervisorHandle {
    /// Enqueue a user message. Returns `false` when the supervisor is gone
    /// (the manager then recreates it and resumes from persistence).
    pub fn handle_message(&self, message: UserMessage) -> bool {
        self.tx.send(SupervisorMsg::User(message)).is_ok()
    }

    /// Fire the one-shot presentation trigger (idempotent).
    pub fn generate_presentation(&self) {
        let _ = self.tx.send(SupervisorMsg::GeneratePresentation);
    }

    /// Seed client-provided initial context; the values reach every agent
    /// through the broadcast bus under first-write-wins.
    pub fn seed_context(&self, values: HashMap<String, serde_json::Value>) {
        let _ = self.tx.send(SupervisorMsg::SeedContext(values));
    }

    /// Tear the conversation subtree down.
    pub fn terminate(&self) {
        let _ = self.tx.send(SupervisorMsg::Terminate);
    }

    /// Whether the actor behind this handle still accepts messages.
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// The actor state behind a [`SupervisorHandle`].
pub struct Supervisor {
    conversation_id: String,
    deps: Arc<RuntimeDeps>,
    router: RouterHandle,
    guard: Guard,
    classifier: Classifier,
    state: TurnState,
    sticky: Option<crate::morgana::agent::AgentHandle>,
    presentation_done: bool,
}

enum TurnOutcome {
    Response(AgentResponse),
    Timeout,
    Failed,
}

impl Supervisor {
    /// Spawn the supervisor and its child actors for one conversation.
    pub fn spawn(conversation_id: String, deps: Arc<RuntimeDeps>) -> SupervisorHandle {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = SupervisorHandle { tx };

        let router = Router::spawn(conversation_id.clone(), Arc::clone(&deps));

        let guard_prompt = deps
            .prompt_store
            .resolve(GUARD_PROMPT_ID)
            .unwrap_or_else(|| Prompt::new(GUARD_PROMPT_ID, default_guard_instructions()));
        let classifier_prompt = deps
            .prompt_store
            .resolve(CLASSIFIER_PROMPT_ID)
            .unwrap_or_else(|| Prompt::new(CLASSIFIER_PROMPT_ID, default_classifier_instructions()));

        let mut supervisor = Supervisor {
            guard: Guard::new(Arc::clone(&deps.client), guard_prompt),
            classifier: Classifier::new(
                Arc::clone(&deps.client),
                classifier_prompt,
                deps.catalog.intents().to_vec(),
            ),
            conversation_id,
            router,
            state: TurnState::Idle,
            sticky: None,
            presentation_done: false,
            deps,
        };

        tokio::spawn(async move {
            supervisor.resume().await;

            let idle_tick = Duration::from_secs(supervisor.deps.config.idle_receive_timeout_secs);
            let idle_limit = supervisor
                .deps
                .config
                .supervisor_idle_timeout_secs
                .map(Duration::from_secs);
            let mut last_activity = tokio::time::Instant::now();

            loop {
                tokio::select! {
                    msg = rx.recv() => {
                        last_activity = tokio::time::Instant::now();
                        match msg {
                            Some(SupervisorMsg::User(message)) => {
                                supervisor.process_turn(message).await;
                            }
                            Some(SupervisorMsg::GeneratePresentation) => {
                                supervisor.generate_presentation().await;
                            }
                            Some(SupervisorMsg::SeedContext(values)) => {
                                supervisor.router.broadcast(
                                    crate::morgana::context::ContextUpdate {
                                        source_intent: String::new(),
                                        updates: values.into_iter().collect(),
                                    },
                                );
                            }
                            Some(SupervisorMsg::Terminate) | None => {
                                supervisor.router.shutdown();
                                log::info!(
                                    "conversation terminated: {}",
                                    supervisor.conversation_id
                                );
                                break;
                            }
                        }
                    }
                    _ = tokio::time::sleep(idle_tick) => {
                        // Default idle handler is a no-op; only an explicit
                        // idle limit stops the subtree.
                        if let Some(limit) = idle_limit {
                            if supervisor.state == TurnState::Idle
                                && last_activity.elapsed() >= limit
                            {
                                supervisor.router.shutdown();
                                log::info!(
                                    "conversation idled out: {}",
                                    supervisor.conversation_id
                                );
                                break;
                            }
                        }
                    }
                }
            }
        });

        handle
    }

    /// Rebind sticky state from the persisted resume record, if any.
    async fn resume(&mut self) {
        let key = snapshot_key(&self.conversation_id);
        let snapshot = match self.deps.store.load(&key).await {
            Ok(Some(blob)) => match serde_json::from_slice::<SupervisorSnapshot>(&blob) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    log::warn!("unreadable supervisor record for {}: {}", self.conversation_id, e);
                    return;
                }
            },
            Ok(None) => return,
            Err(e) => {
                log::warn!("supervisor record load failed for {}: {}", self.conversation_id, e);
                return;
            }
        };

        self.presentation_done = snapshot.presentation_done;
        if let Some(intent) = snapshot.sticky_intent {
            match self.router.restore_agent(&intent).await {
                Some(handle) => {
                    log::info!(
                        "sticky agent restored: conversation={} intent={}",
                        self.conversation_id,
                        intent
                    );
                    self.sticky = Some(handle);
                }
                None => {
                    log::warn!(
                        "sticky agent for intent '{}' could not be rebuilt; clearing",
                        intent
                    );
                    self.persist_snapshot().await;
                }
            }
        }
    }

    async fn persist_snapshot(&self) {
        let snapshot = SupervisorSnapshot {
            sticky_intent: self.sticky.as_ref().map(|h| h.intent.clone()),
            presentation_done: self.presentation_done,
        };
        let key = snapshot_key(&self.conversation_id);
        match serde_json::to_vec(&snapshot) {
            Ok(blob) => {
                if let Err(e) = self.deps.store.save(&key, &blob).await {
                    log::warn!("supervisor record save failed for {}: {}", self.conversation_id, e);
                }
            }
            Err(e) => {
                log::warn!("supervisor record serialization failed: {}", e);
            }
        }
    }

    /// One full turn: guard → (sticky | classify) → route → push.
    async fn process_turn(&mut self, message: UserMessage) {
        let turn_id = message.trace.turn_id;
        log::debug!(
            "turn started: conversation={} turn={}",
            self.conversation_id,
            turn_id
        );

        // Guard check.
        self.state = TurnState::AwaitingGuard;
        match self.guard.check(&self.conversation_id, &message.text).await {
            Ok(verdict) if !verdict.compliant => {
                let violation = verdict.violation.unwrap_or_default();
                let answer = render_template(
                    &self.deps.framework_prompt.template(keys::GUARD_ANSWER),
                    &[("violation", violation.as_str())],
                );
                let _ = self
                    .deps
                    .push
                    .send_structured(
                        &self.conversation_id,
                        &answer,
                        MessageType::System,
                        None,
                        Some("guard_violation"),
                        Some(ASSISTANT_NAME),
                        true,
                    )
                    .await;
                self.state = TurnState::Idle;
                return;
            }
            Ok(_) => {}
            Err(e) => {
                // Fail open: moderation infrastructure trouble never blocks
                // the user; routing continues as if compliant.
                log::warn!(
                    "guard check failed (failing open): conversation={} error={}",
                    self.conversation_id,
                    e
                );
            }
        }

        // Routing: sticky bypass or classification.
        let (reply_rx, chunk_rx, classification) = if let Some(sticky) = self.sticky.clone() {
            self.state = TurnState::AwaitingFollowUp;
            let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
            let request = AgentRequest {
                text: message.text.clone(),
                classification: None,
                trace: message.trace.clone(),
            };
            (sticky.execute_turn(request, chunk_tx), chunk_rx, None)
        } else {
            self.state = TurnState::AwaitingClassification;
            let classification = match self
                .classifier
                .classify(&self.conversation_id, &message.text)
                .await
            {
                Ok(classification) => classification,
                Err(e) => {
                    log::warn!(
                        "classification failed, downgrading to fallback: conversation={} error={}",
                        self.conversation_id,
                        e
                    );
                    Classification::other_with_error(&e.to_string())
                }
            };

            self.state = TurnState::AwaitingAgent;
            let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
            let request = AgentRequest {
                text: message.text.clone(),
                classification: Some(classification.clone()),
                trace: message.trace.clone(),
            };
            (
                self.router.dispatch(request, chunk_tx),
                chunk_rx,
                Some(classification),
            )
        };

        let outcome = self.await_agent(reply_rx, chunk_rx).await;
        self.settle_turn(outcome, classification, message.timestamp).await;
        self.state = TurnState::Idle;
        log::debug!(
            "turn finished: conversation={} turn={}",
            self.conversation_id,
            turn_id
        );
    }

    /// Await the terminal response while forwarding streaming chunks; the
    /// deadline resets on every chunk.
    async fn await_agent(
        &self,
        mut reply_rx: tokio::sync::oneshot::Receiver<AgentResponse>,
        mut chunk_rx: mpsc::UnboundedReceiver<AgentStreamChunk>,
    ) -> TurnOutcome {
        let deadline = tokio::time::sleep(AGENT_TURN_TIMEOUT);
        tokio::pin!(deadline);
        let mut chunks_open = true;

        loop {
            tokio::select! {
                maybe_chunk = chunk_rx.recv(), if chunks_open => match maybe_chunk {
                    Some(chunk) => {
                        if let Err(e) = self
                            .deps
                            .push
                            .send_chunk(&self.conversation_id, &chunk.delta)
                            .await
                        {
                            log::warn!("chunk forwarding failed: {}", e);
                        }
                        deadline
                            .as_mut()
                            .reset(tokio::time::Instant::now() + AGENT_TURN_TIMEOUT);
                    }
                    None => chunks_open = false,
                },
                reply = &mut reply_rx => {
                    // The agent emits every chunk before its terminal reply;
                    // drain whatever is still queued so nothing is lost and
                    // order is preserved.
                    while let Ok(chunk) = chunk_rx.try_recv() {
                        if let Err(e) = self
                            .deps
                            .push
                            .send_chunk(&self.conversation_id, &chunk.delta)
                            .await
                        {
                            log::warn!("chunk forwarding failed: {}", e);
                        }
                    }
                    break match reply {
                        Ok(response) => TurnOutcome::Response(response),
                        Err(_) => TurnOutcome::Failed,
                    };
                }
                _ = &mut deadline => break TurnOutcome::Timeout,
            }
        }
    }

    /// Push the outcome and apply the sticky policy.
    async fn settle_turn(
        &mut self,
        outcome: TurnOutcome,
        classification: Option<Classification>,
        original_timestamp: DateTime<Utc>,
    ) {
        match outcome {
            TurnOutcome::Response(response) => {
                let intent = match (&self.sticky, &classification) {
                    (Some(sticky), _) => Some(sticky.intent.clone()),
                    (None, Some(classification)) => Some(classification.intent.clone()),
                    (None, None) => None,
                };
                let agent_name = self.display_name_for(intent.as_deref());

                let metadata = classification
                    .as_ref()
                    .filter(|c| !c.metadata.is_empty())
                    .map(|c| c.metadata.clone());

                let conversation_response = ConversationResponse {
                    response: response.response_text.clone(),
                    classification: classification.as_ref().map(|c| c.intent.clone()),
                    metadata,
                    agent_name: Some(agent_name),
                    agent_completed: response.is_completed,
                    quick_replies: response.quick_replies.clone(),
                    rich_card: response.rich_card.clone(),
                    original_timestamp: Some(original_timestamp),
                };
                if let Err(e) = self
                    .deps
                    .push
                    .send_response(&self.conversation_id, &conversation_response)
                    .await
                {
                    log::error!("response push failed: conversation={} error={}", self.conversation_id, e);
                }

                // Sticky policy: an incomplete terminal response pins its
                // agent, a completed one clears the pin.
                let sticky_before = self.sticky.as_ref().map(|h| h.intent.clone());
                if response.is_completed {
                    self.sticky = None;
                } else if self.sticky.is_none() {
                    if let Some(intent) = intent {
                        self.sticky = self.router.restore_agent(&intent).await;
                    }
                }
                let sticky_after = self.sticky.as_ref().map(|h| h.intent.clone());
                if sticky_before != sticky_after {
                    self.persist_snapshot().await;
                }
            }
            TurnOutcome::Timeout => {
                log::warn!("agent turn timed out: conversation={}", self.conversation_id);
                let _ = self
                    .deps
                    .push
                    .send_structured(
                        &self.conversation_id,
                        TIMEOUT_MESSAGE,
                        MessageType::Error,
                        None,
                        Some("agent_timeout"),
                        Some(ASSISTANT_NAME),
                        true,
                    )
                    .await;
                if self.sticky.take().is_some() {
                    self.persist_snapshot().await;
                }
            }
            TurnOutcome::Failed => {
                let answer = self.deps.framework_prompt.template(keys::ERROR_ANSWERS);
                let _ = self
                    .deps
                    .push
                    .send_structured(
                        &self.conversation_id,
                        &answer,
                        MessageType::Error,
                        None,
                        Some("agent_failure"),
                        Some(ASSISTANT_NAME),
                        true,
                    )
                    .await;
                if self.sticky.take().is_some() {
                    self.persist_snapshot().await;
                }
            }
        }
    }

    fn display_name_for(&self, intent: Option<&str>) -> String {
        intent
            .and_then(|i| self.deps.catalog.find(i))
            .and_then(|definition| definition.label.as_ref())
            .map(|label| format!("{} ({})", ASSISTANT_NAME, label))
            .unwrap_or_else(|| ASSISTANT_NAME.to_string())
    }

    /// One-shot presentation: only the first invocation takes effect.
    async fn generate_presentation(&mut self) {
        if self.presentation_done {
            return;
        }
        self.presentation_done = true;
        self.persist_snapshot().await;

        let prompt = self
            .deps
            .prompt_store
            .resolve(PRESENTATION_PROMPT_ID)
            .unwrap_or_else(|| Prompt::new(PRESENTATION_PROMPT_ID, default_presentation_instructions()));

        let displayable = self.deps.catalog.displayable();
        let intent_lines: Vec<String> = displayable
            .iter()
            .map(|i| format!("- {} ({})", i.label.as_deref().unwrap_or(&i.name), i.name))
            .collect();

        let (message, quick_replies) = match self
            .deps
            .client
            .complete(
                &prompt.instructions,
                &format!("Available intents:\n{}", intent_lines.join("\n")),
                &self.conversation_id,
            )
            .await
        {
            Ok(raw) => match parse_presentation(&raw) {
                Some(parsed) => parsed,
                None => {
                    log::warn!(
                        "presentation output unusable; using deterministic fallback: conversation={}",
                        self.conversation_id
                    );
                    self.fallback_presentation()
                }
            },
            Err(e) => {
                log::warn!(
                    "presentation call failed; using deterministic fallback: conversation={} error={}",
                    self.conversation_id,
                    e
                );
                self.fallback_presentation()
            }
        };

        let _ = self
            .deps
            .push
            .send_structured(
                &self.conversation_id,
                &message,
                MessageType::Presentation,
                Some(quick_replies),
                None,
                Some(ASSISTANT_NAME),
                false,
            )
            .await;
    }

    /// Deterministic presentation synthesized from the intent catalog.
    fn fallback_presentation(&self) -> (String, Vec<QuickReply>) {
        let displayable = self.deps.catalog.displayable();
        let labels: Vec<&str> = displayable
            .iter()
            .filter_map(|i| i.label.as_deref())
            .collect();
        let message = render_template(
            &self.deps.framework_prompt.template(keys::FALLBACK_MESSAGE),
            &[("intents", labels.join(", ").as_str())],
        );
        let replies = displayable
            .iter()
            .enumerate()
            .map(|(idx, intent)| QuickReply {
                id: (idx + 1).to_string(),
                label: intent.label.clone().unwrap_or_else(|| intent.name.clone()),
                value: intent
                    .default_value
                    .clone()
                    .unwrap_or_else(|| intent.name.clone()),
                termination: None,
            })
            .collect();
        (message, replies)
    }
}

fn snapshot_key(conversation_id: &str) -> String {
    format!("supervisor-{}", conversation_id)
}

/// The presentation payload shape produced by the model.
#[derive(Deserialize)]
struct PresentationPayload {
    message: String,
    #[serde(rename = "quickReplies", default)]
    quick_replies: Vec<QuickReply>,
}

fn parse_presentation(raw: &str) -> Option<(String, Vec<QuickReply>)> {
    let cleaned = crate::morgana::client_wrapper::clean_json_response(raw);
    let payload: PresentationPayload = serde_json::from_str(&cleaned).ok()?;
    if payload.message.is_empty() {
        return None;
    }
    Some((payload.message, payload.quick_replies))
}

fn default_guard_instructions() -> &'static str {
    "You are a content moderation filter. Answer with JSON: \
     {\"compliant\": true|false, \"violation\": \"<reason when non-compliant>\"}."
}

fn default_classifier_instructions() -> &'static str {
    "You classify a user message into exactly one of the known intents."
}

fn default_presentation_instructions() -> &'static str {
    "Introduce yourself and offer the available capabilities. Answer with JSON: \
     {\"message\": \"...\", \"quickReplies\": [{\"id\", \"label\", \"value\"}]}."
}
