//! The agent runtime: one actor per (intent, conversation).
//!
//! An agent owns its [`AgentSession`], invokes the LLM, analyzes the produced
//! text to decide turn completion, harvests ephemeral UI artifacts, and
//! persists the updated session. Domain specialization is a strategy (a
//! prompt id plus a tool bundle), not a subtype: every agent runs the same
//! [`AgentRuntime`].
//!
//! # Turn processing
//!
//! 1. Load the session from persistence (or create a fresh one); re-wire the
//!    shared-context broadcast hook (hooks are not serialized).
//! 2. Drain pending cross-agent merges, first-write-wins.
//! 3. Invoke the LLM, streaming (chunks forwarded to the supervisor as they
//!    arrive, time-to-first-chunk logged) or batch, looping over embedded
//!    `{"tool_call": …}` requests, each answered with a deterministic result
//!    string.
//! 4. Completion analysis: the turn is complete unless the text carries the
//!    `#INT#` sentinel (case-insensitive), ends with a question mark, or the
//!    session staged quick replies / a rich card this turn.
//! 5. Extract quick replies and rich card into the response and **drop** the
//!    reserved keys; they never persist.
//! 6. Persist the session (best-effort: failures are logged, the response
//!    still goes out).
//! 7. Strip the sentinel from the outgoing text in non-debug builds.
//!
//! Any failure inside the pipeline collapses to the generic error answer
//! with `is_completed = true`.

use crate::morgana::classifier::Classification;
use crate::morgana::client_wrapper::{ChatMessage, ClientWrapper, Role};
use crate::morgana::context::{ContextUpdate, QUICK_REPLIES_KEY, RICH_CARD_KEY};
use crate::morgana::history_reducer::HistoryReducer;
use crate::morgana::persistence::SessionStore;
use crate::morgana::push_channel::QuickReply;
use crate::morgana::session::{AgentIdentifier, AgentSession};
use crate::morgana::tool_protocol::{parse_tool_call, ToolContext, ToolSet};
use futures_util::StreamExt;
use std::error::Error;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// The literal completion sentinel. Its presence (case-insensitive) in a
/// response means the agent's interaction is not complete.
pub const COMPLETION_SENTINEL: &str = "#INT#";

/// Upper bound on tool-call round-trips within a single turn.
const MAX_TOOL_ITERATIONS: usize = 5;

/// Opaque telemetry context for one turn, threaded through child operations.
#[derive(Debug, Clone)]
pub struct TurnTrace {
    pub turn_id: Uuid,
}

impl TurnTrace {
    pub fn new() -> Self {
        Self {
            turn_id: Uuid::new_v4(),
        }
    }
}

impl Default for TurnTrace {
    fn default() -> Self {
        Self::new()
    }
}

/// A request routed to an agent for one turn.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub text: String,
    /// Absent on sticky follow-ups (classification was bypassed).
    pub classification: Option<Classification>,
    pub trace: TurnTrace,
}

/// One streaming delta forwarded supervisor-ward while a turn is in flight.
#[derive(Debug, Clone)]
pub struct AgentStreamChunk {
    pub conversation_id: String,
    pub delta: String,
}

/// Terminal result of one agent turn.
#[derive(Debug, Clone)]
pub struct AgentResponse {
    pub response_text: String,
    pub is_completed: bool,
    pub quick_replies: Option<Vec<QuickReply>>,
    pub rich_card: Option<serde_json::Value>,
}

impl AgentResponse {
    fn error(text: String) -> Self {
        Self {
            response_text: text,
            is_completed: true,
            quick_replies: None,
            rich_card: None,
        }
    }
}

/// Everything the router resolves before spawning an agent. Assembled from
/// the blueprint, the intent catalog, and the framework prompt during runtime
/// initialization; construction performs no I/O.
pub struct AgentSpec {
    pub identifier: AgentIdentifier,
    /// Display name pushed to clients, e.g. `"Morgana (Billing)"`.
    pub display_name: String,
    /// Fully assembled system prompt (instructions, personality, policies).
    pub system_prompt: String,
    /// Validated tool surface (framework + domain tools).
    pub tool_set: Arc<ToolSet>,
    /// Optional view reducer applied to the messages sent to the LLM.
    pub reducer: Option<Arc<dyn HistoryReducer>>,
    /// Generic error answer returned on any turn failure.
    pub error_answer: String,
    /// Whether to prefer the provider's streaming path.
    pub streaming_enabled: bool,
}

/// Callback publishing a shared-context write to the router's broadcast bus.
pub type BroadcastFn = Arc<dyn Fn(ContextUpdate) + Send + Sync>;

enum AgentMsg {
    ExecuteTurn {
        request: AgentRequest,
        chunk_tx: mpsc::UnboundedSender<AgentStreamChunk>,
        reply: oneshot::Sender<AgentResponse>,
    },
    ReceiveContextUpdate(ContextUpdate),
    Shutdown,
}

/// Cheap, cloneable address of a live agent actor.
#[derive(Clone)]
pub struct AgentHandle {
    tx: mpsc::UnboundedSender<AgentMsg>,
    pub intent: String,
    pub display_name: String,
}

impl AgentHandle {
    /// Send a turn to the agent. The response arrives on the returned
    /// receiver; streaming deltas on `chunk_tx` as they are produced.
    pub fn execute_turn(
        &self,
        request: AgentRequest,
        chunk_tx: mpsc::UnboundedSender<AgentStreamChunk>,
    ) -> oneshot::Receiver<AgentResponse> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(AgentMsg::ExecuteTurn {
            request,
            chunk_tx,
            reply: reply_tx,
        });
        reply_rx
    }

    /// Deliver a shared-context update from a sibling agent. Fire-and-forget.
    pub fn receive_context_update(&self, update: ContextUpdate) {
        let _ = self.tx.send(AgentMsg::ReceiveContextUpdate(update));
    }

    /// Ask the actor to stop after draining its mailbox.
    pub fn shutdown(&self) {
        let _ = self.tx.send(AgentMsg::Shutdown);
    }
}

/// The actor state behind an [`AgentHandle`].
pub struct AgentRuntime {
    spec: AgentSpec,
    client: Arc<dyn ClientWrapper>,
    store: Arc<dyn SessionStore>,
    broadcast: BroadcastFn,
    /// Session is created lazily on the first turn (or restored from the
    /// store); `None` until then.
    session: Option<AgentSession>,
    /// Updates that arrived before the session existed; transferred into the
    /// session's merge queue when it is created.
    early_updates: Vec<ContextUpdate>,
}

impl AgentRuntime {
    /// Spawn the agent actor and return its handle.
    pub fn spawn(
        spec: AgentSpec,
        client: Arc<dyn ClientWrapper>,
        store: Arc<dyn SessionStore>,
        broadcast: BroadcastFn,
        idle_timeout: Duration,
    ) -> AgentHandle {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = AgentHandle {
            tx,
            intent: spec.identifier.intent.clone(),
            display_name: spec.display_name.clone(),
        };

        let mut runtime = AgentRuntime {
            spec,
            client,
            store,
            broadcast,
            session: None,
            early_updates: Vec::new(),
        };

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(AgentMsg::ExecuteTurn { request, chunk_tx, reply }) => {
                            let response = runtime.execute_turn(request, &chunk_tx).await;
                            let _ = reply.send(response);
                        }
                        Some(AgentMsg::ReceiveContextUpdate(update)) => {
                            runtime.apply_context_update(update);
                        }
                        Some(AgentMsg::Shutdown) | None => {
                            log::debug!("agent stopped: {}", runtime.spec.identifier);
                            break;
                        }
                    },
                    _ = tokio::time::sleep(idle_timeout) => {
                        // Idle tick: the default handler is a no-op; agents
                        // legitimately stay alive between turns.
                        log::trace!("agent idle: {}", runtime.spec.identifier);
                    }
                }
            }
        });

        handle
    }

    fn apply_context_update(&mut self, update: ContextUpdate) {
        match self.session.as_mut() {
            Some(session) => {
                let accepted = session.context.merge(&update.updates);
                log::debug!(
                    "context update from '{}' merged into {}: {}/{} accepted",
                    update.source_intent,
                    self.spec.identifier,
                    accepted,
                    update.updates.len()
                );
            }
            None => {
                // No session yet; the update waits for step 2 of the first turn.
                self.early_updates.push(update);
            }
        }
    }

    async fn execute_turn(
        &mut self,
        request: AgentRequest,
        chunk_tx: &mpsc::UnboundedSender<AgentStreamChunk>,
    ) -> AgentResponse {
        let turn_id = request.trace.turn_id;
        match self.try_execute_turn(request, chunk_tx).await {
            Ok(response) => response,
            Err(e) => {
                log::error!(
                    "agent turn failed: agent={} turn={} error={}",
                    self.spec.identifier,
                    turn_id,
                    e
                );
                AgentResponse::error(self.spec.error_answer.clone())
            }
        }
    }

    async fn try_execute_turn(
        &mut self,
        request: AgentRequest,
        chunk_tx: &mpsc::UnboundedSender<AgentStreamChunk>,
    ) -> Result<AgentResponse, Box<dyn Error + Send + Sync>> {
        // Step 1: lazy session load/create + hook wiring.
        self.ensure_session().await?;

        // Step 2: drain queued merges ahead of the LLM call.
        let session = self.session.as_mut().ok_or("session missing after init")?;
        let accepted = session.drain_pending_merges();
        if accepted > 0 {
            log::debug!(
                "applied {} pending context value(s) to {}",
                accepted,
                self.spec.identifier
            );
        }

        if let Some(classification) = &request.classification {
            log::debug!(
                "agent {} handling intent '{}' (confidence {:.2})",
                self.spec.identifier,
                classification.intent,
                classification.confidence
            );
        }

        session.push_message(ChatMessage::new(Role::User, request.text.clone()));

        // Step 3: LLM invocation with the tool loop. The view sent to the
        // model is reduced lazily; the session keeps the full history.
        let mut view = {
            let session = self.session.as_ref().ok_or("session missing")?;
            self.render_view(session)
        };
        let tool_definitions = self.spec.tool_set.definitions_for_llm();
        let streaming = self.spec.streaming_enabled;

        let mut iterations = 0usize;
        let final_text = loop {
            let text = self
                .invoke_llm(&view, &tool_definitions, chunk_tx, streaming)
                .await?;

            let session = self.session.as_mut().ok_or("session missing")?;
            session.push_message(ChatMessage::new(Role::Assistant, text.clone()));
            view.push(ChatMessage::new(Role::Assistant, text.clone()));

            match parse_tool_call(&text) {
                Some(call) => {
                    if iterations >= MAX_TOOL_ITERATIONS {
                        log::warn!(
                            "agent {} hit the tool iteration cap",
                            self.spec.identifier
                        );
                        break format!("{}\n\n[Warning: Maximum tool iterations reached]", text);
                    }
                    iterations += 1;

                    let result = {
                        let mut ctx = ToolContext {
                            context: &mut session.context,
                            intent: &self.spec.identifier.intent,
                            conversation_id: &self.spec.identifier.conversation_id,
                        };
                        self.spec.tool_set.execute(&call.name, &call.parameters, &mut ctx)
                    };
                    log::debug!(
                        "tool '{}' executed for {} (iteration {})",
                        call.name,
                        self.spec.identifier,
                        iterations
                    );

                    let tool_message = format!("Tool '{}' result: {}", call.name, result);
                    session.push_message(ChatMessage::new(Role::Tool, tool_message.clone()));
                    view.push(ChatMessage::new(Role::Tool, tool_message));
                }
                None => break text,
            }
        };

        // Step 4: completion analysis reads the staged ephemeral keys
        // before they are dropped.
        let session = self.session.as_mut().ok_or("session missing")?;
        let is_completed = analyze_completion(&final_text, &session.context);

        // Step 5: harvest ephemerals into the response; drop the keys so they
        // never persist.
        let quick_replies = session
            .context
            .remove(QUICK_REPLIES_KEY)
            .and_then(|value| serde_json::from_value::<Vec<QuickReply>>(value).ok());
        let rich_card = session.context.remove(RICH_CARD_KEY);

        // Step 6: best-effort persistence.
        match session.to_blob() {
            Ok(blob) => {
                if let Err(e) = self.store.save(&self.spec.identifier.key(), &blob).await {
                    log::error!(
                        "session persistence failed for {}: {}",
                        self.spec.identifier,
                        e
                    );
                }
            }
            Err(e) => {
                log::error!(
                    "session serialization failed for {}: {}",
                    self.spec.identifier,
                    e
                );
            }
        }

        // Step 7: the sentinel is a protocol marker, not user content. Debug
        // builds forward it raw for diagnosis.
        let response_text = if cfg!(debug_assertions) {
            final_text
        } else {
            strip_sentinel(&final_text)
        };

        Ok(AgentResponse {
            response_text,
            is_completed,
            quick_replies,
            rich_card,
        })
    }

    /// Load or create the session, then (re-)wire the broadcast hook and move
    /// any early updates into the merge queue.
    async fn ensure_session(&mut self) -> Result<(), Box<dyn Error + Send + Sync>> {
        if self.session.is_none() {
            let key = self.spec.identifier.key();
            let mut session = match self.store.load(&key).await {
                Ok(Some(blob)) => match AgentSession::from_blob(&blob) {
                    Ok(session) => {
                        log::info!("session restored: {}", self.spec.identifier);
                        session
                    }
                    Err(e) => {
                        log::error!(
                            "stored session for {} is unreadable ({}); starting fresh",
                            self.spec.identifier,
                            e
                        );
                        self.fresh_session()
                    }
                },
                Ok(None) => self.fresh_session(),
                Err(e) => {
                    // Persistence failures never kill the conversation.
                    log::error!("session load failed for {}: {}", self.spec.identifier, e);
                    self.fresh_session()
                }
            };

            let intent = self.spec.identifier.intent.clone();
            let broadcast = Arc::clone(&self.broadcast);
            session
                .context
                .set_broadcast_hook(Arc::new(move |name, value| {
                    broadcast(ContextUpdate {
                        source_intent: intent.clone(),
                        updates: vec![(name.to_string(), value.clone())],
                    });
                }));

            for update in self.early_updates.drain(..) {
                session.queue_merge(update);
            }
            self.session = Some(session);
        }
        Ok(())
    }

    fn fresh_session(&self) -> AgentSession {
        let mut session = AgentSession::new(self.spec.tool_set.shared_variable_names());
        session.push_message(ChatMessage::new(Role::System, self.spec.system_prompt.clone()));
        session
    }

    /// The reduced message view sent to the LLM, with the tool block appended
    /// to the leading system message. View-only: the session history is
    /// untouched.
    fn render_view(&self, session: &AgentSession) -> Vec<ChatMessage> {
        let mut view = match &self.spec.reducer {
            Some(reducer) => reducer.reduce(session.history()),
            None => session.history().to_vec(),
        };

        let tool_block = self.spec.tool_set.render_prompt_block();
        if !tool_block.is_empty() {
            match view.iter_mut().find(|m| m.role == Role::System) {
                Some(system) => system.content.push_str(&tool_block),
                None => view.insert(
                    0,
                    ChatMessage::new(Role::System, tool_block.trim_start().to_string()),
                ),
            }
        }
        view
    }

    /// One LLM round-trip: streaming when enabled and supported, batch
    /// otherwise. While streaming, chunks are withheld as long as the
    /// accumulated text looks like a tool-call payload so clients never see
    /// raw tool JSON.
    async fn invoke_llm(
        &self,
        view: &[ChatMessage],
        tools: &[crate::morgana::client_wrapper::ToolDefinition],
        chunk_tx: &mpsc::UnboundedSender<AgentStreamChunk>,
        streaming: bool,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        if streaming {
            if let Some(mut stream) = self.client.run_stream(view, tools).await? {
                let started = Instant::now();
                let mut first_chunk_at: Option<Duration> = None;
                let mut accumulated = String::new();
                let mut forwarding = false;

                while let Some(chunk) = stream.next().await {
                    let chunk = chunk?;
                    if chunk.content.is_empty() {
                        continue;
                    }
                    if first_chunk_at.is_none() {
                        let elapsed = started.elapsed();
                        first_chunk_at = Some(elapsed);
                        log::debug!(
                            "first chunk after {:?} for {}",
                            elapsed,
                            self.spec.identifier
                        );
                    }
                    accumulated.push_str(&chunk.content);

                    if forwarding {
                        let _ = chunk_tx.send(AgentStreamChunk {
                            conversation_id: self.spec.identifier.conversation_id.clone(),
                            delta: chunk.content,
                        });
                    } else if !could_be_tool_call(accumulated.trim_start()) {
                        // Flush everything seen so far and stream the rest.
                        forwarding = true;
                        let _ = chunk_tx.send(AgentStreamChunk {
                            conversation_id: self.spec.identifier.conversation_id.clone(),
                            delta: accumulated.clone(),
                        });
                    }
                }

                // A withheld response that turned out not to be a tool call
                // still reaches the client, just un-streamed.
                if !forwarding && parse_tool_call(&accumulated).is_none() && !accumulated.is_empty()
                {
                    let _ = chunk_tx.send(AgentStreamChunk {
                        conversation_id: self.spec.identifier.conversation_id.clone(),
                        delta: accumulated.clone(),
                    });
                }

                return Ok(accumulated);
            }
        }

        let message = self.client.run(view, tools).await?;
        Ok(message.content)
    }
}

/// Whether `text` could still grow into a `{"tool_call": …}` payload.
///
/// True while the text is a prefix of the marker, or starts with it.
fn could_be_tool_call(text: &str) -> bool {
    const MARKER: &str = "{\"tool_call\"";
    if text.len() < MARKER.len() {
        MARKER.starts_with(text)
    } else {
        text.starts_with(MARKER)
    }
}

/// The completion rule: a turn is complete unless the text carries the
/// sentinel, ends with a question mark, or the session staged quick replies
/// or a rich card.
pub fn analyze_completion(
    response_text: &str,
    context: &crate::morgana::context::ContextStore,
) -> bool {
    let has_sentinel = contains_sentinel(response_text);
    let ends_with_question = response_text.trim_end().ends_with('?');

    let has_quick_replies = context
        .variables()
        .get(QUICK_REPLIES_KEY)
        .and_then(|value| serde_json::from_value::<Vec<QuickReply>>(value.clone()).ok())
        .map(|replies| !replies.is_empty())
        .unwrap_or(false);

    let has_rich_card = context.variables().get(RICH_CARD_KEY).is_some();

    !(has_sentinel || ends_with_question || has_quick_replies || has_rich_card)
}

/// Case-insensitive check for the completion sentinel.
pub fn contains_sentinel(text: &str) -> bool {
    text.to_ascii_lowercase()
        .contains(&COMPLETION_SENTINEL.to_ascii_lowercase())
}

/// Remove every (case-insensitive) occurrence of the sentinel and tidy the
/// surrounding whitespace.
pub fn strip_sentinel(text: &str) -> String {
    let lower = text.to_ascii_lowercase();
    let marker = COMPLETION_SENTINEL.to_ascii_lowercase();
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    while let Some(found) = lower[cursor..].find(&marker) {
        let start = cursor + found;
        out.push_str(&text[cursor..start]);
        cursor = start + marker.len();
    }
    out.push_str(&text[cursor..]);

    // Tidy the doubled spaces stripping tends to leave behind, without
    // disturbing line structure.
    while out.contains("  ") {
        out = out.replace("  ", " ");
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::morgana::context::ContextStore;
    use serde_json::json;
    use std::collections::HashSet;

    fn empty_context() -> ContextStore {
        ContextStore::new(HashSet::new())
    }

    #[test]
    fn test_completion_plain_statement_is_complete() {
        assert!(analyze_completion("Here is invoice INV-001.", &empty_context()));
    }

    #[test]
    fn test_completion_sentinel_blocks_any_case() {
        assert!(!analyze_completion("Which invoice id? #INT#", &empty_context()));
        assert!(!analyze_completion("still working #int#", &empty_context()));
    }

    #[test]
    fn test_completion_trailing_question_blocks() {
        assert!(!analyze_completion("Which invoice id?", &empty_context()));
        assert!(!analyze_completion("Which invoice id?   \n", &empty_context()));
    }

    #[test]
    fn test_completion_quick_replies_block() {
        let mut context = empty_context();
        context.set_local(
            QUICK_REPLIES_KEY,
            json!([{"id": "1", "label": "Yes", "value": "yes"}]),
        );
        assert!(!analyze_completion("Done.", &context));
    }

    #[test]
    fn test_completion_unparseable_quick_replies_do_not_block() {
        let mut context = empty_context();
        context.set_local(QUICK_REPLIES_KEY, json!("not an array"));
        assert!(analyze_completion("Done.", &context));
    }

    #[test]
    fn test_completion_rich_card_blocks() {
        let mut context = empty_context();
        context.set_local(RICH_CARD_KEY, json!({"title": "x", "components": []}));
        assert!(!analyze_completion("Done.", &context));
    }

    #[test]
    fn test_strip_sentinel_case_insensitive() {
        assert_eq!(strip_sentinel("Which invoice id? #INT#"), "Which invoice id?");
        assert_eq!(strip_sentinel("a #int# b #INT# c"), "a b c");
        assert_eq!(strip_sentinel("no sentinel here"), "no sentinel here");
    }

    #[test]
    fn test_could_be_tool_call_prefixes() {
        assert!(could_be_tool_call(""));
        assert!(could_be_tool_call("{"));
        assert!(could_be_tool_call("{\"tool"));
        assert!(could_be_tool_call("{\"tool_call\": {\"name\": \"x\"}}"));
        assert!(!could_be_tool_call("Hello"));
        assert!(!could_be_tool_call("{\"not_a_tool\": 1}"));
    }
}
