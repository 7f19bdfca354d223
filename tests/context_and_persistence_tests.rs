//! Cross-agent shared context, ephemeral UI artifacts, and session
//! persistence across the full actor tree.

use async_trait::async_trait;
use morgana::client_wrapper::{ChatMessage, ClientWrapper, Role, ToolDefinition};
use morgana::config::MorganaConfig;
use morgana::manager::{ConversationManager, MorganaRuntime};
use morgana::persistence::{InMemorySessionStore, SessionStore};
use morgana::prompts::{IntentCatalog, Prompt, StaticPromptStore};
use morgana::push_channel::{ConversationResponse, MessageType, PushChannel, QuickReply};
use morgana::registry::AgentBlueprint;
use morgana::session::SessionSnapshot;
use morgana::tool_protocol::{ToolBundle, ToolHandler, ToolMetadata, ToolParameter, ToolScope};
use std::collections::VecDeque;
use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct ScriptedClient {
    classifier: Mutex<String>,
    agent_responses: Mutex<VecDeque<String>>,
    classifier_calls: AtomicUsize,
}

impl ScriptedClient {
    fn new() -> Self {
        Self {
            classifier: Mutex::new(r#"{"intent": "billing", "confidence": 0.9}"#.to_string()),
            agent_responses: Mutex::new(VecDeque::new()),
            classifier_calls: AtomicUsize::new(0),
        }
    }

    fn script_classifier_intent(&self, intent: &str) {
        *self.classifier.lock().unwrap() =
            format!(r#"{{"intent": "{}", "confidence": 0.9}}"#, intent);
    }

    fn queue_agent_response(&self, text: &str) {
        self.agent_responses
            .lock()
            .unwrap()
            .push_back(text.to_string());
    }
}

#[async_trait]
impl ClientWrapper for ScriptedClient {
    async fn complete(
        &self,
        system_prompt: &str,
        _user_prompt: &str,
        _conversation_id: &str,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        if system_prompt.contains("guard-check") {
            Ok(r#"{"compliant": true}"#.to_string())
        } else if system_prompt.contains("intent-classify") {
            self.classifier_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.classifier.lock().unwrap().clone())
        } else {
            Ok(r#"{"message": "Hi!"}"#.to_string())
        }
    }

    async fn run(
        &self,
        _messages: &[ChatMessage],
        _tools: &[ToolDefinition],
    ) -> Result<ChatMessage, Box<dyn Error + Send + Sync>> {
        match self.agent_responses.lock().unwrap().pop_front() {
            Some(text) => Ok(ChatMessage::new(Role::Assistant, text)),
            None => Err("no scripted agent response".into()),
        }
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

#[derive(Default)]
struct RecordingPush {
    responses: Mutex<Vec<ConversationResponse>>,
}

impl RecordingPush {
    async fn wait_for_responses(&self, count: usize) -> Vec<ConversationResponse> {
        for _ in 0..500 {
            let responses = self.responses.lock().unwrap().clone();
            if responses.len() >= count {
                return responses;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {} response(s), got {:?}",
            count,
            self.responses.lock().unwrap().len()
        );
    }
}

#[async_trait]
impl PushChannel for RecordingPush {
    async fn send_plain(
        &self,
        _conversation_id: &str,
        _text: &str,
        _error_reason: Option<&str>,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        Ok(())
    }

    async fn send_structured(
        &self,
        _conversation_id: &str,
        _text: &str,
        _message_type: MessageType,
        _quick_replies: Option<Vec<QuickReply>>,
        _error_reason: Option<&str>,
        _agent_name: Option<&str>,
        _agent_completed: bool,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        Ok(())
    }

    async fn send_response(
        &self,
        _conversation_id: &str,
        response: &ConversationResponse,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.responses.lock().unwrap().push(response.clone());
        Ok(())
    }
}

fn test_catalog() -> IntentCatalog {
    IntentCatalog::from_json(
        r#"{
            "intents": [
                {"name": "billing", "description": "invoices", "label": "Billing"},
                {"name": "contracts", "description": "contracts", "label": "Contracts"}
            ],
            "agents": [
                {"id": "billing", "instructions": "You handle invoices."},
                {"id": "contracts", "instructions": "You handle contracts."}
            ]
        }"#,
    )
    .unwrap()
}

fn domain_bundle(intent: &str, tool_name: &str) -> ToolBundle {
    ToolBundle {
        intent: intent.to_string(),
        definitions: vec![ToolMetadata::new(tool_name, "Domain lookup by user id.")
            .with_parameter(
                ToolParameter::new("userId", ToolScope::Context)
                    .with_description("The customer id.")
                    .shared()
                    .required(),
            )],
        handlers: vec![ToolHandler::new(
            tool_name,
            &[("userId", false)],
            Arc::new(|_, params| format!("lookup result for {}", params["userId"])),
        )],
    }
}

fn build_runtime(
    client: Arc<ScriptedClient>,
    push: Arc<RecordingPush>,
    store: Arc<dyn SessionStore>,
) -> ConversationManager {
    let _ = env_logger::builder().is_test(true).try_init();
    MorganaRuntime::builder()
        .with_client(client)
        .with_push_channel(push)
        .with_session_store(store)
        .with_prompt_store(Arc::new(StaticPromptStore::from_prompts(vec![
            Prompt::new("guard", "guard-check"),
            Prompt::new("classifier", "intent-classify"),
        ])))
        .with_catalog(test_catalog())
        .with_config(MorganaConfig::default())
        .register_agent(AgentBlueprint::new("billing"))
        .unwrap()
        .register_agent(AgentBlueprint::new("contracts"))
        .unwrap()
        .register_tool_bundle(domain_bundle("billing", "get_invoice"))
        .unwrap()
        .register_tool_bundle(domain_bundle("contracts", "get_contract"))
        .unwrap()
        .build()
        .unwrap()
}

async fn load_snapshot(store: &InMemorySessionStore, key: &str) -> SessionSnapshot {
    let blob = store
        .load(key)
        .await
        .unwrap()
        .unwrap_or_else(|| panic!("no blob for {}", key));
    serde_json::from_slice(&blob).unwrap()
}

fn tool_call(name: &str, parameters: serde_json::Value) -> String {
    serde_json::json!({"tool_call": {"name": name, "parameters": parameters}}).to_string()
}

// Scenario: a shared variable written in the billing agent reaches the
// contracts agent before the latter ever ran a turn.
#[tokio::test]
async fn test_shared_variable_crosses_agents() {
    let client = Arc::new(ScriptedClient::new());
    let push = Arc::new(RecordingPush::default());
    let store = Arc::new(InMemorySessionStore::new());
    let manager = build_runtime(
        Arc::clone(&client),
        Arc::clone(&push),
        Arc::clone(&store) as Arc<dyn SessionStore>,
    );

    // Billing turn: the model stores the shared user id, then answers.
    client.queue_agent_response(&tool_call(
        "set_context_variable",
        serde_json::json!({"name": "userId", "value": "P994E"}),
    ));
    client.queue_agent_response("Stored your id.");
    manager.handle_message("c1", "my id is P994E").await.unwrap();
    push.wait_for_responses(1).await;

    // Contracts turn: the model reads the id it never wrote.
    client.script_classifier_intent("contracts");
    client.queue_agent_response(&tool_call(
        "get_context_variable",
        serde_json::json!({"name": "userId"}),
    ));
    client.queue_agent_response("Your contract is linked to P994E.");
    manager.handle_message("c1", "show my contract").await.unwrap();
    push.wait_for_responses(2).await;

    let snapshot = load_snapshot(&store, "contracts-c1").await;
    assert_eq!(
        snapshot.context_variables.get("userId"),
        Some(&serde_json::json!("P994E"))
    );
    // The read hit: the tool result fed back to the model carries the value.
    assert!(snapshot.message_history.iter().any(|m| {
        m.role == Role::Tool && m.content == "Tool 'get_context_variable' result: P994E"
    }));
}

// First-write-wins: a local value survives an incoming merge.
#[tokio::test]
async fn test_merge_does_not_overwrite_local_value() {
    let client = Arc::new(ScriptedClient::new());
    let push = Arc::new(RecordingPush::default());
    let store = Arc::new(InMemorySessionStore::new());
    let manager = build_runtime(
        Arc::clone(&client),
        Arc::clone(&push),
        Arc::clone(&store) as Arc<dyn SessionStore>,
    );

    // Contracts writes its own value first.
    client.script_classifier_intent("contracts");
    client.queue_agent_response(&tool_call(
        "set_context_variable",
        serde_json::json!({"name": "userId", "value": "LOCAL"}),
    ));
    client.queue_agent_response("Noted.");
    manager.handle_message("c1", "my id is LOCAL").await.unwrap();
    push.wait_for_responses(1).await;

    // Billing broadcasts a different value for the same key.
    client.script_classifier_intent("billing");
    client.queue_agent_response(&tool_call(
        "set_context_variable",
        serde_json::json!({"name": "userId", "value": "REMOTE"}),
    ));
    client.queue_agent_response("Noted too.");
    manager.handle_message("c1", "actually REMOTE").await.unwrap();
    push.wait_for_responses(2).await;

    // Contracts re-persists on its next turn; the local value won.
    client.script_classifier_intent("contracts");
    client.queue_agent_response("Still here.");
    manager.handle_message("c1", "anything else?").await.unwrap();
    push.wait_for_responses(3).await;

    let snapshot = load_snapshot(&store, "contracts-c1").await;
    assert_eq!(
        snapshot.context_variables.get("userId"),
        Some(&serde_json::json!("LOCAL"))
    );
}

// Quick replies ride the response and never reach the persisted blob.
#[tokio::test]
async fn test_quick_replies_are_ephemeral() {
    let client = Arc::new(ScriptedClient::new());
    let push = Arc::new(RecordingPush::default());
    let store = Arc::new(InMemorySessionStore::new());
    let manager = build_runtime(
        Arc::clone(&client),
        Arc::clone(&push),
        Arc::clone(&store) as Arc<dyn SessionStore>,
    );

    let replies = r#"[{"id": "1", "label": "Yes", "value": "yes"}, {"id": "2", "label": "No", "value": "no"}]"#;
    client.queue_agent_response(&tool_call(
        "set_quick_replies",
        serde_json::json!({ "json": replies }),
    ));
    client.queue_agent_response("Shall I close the invoice");
    manager.handle_message("c1", "close it").await.unwrap();

    let responses = push.wait_for_responses(1).await;
    let response = &responses[0];
    // Staged quick replies make the turn incomplete and ride the response.
    assert!(!response.agent_completed);
    assert_eq!(response.quick_replies.as_ref().unwrap().len(), 2);

    let snapshot = load_snapshot(&store, "billing-c1").await;
    assert!(!snapshot.context_variables.contains_key("quick_replies"));
    assert!(!snapshot.context_variables.contains_key("rich_card"));
}

// Scenario: a card nested four sections deep is rejected and not stored.
#[tokio::test]
async fn test_rich_card_depth_violation_is_rejected() {
    let client = Arc::new(ScriptedClient::new());
    let push = Arc::new(RecordingPush::default());
    let store = Arc::new(InMemorySessionStore::new());
    let manager = build_runtime(
        Arc::clone(&client),
        Arc::clone(&push),
        Arc::clone(&store) as Arc<dyn SessionStore>,
    );

    let deep_card = r#"{"title": "deep", "components": [
        {"type": "section", "components": [
            {"type": "section", "components": [
                {"type": "section", "components": [
                    {"type": "text_block", "text": "leaf"}
                ]}
            ]}
        ]}
    ]}"#;
    client.queue_agent_response(&tool_call(
        "set_rich_card",
        serde_json::json!({ "json": deep_card }),
    ));
    client.queue_agent_response("I could not attach the card.");
    manager.handle_message("c1", "show me a card").await.unwrap();

    let responses = push.wait_for_responses(1).await;
    assert!(responses[0].rich_card.is_none());
    assert!(responses[0].agent_completed);

    let snapshot = load_snapshot(&store, "billing-c1").await;
    assert!(!snapshot.context_variables.contains_key("rich_card"));
    // The model saw the deterministic rejection.
    assert!(snapshot.message_history.iter().any(|m| {
        m.role == Role::Tool
            && m.content.starts_with(
                "Tool 'set_rich_card' result: Error: Rich card exceeds maximum nesting depth of 3",
            )
    }));
}

// A valid card rides the response.
#[tokio::test]
async fn test_valid_rich_card_rides_the_response() {
    let client = Arc::new(ScriptedClient::new());
    let push = Arc::new(RecordingPush::default());
    let store = Arc::new(InMemorySessionStore::new());
    let manager = build_runtime(
        Arc::clone(&client),
        Arc::clone(&push),
        Arc::clone(&store) as Arc<dyn SessionStore>,
    );

    let card = r#"{"title": "Invoice INV-001", "components": [{"type": "key_value", "key": "Total", "value": "€120"}]}"#;
    client.queue_agent_response(&tool_call(
        "set_rich_card",
        serde_json::json!({ "json": card }),
    ));
    client.queue_agent_response("Here is your invoice overview.");
    manager.handle_message("c1", "invoice overview").await.unwrap();

    let responses = push.wait_for_responses(1).await;
    let response = &responses[0];
    assert!(!response.agent_completed);
    assert_eq!(response.rich_card.as_ref().unwrap()["title"], "Invoice INV-001");

    let snapshot = load_snapshot(&store, "billing-c1").await;
    assert!(!snapshot.context_variables.contains_key("rich_card"));
}

// Histories persist across turns and accumulate in order.
#[tokio::test]
async fn test_history_persists_in_order() {
    let client = Arc::new(ScriptedClient::new());
    let push = Arc::new(RecordingPush::default());
    let store = Arc::new(InMemorySessionStore::new());
    let manager = build_runtime(
        Arc::clone(&client),
        Arc::clone(&push),
        Arc::clone(&store) as Arc<dyn SessionStore>,
    );

    client.queue_agent_response("Answer one.");
    manager.handle_message("c1", "question one").await.unwrap();
    push.wait_for_responses(1).await;

    client.queue_agent_response("Answer two.");
    manager.handle_message("c1", "question two").await.unwrap();
    push.wait_for_responses(2).await;

    let snapshot = load_snapshot(&store, "billing-c1").await;
    let contents: Vec<&str> = snapshot
        .message_history
        .iter()
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(snapshot.message_history[0].role, Role::System);
    assert_eq!(
        &contents[1..],
        &["question one", "Answer one.", "question two", "Answer two."]
    );
    assert!(snapshot.shared_variable_names.contains("userId"));
}

// Sticky routing survives a supervisor teardown via the persisted resume
// record.
#[tokio::test]
async fn test_sticky_agent_survives_restart() {
    let client = Arc::new(ScriptedClient::new());
    let push = Arc::new(RecordingPush::default());
    let store = Arc::new(InMemorySessionStore::new());
    let manager = build_runtime(
        Arc::clone(&client),
        Arc::clone(&push),
        Arc::clone(&store) as Arc<dyn SessionStore>,
    );

    client.queue_agent_response("Which invoice id? #INT#");
    manager.handle_message("c1", "about my invoice").await.unwrap();
    push.wait_for_responses(1).await;
    assert_eq!(client.classifier_calls.load(Ordering::SeqCst), 1);

    // Tear the whole subtree down; sticky state only survives on disk.
    manager.terminate_conversation("c1").await;

    client.queue_agent_response("Invoice total: €120.");
    manager.handle_message("c1", "INV-001").await.unwrap();
    let responses = push.wait_for_responses(2).await;

    // The revived supervisor rebound the sticky billing agent: no second
    // classification, and the answer came from billing.
    assert_eq!(client.classifier_calls.load(Ordering::SeqCst), 1);
    assert_eq!(responses[1].response, "Invoice total: €120.");
    assert_eq!(responses[1].agent_name.as_deref(), Some("Morgana (Billing)"));
    assert!(responses[1].classification.is_none());

    // And the restored agent continued its persisted history.
    let snapshot = load_snapshot(&store, "billing-c1").await;
    let contents: Vec<&str> = snapshot
        .message_history
        .iter()
        .map(|m| m.content.as_str())
        .collect();
    assert!(contents.contains(&"about my invoice"));
    assert!(contents.contains(&"INV-001"));
}
