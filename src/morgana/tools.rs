//! The four framework tools exposed to the LLM by every agent.
//!
//! - `get_context_variable`: read a variable; the read path logs HIT/MISS
//!   and a miss returns a deterministic string telling the model to ask the
//!   user or call `set_context_variable`.
//! - `set_context_variable`: write a variable; shared names are broadcast
//!   to sibling agents by the context store's hook.
//! - `set_quick_replies`: stage a quick-reply array for this turn under the
//!   reserved `quick_replies` key.
//! - `set_rich_card`: validate and stage a rich card for this turn under
//!   the reserved `rich_card` key.
//!
//! Every outcome, success or failure, is a deterministic string handed
//! back to the model, so a malformed payload becomes a retry opportunity
//! instead of an exception.

use crate::morgana::context::{QUICK_REPLIES_KEY, RICH_CARD_KEY};
use crate::morgana::push_channel::QuickReply;
use crate::morgana::rich_card::RichCard;
use crate::morgana::tool_protocol::{
    ToolHandlerFn, ToolMetadata, ToolParameter, ToolScope,
};
use std::sync::Arc;

/// Tool name: read a context variable.
pub const GET_CONTEXT_VARIABLE: &str = "get_context_variable";
/// Tool name: write a context variable.
pub const SET_CONTEXT_VARIABLE: &str = "set_context_variable";
/// Tool name: stage quick replies for this turn.
pub const SET_QUICK_REPLIES: &str = "set_quick_replies";
/// Tool name: stage a rich card for this turn.
pub const SET_RICH_CARD: &str = "set_rich_card";

/// Build the framework tool surface shared by every agent.
///
/// Returns `(metadata, handler)` pairs ready for
/// [`ToolSet::build`](crate::morgana::tool_protocol::ToolSet::build).
pub fn framework_tools() -> Vec<(ToolMetadata, ToolHandlerFn)> {
    vec![
        (get_context_variable_metadata(), get_context_variable_handler()),
        (set_context_variable_metadata(), set_context_variable_handler()),
        (set_quick_replies_metadata(), set_quick_replies_handler()),
        (set_rich_card_metadata(), set_rich_card_handler()),
    ]
}

fn get_context_variable_metadata() -> ToolMetadata {
    ToolMetadata::new(
        GET_CONTEXT_VARIABLE,
        "Read a conversation context variable by name.",
    )
    .with_parameter(
        ToolParameter::new("name", ToolScope::Request)
            .with_description("Name of the context variable to read.")
            .required(),
    )
}

fn get_context_variable_handler() -> ToolHandlerFn {
    Arc::new(|ctx, params| {
        let name = match params.get("name").and_then(|v| v.as_str()) {
            Some(name) => name,
            None => return "Error: get_context_variable requires a 'name' parameter.".to_string(),
        };
        match ctx.context.get(name) {
            Some(value) => match value.as_str() {
                Some(text) => text.to_string(),
                None => value.to_string(),
            },
            None => format!(
                "Context variable '{}' is not set. Ask the user for the value, or call {} once you have it.",
                name, SET_CONTEXT_VARIABLE
            ),
        }
    })
}

fn set_context_variable_metadata() -> ToolMetadata {
    ToolMetadata::new(
        SET_CONTEXT_VARIABLE,
        "Store a conversation context variable.",
    )
    .with_parameter(
        ToolParameter::new("name", ToolScope::Request)
            .with_description("Name of the context variable to store.")
            .required(),
    )
    .with_parameter(
        ToolParameter::new("value", ToolScope::Request)
            .with_description("Value to store.")
            .required(),
    )
}

fn set_context_variable_handler() -> ToolHandlerFn {
    Arc::new(|ctx, params| {
        let name = match params.get("name").and_then(|v| v.as_str()) {
            Some(name) => name.to_string(),
            None => return "Error: set_context_variable requires a 'name' parameter.".to_string(),
        };
        let value = match params.get("value") {
            Some(value) => value.clone(),
            None => return "Error: set_context_variable requires a 'value' parameter.".to_string(),
        };
        // A shared name fires the broadcast hook inside the store.
        ctx.context.set(name.clone(), value);
        format!("Context variable '{}' stored.", name)
    })
}

fn set_quick_replies_metadata() -> ToolMetadata {
    ToolMetadata::new(
        SET_QUICK_REPLIES,
        "Offer tappable quick replies with this turn's answer.",
    )
    .with_parameter(
        ToolParameter::new("json", ToolScope::Request)
            .with_description(
                "JSON array of reply objects: {\"id\", \"label\", \"value\", \"termination\"?}.",
            )
            .required(),
    )
}

fn set_quick_replies_handler() -> ToolHandlerFn {
    Arc::new(|ctx, params| {
        let raw = match params.get("json").and_then(|v| v.as_str()) {
            Some(raw) => raw,
            None => return "Error: set_quick_replies requires a 'json' parameter.".to_string(),
        };
        let replies: Vec<QuickReply> = match serde_json::from_str(raw) {
            Ok(replies) => replies,
            Err(e) => {
                log::debug!("quick replies rejected: {}", e);
                return "Error: quick replies payload must be a JSON array of {id, label, value} objects.".to_string();
            }
        };
        if replies.is_empty() {
            return "Error: quick replies payload must contain at least one reply.".to_string();
        }
        // Stage the raw payload; the agent runtime extracts and drops it at
        // the end of the turn.
        match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(value) => {
                ctx.context.set_local(QUICK_REPLIES_KEY, value);
                format!("{} quick replies staged for this turn.", replies.len())
            }
            Err(_) => {
                "Error: quick replies payload must be a JSON array of {id, label, value} objects."
                    .to_string()
            }
        }
    })
}

fn set_rich_card_metadata() -> ToolMetadata {
    ToolMetadata::new(
        SET_RICH_CARD,
        "Attach a structured rich card to this turn's answer.",
    )
    .with_parameter(
        ToolParameter::new("json", ToolScope::Request)
            .with_description(
                "JSON card: {\"title\", \"subtitle\"?, \"components\": [...]}; components are \
                 tagged with \"type\" (text_block, key_value, divider, list, section, grid, badge).",
            )
            .required(),
    )
}

fn set_rich_card_handler() -> ToolHandlerFn {
    Arc::new(|ctx, params| {
        let raw = match params.get("json").and_then(|v| v.as_str()) {
            Some(raw) => raw,
            None => return "Error: set_rich_card requires a 'json' parameter.".to_string(),
        };
        let card: RichCard = match serde_json::from_str(raw) {
            Ok(card) => card,
            Err(e) => {
                log::debug!("rich card rejected: {}", e);
                return "Error: rich card payload is not valid JSON matching the card schema."
                    .to_string();
            }
        };
        if let Err(violation) = card.validate() {
            return format!("Error: {}", violation);
        }
        match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(value) => {
                ctx.context.set_local(RICH_CARD_KEY, value);
                "Rich card staged for this turn.".to_string()
            }
            Err(_) => {
                "Error: rich card payload is not valid JSON matching the card schema.".to_string()
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::morgana::context::ContextStore;
    use crate::morgana::tool_protocol::{ToolContext, ToolSet};
    use serde_json::json;
    use std::collections::HashSet;

    fn tool_set() -> ToolSet {
        ToolSet::build(framework_tools(), Vec::new(), None, "", "").unwrap()
    }

    fn run(set: &ToolSet, store: &mut ContextStore, name: &str, params: serde_json::Value) -> String {
        let mut ctx = ToolContext {
            context: store,
            intent: "billing",
            conversation_id: "c1",
        };
        set.execute(name, &params, &mut ctx)
    }

    #[test]
    fn test_get_miss_tells_model_what_to_do() {
        let set = tool_set();
        let mut store = ContextStore::new(HashSet::new());
        let out = run(&set, &mut store, GET_CONTEXT_VARIABLE, json!({"name": "userId"}));
        assert_eq!(
            out,
            "Context variable 'userId' is not set. Ask the user for the value, or call set_context_variable once you have it."
        );
    }

    #[test]
    fn test_set_then_get_round_trip() {
        let set = tool_set();
        let mut store = ContextStore::new(HashSet::new());

        let out = run(
            &set,
            &mut store,
            SET_CONTEXT_VARIABLE,
            json!({"name": "userId", "value": "P994E"}),
        );
        assert_eq!(out, "Context variable 'userId' stored.");

        let out = run(&set, &mut store, GET_CONTEXT_VARIABLE, json!({"name": "userId"}));
        assert_eq!(out, "P994E");
    }

    #[test]
    fn test_quick_replies_staged_under_reserved_key() {
        let set = tool_set();
        let mut store = ContextStore::new(HashSet::new());

        let payload = r#"[{"id": "1", "label": "Yes", "value": "yes"}]"#;
        let out = run(
            &set,
            &mut store,
            SET_QUICK_REPLIES,
            json!({ "json": payload }),
        );
        assert_eq!(out, "1 quick replies staged for this turn.");
        assert!(store.contains(QUICK_REPLIES_KEY));
    }

    #[test]
    fn test_quick_replies_parse_failure_is_deterministic() {
        let set = tool_set();
        let mut store = ContextStore::new(HashSet::new());

        let out = run(&set, &mut store, SET_QUICK_REPLIES, json!({"json": "not json"}));
        assert!(out.starts_with("Error: quick replies payload"));
        assert!(!store.contains(QUICK_REPLIES_KEY));
    }

    #[test]
    fn test_quick_replies_empty_array_rejected() {
        let set = tool_set();
        let mut store = ContextStore::new(HashSet::new());

        let out = run(&set, &mut store, SET_QUICK_REPLIES, json!({"json": "[]"}));
        assert_eq!(
            out,
            "Error: quick replies payload must contain at least one reply."
        );
        assert!(!store.contains(QUICK_REPLIES_KEY));
    }

    #[test]
    fn test_rich_card_staged() {
        let set = tool_set();
        let mut store = ContextStore::new(HashSet::new());

        let payload = r#"{"title": "Invoice", "components": [{"type": "text_block", "text": "€120"}]}"#;
        let out = run(&set, &mut store, SET_RICH_CARD, json!({ "json": payload }));
        assert_eq!(out, "Rich card staged for this turn.");
        assert!(store.contains(RICH_CARD_KEY));
    }

    #[test]
    fn test_rich_card_depth_violation_not_stored() {
        let set = tool_set();
        let mut store = ContextStore::new(HashSet::new());

        // Sections nested four deep.
        let payload = r#"{"title": "deep", "components": [
            {"type": "section", "components": [
                {"type": "section", "components": [
                    {"type": "section", "components": [
                        {"type": "text_block", "text": "leaf"}
                    ]}
                ]}
            ]}
        ]}"#;
        let out = run(&set, &mut store, SET_RICH_CARD, json!({ "json": payload }));
        assert!(out.starts_with("Error: Rich card exceeds maximum nesting depth of 3"));
        assert!(!store.contains(RICH_CARD_KEY));
    }

    #[test]
    fn test_shared_write_through_tool_broadcasts() {
        use std::sync::{Arc, Mutex};

        let set = tool_set();
        let shared: HashSet<String> = ["userId".to_string()].iter().cloned().collect();
        let mut store = ContextStore::new(shared);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        store.set_broadcast_hook(Arc::new(move |name, _| {
            sink.lock().unwrap().push(name.to_string());
        }));

        run(
            &set,
            &mut store,
            SET_CONTEXT_VARIABLE,
            json!({"name": "userId", "value": "P994E"}),
        );
        assert_eq!(seen.lock().unwrap().as_slice(), &["userId".to_string()]);
    }
}
