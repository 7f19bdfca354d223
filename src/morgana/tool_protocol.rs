//! Tool protocol: definitions, typed handlers, validation, and the per-agent
//! tool set.
//!
//! Tools are the surface the LLM uses to reach back into the framework. Each
//! tool is described by a [`ToolMetadata`] (name, description, parameters
//! with scope/shared flags) and executed by a typed [`ToolHandler`] that
//! receives an explicit [`ToolContext`]: no dynamic delegates, no closure
//! capture of ambient state.
//!
//! At agent construction the declared tool definitions are validated against
//! the registered handlers ([`validate_tools`]): every declared tool must
//! resolve a handler by name, the parameter lists must agree in arity and
//! per-name mapping, and a required definition parameter may not map to an
//! optional handler parameter. Mismatches are startup errors, not runtime
//! surprises.
//!
//! Tool invocation errors are part of the protocol: [`ToolSet::execute`]
//! always returns a string, and failures are deterministic error strings the
//! LLM can recover from, never propagated as panics or exceptions.
//!
//! The LLM requests a tool with a JSON fragment embedded in its response:
//!
//! ```text
//! {"tool_call": {"name": "set_context_variable", "parameters": {"name": "userId", "value": "P994E"}}}
//! ```
//!
//! [`parse_tool_call`] extracts the first such fragment by brace counting,
//! which copes with the common case of the model wrapping the call in prose.

use crate::morgana::client_wrapper::ToolDefinition;
use crate::morgana::context::ContextStore;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Where a tool parameter's value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolScope {
    /// The value lives in the context-variable store; the model is told to
    /// consult `get_context_variable` before asking the user.
    Context,
    /// The value is taken directly from the user's message.
    Request,
}

/// Defines a parameter for a tool.
///
/// Invariant: `shared` implies `scope == Context`; only context-scoped
/// values can be broadcast to sibling agents. [`ToolParameter::validate`]
/// enforces this at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    pub scope: ToolScope,
    #[serde(default)]
    pub shared: bool,
}

impl ToolParameter {
    /// Define a new parameter with the provided name and scope.
    pub fn new(name: impl Into<String>, scope: ToolScope) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            required: false,
            scope,
            shared: false,
        }
    }

    /// Add a human readable description that will surface in generated schemas.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Mark the argument as required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Mark the parameter as shared: writes are broadcast to sibling agents.
    /// Only legal on `Context`-scoped parameters.
    pub fn shared(mut self) -> Self {
        self.shared = true;
        self
    }

    /// Check the `shared ⇒ context` invariant.
    pub fn validate(&self) -> Result<(), ToolError> {
        if self.shared && self.scope != ToolScope::Context {
            return Err(ToolError::InvalidDefinition {
                tool: String::new(),
                detail: format!(
                    "parameter '{}' is shared but not context-scoped",
                    self.name
                ),
            });
        }
        Ok(())
    }
}

/// Metadata about a tool: identity, description, parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<ToolParameter>,
}

impl ToolMetadata {
    /// Create metadata with the supplied identifier and description.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
        }
    }

    /// Append a parameter definition (builder pattern).
    pub fn with_parameter(mut self, param: ToolParameter) -> Self {
        self.parameters.push(param);
        self
    }

    /// Validate every parameter's invariants.
    pub fn validate(&self) -> Result<(), ToolError> {
        for param in &self.parameters {
            param.validate().map_err(|e| match e {
                ToolError::InvalidDefinition { detail, .. } => ToolError::InvalidDefinition {
                    tool: self.name.clone(),
                    detail,
                },
                other => other,
            })?;
        }
        Ok(())
    }

    /// Render the provider-facing schema, decorating each parameter
    /// description with the scope guidance text configured in the framework
    /// prompt.
    pub fn to_tool_definition(
        &self,
        context_guidance: &str,
        request_guidance: &str,
    ) -> ToolDefinition {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for param in &self.parameters {
            let guidance = match param.scope {
                ToolScope::Context => context_guidance,
                ToolScope::Request => request_guidance,
            };
            properties.insert(
                param.name.clone(),
                serde_json::json!({
                    "type": "string",
                    "description": format!("{}{}", param.description, guidance),
                }),
            );
            if param.required {
                required.push(serde_json::Value::String(param.name.clone()));
            }
        }
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }),
        }
    }
}

/// Error types for tool operations.
#[derive(Debug, Clone)]
pub enum ToolError {
    /// Requested tool is not part of the agent's tool set.
    NotFound(String),
    /// A declared tool has no registered handler.
    MissingHandler { tool: String },
    /// The declared parameter list does not match the handler's.
    ParameterMismatch { tool: String, detail: String },
    /// A definition violates a structural invariant.
    InvalidDefinition { tool: String, detail: String },
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::NotFound(name) => write!(f, "Tool not found: {}", name),
            ToolError::MissingHandler { tool } => {
                write!(f, "Tool '{}' has no registered handler", tool)
            }
            ToolError::ParameterMismatch { tool, detail } => {
                write!(f, "Tool '{}' parameter mismatch: {}", tool, detail)
            }
            ToolError::InvalidDefinition { tool, detail } => {
                write!(f, "Invalid tool definition '{}': {}", tool, detail)
            }
        }
    }
}

impl Error for ToolError {}

/// Explicit state handed to a tool handler for the duration of one call.
pub struct ToolContext<'a> {
    /// The calling agent's context-variable store.
    pub context: &'a mut ContextStore,
    /// Intent of the calling agent.
    pub intent: &'a str,
    /// Conversation the call belongs to.
    pub conversation_id: &'a str,
}

/// Typed tool function: parameters in, deterministic result string out.
///
/// Handlers never fail with an error type; failure modes are encoded as
/// deterministic strings so the LLM can recover (retry, rephrase, ask the
/// user).
pub type ToolHandlerFn = Arc<dyn Fn(&mut ToolContext<'_>, &serde_json::Value) -> String + Send + Sync>;

/// A handler parameter as declared by the implementation.
#[derive(Debug, Clone)]
pub struct HandlerParam {
    pub name: String,
    /// Optional handler parameters may be omitted by the model; a required
    /// definition parameter may not map onto one.
    pub optional: bool,
}

/// A registered tool implementation: name, declared parameter list, function.
#[derive(Clone)]
pub struct ToolHandler {
    pub name: String,
    pub params: Vec<HandlerParam>,
    pub func: ToolHandlerFn,
}

impl ToolHandler {
    /// Register a handler; `params` pairs are `(name, optional)`.
    pub fn new(
        name: impl Into<String>,
        params: &[(&str, bool)],
        func: ToolHandlerFn,
    ) -> Self {
        Self {
            name: name.into(),
            params: params
                .iter()
                .map(|(n, optional)| HandlerParam {
                    name: (*n).to_string(),
                    optional: *optional,
                })
                .collect(),
            func,
        }
    }
}

/// The domain tool implementation registered for one intent: the handlers
/// plus the declared metadata they satisfy.
#[derive(Clone)]
pub struct ToolBundle {
    /// Intent this bundle serves; at most one bundle per intent.
    pub intent: String,
    /// Declared tool definitions contributed to the agent's surface.
    pub definitions: Vec<ToolMetadata>,
    /// Implementations, matched to definitions by name.
    pub handlers: Vec<ToolHandler>,
}

/// Validate declared tool definitions against registered handlers.
///
/// Rules (per declared definition):
/// 1. A handler with the same name must exist.
/// 2. The parameter lists must have the same arity.
/// 3. Every definition parameter must map by name to a handler parameter.
/// 4. A `required` definition parameter may not map to an optional handler
///    parameter.
pub fn validate_tools(
    declared: &[ToolMetadata],
    handlers: &[ToolHandler],
) -> Result<(), ToolError> {
    for definition in declared {
        definition.validate()?;

        let handler = handlers
            .iter()
            .find(|h| h.name == definition.name)
            .ok_or_else(|| ToolError::MissingHandler {
                tool: definition.name.clone(),
            })?;

        if handler.params.len() != definition.parameters.len() {
            return Err(ToolError::ParameterMismatch {
                tool: definition.name.clone(),
                detail: format!(
                    "definition declares {} parameter(s), handler takes {}",
                    definition.parameters.len(),
                    handler.params.len()
                ),
            });
        }

        for param in &definition.parameters {
            let matched = handler
                .params
                .iter()
                .find(|hp| hp.name == param.name)
                .ok_or_else(|| ToolError::ParameterMismatch {
                    tool: definition.name.clone(),
                    detail: format!("no handler parameter named '{}'", param.name),
                })?;

            if param.required && matched.optional {
                return Err(ToolError::ParameterMismatch {
                    tool: definition.name.clone(),
                    detail: format!(
                        "required parameter '{}' maps to an optional handler parameter",
                        param.name
                    ),
                });
            }
        }
    }
    Ok(())
}

/// The complete tool surface of one agent: framework tools first, then the
/// intent's domain tools, each bound to its handler.
pub struct ToolSet {
    tools: Vec<(ToolMetadata, ToolHandlerFn)>,
    by_name: HashMap<String, usize>,
    context_guidance: String,
    request_guidance: String,
}

impl ToolSet {
    /// Assemble and validate an agent's tool surface.
    ///
    /// `framework` tools arrive pre-bound; `declared` definitions must be
    /// satisfied by the handlers of `bundle` (if any).
    pub fn build(
        framework: Vec<(ToolMetadata, ToolHandlerFn)>,
        declared: Vec<ToolMetadata>,
        bundle: Option<&ToolBundle>,
        context_guidance: impl Into<String>,
        request_guidance: impl Into<String>,
    ) -> Result<Self, ToolError> {
        let empty: [ToolHandler; 0] = [];
        let handlers: &[ToolHandler] = match bundle {
            Some(b) => &b.handlers,
            None => &empty,
        };
        validate_tools(&declared, handlers)?;

        let mut tools = Vec::new();
        let mut by_name = HashMap::new();
        for (metadata, func) in framework {
            metadata.validate()?;
            by_name.insert(metadata.name.clone(), tools.len());
            tools.push((metadata, func));
        }
        for definition in declared {
            // validate_tools guaranteed the handler exists.
            let handler = handlers
                .iter()
                .find(|h| h.name == definition.name)
                .ok_or_else(|| ToolError::MissingHandler {
                    tool: definition.name.clone(),
                })?;
            by_name.insert(definition.name.clone(), tools.len());
            tools.push((definition, Arc::clone(&handler.func)));
        }

        Ok(Self {
            tools,
            by_name,
            context_guidance: context_guidance.into(),
            request_guidance: request_guidance.into(),
        })
    }

    /// Names of all context-scoped shared parameters across the surface.
    /// This is where an agent's immutable shared-variable set comes from.
    pub fn shared_variable_names(&self) -> HashSet<String> {
        let mut names = HashSet::new();
        for (metadata, _) in &self.tools {
            for param in &metadata.parameters {
                if param.shared && param.scope == ToolScope::Context {
                    names.insert(param.name.clone());
                }
            }
        }
        names
    }

    /// Provider-facing schemas with scope guidance decorated into every
    /// parameter description.
    pub fn definitions_for_llm(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|(m, _)| m.to_tool_definition(&self.context_guidance, &self.request_guidance))
            .collect()
    }

    /// Render the tool block appended to the agent's prompt, instructing the
    /// model how to request a call.
    pub fn render_prompt_block(&self) -> String {
        if self.tools.is_empty() {
            return String::new();
        }
        let mut block = String::from("\n\nYou have access to the following tools:\n");
        for (metadata, _) in &self.tools {
            block.push_str(&format!("- {}: {}\n", metadata.name, metadata.description));
            if !metadata.parameters.is_empty() {
                block.push_str("  Parameters:\n");
                for param in &metadata.parameters {
                    let guidance = match param.scope {
                        ToolScope::Context => &self.context_guidance,
                        ToolScope::Request => &self.request_guidance,
                    };
                    block.push_str(&format!(
                        "    - {}{}: {}{}\n",
                        param.name,
                        if param.required { " (required)" } else { "" },
                        param.description,
                        guidance
                    ));
                }
            }
        }
        block.push_str(
            "\nTo use a tool, respond with a JSON object in the following format:\n\
             {\"tool_call\": {\"name\": \"tool_name\", \"parameters\": {...}}}\n\
             After tool execution, the result will be provided and you can continue.\n",
        );
        block
    }

    /// Execute a named tool. Unknown names yield a deterministic error string
    /// (the model can recover); known tools return whatever their handler
    /// produced.
    pub fn execute(
        &self,
        name: &str,
        parameters: &serde_json::Value,
        ctx: &mut ToolContext<'_>,
    ) -> String {
        match self.by_name.get(name) {
            Some(&idx) => {
                let (_, func) = &self.tools[idx];
                func(ctx, parameters)
            }
            None => format!("Error: {}", ToolError::NotFound(name.to_string())),
        }
    }

    /// Whether the surface exposes any tools at all.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Number of tools on the surface.
    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

/// A parsed tool call extracted from an LLM response.
#[derive(Debug, Clone)]
pub struct ParsedToolCall {
    pub name: String,
    pub parameters: serde_json::Value,
}

/// Extract the first `{"tool_call": …}` fragment from a response.
///
/// Uses brace counting from the fragment start rather than parsing the whole
/// response as JSON, which handles the common case of the model wrapping the
/// call in surrounding prose.
pub fn parse_tool_call(response: &str) -> Option<ParsedToolCall> {
    let start = response.find("{\"tool_call\"")?;

    let mut depth = 0usize;
    let mut end = None;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in response[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    end = Some(start + offset + 1);
                    break;
                }
            }
            _ => {}
        }
    }

    let fragment = &response[start..end?];
    let parsed: serde_json::Value = serde_json::from_str(fragment).ok()?;
    let call = parsed.get("tool_call")?;
    let name = call.get("name")?.as_str()?.to_string();
    let parameters = call.get("parameters")?.clone();
    Some(ParsedToolCall { name, parameters })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop_handler() -> ToolHandlerFn {
        Arc::new(|_, _| "ok".to_string())
    }

    #[test]
    fn test_shared_requires_context_scope() {
        let bad = ToolParameter::new("userId", ToolScope::Request).shared();
        assert!(bad.validate().is_err());

        let good = ToolParameter::new("userId", ToolScope::Context).shared();
        assert!(good.validate().is_ok());
    }

    #[test]
    fn test_validate_tools_missing_handler() {
        let declared = vec![ToolMetadata::new("get_invoice", "Fetch an invoice")];
        let err = validate_tools(&declared, &[]).unwrap_err();
        match err {
            ToolError::MissingHandler { tool } => assert_eq!(tool, "get_invoice"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_validate_tools_arity_and_name_mapping() {
        let declared = vec![ToolMetadata::new("get_invoice", "Fetch an invoice")
            .with_parameter(ToolParameter::new("invoice_id", ToolScope::Request).required())];

        // Wrong arity.
        let handler = ToolHandler::new("get_invoice", &[], noop_handler());
        assert!(validate_tools(&declared, &[handler]).is_err());

        // Wrong name.
        let handler = ToolHandler::new("get_invoice", &[("id", false)], noop_handler());
        assert!(validate_tools(&declared, &[handler]).is_err());

        // Required definition parameter onto optional handler parameter.
        let handler = ToolHandler::new("get_invoice", &[("invoice_id", true)], noop_handler());
        assert!(validate_tools(&declared, &[handler]).is_err());

        // Correct mapping.
        let handler = ToolHandler::new("get_invoice", &[("invoice_id", false)], noop_handler());
        assert!(validate_tools(&declared, &[handler]).is_ok());
    }

    #[test]
    fn test_tool_set_shared_names_and_execute() {
        let declared = vec![ToolMetadata::new("get_contract", "Fetch a contract")
            .with_parameter(
                ToolParameter::new("userId", ToolScope::Context)
                    .shared()
                    .required(),
            )];
        let bundle = ToolBundle {
            intent: "contracts".to_string(),
            definitions: declared.clone(),
            handlers: vec![ToolHandler::new(
                "get_contract",
                &[("userId", false)],
                Arc::new(|_, params| format!("contract for {}", params["userId"])),
            )],
        };

        let set = ToolSet::build(Vec::new(), declared, Some(&bundle), " ctx.", " req.").unwrap();
        assert!(set.shared_variable_names().contains("userId"));

        let mut store = ContextStore::new(HashSet::new());
        let mut ctx = ToolContext {
            context: &mut store,
            intent: "contracts",
            conversation_id: "c1",
        };
        let out = set.execute("get_contract", &json!({"userId": "P994E"}), &mut ctx);
        assert_eq!(out, "contract for \"P994E\"");

        let missing = set.execute("nope", &json!({}), &mut ctx);
        assert_eq!(missing, "Error: Tool not found: nope");
    }

    #[test]
    fn test_schema_decoration_by_scope() {
        let metadata = ToolMetadata::new("get_invoice", "Fetch an invoice")
            .with_parameter(
                ToolParameter::new("userId", ToolScope::Context)
                    .with_description("The customer id."),
            )
            .with_parameter(
                ToolParameter::new("invoice_id", ToolScope::Request)
                    .with_description("The invoice id."),
            );

        let def = metadata.to_tool_definition(" Check the context first.", " Read the message.");
        let props = &def.parameters_schema["properties"];
        assert_eq!(
            props["userId"]["description"],
            "The customer id. Check the context first."
        );
        assert_eq!(
            props["invoice_id"]["description"],
            "The invoice id. Read the message."
        );
    }

    #[test]
    fn test_parse_tool_call_in_prose() {
        let response = r#"Let me look that up.
            {"tool_call": {"name": "get_context_variable", "parameters": {"name": "userId"}}}
            "#;
        let call = parse_tool_call(response).unwrap();
        assert_eq!(call.name, "get_context_variable");
        assert_eq!(call.parameters["name"], "userId");
    }

    #[test]
    fn test_parse_tool_call_with_nested_braces_and_strings() {
        let response = r#"{"tool_call": {"name": "set_rich_card", "parameters": {"json": "{\"title\": \"x}\"}"}}}"#;
        let call = parse_tool_call(response).unwrap();
        assert_eq!(call.name, "set_rich_card");
    }

    #[test]
    fn test_parse_tool_call_absent() {
        assert!(parse_tool_call("plain answer, no tools").is_none());
    }
}
