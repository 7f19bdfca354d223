//! Configuration for the Morgana runtime.
//!
//! [`MorganaConfig`] is intentionally a plain struct: embedders construct it
//! manually or deserialize it from the JSON shape used by the hosting
//! application (`StreamingResponse`, `ConversationPersistence`,
//! `RateLimiting`, `MCPServers`, `LLM` sections). No config-file framework is
//! pulled in.
//!
//! # Example
//!
//! ```rust
//! use morgana::config::MorganaConfig;
//!
//! // Defaults: streaming on, no persistence path, rate limiting off.
//! let config = MorganaConfig::default();
//! assert!(config.streaming.enabled);
//!
//! // Or from the hosting application's JSON section.
//! let config = MorganaConfig::from_json(r#"{
//!     "StreamingResponse": { "Enabled": false },
//!     "RateLimiting": { "Enabled": true, "MaxMessagesPerMinute": 10 }
//! }"#).unwrap();
//! assert!(!config.streaming.enabled);
//! ```

use serde::Deserialize;
use std::collections::HashMap;
use std::error::Error;
use std::path::PathBuf;

/// Streaming behaviour of agent responses.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct StreamingConfig {
    /// When true, agents prefer the provider's streaming path and forward
    /// chunks to the client as they arrive. Default: `true`.
    pub enabled: bool,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Where and how agent sessions are persisted.
///
/// The encryption key is opaque to the core: it is handed verbatim to the
/// configured session store, which owns the encryption scheme.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PersistenceConfig {
    /// Directory for the file-backed session store. `None` selects the
    /// in-memory store.
    pub storage_path: Option<PathBuf>,
    /// Opaque key material forwarded to the store implementation.
    pub encryption_key: Option<String>,
}

/// Per-conversation message rate limits. A zero threshold disables that window.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub max_messages_per_minute: u32,
    pub max_messages_per_hour: u32,
    pub max_messages_per_day: u32,
    /// Optional canned answers per violated window; defaults apply when absent.
    pub error_message_minute: Option<String>,
    pub error_message_hour: Option<String>,
    pub error_message_day: Option<String>,
}

/// Declaration of an external MCP server; passed through untouched to an
/// optional tool-ingestion collaborator. The core attaches no meaning to it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct McpServerConfig {
    pub name: String,
    pub uri: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub additional_settings: HashMap<String, serde_json::Value>,
}

/// Provider selection for the LLM client; provider-specific subkeys are kept
/// as an opaque bag for the embedder's client factory.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LlmConfig {
    pub provider: String,
    #[serde(flatten)]
    pub settings: HashMap<String, serde_json::Value>,
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MorganaConfig {
    #[serde(rename = "StreamingResponse")]
    pub streaming: StreamingConfig,
    #[serde(rename = "ConversationPersistence")]
    pub persistence: PersistenceConfig,
    #[serde(rename = "RateLimiting")]
    pub rate_limiting: RateLimitConfig,
    #[serde(rename = "MCPServers")]
    pub mcp_servers: Vec<McpServerConfig>,
    #[serde(rename = "LLM")]
    pub llm: LlmConfig,
    /// Receive timeout for idle actors, in seconds. The default handler is a
    /// no-op tick; supervisors additionally honor
    /// [`supervisor_idle_timeout_secs`](MorganaConfig::supervisor_idle_timeout_secs).
    #[serde(rename = "IdleReceiveTimeoutSeconds")]
    pub idle_receive_timeout_secs: u64,
    /// When set, a supervisor that has been idle this long stops its subtree;
    /// the conversation is recreated from persistence on the next message.
    #[serde(rename = "SupervisorIdleTimeoutSeconds")]
    pub supervisor_idle_timeout_secs: Option<u64>,
}

impl Default for MorganaConfig {
    fn default() -> Self {
        Self {
            streaming: StreamingConfig::default(),
            persistence: PersistenceConfig::default(),
            rate_limiting: RateLimitConfig::default(),
            mcp_servers: Vec::new(),
            llm: LlmConfig::default(),
            idle_receive_timeout_secs: default_idle_receive_timeout_secs(),
            supervisor_idle_timeout_secs: None,
        }
    }
}

impl MorganaConfig {
    /// Parse the configuration from the hosting application's JSON section.
    pub fn from_json(raw: &str) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let mut config: MorganaConfig = serde_json::from_str(raw)?;
        if config.idle_receive_timeout_secs == 0 {
            config.idle_receive_timeout_secs = default_idle_receive_timeout_secs();
        }
        Ok(config)
    }
}

fn default_idle_receive_timeout_secs() -> u64 {
    60
}
