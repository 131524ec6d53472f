//! Contract with the external LLM-agent SDK.
//!
//! The daemon is a client of an opaque streaming conversation
//! endpoint: a connector opens one subprocess-backed client per
//! Telephone generation; the client accepts `query` + `next_message`
//! pairs. Tests inject scripted clients through the same traits.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use delegate_core::error::Result;

/// One content block inside an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        input: serde_json::Value,
    },
}

/// Token usage reported by the SDK's terminal result message.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SdkUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

/// A message streamed back from the SDK during a turn.
///
/// `Result` is terminal per query and the only carrier of usage/cost;
/// its `total_cost_usd` is cumulative across the subprocess lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SdkMessage {
    Assistant {
        content: Vec<ContentBlock>,
        #[serde(default)]
        model: Option<String>,
    },
    System {
        #[serde(default)]
        subtype: String,
    },
    Result {
        total_cost_usd: f64,
        usage: SdkUsage,
    },
}

/// OS-level sandbox configuration for the subprocess.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    pub enabled: bool,
    pub auto_allow_bash_if_sandboxed: bool,
    pub allow_unsandboxed_commands: bool,
    /// Set when the domain allowlist is not wildcard.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_local_binding: Option<bool>,
}

/// Options handed to the connector when opening a client.
#[derive(Debug, Clone, Default)]
pub struct SdkOptions {
    pub cwd: PathBuf,
    pub model: Option<String>,
    pub add_dirs: Vec<PathBuf>,
    pub disallowed_tools: Vec<String>,
    /// Omitted whenever a permission guard is active: a bypass mode
    /// would short-circuit the guard callback entirely.
    pub permission_mode: Option<String>,
    pub sandbox: Option<SandboxConfig>,
    pub mcp_servers: BTreeMap<String, serde_json::Value>,
}

/// Outcome of the permission guard for one tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionDecision {
    Allow,
    Deny { message: String },
}

/// Guard callback inspecting every tool invocation.
pub type PermissionGuard =
    Arc<dyn Fn(&str, &serde_json::Value) -> PermissionDecision + Send + Sync>;

/// A connected conversation subprocess.
#[async_trait]
pub trait SdkClient: Send {
    /// Submit a user message to the conversation.
    async fn query(&mut self, prompt: &str) -> Result<()>;

    /// Next streamed message for the current query; `None` once the
    /// terminal result message has been consumed.
    async fn next_message(&mut self) -> Result<Option<SdkMessage>>;

    /// Tear the subprocess down. Idempotent, best-effort.
    async fn disconnect(&mut self) -> Result<()>;
}

/// Factory opening clients; one per Telephone generation.
#[async_trait]
pub trait SdkConnector: Send + Sync {
    async fn connect(
        &self,
        options: SdkOptions,
        guard: Option<PermissionGuard>,
    ) -> Result<Box<dyn SdkClient>>;
}
