//! Bounded-context persistent conversation with one agent subprocess.
//!
//! On the first turn of each generation the user message sent to the
//! SDK is `## PREAMBLE` + `## MEMORY` (when non-empty) + the prompt;
//! subsequent turns send the prompt alone and rely on the subprocess's
//! own conversation history. When cumulative input tokens exceed the
//! budget the session rotates: the model summarizes its state, the
//! summary becomes the new memory (persisted via `on_rotation`), the
//! old subprocess is queued for disconnect, and a fresh generation
//! starts.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use delegate_core::error::Result;

use crate::guard::GuardConfig;
use crate::sdk::{
    ContentBlock, SandboxConfig, SdkClient, SdkConnector, SdkMessage, SdkOptions,
};
use crate::usage::Usage;

/// Rotate once the current generation's input tokens pass this.
pub const DEFAULT_MAX_CONTEXT_TOKENS: i64 = 80_000;

pub const DEFAULT_ROTATION_PROMPT: &str = "Your session context is about to be rotated. \
Please write a concise summary of whatever you have learned about the project, codebase, \
recent tasks, and any other information that may be useful to you in future sessions.\n\
This summary will be provided to you at the start of your next session so you can pick up \
where you left off.";

/// Callback persisting the rotation summary (e.g. to `context.md`).
pub type RotationCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Constructor inputs for a [`Telephone`].
#[derive(Clone)]
pub struct TelephoneConfig {
    /// Static role instructions, included on turn 0 of every generation.
    pub preamble: String,
    pub cwd: PathBuf,
    /// Dynamic accumulated context; replaced by the rotation summary.
    pub memory: String,
    pub max_context_tokens: i64,
    /// `None` skips summarization on rotation (hard reset only).
    pub rotation_prompt: Option<String>,
    pub on_rotation: Option<RotationCallback>,
    pub model: Option<String>,
    pub allowed_write_paths: Option<Vec<PathBuf>>,
    pub denied_bash_patterns: Vec<String>,
    pub add_dirs: Vec<PathBuf>,
    pub permission_mode: String,
    pub disallowed_tools: Vec<String>,
    pub sandbox_enabled: bool,
    pub allowed_domains: Vec<String>,
    pub mcp_servers: BTreeMap<String, serde_json::Value>,
}

impl Default for TelephoneConfig {
    fn default() -> Self {
        Self {
            preamble: String::new(),
            cwd: PathBuf::from("."),
            memory: String::new(),
            max_context_tokens: DEFAULT_MAX_CONTEXT_TOKENS,
            rotation_prompt: Some(DEFAULT_ROTATION_PROMPT.to_string()),
            on_rotation: None,
            model: None,
            allowed_write_paths: None,
            denied_bash_patterns: Vec::new(),
            add_dirs: Vec::new(),
            permission_mode: "bypassPermissions".to_string(),
            disallowed_tools: Vec::new(),
            sandbox_enabled: false,
            allowed_domains: vec!["*".to_string()],
            mcp_servers: BTreeMap::new(),
        }
    }
}

/// A persistent conversation: one subprocess per generation, token
/// accounting across generations, and permission enforcement.
pub struct Telephone {
    /// Stable per-generation identity; re-minted on every rotation.
    pub id: String,
    pub preamble: String,
    pub memory: String,
    config: TelephoneConfig,
    connector: Arc<dyn SdkConnector>,

    client: Option<Box<dyn SdkClient>>,
    /// Previous generation's subprocess, disconnected lazily on the
    /// next connect (or on `close`).
    stale_client: Option<Box<dyn SdkClient>>,

    /// Usage of the current generation.
    usage: Usage,
    /// Usage summed across prior generations.
    prior_usage: Usage,
    /// SDK cost is cumulative per subprocess; diff against this.
    last_cumulative_cost: f64,

    pub turns: u64,
    pub generation: u64,
}

impl Telephone {
    pub fn new(config: TelephoneConfig, connector: Arc<dyn SdkConnector>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            preamble: config.preamble.clone(),
            memory: config.memory.clone(),
            config,
            connector,
            client: None,
            stale_client: None,
            usage: Usage::default(),
            prior_usage: Usage::default(),
            last_cumulative_cost: 0.0,
            turns: 0,
            generation: 0,
        }
    }

    // ── Accessors ──────────────────────────────────────────────────

    /// Whether a connected subprocess exists.
    pub fn is_active(&self) -> bool {
        self.client.is_some()
    }

    /// Whether the current generation's input tokens exceed the budget.
    pub fn needs_rotation(&self) -> bool {
        self.usage.input_tokens > self.config.max_context_tokens
    }

    /// Current-generation usage.
    pub fn usage(&self) -> Usage {
        self.usage
    }

    /// Lifetime usage across all generations.
    pub fn total_usage(&self) -> Usage {
        self.usage + self.prior_usage
    }

    pub fn cwd(&self) -> &PathBuf {
        &self.config.cwd
    }

    pub fn set_allowed_write_paths(&mut self, paths: Option<Vec<PathBuf>>) {
        self.config.allowed_write_paths = paths;
    }

    // ── Core API ───────────────────────────────────────────────────

    /// Send a prompt, streaming each SDK message into `on_message`.
    ///
    /// Rotates first when the context budget is exhausted. On turn 0 of
    /// a generation the composite preamble+memory+prompt message is
    /// sent; afterwards the prompt alone.
    pub async fn send<F>(&mut self, prompt: &str, mut on_message: F) -> Result<()>
    where
        F: FnMut(&SdkMessage),
    {
        if self.needs_rotation() {
            self.rotate().await?;
        }
        self.run_turn(prompt, &mut on_message).await
    }

    /// Rotate: summarize (when configured and connected), persist the
    /// new memory, reset conversation state. Returns the summary.
    pub async fn rotate(&mut self) -> Result<Option<String>> {
        let summary = self.summarize().await?;

        tracing::info!(
            "Telephone {} rotating (gen {} -> {}, {} turns, {} input tokens)",
            &self.id[..8],
            self.generation,
            self.generation + 1,
            self.turns,
            self.usage.input_tokens,
        );

        self.memory = summary.clone().unwrap_or_default();
        if let Some(on_rotation) = &self.config.on_rotation {
            on_rotation(&self.memory);
        }
        self.reset();
        Ok(summary)
    }

    /// Hard reset: queue the subprocess for disconnect, mint a new id,
    /// roll current usage into `prior_usage`, bump the generation.
    /// Memory is preserved across resets.
    pub fn reset(&mut self) {
        if let Some(client) = self.client.take() {
            self.stale_client = Some(client);
        }
        self.id = uuid::Uuid::new_v4().simple().to_string();
        self.turns = 0;
        self.prior_usage += self.usage;
        self.usage = Usage::default();
        // A fresh subprocess reports cumulative cost from zero.
        self.last_cumulative_cost = 0.0;
        self.generation += 1;
    }

    /// Disconnect the subprocess (and any stale one).
    pub async fn close(&mut self) -> Result<()> {
        for client in [self.client.take(), self.stale_client.take()].iter_mut() {
            if let Some(client) = client {
                let _ = client.disconnect().await;
            }
        }
        Ok(())
    }

    // ── Internals ──────────────────────────────────────────────────

    /// Run one turn without the rotation check (the summary turn uses
    /// this directly so it can never re-trigger rotation).
    async fn run_turn<F>(&mut self, prompt: &str, on_message: &mut F) -> Result<()>
    where
        F: FnMut(&SdkMessage),
    {
        self.ensure_client().await?;

        let effective = if self.turns == 0 {
            self.build_turn0_prompt(prompt)
        } else {
            prompt.to_string()
        };

        let client = self.client.as_mut().expect("client connected above");
        client.query(&effective).await?;
        loop {
            let client = self.client.as_mut().expect("client connected above");
            let Some(msg) = client.next_message().await? else {
                break;
            };
            self.track_message(&msg);
            on_message(&msg);
        }
        self.turns += 1;
        Ok(())
    }

    /// Ask the model to summarize its state; returns `None` when no
    /// rotation prompt is configured or no subprocess is live.
    async fn summarize(&mut self) -> Result<Option<String>> {
        let Some(prompt) = self.config.rotation_prompt.clone() else {
            return Ok(None);
        };
        if self.client.is_none() {
            return Ok(None);
        }

        let mut parts: Vec<String> = Vec::new();
        self.run_turn(&prompt, &mut |msg| {
            if let SdkMessage::Assistant { content, .. } = msg {
                for block in content {
                    if let ContentBlock::Text { text } = block {
                        parts.push(text.clone());
                    }
                }
            }
        })
        .await?;

        let summary = parts.join("\n").trim().to_string();
        Ok(if summary.is_empty() {
            None
        } else {
            Some(summary)
        })
    }

    fn build_turn0_prompt(&self, prompt: &str) -> String {
        let mut parts = vec!["## PREAMBLE".to_string(), self.preamble.clone()];
        if !self.memory.trim().is_empty() {
            parts.push("## MEMORY".to_string());
            parts.push(self.memory.clone());
        }
        parts.push(prompt.to_string());
        parts.join("\n\n")
    }

    async fn ensure_client(&mut self) -> Result<()> {
        if self.client.is_some() {
            return Ok(());
        }
        if let Some(mut stale) = self.stale_client.take() {
            let _ = stale.disconnect().await;
        }

        let guard_config = GuardConfig {
            cwd: self.config.cwd.clone(),
            allowed_write_paths: self.config.allowed_write_paths.clone(),
            denied_bash_patterns: self.config.denied_bash_patterns.clone(),
        };
        let guard = guard_config.make_guard();

        let sandbox = if self.config.sandbox_enabled {
            let restrict_network = !self.config.allowed_domains.iter().any(|d| d == "*");
            Some(SandboxConfig {
                enabled: true,
                auto_allow_bash_if_sandboxed: true,
                allow_unsandboxed_commands: false,
                allow_local_binding: restrict_network.then_some(false),
            })
        } else {
            None
        };

        let options = SdkOptions {
            cwd: self.config.cwd.clone(),
            model: self.config.model.clone(),
            add_dirs: self.config.add_dirs.clone(),
            disallowed_tools: self.config.disallowed_tools.clone(),
            // With a guard active the permission mode must stay unset:
            // a bypass mode would auto-approve before the guard runs.
            permission_mode: if guard.is_some() {
                None
            } else {
                Some(self.config.permission_mode.clone())
            },
            sandbox,
            mcp_servers: self.config.mcp_servers.clone(),
        };

        self.client = Some(self.connector.connect(options, guard).await?);
        Ok(())
    }

    /// Fold a result message into the current generation's usage,
    /// converting the SDK's cumulative cost into a per-query delta.
    fn track_message(&mut self, msg: &SdkMessage) {
        let mut delta = Usage::from_sdk_message(msg);
        if delta.is_zero() {
            return;
        }
        let cumulative = delta.cost_usd;
        delta.cost_usd = (cumulative - self.last_cumulative_cost).max(0.0);
        self.last_cumulative_cost = cumulative;
        self.usage += delta;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{script_result, script_text, MockConnector};

    fn telephone(connector: &Arc<MockConnector>, config: TelephoneConfig) -> Telephone {
        Telephone::new(config, connector.clone())
    }

    #[tokio::test]
    async fn test_turn0_includes_preamble_and_memory() {
        let connector = MockConnector::new();
        connector.push_turn(vec![script_text("ok"), script_result(100, 10, 0.01)]);
        connector.push_turn(vec![script_text("again"), script_result(100, 10, 0.02)]);

        let mut tel = telephone(
            &connector,
            TelephoneConfig {
                preamble: "You are a senior engineer.".into(),
                memory: "We shipped the parser.".into(),
                ..Default::default()
            },
        );

        tel.send("Fix the bug", |_| {}).await.unwrap();
        tel.send("Now add tests", |_| {}).await.unwrap();

        let prompts = connector.prompts();
        assert!(prompts[0].starts_with("## PREAMBLE"));
        assert!(prompts[0].contains("You are a senior engineer."));
        assert!(prompts[0].contains("## MEMORY"));
        assert!(prompts[0].contains("We shipped the parser."));
        assert!(prompts[0].ends_with("Fix the bug"));
        // Turn 1 sends the raw prompt only.
        assert_eq!(prompts[1], "Now add tests");
    }

    #[tokio::test]
    async fn test_empty_memory_section_omitted() {
        let connector = MockConnector::new();
        connector.push_turn(vec![script_result(10, 1, 0.0)]);
        let mut tel = telephone(
            &connector,
            TelephoneConfig {
                preamble: "P".into(),
                ..Default::default()
            },
        );
        tel.send("go", |_| {}).await.unwrap();
        assert!(!connector.prompts()[0].contains("## MEMORY"));
    }

    #[tokio::test]
    async fn test_usage_delta_from_cumulative_cost() {
        let connector = MockConnector::new();
        connector.push_turn(vec![script_result(100, 10, 0.05)]);
        connector.push_turn(vec![script_result(200, 20, 0.12)]);

        let mut tel = telephone(&connector, TelephoneConfig::default());
        tel.send("a", |_| {}).await.unwrap();
        assert!((tel.usage().cost_usd - 0.05).abs() < 1e-9);

        tel.send("b", |_| {}).await.unwrap();
        // 0.12 cumulative -> 0.07 delta folded in.
        assert!((tel.usage().cost_usd - 0.12).abs() < 1e-9);
        assert_eq!(tel.usage().input_tokens, 300);
        assert_eq!(tel.turns, 2);
    }

    #[tokio::test]
    async fn test_rotation_on_budget_exhaustion() {
        let connector = MockConnector::new();
        // Turn 1 blows the budget.
        connector.push_turn(vec![script_result(150, 10, 0.01)]);
        // Summary turn on the old subprocess.
        connector.push_turn(vec![script_text("summary of work"), script_result(10, 5, 0.02)]);
        // First turn of the new generation.
        connector.push_turn(vec![script_result(20, 5, 0.01)]);

        let rotated: Arc<std::sync::Mutex<Vec<String>>> = Default::default();
        let rotated_clone = rotated.clone();
        let mut tel = telephone(
            &connector,
            TelephoneConfig {
                preamble: "P".into(),
                max_context_tokens: 100,
                on_rotation: Some(Arc::new(move |memory: &str| {
                    rotated_clone.lock().unwrap().push(memory.to_string());
                })),
                ..Default::default()
            },
        );

        tel.send("big turn", |_| {}).await.unwrap();
        assert!(tel.needs_rotation());
        let gen0_id = tel.id.clone();

        tel.send("next", |_| {}).await.unwrap();
        // Rotation happened before the prompt ran.
        assert_eq!(tel.generation, 1);
        assert_ne!(tel.id, gen0_id);
        assert_eq!(tel.memory, "summary of work");
        assert_eq!(rotated.lock().unwrap().as_slice(), ["summary of work"]);

        // New generation's turn 0 includes the fresh memory.
        let prompts = connector.prompts();
        let last = prompts.last().unwrap();
        assert!(last.contains("## MEMORY"));
        assert!(last.contains("summary of work"));

        // Usage rolled into prior_usage; current generation restarted.
        assert_eq!(tel.usage().input_tokens, 20);
        assert_eq!(tel.total_usage().input_tokens, 150 + 10 + 20);
        // Cost delta restarts per subprocess.
        assert!((tel.usage().cost_usd - 0.01).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_reset_preserves_memory() {
        let connector = MockConnector::new();
        let mut tel = telephone(
            &connector,
            TelephoneConfig {
                memory: "sticky".into(),
                ..Default::default()
            },
        );
        tel.reset();
        assert_eq!(tel.memory, "sticky");
        assert_eq!(tel.generation, 1);
        assert_eq!(tel.turns, 0);
    }

    #[tokio::test]
    async fn test_rotate_without_client_skips_summary() {
        let connector = MockConnector::new();
        let mut tel = telephone(&connector, TelephoneConfig::default());
        let summary = tel.rotate().await.unwrap();
        assert!(summary.is_none());
        assert_eq!(tel.generation, 1);
    }

    #[tokio::test]
    async fn test_stale_client_disconnected_on_next_connect() {
        let connector = MockConnector::new();
        connector.push_turn(vec![script_result(10, 1, 0.0)]);
        connector.push_turn(vec![script_result(10, 1, 0.0)]);

        let mut tel = telephone(&connector, TelephoneConfig::default());
        tel.send("a", |_| {}).await.unwrap();
        tel.reset();
        tel.send("b", |_| {}).await.unwrap();
        // Two clients were opened; the first was disconnected.
        assert_eq!(connector.connect_count(), 2);
        assert_eq!(connector.disconnect_count(), 1);

        tel.close().await.unwrap();
        assert_eq!(connector.disconnect_count(), 2);
        assert!(!tel.is_active());
    }

    #[tokio::test]
    async fn test_guard_suppresses_permission_mode() {
        let connector = MockConnector::new();
        connector.push_turn(vec![script_result(1, 1, 0.0)]);
        let dir = tempfile::tempdir().unwrap();
        let mut tel = telephone(
            &connector,
            TelephoneConfig {
                cwd: dir.path().to_path_buf(),
                allowed_write_paths: Some(vec![dir.path().to_path_buf()]),
                ..Default::default()
            },
        );
        tel.send("x", |_| {}).await.unwrap();
        let opts = connector.last_options().unwrap();
        assert!(opts.permission_mode.is_none());
        assert!(connector.last_had_guard());
    }
}
