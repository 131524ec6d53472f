//! Subprocess-backed SDK connector.
//!
//! Bridges the [`SdkConnector`] contract onto an external agent CLI
//! speaking newline-delimited JSON: each `query` writes a user line,
//! the subprocess streams [`SdkMessage`] lines back, and a turn ends
//! at the terminal result message. Permission requests arrive as
//! `{"type":"permission_request", ...}` lines and are answered inline
//! from the guard callback, so the subprocess blocks until the daemon
//! decides.

use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use delegate_core::error::{DelegateError, Result};

use crate::sdk::{
    PermissionDecision, PermissionGuard, SdkClient, SdkConnector, SdkMessage, SdkOptions,
};

/// Environment variable carrying the serialized options to the
/// subprocess.
const OPTIONS_ENV: &str = "DELEGATE_SDK_OPTIONS";

#[derive(Serialize)]
struct UserLine<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct PermissionRequest {
    name: String,
    input: serde_json::Value,
    #[serde(default)]
    request_id: Option<String>,
}

#[derive(Serialize)]
struct PermissionResponse<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<&'a str>,
    behavior: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
}

#[derive(Serialize)]
struct OptionsPayload<'a> {
    cwd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    add_dirs: Vec<String>,
    disallowed_tools: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    permission_mode: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sandbox: Option<&'a crate::sdk::SandboxConfig>,
    mcp_servers: &'a std::collections::BTreeMap<String, serde_json::Value>,
}

/// Connector spawning one agent subprocess per Telephone generation.
#[derive(Debug, Clone)]
pub struct ProcessConnector {
    /// Program plus leading arguments, e.g. `["claude-agent", "--ndjson"]`.
    pub command: Vec<String>,
}

impl ProcessConnector {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl SdkConnector for ProcessConnector {
    async fn connect(
        &self,
        options: SdkOptions,
        guard: Option<PermissionGuard>,
    ) -> Result<Box<dyn SdkClient>> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| DelegateError::Sdk("empty agent command".into()))?;

        let payload = OptionsPayload {
            cwd: options.cwd.display().to_string(),
            model: options.model.as_deref(),
            add_dirs: options
                .add_dirs
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
            disallowed_tools: &options.disallowed_tools,
            permission_mode: options.permission_mode.as_deref(),
            sandbox: options.sandbox.as_ref(),
            mcp_servers: &options.mcp_servers,
        };

        let mut child = Command::new(program)
            .args(args)
            .current_dir(&options.cwd)
            .env(OPTIONS_ENV, serde_json::to_string(&payload)?)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DelegateError::Sdk(format!("spawn {program}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DelegateError::Sdk("agent subprocess has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DelegateError::Sdk("agent subprocess has no stdout".into()))?;

        Ok(Box::new(ProcessClient {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            guard,
            turn_done: true,
        }))
    }
}

struct ProcessClient {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    guard: Option<PermissionGuard>,
    /// True between turns; a query opens a new turn.
    turn_done: bool,
}

impl ProcessClient {
    async fn write_line(&mut self, value: &impl Serialize) -> Result<()> {
        let mut line = serde_json::to_string(value)?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| DelegateError::Sdk(format!("agent stdin closed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl SdkClient for ProcessClient {
    async fn query(&mut self, prompt: &str) -> Result<()> {
        self.write_line(&UserLine {
            kind: "user",
            content: prompt,
        })
        .await?;
        self.turn_done = false;
        Ok(())
    }

    async fn next_message(&mut self) -> Result<Option<SdkMessage>> {
        if self.turn_done {
            return Ok(None);
        }
        loop {
            let mut line = String::new();
            let read = self
                .stdout
                .read_line(&mut line)
                .await
                .map_err(|e| DelegateError::Sdk(format!("agent stdout: {e}")))?;
            if read == 0 {
                return Err(DelegateError::Sdk(
                    "agent subprocess closed mid-stream".into(),
                ));
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            // Permission requests are answered inline, not surfaced.
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
                if value.get("type").and_then(|t| t.as_str()) == Some("permission_request") {
                    let request: PermissionRequest = serde_json::from_value(value)?;
                    let decision = match &self.guard {
                        Some(guard) => guard(&request.name, &request.input),
                        None => PermissionDecision::Allow,
                    };
                    let response = match &decision {
                        PermissionDecision::Allow => PermissionResponse {
                            kind: "permission_response",
                            request_id: request.request_id.as_deref(),
                            behavior: "allow",
                            message: None,
                        },
                        PermissionDecision::Deny { message } => PermissionResponse {
                            kind: "permission_response",
                            request_id: request.request_id.as_deref(),
                            behavior: "deny",
                            message: Some(message),
                        },
                    };
                    self.write_line(&response).await?;
                    continue;
                }
            }

            let msg: SdkMessage = serde_json::from_str(line)
                .map_err(|e| DelegateError::Sdk(format!("bad agent message: {e}: {line}")))?;
            if matches!(msg, SdkMessage::Result { .. }) {
                self.turn_done = true;
            }
            return Ok(Some(msg));
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::ContentBlock;

    /// A shell stand-in for the agent CLI: for every user line it
    /// emits one assistant text line and a result line.
    fn echo_agent() -> ProcessConnector {
        let script = r#"
while read -r _line; do
  printf '%s\n' '{"type":"assistant","content":[{"type":"text","text":"pong"}]}'
  printf '%s\n' '{"type":"result","total_cost_usd":0.01,"usage":{"input_tokens":7,"output_tokens":3}}'
done
"#;
        ProcessConnector::new(vec!["/bin/sh".into(), "-c".into(), script.into()])
    }

    #[tokio::test]
    async fn test_turn_roundtrip() {
        let connector = echo_agent();
        let dir = tempfile::tempdir().unwrap();
        let mut client = connector
            .connect(
                SdkOptions {
                    cwd: dir.path().to_path_buf(),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();

        client.query("ping").await.unwrap();
        let first = client.next_message().await.unwrap().unwrap();
        match first {
            SdkMessage::Assistant { content, .. } => match &content[0] {
                ContentBlock::Text { text } => assert_eq!(text, "pong"),
                other => panic!("unexpected block: {other:?}"),
            },
            other => panic!("unexpected message: {other:?}"),
        }
        let second = client.next_message().await.unwrap().unwrap();
        assert!(matches!(second, SdkMessage::Result { .. }));
        // Turn over: stream ends.
        assert!(client.next_message().await.unwrap().is_none());

        // A second query opens a fresh turn on the same subprocess.
        client.query("ping again").await.unwrap();
        assert!(client.next_message().await.unwrap().is_some());
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_permission_request_denied_by_guard() {
        let script = r#"
read -r _line
printf '%s\n' '{"type":"permission_request","name":"Bash","input":{"command":"git push"},"request_id":"r1"}'
read -r response
case "$response" in
  *deny*) printf '%s\n' '{"type":"assistant","content":[{"type":"text","text":"denied"}]}' ;;
  *) printf '%s\n' '{"type":"assistant","content":[{"type":"text","text":"allowed"}]}' ;;
esac
printf '%s\n' '{"type":"result","total_cost_usd":0.0,"usage":{}}'
"#;
        let connector =
            ProcessConnector::new(vec!["/bin/sh".into(), "-c".into(), script.into()]);
        let dir = tempfile::tempdir().unwrap();
        let guard: PermissionGuard = std::sync::Arc::new(|name, _input| {
            if name == "Bash" {
                PermissionDecision::Deny {
                    message: "no pushes".into(),
                }
            } else {
                PermissionDecision::Allow
            }
        });
        let mut client = connector
            .connect(
                SdkOptions {
                    cwd: dir.path().to_path_buf(),
                    ..Default::default()
                },
                Some(guard),
            )
            .await
            .unwrap();

        client.query("do something forbidden").await.unwrap();
        let first = client.next_message().await.unwrap().unwrap();
        match first {
            SdkMessage::Assistant { content, .. } => match &content[0] {
                ContentBlock::Text { text } => assert_eq!(text, "denied"),
                other => panic!("unexpected block: {other:?}"),
            },
            other => panic!("unexpected message: {other:?}"),
        }
        client.disconnect().await.unwrap();
    }
}
