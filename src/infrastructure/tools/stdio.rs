//! Stdio-framed JSON-RPC session with one tool-server child process.
//!
//! Each configured server is launched lazily on first use, behind a
//! session-level lock so concurrent callers cannot double-start it. The
//! process lives for the whole run; requests and responses are
//! line-delimited JSON-RPC 2.0 (`initialize`, `tools/list`, `tools/call`).

use std::process::Stdio;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::domain::error::ToolError;
use crate::domain::models::ToolServerConfig;
use crate::domain::ports::ToolInfo;

struct SessionState {
    _child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

/// A persistent stdio session with one tool server.
pub struct StdioToolSession {
    config: ToolServerConfig,
    state: Mutex<Option<SessionState>>,
}

impl StdioToolSession {
    pub fn new(config: ToolServerConfig) -> Self {
        Self { config, state: Mutex::new(None) }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    async fn ensure_started(
        &self,
        state: &mut Option<SessionState>,
    ) -> Result<(), ToolError> {
        if state.is_some() {
            return Ok(());
        }
        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| ToolError::SpawnFailed(self.config.name.clone(), e.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ToolError::Transport("missing child stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ToolError::Transport("missing child stdout".to_string()))?;

        let mut session = SessionState {
            _child: child,
            stdin,
            reader: BufReader::new(stdout),
            next_id: 0,
        };
        let init = Self::roundtrip(
            &mut session,
            "initialize",
            json!({"clientInfo": {"name": "stratagem"}}),
        )
        .await?;
        if init.get("error").is_some() {
            return Err(ToolError::Rpc(init["error"].to_string()));
        }
        tracing::info!(server = %self.config.name, "tool server session started");
        *state = Some(session);
        Ok(())
    }

    async fn roundtrip(
        session: &mut SessionState,
        method: &str,
        params: Value,
    ) -> Result<Value, ToolError> {
        session.next_id += 1;
        let id = session.next_id;
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let mut frame = request.to_string();
        frame.push('\n');
        session
            .stdin
            .write_all(frame.as_bytes())
            .await
            .map_err(|e| ToolError::Transport(e.to_string()))?;
        session
            .stdin
            .flush()
            .await
            .map_err(|e| ToolError::Transport(e.to_string()))?;

        loop {
            let mut line = String::new();
            let read = session
                .reader
                .read_line(&mut line)
                .await
                .map_err(|e| ToolError::Transport(e.to_string()))?;
            if read == 0 {
                return Err(ToolError::Transport("tool server closed stdout".to_string()));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let Ok(message) = serde_json::from_str::<Value>(trimmed) else {
                tracing::debug!(server_line = trimmed, "non-JSON line from tool server skipped");
                continue;
            };
            // Notifications (no id) are skipped; only our reply matters.
            if message.get("id").and_then(Value::as_u64) == Some(id) {
                return Ok(message);
            }
        }
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, ToolError> {
        let mut guard = self.state.lock().await;
        self.ensure_started(&mut guard).await?;
        let session = guard.as_mut().expect("session started above");
        let result = Self::roundtrip(session, method, params).await;
        if result.is_err() {
            // Transport faults invalidate the session so the next call
            // respawns the server.
            *guard = None;
        }
        result
    }

    /// `tools/list`: the tools this server advertises.
    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>, ToolError> {
        let response = self.request("tools/list", json!({})).await?;
        if let Some(error) = response.get("error") {
            return Err(ToolError::Rpc(error.to_string()));
        }
        let tools = response
            .get("result")
            .and_then(|r| r.get("tools"))
            .and_then(Value::as_array)
            .ok_or_else(|| ToolError::Rpc("malformed tools/list result".to_string()))?;
        Ok(tools
            .iter()
            .filter_map(|tool| {
                Some(ToolInfo {
                    name: tool.get("name")?.as_str()?.to_string(),
                    description: tool
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                    input_schema: tool
                        .get("inputSchema")
                        .cloned()
                        .unwrap_or(Value::Object(serde_json::Map::new())),
                    server: self.config.name.clone(),
                })
            })
            .collect())
    }

    /// `tools/call`: invoke a tool and return its textual content.
    pub async fn call_tool(&self, tool: &str, arguments: Value) -> Result<String, ToolError> {
        let response = self
            .request("tools/call", json!({"name": tool, "arguments": arguments}))
            .await?;
        if let Some(error) = response.get("error") {
            return Err(ToolError::Rpc(error.to_string()));
        }
        let result = response
            .get("result")
            .ok_or_else(|| ToolError::Rpc("missing result field".to_string()))?;
        let text = result
            .get("content")
            .and_then(Value::as_array)
            .and_then(|items| items.first())
            .and_then(|item| item.get("text"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| result.to_string());
        Ok(text)
    }

    /// Terminate the session; the child dies with the dropped handle.
    pub async fn close(&self) {
        let mut guard = self.state.lock().await;
        if guard.take().is_some() {
            tracing::info!(server = %self.config.name, "tool server session closed");
        }
    }
}
