//! Tool invoker: routing, timeouts and retry for tool calls.
//!
//! Faults never escape as errors. Every failure is encoded into the
//! returned payload (`{"success": false, ...}`) so the executor can hand
//! it to the LLM as an observation; transient faults are retried first
//! with a fixed backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::domain::error::ToolError;
use crate::domain::models::ToolServerConfig;
use crate::domain::ports::{ToolDispatch, ToolInfo};

use super::catalog::ToolCatalog;
use super::stdio::StdioToolSession;

/// Routes tool calls across the configured stdio servers.
pub struct ToolInvoker {
    sessions: Vec<Arc<StdioToolSession>>,
    catalog: ToolCatalog,
    timeout_secs: u64,
    max_retries: u32,
    retry_delay_secs: u64,
}

impl ToolInvoker {
    pub fn new(
        servers: Vec<ToolServerConfig>,
        timeout_secs: u64,
        max_retries: u32,
        retry_delay_secs: u64,
    ) -> Self {
        let sessions = servers
            .into_iter()
            .filter(|s| {
                let supported = s.transport == "stdio";
                if !supported {
                    tracing::warn!(server = %s.name, transport = %s.transport, "unsupported tool transport skipped");
                }
                supported
            })
            .map(|s| Arc::new(StdioToolSession::new(s)))
            .collect();
        Self {
            sessions,
            catalog: ToolCatalog::new(),
            timeout_secs,
            max_retries,
            retry_delay_secs,
        }
    }

    /// Discover every advertised tool. Run once at startup and whenever
    /// the executor wants a fresh catalog.
    pub async fn refresh_catalog(&self) {
        self.catalog.refresh(&self.sessions).await;
    }

    fn session(&self, name: &str) -> Option<&Arc<StdioToolSession>> {
        self.sessions.iter().find(|s| s.name() == name)
    }

    fn server_names(&self) -> Vec<String> {
        self.sessions.iter().map(|s| s.name().to_string()).collect()
    }

    async fn call_with_retry(
        &self,
        session: &Arc<StdioToolSession>,
        tool: &str,
        params: &Value,
    ) -> Result<String, ToolError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let call = session.call_tool(tool, params.clone());
            let result = match tokio::time::timeout(
                Duration::from_secs(self.timeout_secs),
                call,
            )
            .await
            {
                Ok(inner) => inner,
                Err(_) => Err(ToolError::Timeout(tool.to_string(), self.timeout_secs)),
            };

            match result {
                Ok(text) => return Ok(text),
                Err(e) if e.is_transient() && attempt <= self.max_retries => {
                    tracing::warn!(
                        tool,
                        attempt,
                        error = %e,
                        "transient tool fault, retrying after {}s",
                        self.retry_delay_secs
                    );
                    tokio::time::sleep(Duration::from_secs(self.retry_delay_secs)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl ToolDispatch for ToolInvoker {
    async fn call(&self, tool: &str, params: Value) -> String {
        if self.catalog.is_empty().await {
            self.refresh_catalog().await;
        }
        let Some(server) = self.catalog.server_for(tool).await else {
            return json!({
                "success": false,
                "error": format!("tool {tool} not found on any configured server"),
                "error_type": "MISSING_TOOL",
                "available_servers": self.server_names(),
            })
            .to_string();
        };
        let Some(session) = self.session(&server) else {
            return json!({
                "success": false,
                "error": format!("tool server {server} not configured"),
            })
            .to_string();
        };
        match self.call_with_retry(session, tool, &params).await {
            Ok(text) => text,
            Err(e) => json!({
                "success": false,
                "error": format!("tool call failed: {e}"),
            })
            .to_string(),
        }
    }

    async fn catalog(&self) -> Vec<ToolInfo> {
        if self.catalog.is_empty().await {
            self.refresh_catalog().await;
        }
        self.catalog.all().await
    }

    async fn shutdown(&self) {
        for session in &self.sessions {
            session.close().await;
        }
    }
}

/// Classification of a tool result payload as seen by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolResultKind {
    /// A well-formed result (success or domain-level failure)
    Normal,
    /// `{success:false, error_type: SYNTAX|MISSING_TOOL}` — the LLM can
    /// correct its call and retry within the same turn
    Correctable,
}

/// Inspect a raw tool result for the correctable-error contract.
pub fn classify_tool_result(raw: &str) -> (ToolResultKind, Option<String>) {
    let Ok(parsed) = serde_json::from_str::<Value>(raw) else {
        return (ToolResultKind::Normal, None);
    };
    if parsed.get("success").and_then(Value::as_bool) == Some(false) {
        let error_type = parsed.get("error_type").and_then(Value::as_str);
        if matches!(error_type, Some("SYNTAX") | Some("MISSING_TOOL")) {
            let message = parsed
                .get("message")
                .or_else(|| parsed.get("error"))
                .and_then(Value::as_str)
                .unwrap_or("invalid tool call")
                .to_string();
            let hint = parsed
                .get("fix_suggestion")
                .and_then(Value::as_str)
                .map(|s| format!(" -> {s}"))
                .unwrap_or_default();
            return (ToolResultKind::Correctable, Some(format!("{message}{hint}")));
        }
    }
    (ToolResultKind::Normal, None)
}
