//! Tool dispatch port.

use async_trait::async_trait;
use serde_json::Value;

/// Description of one advertised tool, used for prompt assembly.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    /// JSON schema of the tool's arguments
    pub input_schema: Value,
    /// Server that advertises the tool
    pub server: String,
}

/// Routes tool calls to whichever configured server advertises them.
///
/// Calls never fail at this boundary: faults are encoded in the returned
/// payload (`{"success": false, ...}`) so the executor can surface them to
/// the LLM as observations.
#[async_trait]
pub trait ToolDispatch: Send + Sync {
    /// Invoke a tool and return its raw textual result.
    async fn call(&self, tool: &str, params: Value) -> String;

    /// Enumerate every advertised tool across all servers.
    async fn catalog(&self) -> Vec<ToolInfo>;

    /// Close all server sessions.
    async fn shutdown(&self);
}
