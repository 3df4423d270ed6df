//! Tool catalog: a cache of every advertised tool across all servers.
//!
//! The executor's prompt enumerates this catalog each turn; routing uses
//! it to find which server advertises a tool.

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::domain::ports::ToolInfo;

use super::stdio::StdioToolSession;

/// Cached tool listing.
#[derive(Default)]
pub struct ToolCatalog {
    entries: RwLock<Vec<ToolInfo>>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-query every session and replace the cache. Servers that fail to
    /// list are skipped; their tools simply disappear until they recover.
    pub async fn refresh(&self, sessions: &[Arc<StdioToolSession>]) {
        let mut entries = Vec::new();
        for session in sessions {
            match session.list_tools().await {
                Ok(tools) => entries.extend(tools),
                Err(e) => {
                    tracing::warn!(server = session.name(), error = %e, "tools/list failed");
                }
            }
        }
        *self.entries.write().await = entries;
    }

    pub async fn all(&self) -> Vec<ToolInfo> {
        self.entries.read().await.clone()
    }

    /// The server advertising `tool`, if any.
    pub async fn server_for(&self, tool: &str) -> Option<String> {
        self.entries
            .read()
            .await
            .iter()
            .find(|t| t.name == tool)
            .map(|t| t.server.clone())
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
