//! Domain error types for the Stratagem engine.
//!
//! Each enum covers one component boundary. Errors carry an
//! `is_transient` classification that drives the retry ladders.

use thiserror::Error;

/// Errors raised by graph mutations and queries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Referenced node does not exist in the task graph
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// An execution step referenced a parent that does not exist
    #[error("Parent node not found: {0}")]
    ParentNotFound(String),

    /// An edge insertion would introduce a cycle
    #[error("Edge {edge_source} -> {target} would create a cycle")]
    WouldCycle { edge_source: String, target: String },

    /// A causal edge referenced an endpoint that does not exist
    #[error("Causal endpoint not found: {0}")]
    CausalEndpointNotFound(String),
}

/// Errors raised by the LLM transport.
#[derive(Error, Debug)]
pub enum LlmError {
    /// Request failed at the network layer
    #[error("LLM request failed: {0}")]
    RequestFailed(String),

    /// Request timed out
    #[error("LLM request timed out after {0} seconds")]
    Timeout(u64),

    /// The API returned a non-success status
    #[error("LLM API error {status}: {message}")]
    ApiError { status: u16, message: String },

    /// The reply could not be salvaged into JSON after all retries
    #[error("LLM reply was not valid JSON after {0} attempts")]
    InvalidJson(u32),

    /// The reply was empty
    #[error("LLM returned no content")]
    EmptyReply,
}

impl LlmError {
    /// Whether this error should be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RequestFailed(_) | Self::Timeout(_) => true,
            Self::ApiError { status, .. } => *status == 429 || *status >= 500,
            Self::InvalidJson(_) | Self::EmptyReply => false,
        }
    }
}

/// Errors raised by tool dispatch.
#[derive(Error, Debug)]
pub enum ToolError {
    /// No configured server advertises the tool
    #[error("Tool '{tool}' not found on any server")]
    ToolNotFound {
        tool: String,
        available_servers: Vec<String>,
    },

    /// Named server is not configured
    #[error("Tool server not configured: {0}")]
    ServerNotConfigured(String),

    /// The server process could not be spawned
    #[error("Failed to spawn tool server '{0}': {1}")]
    SpawnFailed(String, String),

    /// The call exceeded its timeout
    #[error("Tool call '{0}' timed out after {1} seconds")]
    Timeout(String, u64),

    /// Transport-level failure (closed pipe, malformed frame)
    #[error("Tool transport error: {0}")]
    Transport(String),

    /// The server returned a JSON-RPC error object
    #[error("Tool server error: {0}")]
    Rpc(String),
}

impl ToolError {
    /// Whether the fault is transient enough to retry the call.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_, _) | Self::Transport(_))
    }
}

/// Errors raised by the persistence layer. These never propagate into the
/// control loop; the sink logs them and continues.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Row not found")]
    RowNotFound,
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Self::RowNotFound,
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                Self::ConnectionFailed(e.to_string())
            }
            other => Self::QueryFailed(other.to_string()),
        }
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    #[error("Invalid executor setting {field}: {value}")]
    InvalidExecutorSetting { field: &'static str, value: String },

    #[error("Tool server '{0}' is missing a command")]
    ToolServerMissingCommand(String),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_error_transience() {
        assert!(LlmError::RequestFailed("reset".into()).is_transient());
        assert!(LlmError::Timeout(1200).is_transient());
        assert!(LlmError::ApiError { status: 429, message: "tpm".into() }.is_transient());
        assert!(LlmError::ApiError { status: 503, message: "busy".into() }.is_transient());
        assert!(!LlmError::ApiError { status: 401, message: "key".into() }.is_transient());
        assert!(!LlmError::InvalidJson(3).is_transient());
    }

    #[test]
    fn test_tool_error_transience() {
        assert!(ToolError::Timeout("probe".into(), 300).is_transient());
        assert!(ToolError::Transport("pipe closed".into()).is_transient());
        assert!(!ToolError::ToolNotFound { tool: "x".into(), available_servers: vec![] }
            .is_transient());
    }

    #[test]
    fn test_graph_error_display() {
        let err = GraphError::ParentNotFound("step_9".into());
        assert_eq!(err.to_string(), "Parent node not found: step_9");
    }
}
