//! LLM transport port.

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::error::LlmError;
use crate::domain::models::{CallMetrics, ChatMessage};

/// What a transport call produced.
#[derive(Debug, Clone)]
pub enum LlmReply {
    /// Parsed JSON object (arrays are wrapped as `{"list": …}` upstream)
    Json(Value),
    /// Raw text when `expect_json` was false
    Text(String),
}

impl LlmReply {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(v) => Some(v),
            Self::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Json(_) => None,
        }
    }
}

/// Sends role-tagged message sequences to a language model.
///
/// Implementations own retry and JSON-salvage behavior; callers receive
/// either a parsed object or the raw string, plus per-call usage metrics.
#[async_trait]
pub trait LlmTransport: Send + Sync {
    /// Send a conversation and return the reply.
    ///
    /// `role` selects the model/temperature pair configured for the caller
    /// (`planner`, `executor`, `reflector`, `summarizer`, ...).
    async fn send_message(
        &self,
        messages: &[ChatMessage],
        role: &str,
        expect_json: bool,
    ) -> Result<(LlmReply, CallMetrics), LlmError>;

    /// Summarize a conversation slice for context compression.
    async fn summarize_conversation(
        &self,
        messages: &[ChatMessage],
    ) -> Result<(String, CallMetrics), LlmError>;
}
