//! HTTP LLM transport (OpenAI-compatible chat completions).
//!
//! Retry ladders mirror the fault taxonomy: network errors back off
//! linearly up to a cap; rate-limit rejections switch to the fallback key
//! once and then wait; invalid JSON triggers a correction turn asking the
//! model to resend valid JSON, up to three attempts.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::domain::error::LlmError;
use crate::domain::models::{CallMetrics, ChatMessage, LlmConfig, Role};
use crate::domain::ports::{LlmReply, LlmTransport};

use super::salvage::salvage_json;

/// Correction turn appended when salvage fails.
const JSON_CORRECTION: &str = "Your previous response was not valid JSON. Please correct the \
format and provide the full response again, ensuring it is a single, valid JSON object.";

/// OpenAI-compatible HTTP client.
pub struct HttpLlmClient {
    config: LlmConfig,
    client: reqwest::Client,
}

impl HttpLlmClient {
    pub fn new(config: LlmConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    fn payload(&self, messages: &[ChatMessage], role: &str, expect_json: bool) -> Value {
        let rendered: Vec<Value> = messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();
        let mut payload = json!({
            "model": self.config.model_for(role),
            "messages": rendered,
            "temperature": self.config.temperature_for(role),
            "stream": false,
        });
        if expect_json {
            payload["response_format"] = json!({"type": "json_object"});
        }
        payload
    }

    fn metrics_from_usage(&self, usage: Option<&Value>) -> CallMetrics {
        let prompt_tokens = usage
            .and_then(|u| u.get("prompt_tokens"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let completion_tokens = usage
            .and_then(|u| u.get("completion_tokens"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        CallMetrics {
            prompt_tokens,
            completion_tokens,
            cost: prompt_tokens as f64 * self.config.prompt_token_cost
                + completion_tokens as f64 * self.config.completion_token_cost,
        }
    }

    /// One HTTP round trip with the network/rate-limit retry ladder.
    async fn request_once(
        &self,
        payload: &Value,
    ) -> Result<(String, CallMetrics), LlmError> {
        let mut network_retries = 0u32;
        let mut api_key = self.config.api_key.clone();
        let mut fallback_used = false;

        loop {
            let response = self
                .client
                .post(&self.config.base_url)
                .header("Authorization", format!("Bearer {api_key}"))
                .header("Content-Type", "application/json")
                .json(payload)
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    network_retries += 1;
                    if network_retries > self.config.max_network_retries {
                        return Err(LlmError::RequestFailed(e.to_string()));
                    }
                    let wait = 5 * u64::from(network_retries);
                    tracing::warn!(
                        error = %e,
                        attempt = network_retries,
                        "LLM network error, retrying after {wait}s"
                    );
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                    continue;
                }
            };

            let status = response.status();
            if status.as_u16() == 429 {
                if let Some(fallback) = self
                    .config
                    .fallback_api_key
                    .as_ref()
                    .filter(|k| !k.is_empty() && !fallback_used)
                {
                    tracing::warn!("rate limited, switching to fallback API key");
                    api_key = fallback.clone();
                    fallback_used = true;
                    continue;
                }
                network_retries += 1;
                if network_retries > self.config.max_network_retries {
                    return Err(LlmError::ApiError {
                        status: 429,
                        message: "rate limit exceeded".to_string(),
                    });
                }
                tokio::time::sleep(Duration::from_secs(10)).await;
                continue;
            }
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                let error = LlmError::ApiError { status: status.as_u16(), message };
                if error.is_transient() && network_retries < self.config.max_network_retries {
                    network_retries += 1;
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
                return Err(error);
            }

            let body: Value = response
                .json()
                .await
                .map_err(|e| LlmError::RequestFailed(e.to_string()))?;
            let metrics = self.metrics_from_usage(body.get("usage"));
            let content = body
                .get("choices")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("message"))
                .and_then(|m| m.get("content"))
                .and_then(Value::as_str)
                .ok_or(LlmError::EmptyReply)?;
            return Ok((content.to_string(), metrics));
        }
    }
}

#[async_trait]
impl LlmTransport for HttpLlmClient {
    async fn send_message(
        &self,
        messages: &[ChatMessage],
        role: &str,
        expect_json: bool,
    ) -> Result<(LlmReply, CallMetrics), LlmError> {
        let mut conversation = messages.to_vec();
        let mut totals = CallMetrics::default();

        let max_attempts = self.config.max_json_retries.max(1);
        for attempt in 1..=max_attempts {
            let payload = self.payload(&conversation, role, expect_json);
            let (content, metrics) = self.request_once(&payload).await?;
            totals.prompt_tokens += metrics.prompt_tokens;
            totals.completion_tokens += metrics.completion_tokens;
            totals.cost += metrics.cost;

            if !expect_json {
                return Ok((LlmReply::Text(content), totals));
            }
            if let Some(parsed) = salvage_json(&content) {
                return Ok((LlmReply::Json(parsed), totals));
            }

            tracing::warn!(attempt, role, "LLM reply was not valid JSON");
            if attempt < max_attempts {
                conversation.push(ChatMessage { role: Role::Assistant, content });
                conversation.push(ChatMessage::user(JSON_CORRECTION));
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        Err(LlmError::InvalidJson(max_attempts))
    }

    async fn summarize_conversation(
        &self,
        messages: &[ChatMessage],
    ) -> Result<(String, CallMetrics), LlmError> {
        let mut rendered = String::new();
        for (index, message) in messages.iter().enumerate() {
            rendered.push_str(&format!(
                "\n[message {}] {}:\n{}\n{}",
                index + 1,
                message.role.as_str(),
                message.content,
                "-".repeat(50)
            ));
        }
        let prompt = format!(
            "You are the memory manager of an autonomous task agent. Compress the \
             following conversation history into a concise progress report that another \
             agent can resume from.\n\n\
             Preserve verbatim: security findings, concrete payloads and parameters, \
             discovered endpoints and versions, and exploratory ideas that were not yet \
             followed up. Compress: repeated tool invocations (keep the result), long \
             theory, routine verification.\n\n\
             Conversation to compress:\n{rendered}\n\n\
             Reply with the report as plain text."
        );
        let summary_request = vec![ChatMessage::user(prompt)];
        let (reply, metrics) = self
            .send_message(&summary_request, "summarizer", false)
            .await?;
        match reply {
            LlmReply::Text(text) if !text.trim().is_empty() => Ok((text, metrics)),
            _ => Err(LlmError::EmptyReply),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_shape() {
        let client = HttpLlmClient::new(LlmConfig::default());
        let messages = vec![ChatMessage::system("sys"), ChatMessage::user("hi")];
        let payload = client.payload(&messages, "executor", true);
        assert_eq!(payload["messages"][0]["role"], "system");
        assert_eq!(payload["messages"][1]["content"], "hi");
        assert_eq!(payload["response_format"]["type"], "json_object");
        assert_eq!(payload["stream"], false);
    }

    #[test]
    fn test_metrics_cost() {
        let mut config = LlmConfig::default();
        config.prompt_token_cost = 0.001;
        config.completion_token_cost = 0.002;
        let client = HttpLlmClient::new(config);
        let metrics =
            client.metrics_from_usage(Some(&json!({"prompt_tokens": 100, "completion_tokens": 50})));
        assert_eq!(metrics.prompt_tokens, 100);
        assert!((metrics.cost - 0.2).abs() < 1e-9);
    }
}
