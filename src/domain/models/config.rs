//! Configuration model.
//!
//! Loaded hierarchically by `infrastructure::config::ConfigLoader`:
//! defaults, then `stratagem.yaml`, then `STRATAGEM_*` environment
//! variables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Console verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    Simple,
    Default,
    Debug,
}

impl Default for OutputMode {
    fn default() -> Self {
        Self::Default
    }
}

impl OutputMode {
    /// Whether per-turn detail (LLM replies, tool results) is printed.
    pub fn verbose(&self) -> bool {
        matches!(self, Self::Default | Self::Debug)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub executor: ExecutorConfig,
    pub planner: PlannerConfig,
    pub reflector: ReflectorConfig,
    pub llm: LlmConfig,
    pub knowledge: KnowledgeConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    /// If false, approval requests auto-approve immediately
    pub human_in_the_loop: bool,
    /// Tunes prompt variants for special scenarios
    pub scenario_mode: Option<String>,
    pub output_mode: OutputMode,
    pub tool_servers: Vec<ToolServerConfig>,
    /// Per-call tool timeout in seconds
    pub tool_timeout_secs: u64,
    /// Retries for transient tool faults
    pub tool_max_retries: u32,
    /// Fixed backoff between tool retries in seconds
    pub tool_retry_delay_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            executor: ExecutorConfig::default(),
            planner: PlannerConfig::default(),
            reflector: ReflectorConfig::default(),
            llm: LlmConfig::default(),
            knowledge: KnowledgeConfig::default(),
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            human_in_the_loop: false,
            scenario_mode: None,
            output_mode: OutputMode::default(),
            tool_servers: Vec::new(),
            tool_timeout_secs: 300,
            tool_max_retries: 3,
            tool_retry_delay_secs: 5,
        }
    }
}

/// Executor loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Hard cap on executor turns per subtask
    pub max_steps: u32,
    /// Message-count compression trigger
    pub message_compress_threshold: usize,
    /// Estimated-token compression trigger
    pub token_compress_threshold: usize,
    /// Turns without staged nodes before termination
    pub no_artifacts_patience: u32,
    /// Consecutive failures that force a reflection turn
    pub failure_threshold: u32,
    /// Tail messages preserved on compression
    pub recent_messages_keep: usize,
    /// Minimum middle-slice size worth compressing
    pub min_compress_messages: usize,
    /// Periodic compression every N turns
    pub compress_interval: u32,
    /// Message count that must also be exceeded for periodic compression
    pub compress_interval_msg_threshold: usize,
    /// Observation truncation length in characters
    pub max_output_length: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_steps: 30,
            message_compress_threshold: 60,
            token_compress_threshold: 60_000,
            no_artifacts_patience: 5,
            failure_threshold: 3,
            recent_messages_keep: 8,
            min_compress_messages: 4,
            compress_interval: 10,
            compress_interval_msg_threshold: 20,
            max_output_length: 20_000,
        }
    }
}

/// Planner context tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Planning attempts retained before compression
    pub history_window: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self { history_window: 5 }
    }
}

/// Reflector context tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflectorConfig {
    /// Reflections retained before compression
    pub history_window: usize,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self { history_window: 5 }
    }
}

/// LLM transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    /// Secondary key tried on rate-limit rejections
    pub fallback_api_key: Option<String>,
    /// Model per caller role; "default" must be present
    pub models: HashMap<String, String>,
    /// Temperature per caller role
    pub temperatures: HashMap<String, f64>,
    pub request_timeout_secs: u64,
    pub max_network_retries: u32,
    pub max_json_retries: u32,
    /// Placeholder per-token prices used for cost estimates
    pub prompt_token_cost: f64,
    pub completion_token_cost: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        let mut models = HashMap::new();
        models.insert("default".to_string(), "qwen3-max".to_string());
        let mut temperatures = HashMap::new();
        temperatures.insert("default".to_string(), 0.2);
        Self {
            base_url: "http://localhost:8000/v1/chat/completions".to_string(),
            api_key: String::new(),
            fallback_api_key: None,
            models,
            temperatures,
            request_timeout_secs: 1200,
            max_network_retries: 3,
            max_json_retries: 3,
            prompt_token_cost: 0.000_001,
            completion_token_cost: 0.000_002,
        }
    }
}

impl LlmConfig {
    pub fn model_for(&self, role: &str) -> &str {
        self.models
            .get(role)
            .or_else(|| self.models.get("default"))
            .map_or("qwen3-max", String::as_str)
    }

    pub fn temperature_for(&self, role: &str) -> f64 {
        self.temperatures
            .get(role)
            .or_else(|| self.temperatures.get("default"))
            .copied()
            .unwrap_or(0.2)
    }
}

/// Knowledge-retrieval service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
    /// Whether the session should require a healthy service at startup
    pub required: bool,
    /// Command that launches the service when the health probe fails.
    /// None disables auto-spawn and the ensure degrades to the probe.
    pub spawn_command: Option<String>,
    pub spawn_args: Vec<String>,
    /// Health polls after a spawn before the ensure gives up
    pub startup_poll_attempts: u32,
    /// Seconds between startup health polls
    pub startup_poll_interval_secs: u64,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8001".to_string(),
            request_timeout_secs: 30,
            required: false,
            spawn_command: None,
            spawn_args: Vec::new(),
            startup_poll_attempts: 15,
            startup_poll_interval_secs: 2,
        }
    }
}

/// Durable store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: ".stratagem/stratagem.db".to_string(),
            max_connections: 10,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// One declarative tool-server entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Transport kind; only "stdio" is supported
    #[serde(default = "default_transport", rename = "type")]
    pub transport: String,
}

fn default_transport() -> String {
    "stdio".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.executor.max_steps, 30);
        assert_eq!(config.executor.no_artifacts_patience, 5);
        assert_eq!(config.executor.failure_threshold, 3);
        assert_eq!(config.executor.recent_messages_keep, 8);
        assert_eq!(config.tool_timeout_secs, 300);
        assert!(!config.human_in_the_loop);
    }

    #[test]
    fn test_model_role_fallback() {
        let mut llm = LlmConfig::default();
        llm.models.insert("planner".to_string(), "big-model".to_string());
        assert_eq!(llm.model_for("planner"), "big-model");
        assert_eq!(llm.model_for("reflector"), "qwen3-max");
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r"
executor:
  max_steps: 12
  no_artifacts_patience: 2
human_in_the_loop: true
output_mode: debug
knowledge:
  spawn_command: uvicorn
  spawn_args: ['knowledge_service:app', '--port', '8001']
tool_servers:
  - name: recon
    command: recon-server
    args: ['--stdio']
";
        let config: Config = serde_yaml::from_str(yaml).expect("YAML should parse");
        assert_eq!(config.executor.max_steps, 12);
        assert_eq!(config.executor.no_artifacts_patience, 2);
        assert!(config.human_in_the_loop);
        assert_eq!(config.output_mode, OutputMode::Debug);
        assert_eq!(config.knowledge.spawn_command.as_deref(), Some("uvicorn"));
        assert_eq!(config.knowledge.spawn_args.len(), 3);
        assert_eq!(config.tool_servers.len(), 1);
        assert_eq!(config.tool_servers[0].transport, "stdio");
    }

    #[test]
    fn test_knowledge_defaults() {
        let knowledge = super::KnowledgeConfig::default();
        assert!(knowledge.spawn_command.is_none());
        assert_eq!(knowledge.startup_poll_attempts, 15);
        assert_eq!(knowledge.startup_poll_interval_secs, 2);
    }
}
