//! Knowledge-retrieval service client.
//!
//! A thin HTTP client over the retrieval sidecar: `POST
//! /retrieve_knowledge`, `GET /health`, `GET /stats`. At startup the
//! engine ensures the service is available and, when a spawn command is
//! configured, launches it itself: the spawn runs behind a session-wide
//! lock so concurrent ensures cannot double-spawn, the child handle is
//! cached for the process lifetime, and health is polled on a bounded
//! loop before the ensure gives up.

use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::domain::models::config::KnowledgeConfig;

/// One retrieval hit.
#[derive(Debug, Clone, Deserialize)]
pub struct KnowledgeHit {
    pub id: String,
    pub snippet: String,
    #[serde(default)]
    pub score: f64,
}

/// Reply of `/retrieve_knowledge`.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalReply {
    pub success: bool,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub total_results: usize,
    #[serde(default)]
    pub results: Vec<KnowledgeHit>,
}

/// The one spawned service child, guarded by the ensure lock. The child
/// is detached (not killed on drop): the service outlives the session, as
/// a persistent sidecar.
#[derive(Default)]
struct EnsureState {
    child: Option<Child>,
}

/// HTTP client for the knowledge service.
pub struct KnowledgeClient {
    config: KnowledgeConfig,
    client: reqwest::Client,
    /// Session-wide double-spawn guard plus the cached child handle.
    ensure_lock: Mutex<EnsureState>,
}

impl KnowledgeClient {
    pub fn new(config: KnowledgeConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_default();
        Self { config, client, ensure_lock: Mutex::new(EnsureState::default()) }
    }

    /// Ensure the service is available, spawning it when configured.
    ///
    /// Runs entirely under the ensure lock, so concurrent callers cannot
    /// each launch a service instance. Sequence: probe health; reconcile
    /// the cached child (exited children clear the cache, an alive but
    /// unresponsive child is noted and replaced); spawn the configured
    /// command detached; poll health up to the configured attempt count.
    /// Without a spawn command this degrades to the plain health probe.
    pub async fn ensure_available(&self) -> bool {
        let mut state = self.ensure_lock.lock().await;

        if self.check_health().await {
            tracing::debug!("knowledge service already healthy");
            return true;
        }

        if let Some(child) = state.child.as_mut() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    tracing::warn!(%status, "spawned knowledge service exited");
                    state.child = None;
                }
                Ok(None) => {
                    tracing::warn!(
                        pid = child.id(),
                        "knowledge service process alive but not responding, respawning"
                    );
                    state.child = None;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "knowledge service child state unknown");
                    state.child = None;
                }
            }
        }

        let Some(spawn_command) = &self.config.spawn_command else {
            tracing::warn!("knowledge service unreachable and no spawn command configured");
            return false;
        };

        tracing::info!(command = %spawn_command, "launching knowledge service");
        let spawned = Command::new(spawn_command)
            .args(&self.config.spawn_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(error = %e, "failed to spawn knowledge service");
                return false;
            }
        };
        tracing::info!(pid = child.id(), "knowledge service started in the background");
        state.child = Some(child);

        for attempt in 1..=self.config.startup_poll_attempts.max(1) {
            tracing::debug!(
                attempt,
                max = self.config.startup_poll_attempts,
                "waiting for knowledge service startup"
            );
            if self.check_health().await {
                tracing::info!("knowledge service is up and healthy");
                return true;
            }
            tokio::time::sleep(Duration::from_secs(self.config.startup_poll_interval_secs))
                .await;
        }
        tracing::error!("knowledge service did not become healthy in time");
        false
    }

    /// Pid of the child this client spawned, if any.
    pub async fn spawned_pid(&self) -> Option<u32> {
        self.ensure_lock.lock().await.child.as_ref().and_then(Child::id)
    }

    async fn check_health(&self) -> bool {
        let url = format!("{}/health", self.config.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => {
                let body: Value = response.json().await.unwrap_or(Value::Null);
                let healthy = body.get("status").and_then(Value::as_str) == Some("healthy");
                if !healthy {
                    tracing::warn!(body = %body, "knowledge service unhealthy");
                }
                healthy
            }
            Err(e) => {
                tracing::debug!(error = %e, "knowledge service unreachable");
                false
            }
        }
    }

    /// Retrieve the `top_k` most relevant snippets for a query.
    pub async fn retrieve(&self, query: &str, top_k: usize) -> Option<RetrievalReply> {
        let url = format!("{}/retrieve_knowledge", self.config.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({"query": query, "top_k": top_k}))
            .send()
            .await
            .ok()?;
        let reply: RetrievalReply = response.json().await.ok()?;
        if reply.success {
            Some(reply)
        } else {
            None
        }
    }

    /// Service statistics blob, for diagnostics.
    pub async fn stats(&self) -> Option<Value> {
        let url = format!("{}/stats", self.config.base_url);
        self.client.get(&url).send().await.ok()?.json().await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> KnowledgeConfig {
        KnowledgeConfig {
            // A port nothing listens on; probes fail fast.
            base_url: "http://127.0.0.1:1".to_string(),
            request_timeout_secs: 1,
            startup_poll_attempts: 1,
            startup_poll_interval_secs: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_ensure_without_spawn_command_degrades_to_probe() {
        let client = KnowledgeClient::new(unreachable_config());
        assert!(!client.ensure_available().await);
        assert!(client.spawned_pid().await.is_none(), "nothing was spawned");
    }

    #[tokio::test]
    async fn test_ensure_spawns_and_caches_the_child() {
        let mut config = unreachable_config();
        config.spawn_command = Some("sleep".to_string());
        config.spawn_args = vec!["5".to_string()];
        let client = KnowledgeClient::new(config);

        // The fake service never becomes healthy, so the ensure fails, but
        // the child was launched and its handle cached.
        assert!(!client.ensure_available().await);
        assert!(client.spawned_pid().await.is_some());
    }

    #[tokio::test]
    async fn test_failed_spawn_reports_unavailable() {
        let mut config = unreachable_config();
        config.spawn_command = Some("definitely-not-a-real-binary-3c1f".to_string());
        let client = KnowledgeClient::new(config);
        assert!(!client.ensure_available().await);
        assert!(client.spawned_pid().await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_ensures_are_serialized() {
        // Both callers contend on the ensure lock: the second ensure only
        // runs after the first has finished, sees the cached child, and
        // reconciles it rather than racing a spawn in parallel.
        let mut config = unreachable_config();
        config.spawn_command = Some("sleep".to_string());
        config.spawn_args = vec!["5".to_string()];
        let client = std::sync::Arc::new(KnowledgeClient::new(config));

        let a = {
            let client = std::sync::Arc::clone(&client);
            tokio::spawn(async move { client.ensure_available().await })
        };
        let b = {
            let client = std::sync::Arc::clone(&client);
            tokio::spawn(async move { client.ensure_available().await })
        };
        let (first, second) = (a.await.unwrap(), b.await.unwrap());
        assert!(!first && !second);
        // Exactly one cached child handle exists afterwards.
        assert!(client.spawned_pid().await.is_some());
    }
}
