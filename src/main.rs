//! Stratagem CLI entry point.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tokio::sync::Mutex;

use stratagem::domain::models::{Config, OutputMode};
use stratagem::domain::ports::ToolDispatch;
use stratagem::infrastructure::config::ConfigLoader;
use stratagem::infrastructure::knowledge::KnowledgeClient;
use stratagem::infrastructure::llm::HttpLlmClient;
use stratagem::infrastructure::logging;
use stratagem::infrastructure::persistence::{PersistenceSink, SqliteStore};
use stratagem::infrastructure::tools::ToolInvoker;
use stratagem::services::halt::HaltLatch;
use stratagem::services::intervention::InterventionManager;
use stratagem::services::{EventBroker, GraphManager, Orchestrator};

#[derive(Parser, Debug)]
#[command(name = "stratagem", about = "Planner-Executor-Reflector task engine")]
struct Cli {
    /// The high-level goal for this session
    #[arg(long)]
    goal: String,

    /// Session name, used for ids and logging
    #[arg(long, default_value = "default_task")]
    task_name: String,

    /// Explicit configuration file (defaults to stratagem.yaml + env)
    #[arg(long)]
    config: Option<String>,

    /// Console verbosity: simple, default, debug
    #[arg(long)]
    output_mode: Option<String>,

    /// Base URL of the LLM API
    #[arg(long, env = "STRATAGEM_LLM__BASE_URL")]
    llm_api_base_url: Option<String>,

    /// API key for the LLM service
    #[arg(long, env = "STRATAGEM_LLM__API_KEY", hide_env_values = true)]
    llm_api_key: Option<String>,

    /// Require interactive approval of every plan
    #[arg(long)]
    human_in_the_loop: bool,
}

fn apply_cli_overrides(config: &mut Config, cli: &Cli) {
    if let Some(url) = &cli.llm_api_base_url {
        config.llm.base_url = url.clone();
    }
    if let Some(key) = &cli.llm_api_key {
        config.llm.api_key = key.clone();
    }
    if cli.human_in_the_loop {
        config.human_in_the_loop = true;
    }
    if let Some(mode) = &cli.output_mode {
        config.output_mode = match mode.as_str() {
            "simple" => OutputMode::Simple,
            "debug" => OutputMode::Debug,
            _ => OutputMode::Default,
        };
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path)?,
        None => ConfigLoader::load()?,
    };
    apply_cli_overrides(&mut config, &cli);
    // Output mode steers console verbosity unless RUST_LOG overrides it.
    match config.output_mode {
        OutputMode::Simple => config.logging.level = "warn".to_string(),
        OutputMode::Debug => config.logging.level = "debug".to_string(),
        OutputMode::Default => {}
    }
    logging::init(&config.logging);

    let session_id = format!(
        "{}_{}",
        cli.task_name,
        chrono::Utc::now().format("%Y%m%d_%H%M%S")
    );
    tracing::info!(session_id = %session_id, goal = %cli.goal, "session starting");

    // Durable store + write-through sink.
    if let Some(parent) = std::path::Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let store = Arc::new(
        SqliteStore::open(&config.database.path, config.database.max_connections)
            .await
            .context("Failed to open the durable store")?,
    );
    store.migrate().await.context("Failed to run migrations")?;
    store
        .create_session(
            &session_id,
            &cli.task_name,
            &cli.goal,
            &serde_json::to_value(&config).unwrap_or(json!({})),
        )
        .await
        .context("Failed to create the session row")?;
    let (sink, sink_worker) = PersistenceSink::spawn(Arc::clone(&store));

    // Process-lifetime singletons.
    let broker = Arc::new(EventBroker::new());
    let halt = HaltLatch::new(&session_id);
    halt.clear();

    let tools: Arc<ToolInvoker> = Arc::new(ToolInvoker::new(
        config.tool_servers.clone(),
        config.tool_timeout_secs,
        config.tool_max_retries,
        config.tool_retry_delay_secs,
    ));
    tools.refresh_catalog().await;

    // Ensure the knowledge service is up, spawning it when configured.
    let knowledge = KnowledgeClient::new(config.knowledge.clone());
    if !knowledge.ensure_available().await {
        if config.knowledge.required {
            anyhow::bail!("knowledge service unavailable and marked required");
        }
        tracing::warn!("knowledge service unavailable, continuing without retrieval");
    }

    let llm = Arc::new(HttpLlmClient::new(config.llm.clone()));
    let intervention = Arc::new(InterventionManager::new(
        store.clone(),
        Arc::clone(&broker),
        config.human_in_the_loop,
    ));

    let graph = Arc::new(Mutex::new(GraphManager::new(
        &session_id,
        format!("task_{session_id}"),
        &cli.goal,
        sink.clone(),
        Arc::clone(&broker),
    )));

    let mut orchestrator = Orchestrator::new(
        config.clone(),
        &session_id,
        &cli.goal,
        Arc::clone(&graph),
        llm,
        Arc::clone(&tools) as Arc<dyn ToolDispatch>,
        intervention,
        Arc::clone(&broker),
        halt.clone(),
    );

    // Run the session, racing a shutdown signal (SIGINT, and SIGTERM on
    // unix).
    let shutdown = async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
    };
    let outcome = tokio::select! {
        outcome = orchestrator.run() => Some(outcome),
        () = shutdown => {
            tracing::warn!("interrupt received, shutting down");
            broker.emit("shutdown", json!({"reason": "signal"}), None);
            None
        }
    };

    // Final snapshot of metrics and run log, then teardown.
    orchestrator
        .metrics
        .mark_finished(
            outcome.as_ref().is_some_and(|o| o.success),
            outcome
                .as_ref()
                .map_or("interrupted", |o| o.reason.as_str()),
        );
    sink.append_log(&session_id, "metrics_snapshot", orchestrator.metrics.snapshot());
    sink.append_log(&session_id, "run_log", orchestrator.run_log.snapshot());
    let final_status = match &outcome {
        Some(o) if o.success => "completed",
        Some(_) => "failed",
        None => "stopped",
    };
    sink.session_status(&session_id, final_status);

    tools.shutdown().await;
    drop(sink);
    // Give the sink worker a moment to drain before exit.
    let _ = tokio::time::timeout(Duration::from_secs(5), sink_worker).await;

    match outcome {
        Some(outcome) => {
            tracing::info!(
                success = outcome.success,
                reason = %outcome.reason,
                "session finished"
            );
            println!(
                "Session {session_id} finished: {} ({})",
                if outcome.success { "success" } else { "incomplete" },
                outcome.reason
            );
        }
        None => println!("Session {session_id} interrupted."),
    }
    Ok(())
}
