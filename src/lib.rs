//! Stratagem - a Planner-Executor-Reflector task-execution engine.
//!
//! The engine iteratively decomposes a natural-language goal into a task
//! graph, executes ready subtasks through tool-using LLM agents, audits
//! every outcome, and replans until the goal is proven achieved or the
//! graph runs dry. Alongside the task graph it maintains a causal
//! inference graph with non-monotonic confidence propagation.
//!
//! - Task graph + causal graph with invariant enforcement
//! - Parallel executor batches with context compression
//! - Human-in-the-loop plan approval with racing approvers
//! - Stdio tool-server integration and SQLite persistence

pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export key types for convenience
pub use domain::models::Config;
pub use services::{EventBroker, GraphManager, Orchestrator};
