//! Asynchronous persistence sink.
//!
//! Graph mutations enqueue jobs on an unbounded channel consumed by a
//! background task. The mutating caller never blocks and never sees a
//! persistence failure: the in-memory graph is authoritative, the store is
//! a shadow for observers.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::store::{EdgeRow, NodeRow, SqliteStore};

/// One persistence job.
#[derive(Debug)]
pub enum PersistJob {
    UpsertNode {
        session_id: String,
        graph_type: String,
        node: NodeRow,
    },
    DeleteNode {
        session_id: String,
        graph_type: String,
        node_id: String,
    },
    AddEdge {
        session_id: String,
        graph_type: String,
        edge: EdgeRow,
    },
    /// Nodes and their edges that must appear together to external readers.
    AtomicUpsert {
        session_id: String,
        graph_type: String,
        nodes: Vec<NodeRow>,
        edges: Vec<EdgeRow>,
    },
    AppendLog {
        session_id: String,
        event_type: String,
        content: Value,
    },
    SessionStatus {
        session_id: String,
        status: String,
    },
}

/// Cloneable, non-blocking handle used by the graph manager.
#[derive(Clone)]
pub struct PersistenceHandle {
    tx: mpsc::UnboundedSender<PersistJob>,
}

impl PersistenceHandle {
    /// A handle whose jobs go nowhere; used by tests and store-less runs.
    pub fn disconnected() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    pub fn enqueue(&self, job: PersistJob) {
        // A closed channel means shutdown is in progress; drop silently.
        let _ = self.tx.send(job);
    }

    pub fn upsert_node(&self, session_id: &str, graph_type: &str, node: NodeRow) {
        self.enqueue(PersistJob::UpsertNode {
            session_id: session_id.to_string(),
            graph_type: graph_type.to_string(),
            node,
        });
    }

    pub fn delete_node(&self, session_id: &str, graph_type: &str, node_id: &str) {
        self.enqueue(PersistJob::DeleteNode {
            session_id: session_id.to_string(),
            graph_type: graph_type.to_string(),
            node_id: node_id.to_string(),
        });
    }

    pub fn add_edge(&self, session_id: &str, graph_type: &str, edge: EdgeRow) {
        self.enqueue(PersistJob::AddEdge {
            session_id: session_id.to_string(),
            graph_type: graph_type.to_string(),
            edge,
        });
    }

    pub fn atomic_upsert(
        &self,
        session_id: &str,
        graph_type: &str,
        nodes: Vec<NodeRow>,
        edges: Vec<EdgeRow>,
    ) {
        self.enqueue(PersistJob::AtomicUpsert {
            session_id: session_id.to_string(),
            graph_type: graph_type.to_string(),
            nodes,
            edges,
        });
    }

    pub fn append_log(&self, session_id: &str, event_type: &str, content: Value) {
        self.enqueue(PersistJob::AppendLog {
            session_id: session_id.to_string(),
            event_type: event_type.to_string(),
            content,
        });
    }

    pub fn session_status(&self, session_id: &str, status: &str) {
        self.enqueue(PersistJob::SessionStatus {
            session_id: session_id.to_string(),
            status: status.to_string(),
        });
    }
}

/// Background worker draining jobs into the store. Fails open: errors are
/// logged and the worker moves on.
pub struct PersistenceSink;

impl PersistenceSink {
    pub fn spawn(store: Arc<SqliteStore>) -> (PersistenceHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<PersistJob>();
        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let result = match &job {
                    PersistJob::UpsertNode { session_id, graph_type, node } => {
                        store.upsert_node(session_id, graph_type, node).await
                    }
                    PersistJob::DeleteNode { session_id, graph_type, node_id } => {
                        store.delete_node(session_id, node_id, graph_type).await
                    }
                    PersistJob::AddEdge { session_id, graph_type, edge } => {
                        store.upsert_edge(session_id, graph_type, edge).await
                    }
                    PersistJob::AtomicUpsert { session_id, graph_type, nodes, edges } => {
                        store
                            .atomic_upsert_graph_data(session_id, graph_type, nodes, edges)
                            .await
                    }
                    PersistJob::AppendLog { session_id, event_type, content } => {
                        store.append_log(session_id, event_type, content).await
                    }
                    PersistJob::SessionStatus { session_id, status } => {
                        store.set_session_status(session_id, status).await
                    }
                };
                if let Err(e) = result {
                    tracing::warn!(error = %e, "persistence job failed (ignored)");
                }
            }
        });
        (PersistenceHandle { tx }, worker)
    }
}
