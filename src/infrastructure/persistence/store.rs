//! SQLite durable store.
//!
//! The store is a shadow of the in-memory session state for external
//! observers. All writes are idempotent upserts; touching a node or edge
//! also touches the owning session's `updated_at` so change feeds fire.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use crate::domain::error::StoreError;
use crate::domain::ports::{InterventionRecord, InterventionStatus, InterventionStore};

/// A node row destined for `graph_nodes`.
#[derive(Debug, Clone)]
pub struct NodeRow {
    pub node_id: String,
    pub node_type: String,
    pub status: Option<String>,
    pub data: Value,
}

/// An edge row destined for `graph_edges`.
#[derive(Debug, Clone)]
pub struct EdgeRow {
    pub source: String,
    pub target: String,
    pub relation_type: String,
    pub data: Value,
}

/// SQLite-backed durable store.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (and create if missing) the database at `path`.
    pub async fn open(path: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{path}"))
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;
        Ok(Self { pool })
    }

    /// In-memory database, used by integration tests.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the schema.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                name TEXT,
                goal TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                sort_index INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                config TEXT
            )",
            "CREATE TABLE IF NOT EXISTS graph_nodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL REFERENCES sessions(id),
                node_id TEXT NOT NULL,
                graph_type TEXT NOT NULL,
                type TEXT,
                status TEXT,
                data TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_graph_nodes_key
                ON graph_nodes(session_id, node_id, graph_type)",
            "CREATE TABLE IF NOT EXISTS graph_edges (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL REFERENCES sessions(id),
                source_node_id TEXT NOT NULL,
                target_node_id TEXT NOT NULL,
                graph_type TEXT NOT NULL,
                relation_type TEXT,
                data TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            )",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_graph_edges_key
                ON graph_edges(session_id, source_node_id, target_node_id, graph_type, relation_type)",
            "CREATE TABLE IF NOT EXISTS event_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL REFERENCES sessions(id),
                event_type TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS interventions (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES sessions(id),
                type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                request_data TEXT NOT NULL,
                response_data TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        ];
        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;
        }
        Ok(())
    }

    /// Upsert the session row.
    pub async fn create_session(
        &self,
        session_id: &str,
        name: &str,
        goal: &str,
        config: &Value,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO sessions (id, name, goal, status, created_at, updated_at, config)
             VALUES (?, ?, ?, 'running', ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               name = excluded.name, goal = excluded.goal, updated_at = excluded.updated_at",
        )
        .bind(session_id)
        .bind(name)
        .bind(goal)
        .bind(&now)
        .bind(&now)
        .bind(config.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_session_status(
        &self,
        session_id: &str,
        status: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now().to_rfc3339())
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn touch_session(&self, session_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET updated_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn upsert_node(
        &self,
        session_id: &str,
        graph_type: &str,
        node: &NodeRow,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO graph_nodes
               (session_id, node_id, graph_type, type, status, data, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(session_id, node_id, graph_type) DO UPDATE SET
               type = excluded.type, status = excluded.status,
               data = excluded.data, updated_at = excluded.updated_at",
        )
        .bind(session_id)
        .bind(&node.node_id)
        .bind(graph_type)
        .bind(&node.node_type)
        .bind(&node.status)
        .bind(node.data.to_string())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        self.touch_session(session_id).await
    }

    pub async fn delete_node(
        &self,
        session_id: &str,
        node_id: &str,
        graph_type: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "DELETE FROM graph_nodes WHERE session_id = ? AND node_id = ? AND graph_type = ?",
        )
        .bind(session_id)
        .bind(node_id)
        .bind(graph_type)
        .execute(&self.pool)
        .await?;
        self.touch_session(session_id).await
    }

    pub async fn upsert_edge(
        &self,
        session_id: &str,
        graph_type: &str,
        edge: &EdgeRow,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO graph_edges
               (session_id, source_node_id, target_node_id, graph_type, relation_type, data, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(session_id, source_node_id, target_node_id, graph_type, relation_type)
             DO UPDATE SET data = excluded.data",
        )
        .bind(session_id)
        .bind(&edge.source)
        .bind(&edge.target)
        .bind(graph_type)
        .bind(&edge.relation_type)
        .bind(edge.data.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        self.touch_session(session_id).await
    }

    /// Insert a batch of nodes and edges in one transaction so external
    /// readers never observe the edges without their endpoints.
    pub async fn atomic_upsert_graph_data(
        &self,
        session_id: &str,
        graph_type: &str,
        nodes: &[NodeRow],
        edges: &[EdgeRow],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now().to_rfc3339();
        for node in nodes {
            sqlx::query(
                "INSERT INTO graph_nodes
                   (session_id, node_id, graph_type, type, status, data, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(session_id, node_id, graph_type) DO UPDATE SET
                   type = excluded.type, status = excluded.status,
                   data = excluded.data, updated_at = excluded.updated_at",
            )
            .bind(session_id)
            .bind(&node.node_id)
            .bind(graph_type)
            .bind(&node.node_type)
            .bind(&node.status)
            .bind(node.data.to_string())
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        for edge in edges {
            sqlx::query(
                "INSERT INTO graph_edges
                   (session_id, source_node_id, target_node_id, graph_type, relation_type, data, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(session_id, source_node_id, target_node_id, graph_type, relation_type)
                 DO UPDATE SET data = excluded.data",
            )
            .bind(session_id)
            .bind(&edge.source)
            .bind(&edge.target)
            .bind(graph_type)
            .bind(&edge.relation_type)
            .bind(edge.data.to_string())
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query("UPDATE sessions SET updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn append_log(
        &self,
        session_id: &str,
        event_type: &str,
        content: &Value,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO event_logs (session_id, event_type, content, timestamp)
             VALUES (?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(event_type)
        .bind(content.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Node count for a session/graph pair; used by tests and status views.
    pub async fn count_nodes(
        &self,
        session_id: &str,
        graph_type: &str,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM graph_nodes WHERE session_id = ? AND graph_type = ?",
        )
        .bind(session_id)
        .bind(graph_type)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n"))
    }
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<InterventionRecord, StoreError> {
    let status_str: String = row.get("status");
    let status = InterventionStatus::from_str(&status_str)
        .ok_or_else(|| StoreError::Serialization(format!("unknown status {status_str}")))?;
    let request_data: String = row.get("request_data");
    let response_data: Option<String> = row.get("response_data");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");
    Ok(InterventionRecord {
        id: row.get("id"),
        session_id: row.get("session_id"),
        kind: row.get("type"),
        status,
        request_data: serde_json::from_str(&request_data)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        response_data: response_data.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| StoreError::Serialization(e.to_string()))?
            .with_timezone(&Utc),
        updated_at: chrono::DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| StoreError::Serialization(e.to_string()))?
            .with_timezone(&Utc),
    })
}

#[async_trait]
impl InterventionStore for SqliteStore {
    async fn create(&self, record: InterventionRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO interventions
               (id, session_id, type, status, request_data, response_data, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.session_id)
        .bind(&record.kind)
        .bind(record.status.as_str())
        .bind(record.request_data.to_string())
        .bind(record.response_data.as_ref().map(ToString::to_string))
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, request_id: &str) -> Result<Option<InterventionRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM interventions WHERE id = ?")
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn get_pending(
        &self,
        session_id: &str,
    ) -> Result<Option<InterventionRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM interventions
             WHERE session_id = ? AND status = 'pending'
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn record_decision(
        &self,
        request_id: &str,
        status: InterventionStatus,
        response_data: Option<Value>,
    ) -> Result<(), StoreError> {
        // Only a pending request may transition; submitting against an
        // already-resolved request is a no-op (idempotent).
        sqlx::query(
            "UPDATE interventions
             SET status = ?, response_data = ?, updated_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(status.as_str())
        .bind(response_data.map(|v| v.to_string()))
        .bind(Utc::now().to_rfc3339())
        .bind(request_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
