//! Intervention store port.
//!
//! The intervention manager talks to the durable store through this trait
//! so the approval protocol can be exercised against an in-memory fake.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::domain::error::StoreError;

/// Lifecycle state of an intervention request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterventionStatus {
    Pending,
    Approved,
    Rejected,
    Modified,
    TimedOut,
}

impl InterventionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Modified => "modified",
            Self::TimedOut => "timed_out",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "modified" => Some(Self::Modified),
            "timed_out" => Some(Self::TimedOut),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A persisted approval request.
#[derive(Debug, Clone)]
pub struct InterventionRecord {
    pub id: String,
    pub session_id: String,
    pub kind: String,
    pub status: InterventionStatus,
    pub request_data: Value,
    pub response_data: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable storage for intervention requests.
#[async_trait]
pub trait InterventionStore: Send + Sync {
    /// Persist a new pending request.
    async fn create(&self, record: InterventionRecord) -> Result<(), StoreError>;

    /// Fetch a request by id.
    async fn get(&self, request_id: &str) -> Result<Option<InterventionRecord>, StoreError>;

    /// Most recent pending request for a session, if any.
    async fn get_pending(
        &self,
        session_id: &str,
    ) -> Result<Option<InterventionRecord>, StoreError>;

    /// Record a decision. Implementations must not overwrite an
    /// already-resolved request; the call still succeeds (idempotent).
    async fn record_decision(
        &self,
        request_id: &str,
        status: InterventionStatus,
        response_data: Option<Value>,
    ) -> Result<(), StoreError>;
}
