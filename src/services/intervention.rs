//! Intervention manager: human-in-the-loop approvals.
//!
//! The core creates a persistent request, announces it on the broker, and
//! polls the store until some approver resolves it or the timeout lapses.
//! Several approvers may race; the first decision wins and later
//! submissions are idempotent no-ops against the resolved record.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::error::StoreError;
use crate::domain::ports::{InterventionRecord, InterventionStatus, InterventionStore};
use crate::services::broker::EventBroker;

/// Default approval timeout.
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(3600);
/// Store poll cadence while waiting for a decision.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// What an approver decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalAction {
    Approve,
    Reject,
    Modify,
}

impl ApprovalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "APPROVE",
            Self::Reject => "REJECT",
            Self::Modify => "MODIFY",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "APPROVE" => Some(Self::Approve),
            "REJECT" => Some(Self::Reject),
            "MODIFY" => Some(Self::Modify),
            _ => None,
        }
    }
}

/// The resolved outcome handed back to the requester.
#[derive(Debug, Clone)]
pub struct Decision {
    pub action: ApprovalAction,
    /// Replacement payload on MODIFY; diagnostic text on REJECT
    pub data: Option<Value>,
}

impl Decision {
    fn approve() -> Self {
        Self { action: ApprovalAction::Approve, data: None }
    }

    fn reject(reason: &str) -> Self {
        Self {
            action: ApprovalAction::Reject,
            data: Some(Value::String(reason.to_string())),
        }
    }
}

/// Mediates approval requests between the core and external approvers.
pub struct InterventionManager {
    store: Arc<dyn InterventionStore>,
    broker: Arc<EventBroker>,
    human_in_the_loop: bool,
    poll_interval: Duration,
}

impl InterventionManager {
    pub fn new(
        store: Arc<dyn InterventionStore>,
        broker: Arc<EventBroker>,
        human_in_the_loop: bool,
    ) -> Self {
        Self {
            store,
            broker,
            human_in_the_loop,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Shrink the poll cadence; test hook.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Create an approval request and block until it is resolved or the
    /// timeout lapses (which counts as REJECT).
    pub async fn request_approval(
        &self,
        session_id: &str,
        payload: Value,
        kind: &str,
        timeout: Duration,
    ) -> Decision {
        if !self.human_in_the_loop {
            return Decision::approve();
        }

        let request_id = format!(
            "req_{}_{}",
            Utc::now().timestamp(),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let now = Utc::now();
        let record = InterventionRecord {
            id: request_id.clone(),
            session_id: session_id.to_string(),
            kind: kind.to_string(),
            status: InterventionStatus::Pending,
            request_data: payload,
            response_data: None,
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.store.create(record).await {
            tracing::error!(error = %e, "failed to persist intervention request");
            return Decision::reject("Failed to persist intervention request.");
        }

        self.broker.emit(
            "intervention.required",
            json!({"request_id": request_id.as_str(), "type": kind, "session_id": session_id}),
            Some(session_id),
        );
        tracing::info!(request_id = %request_id, kind, "approval requested");

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            match self.store.get(&request_id).await {
                Ok(Some(record)) if record.status.is_resolved() => {
                    tracing::info!(
                        request_id = %request_id,
                        status = record.status.as_str(),
                        "approval resolved"
                    );
                    return match record.status {
                        InterventionStatus::Approved => Decision::approve(),
                        InterventionStatus::Modified => Decision {
                            action: ApprovalAction::Modify,
                            data: record.response_data,
                        },
                        _ => Decision {
                            action: ApprovalAction::Reject,
                            data: record.response_data,
                        },
                    };
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(request_id = %request_id, error = %e, "approval poll failed");
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        tracing::warn!(request_id = %request_id, "approval request timed out");
        let _ = self
            .store
            .record_decision(&request_id, InterventionStatus::TimedOut, None)
            .await;
        Decision::reject("timed_out")
    }

    /// Most recent pending request for a session.
    pub async fn get_pending(&self, session_id: &str) -> Option<InterventionRecord> {
        self.store.get_pending(session_id).await.ok().flatten()
    }

    /// Submit a decision on behalf of an approver. Returns true on
    /// success, including when the request was already resolved by a
    /// faster approver (the submission is then a no-op).
    pub async fn submit_decision(
        &self,
        request_id: &str,
        action: ApprovalAction,
        modified: Option<Value>,
    ) -> bool {
        let status = match action {
            ApprovalAction::Approve => InterventionStatus::Approved,
            ApprovalAction::Reject => InterventionStatus::Rejected,
            ApprovalAction::Modify => InterventionStatus::Modified,
        };
        match self.store.record_decision(request_id, status, modified).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(request_id, error = %e, "failed to submit decision");
                false
            }
        }
    }
}

/// In-memory intervention store for tests and store-less sessions.
#[derive(Default)]
pub struct MemoryInterventionStore {
    records: RwLock<Vec<InterventionRecord>>,
}

impl MemoryInterventionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InterventionStore for MemoryInterventionStore {
    async fn create(&self, record: InterventionRecord) -> Result<(), StoreError> {
        self.records.write().await.push(record);
        Ok(())
    }

    async fn get(&self, request_id: &str) -> Result<Option<InterventionRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .find(|r| r.id == request_id)
            .cloned())
    }

    async fn get_pending(
        &self,
        session_id: &str,
    ) -> Result<Option<InterventionRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|r| r.session_id == session_id && r.status == InterventionStatus::Pending)
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn record_decision(
        &self,
        request_id: &str,
        status: InterventionStatus,
        response_data: Option<Value>,
    ) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        if let Some(record) = records
            .iter_mut()
            .find(|r| r.id == request_id && r.status == InterventionStatus::Pending)
        {
            record.status = status;
            record.response_data = response_data;
            record.updated_at = Utc::now();
        }
        Ok(())
    }
}
