//! Session halt latch.
//!
//! The latch is materialized as a sentinel file `<tmpdir>/<session>.halt`
//! containing `{reason, evidence}`. The `complete_mission` tool creates it;
//! every executor probes it at the top of each turn and aborts
//! cooperatively when present. A latch is one-way: it is only removed when
//! a new session with the same id starts.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Payload written into the sentinel file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HaltPayload {
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub evidence: String,
}

/// Handle on one session's halt latch.
#[derive(Debug, Clone)]
pub struct HaltLatch {
    path: PathBuf,
}

impl HaltLatch {
    pub fn new(session_id: &str) -> Self {
        Self {
            path: std::env::temp_dir().join(format!("{session_id}.halt")),
        }
    }

    /// Whether the latch has been set.
    pub fn is_set(&self) -> bool {
        self.path.exists()
    }

    /// Set the latch. Idempotent; an existing payload is left in place.
    pub fn set(&self, payload: &HaltPayload) {
        if self.is_set() {
            return;
        }
        match serde_json::to_string(payload) {
            Ok(body) => {
                if let Err(e) = std::fs::write(&self.path, body) {
                    tracing::warn!(path = %self.path.display(), error = %e, "failed to write halt latch");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize halt payload"),
        }
    }

    /// Read the payload, if the latch is set and parseable.
    pub fn read(&self) -> Option<HaltPayload> {
        let body = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&body).ok()
    }

    /// Remove a stale latch at session start.
    pub fn clear(&self) {
        if self.is_set() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to clear halt latch");
            }
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latch_lifecycle() {
        let latch = HaltLatch::new("halt-latch-test-session");
        latch.clear();
        assert!(!latch.is_set());

        latch.set(&HaltPayload {
            reason: "flag captured".to_string(),
            evidence: "FLAG{x}".to_string(),
        });
        assert!(latch.is_set());

        let payload = latch.read().unwrap();
        assert_eq!(payload.reason, "flag captured");

        // Setting again does not clobber the original payload
        latch.set(&HaltPayload { reason: "other".to_string(), evidence: String::new() });
        assert_eq!(latch.read().unwrap().reason, "flag captured");

        latch.clear();
        assert!(!latch.is_set());
    }
}
