//! Terminal approval arm.
//!
//! Runs concurrently with any web approver: whichever side submits a
//! decision first wins, and the loser's submission is an idempotent no-op.
//! When the web side wins, this task is cancelled; the drop guard prints a
//! diagnostic so the operator knows their prompt went stale.

use std::sync::Arc;
use std::time::Duration;

use console::style;
use serde_json::Value;

use crate::services::intervention::{ApprovalAction, InterventionManager};

struct CancelNotice {
    resolved: bool,
}

impl Drop for CancelNotice {
    fn drop(&mut self) {
        if !self.resolved {
            eprintln!(
                "{}",
                style("Another approver submitted a decision; terminal prompt cancelled.").dim()
            );
        }
    }
}

fn render_plan(payload: &Value) {
    let Some(ops) = payload.as_array() else { return };
    eprintln!(
        "{}",
        style(format!("Plan awaiting approval ({} operations):", ops.len())).yellow()
    );
    for (index, op) in ops.iter().enumerate() {
        let command = op.get("command").and_then(Value::as_str).unwrap_or("?");
        let node_id = op
            .get("node_id")
            .or_else(|| op.get("node_data").and_then(|d| d.get("id")))
            .and_then(Value::as_str)
            .unwrap_or("?");
        let detail = op
            .get("node_data")
            .and_then(|d| d.get("description"))
            .or_else(|| op.get("updates"))
            .or_else(|| op.get("reason"))
            .map(ToString::to_string)
            .unwrap_or_default();
        let detail: String = detail.chars().take(100).collect();
        eprintln!("  {}. {} {} {}", index + 1, style(command).bold(), node_id, detail);
    }
    eprintln!("Choose: y (approve), n (reject), m (modify: next line is the JSON batch)");
}

async fn read_line() -> Option<String> {
    tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).ok().map(|_| line)
    })
    .await
    .ok()
    .flatten()
}

/// Watch for the next pending request on `session_id` and offer it on the
/// terminal. Intended to be spawned and aborted once a decision lands.
pub async fn cli_approval_arm(intervention: Arc<InterventionManager>, session_id: String) {
    let mut notice = CancelNotice { resolved: false };

    let pending = loop {
        if let Some(pending) = intervention.get_pending(&session_id).await {
            break pending;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    };
    render_plan(&pending.request_data);

    loop {
        let Some(line) = read_line().await else {
            notice.resolved = true;
            return;
        };
        match line.trim().to_lowercase().as_str() {
            "y" => {
                intervention
                    .submit_decision(&pending.id, ApprovalAction::Approve, None)
                    .await;
                eprintln!("{}", style("Plan approved from the terminal.").green());
                break;
            }
            "n" => {
                intervention
                    .submit_decision(&pending.id, ApprovalAction::Reject, None)
                    .await;
                eprintln!("{}", style("Plan rejected from the terminal.").red());
                break;
            }
            "m" => {
                eprintln!("Paste the replacement JSON batch on one line:");
                let Some(json_line) = read_line().await else { continue };
                match serde_json::from_str::<Value>(json_line.trim()) {
                    Ok(replacement) => {
                        intervention
                            .submit_decision(
                                &pending.id,
                                ApprovalAction::Modify,
                                Some(replacement),
                            )
                            .await;
                        eprintln!("{}", style("Modified plan submitted.").green());
                        break;
                    }
                    Err(e) => {
                        eprintln!("{}", style(format!("Invalid JSON: {e}. Try again.")).red());
                    }
                }
            }
            other => {
                eprintln!("Unrecognized input '{other}'. Use y, n or m.");
            }
        }
    }
    notice.resolved = true;
}
