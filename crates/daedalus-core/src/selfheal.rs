//! Self-healing: recorded agent failures become triageable bugs.
//!
//! Every role failure leaves a structured `error` history entry. The
//! sweep walks those entries over a lookback window and synthesizes one
//! bug per entry, linked back through `source_error_id` so re-sweeps
//! never duplicate work.

use chrono::{Duration, Utc};
use daedalus_store::{
    ErrorKind, ErrorRecord, HistoryAction, WorkHistory, WorkItem, WorkItemKind, WorkItemStatus,
    WorkStore,
};
use serde_json::from_str;
use tracing::{debug, info};

use crate::error::Result;

const SWEEP_ACTOR: &str = "self-healing";

/// Converts recent error history into ready bugs.
#[derive(Debug, Clone)]
pub struct SelfHealer {
    lookback_hours: i64,
}

impl SelfHealer {
    /// Create a healer that looks back over the given window.
    pub fn new(lookback_hours: i64) -> Self {
        Self { lookback_hours }
    }

    /// Synthesize bugs for error entries that have none yet.
    ///
    /// Returns the number of bugs created. Entries that already spawned a
    /// bug, or whose payload does not parse as an [`ErrorRecord`], are
    /// skipped.
    pub async fn sweep(&self, store: &WorkStore) -> Result<usize> {
        let since = Utc::now() - Duration::hours(self.lookback_hours);
        let errors = store.recent_errors(since).await?;
        let mut created = 0usize;

        for entry in &errors {
            if store.bug_exists_for_error(&entry.id).await? {
                continue;
            }

            let record: ErrorRecord = match from_str(&entry.content) {
                Ok(record) => record,
                Err(err) => {
                    debug!(
                        history_id = %entry.id,
                        error = %err,
                        "skipping unparseable error entry"
                    );
                    continue;
                }
            };

            // Ready, not backlog: the brief carries the triage, so the bug
            // goes straight to a developer on the next cycle.
            let bug = WorkItem::new(WorkItemKind::Bug, bug_title(&record))
                .with_description(investigation_brief(&record))
                .with_status(WorkItemStatus::Ready)
                .with_source_error(&entry.id);

            if store.create_linked_bug(&bug).await? {
                store
                    .append_history(&WorkHistory::new(
                        &bug.id,
                        HistoryAction::Decision,
                        format!(
                            "synthesized from error entry {} on item {}",
                            entry.id, record.work_item_id
                        ),
                        SWEEP_ACTOR,
                    ))
                    .await?;
                info!(
                    bug_id = %bug.id,
                    source_entry = %entry.id,
                    "synthesized bug from recorded failure"
                );
                created += 1;
            }
        }

        if created > 0 {
            info!(created, "self-healing sweep finished");
        }
        Ok(created)
    }
}

fn bug_title(record: &ErrorRecord) -> String {
    format!("[auto] {} in {} agent", record.error_type, record.agent_type)
}

fn investigation_brief(record: &ErrorRecord) -> String {
    let type_specific = match record.error_type {
        ErrorKind::JsonParseError => {
            "Inspect the raw output for malformed, fenced, or truncated JSON."
        }
        ErrorKind::ExecutionError => {
            "Check the executor command, timeout, and environment variables."
        }
    };
    format!(
        "Synthesized from a recorded agent failure.\n\n\
         Source item: {}\n\
         Agent: {}\n\
         Error type: {}\n\
         Observed at: {}\n\
         Message: {}\n\n\
         Investigation steps:\n\
         1. Review the history of work item {} around the failure time.\n\
         2. Re-run the {} agent against that item and capture its raw output.\n\
         3. {}\n\
         4. Attach a failing test and root cause, then hand off for a fix.",
        record.work_item_id,
        record.agent_type,
        record.error_type,
        record.timestamp.to_rfc3339(),
        record.error_message,
        record.work_item_id,
        record.agent_type,
        type_specific,
    )
}
