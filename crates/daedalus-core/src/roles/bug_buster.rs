//! Bug-buster role: triages backlog bugs into reproducible, fixable work.

use async_trait::async_trait;
use daedalus_store::{
    BugMetadata, HistoryAction, RoleKind, StoreError, WorkHistory, WorkItem, WorkItemKind,
    WorkItemStatus, WorkStore,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{render_history, RoleAgent};
use crate::error::{EngineError, Result};

const PROMPT_TEMPLATE: &str = r#"You are the bug-buster agent of an autonomous delivery team.
You investigate one reported bug until it is reproducible, or you establish why it is not.

## Bug report
- Title: {title}

{description}

## Recent history
{history}

## Rules
- A bug counts as reproduced only with a failing test or exact manual steps.
- Identify the root cause, not just the symptom.
- List any scratch branches or files you leave behind under "temporary_artifacts".
- If something outside this item blocks the investigation, report it as a blocker.

## Required output
Respond with a single JSON object and nothing else:
{"outcome": "reproduced" | "cannot_reproduce" | "blocked", "root_cause": "<cause>", "reproduction_steps": "<steps>", "reproduction_test": "<failing test>", "temporary_artifacts": "<scratch files or branches>", "suggested_fix": "<fix sketch>", "blockers": ["<blocker>"]}
"#;

/// How a triage investigation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriageOutcome {
    /// The bug reproduces; it can be routed to a developer.
    Reproduced,
    /// The bug does not reproduce with the available evidence.
    CannotReproduce,
    /// Something outside the item blocks the investigation.
    Blocked,
}

/// Triage report from the bug-buster agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BugBusterResponse {
    /// Investigation verdict.
    pub outcome: TriageOutcome,
    /// Identified root cause.
    #[serde(default)]
    pub root_cause: Option<String>,
    /// Manual reproduction steps.
    #[serde(default)]
    pub reproduction_steps: Option<String>,
    /// Failing test demonstrating the defect.
    #[serde(default)]
    pub reproduction_test: Option<String>,
    /// Scratch files or branches left behind.
    #[serde(default)]
    pub temporary_artifacts: Option<String>,
    /// Sketch of the fix, if one is apparent.
    #[serde(default)]
    pub suggested_fix: Option<String>,
    /// What blocks the investigation, for a `blocked` outcome.
    #[serde(default)]
    pub blockers: Vec<String>,
}

/// Investigates bugs and attaches reproduction metadata.
#[derive(Debug, Default)]
pub struct BugBusterAgent;

impl BugBusterAgent {
    /// Create a bug-buster agent.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RoleAgent for BugBusterAgent {
    type Response = BugBusterResponse;

    fn role(&self) -> RoleKind {
        RoleKind::BugBuster
    }

    fn build_prompt(&self, item: &WorkItem, history: &[WorkHistory]) -> String {
        PROMPT_TEMPLATE
            .replace("{title}", &item.title)
            .replace("{description}", &item.description)
            .replace("{history}", &render_history(history))
    }

    async fn apply(
        &self,
        store: &WorkStore,
        item: &WorkItem,
        response: Self::Response,
        actor: &str,
    ) -> Result<String> {
        if item.kind != WorkItemKind::Bug {
            return Err(EngineError::Store(StoreError::KindMismatch {
                expected: WorkItemKind::Bug,
                actual: item.kind,
                id: item.id.clone(),
            }));
        }

        match response.outcome {
            TriageOutcome::Reproduced => {
                let metadata = BugMetadata {
                    work_item_id: item.id.clone(),
                    reproduction_test: response.reproduction_test.clone(),
                    root_cause: response.root_cause.clone(),
                    reproduction_steps: response.reproduction_steps.clone(),
                    temporary_artifacts: response.temporary_artifacts.clone(),
                    suggested_fix: response.suggested_fix.clone(),
                };
                store.save_bug_metadata(&metadata).await?;
                store
                    .set_status(&item.id, WorkItemStatus::Ready, actor)
                    .await?;
                info!(bug_id = %item.id, "bug reproduced and marked ready for fix");

                let cause = response
                    .root_cause
                    .unwrap_or_else(|| "not yet identified".to_string());
                Ok(format!("Bug reproduced; root cause: {cause}"))
            }
            TriageOutcome::CannotReproduce => Ok(
                "Could not reproduce with the available evidence; bug stays in backlog"
                    .to_string(),
            ),
            TriageOutcome::Blocked => {
                let blockers = if response.blockers.is_empty() {
                    "unspecified".to_string()
                } else {
                    response.blockers.join("; ")
                };
                store
                    .append_history(&WorkHistory::new(
                        &item.id,
                        HistoryAction::Decision,
                        format!("triage_blocked: {blockers}"),
                        actor,
                    ))
                    .await?;
                Ok(format!("Triage blocked: {blockers}"))
            }
        }
    }
}
