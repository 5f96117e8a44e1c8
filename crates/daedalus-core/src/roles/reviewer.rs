//! Reviewer role: judges items in review and either approves or bounces them.

use async_trait::async_trait;
use daedalus_store::{
    HistoryAction, RoleKind, WorkHistory, WorkItem, WorkItemStatus, WorkStore,
};
use serde::{Deserialize, Serialize};

use super::{render_history, RoleAgent};
use crate::error::Result;

const PROMPT_TEMPLATE: &str = r#"You are the code quality reviewer of an autonomous delivery team.
You judge one item that a developer has marked ready for review.

## Work item
- Kind: {kind}
- Title: {title}

{description}

## Recent history
{history}

## Rules
- Approve only work that satisfies the item's acceptance criteria.
- Every issue must be concrete and actionable; name the file or behavior.
- Do not request stylistic changes that no criterion demands.

## Required output
Respond with a single JSON object and nothing else:
{"verdict": "approved" | "needs_changes", "issues": ["<actionable issue>"], "summary": "<one-line assessment>"}
"#;

/// Judgement a reviewer hands down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewVerdict {
    /// The work satisfies its criteria.
    Approved,
    /// The work goes back to the developer.
    NeedsChanges,
}

/// Review report from the reviewer agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewerResponse {
    /// Approve or bounce.
    pub verdict: ReviewVerdict,
    /// Actionable problems found, for a `needs_changes` verdict.
    #[serde(default)]
    pub issues: Vec<String>,
    /// One-line assessment.
    #[serde(default)]
    pub summary: Option<String>,
}

/// Moves reviewed items to done or back to in_progress.
#[derive(Debug, Default)]
pub struct ReviewerAgent;

impl ReviewerAgent {
    /// Create a reviewer agent.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RoleAgent for ReviewerAgent {
    type Response = ReviewerResponse;

    fn role(&self) -> RoleKind {
        RoleKind::Reviewer
    }

    fn build_prompt(&self, item: &WorkItem, history: &[WorkHistory]) -> String {
        PROMPT_TEMPLATE
            .replace("{kind}", &item.kind.to_string())
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
        match response.verdict {
            ReviewVerdict::Approved => {
                store
                    .set_status(&item.id, WorkItemStatus::Done, actor)
                    .await?;
                let assessment = response
                    .summary
                    .unwrap_or_else(|| "meets its acceptance criteria".to_string());
                Ok(format!("Review approved: {assessment}"))
            }
            ReviewVerdict::NeedsChanges => {
                store
                    .set_status(&item.id, WorkItemStatus::InProgress, actor)
                    .await?;

                let issues = if response.issues.is_empty() {
                    "no specific issues listed".to_string()
                } else {
                    response
                        .issues
                        .iter()
                        .enumerate()
                        .map(|(index, issue)| format!("{}. {issue}", index + 1))
                        .collect::<Vec<_>>()
                        .join("\n")
                };
                store
                    .append_history(&WorkHistory::new(
                        &item.id,
                        HistoryAction::Decision,
                        format!("needs_changes:\n{issues}"),
                        actor,
                    ))
                    .await?;

                Ok(format!(
                    "Review requested changes ({} issue(s))",
                    response.issues.len()
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daedalus_store::WorkItemKind;
    use std::time::Duration;

    async fn item_in_review(store: &WorkStore) -> WorkItem {
        let item = WorkItem::new(WorkItemKind::Story, "Harden the retry path")
            .with_status(WorkItemStatus::Review);
        store.create_item(&item).await.expect("create");
        item
    }

    #[tokio::test]
    async fn approval_completes_the_item() {
        let store = WorkStore::in_memory(Duration::from_secs(600))
            .await
            .expect("store");
        let item = item_in_review(&store).await;

        let response = ReviewerResponse {
            verdict: ReviewVerdict::Approved,
            issues: vec![],
            summary: Some("clean and covered by tests".to_string()),
        };
        let summary = ReviewerAgent::new()
            .apply(&store, &item, response, "reviewer-test")
            .await
            .expect("apply");

        let after = store.require_item(&item.id).await.expect("reload");
        assert_eq!(after.status, WorkItemStatus::Done);
        assert!(summary.contains("clean and covered"));
    }

    #[tokio::test]
    async fn needs_changes_bounces_with_itemized_issues() {
        let store = WorkStore::in_memory(Duration::from_secs(600))
            .await
            .expect("store");
        let item = item_in_review(&store).await;

        let response = ReviewerResponse {
            verdict: ReviewVerdict::NeedsChanges,
            issues: vec![
                "retry loop ignores the jitter config".to_string(),
                "no test for the exhaustion path".to_string(),
            ],
            summary: None,
        };
        ReviewerAgent::new()
            .apply(&store, &item, response, "reviewer-test")
            .await
            .expect("apply");

        let after = store.require_item(&item.id).await.expect("reload");
        assert_eq!(after.status, WorkItemStatus::InProgress);

        let history = store.recent_history(&item.id, 10).await.expect("history");
        let decision = history
            .iter()
            .find(|entry| {
                entry.action == HistoryAction::Decision
                    && entry.content.starts_with("needs_changes")
            })
            .expect("decision entry");
        assert!(decision.content.contains("1. retry loop ignores"));
        assert!(decision.content.contains("2. no test"));
    }

    #[test]
    fn verdict_parses_from_snake_case() {
        let response: ReviewerResponse =
            serde_json::from_str(r#"{"verdict": "needs_changes"}"#).expect("parse");
        assert_eq!(response.verdict, ReviewVerdict::NeedsChanges);
        assert!(response.issues.is_empty());
    }
}
