//! Developer role: implements ready stories, tasks, and bug fixes.

use async_trait::async_trait;
use daedalus_store::{RoleKind, WorkHistory, WorkItem, WorkItemStatus, WorkStore};
use serde::{Deserialize, Serialize};

use super::{render_history, render_list, RoleAgent};
use crate::error::Result;

const PROMPT_TEMPLATE: &str = r#"You are the developer agent of an autonomous delivery team.
You implement exactly one work item end to end and report the result as JSON.

## Work item
- Kind: {kind}
- Title: {title}

{description}

## Recent history
{history}

## Rules
- Implement the item completely; record anything unfinished under "notes".
- Run the tests that cover your change before reporting.
- Leave unrelated files untouched.

## Required output
Respond with a single JSON object and nothing else:
{"summary": "<what was built and how>", "files_changed": ["<path>"], "tests_added": ["<test name>"], "notes": "<optional caveats>"}
"#;

/// Report a developer agent produces after implementing an item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeveloperResponse {
    /// What was built and how.
    pub summary: String,
    /// Paths touched by the implementation.
    #[serde(default)]
    pub files_changed: Vec<String>,
    /// Tests written alongside the change.
    #[serde(default)]
    pub tests_added: Vec<String>,
    /// Caveats or unfinished edges.
    #[serde(default)]
    pub notes: Option<String>,
}

/// Implements items and hands them to review.
#[derive(Debug, Default)]
pub struct DeveloperAgent;

impl DeveloperAgent {
    /// Create a developer agent.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RoleAgent for DeveloperAgent {
    type Response = DeveloperResponse;

    fn role(&self) -> RoleKind {
        RoleKind::Developer
    }

    fn starts_item(&self) -> bool {
        true
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
        store
            .set_status(&item.id, WorkItemStatus::Review, actor)
            .await?;

        let mut summary = format!(
            "{} ({} file(s) changed, {} test(s) added)",
            response.summary,
            response.files_changed.len(),
            response.tests_added.len()
        );
        summary.push_str(&render_list("Files changed", &response.files_changed));
        summary.push_str(&render_list("Tests added", &response.tests_added));
        if let Some(notes) = &response.notes {
            summary.push_str(&format!("\nNotes: {notes}"));
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daedalus_store::WorkItemKind;
    use std::time::Duration;

    #[test]
    fn prompt_includes_item_and_history() {
        let agent = DeveloperAgent::new();
        let item = WorkItem::new(WorkItemKind::Story, "Add rate limiting")
            .with_description("Token bucket on the ingest path");
        let history = vec![WorkHistory::new(
            &item.id,
            daedalus_store::HistoryAction::Decision,
            "assign_developer",
            "dispatcher-1",
        )];

        let prompt = agent.build_prompt(&item, &history);
        assert!(prompt.contains("Add rate limiting"));
        assert!(prompt.contains("Token bucket on the ingest path"));
        assert!(prompt.contains("assign_developer"));
        assert!(prompt.contains(r#""files_changed""#));
    }

    #[tokio::test]
    async fn apply_moves_item_to_review() {
        let store = WorkStore::in_memory(Duration::from_secs(600))
            .await
            .expect("store");
        let item = WorkItem::new(WorkItemKind::Task, "Patch the parser")
            .with_status(WorkItemStatus::InProgress);
        store.create_item(&item).await.expect("create");

        let response = DeveloperResponse {
            summary: "rewired the parser".to_string(),
            files_changed: vec!["src/parser.rs".to_string()],
            tests_added: vec!["parser_handles_empty_input".to_string()],
            notes: None,
        };
        let summary = DeveloperAgent::new()
            .apply(&store, &item, response, "developer-test")
            .await
            .expect("apply");

        let after = store.require_item(&item.id).await.expect("reload");
        assert_eq!(after.status, WorkItemStatus::Review);
        assert!(summary.contains("rewired the parser"));
        assert!(summary.contains("src/parser.rs"));
    }

    #[test]
    fn response_tolerates_missing_optional_fields() {
        let response: DeveloperResponse =
            serde_json::from_str(r#"{"summary": "done"}"#).expect("parse");
        assert!(response.files_changed.is_empty());
        assert!(response.notes.is_none());
    }
}
