//! Architect role: decomposes accepted epics into ready stories.

use async_trait::async_trait;
use daedalus_store::{
    RoleKind, StoreError, WorkHistory, WorkItem, WorkItemKind, WorkItemStatus, WorkStore,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{render_history, render_list, RoleAgent};
use crate::error::{EngineError, Result};

const PROMPT_TEMPLATE: &str = r#"You are the architect agent of an autonomous delivery team.
You break one epic into independently implementable stories and report the plan as JSON.

## Epic
- Title: {title}

{description}

## Recent history
{history}

## Rules
- Each story must be deliverable by one developer in isolation.
- Order stories so earlier ones unblock later ones.
- Name concrete acceptance criteria; "works correctly" is not a criterion.
- Call out risks and external dependencies separately from the stories.

## Required output
Respond with a single JSON object and nothing else:
{"technical_approach": "<how the epic will be built>", "risks": ["<risk>"], "dependencies": ["<dependency>"], "stories": [{"title": "<short name>", "description": "<what to build>", "acceptance_criteria": ["<criterion>"], "effort": "<S|M|L>"}]}
"#;

/// One story the architect wants created under the epic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorySpec {
    /// Short story name.
    pub title: String,
    /// What to build.
    pub description: String,
    /// Conditions under which the story counts as done.
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Rough size estimate.
    #[serde(default)]
    pub effort: Option<String>,
}

/// Decomposition plan an architect agent produces for an epic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchitectResponse {
    /// Overall approach for the epic.
    pub technical_approach: String,
    /// Risks worth tracking.
    #[serde(default)]
    pub risks: Vec<String>,
    /// External dependencies the plan assumes.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Stories to create under the epic.
    #[serde(default)]
    pub stories: Vec<StorySpec>,
}

/// Turns backlog epics into trees of ready stories.
#[derive(Debug, Default)]
pub struct ArchitectAgent;

impl ArchitectAgent {
    /// Create an architect agent.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RoleAgent for ArchitectAgent {
    type Response = ArchitectResponse;

    fn role(&self) -> RoleKind {
        RoleKind::Architect
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
        if item.kind != WorkItemKind::Epic {
            return Err(EngineError::Store(StoreError::KindMismatch {
                expected: WorkItemKind::Epic,
                actual: item.kind,
                id: item.id.clone(),
            }));
        }

        if response.stories.is_empty() {
            warn!(epic_id = %item.id, "architect produced no stories, leaving epic in backlog");
            return Ok(format!(
                "Decomposition produced no stories; epic stays in backlog.\nTechnical approach: {}",
                response.technical_approach
            ));
        }

        for spec in &response.stories {
            let mut description = spec.description.clone();
            description.push_str(&render_list(
                "Acceptance criteria",
                &spec.acceptance_criteria,
            ));
            if let Some(effort) = &spec.effort {
                description.push_str(&format!("\nEstimated effort: {effort}"));
            }
            let story = WorkItem::new(WorkItemKind::Story, &spec.title)
                .with_parent(&item.id)
                .with_description(description)
                .with_status(WorkItemStatus::Ready);
            store.create_item(&story).await?;
            info!(epic_id = %item.id, story_id = %story.id, title = %spec.title, "created story");
        }

        store
            .set_status(&item.id, WorkItemStatus::Ready, actor)
            .await?;

        let mut summary = format!(
            "Decomposed into {} stories.\nTechnical approach: {}",
            response.stories.len(),
            response.technical_approach
        );
        summary.push_str(&render_list("Risks", &response.risks));
        summary.push_str(&render_list("Dependencies", &response.dependencies));
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn decomposition() -> ArchitectResponse {
        ArchitectResponse {
            technical_approach: "split ingestion from storage".to_string(),
            risks: vec!["schema drift".to_string()],
            dependencies: vec!["object storage bucket".to_string()],
            stories: vec![
                StorySpec {
                    title: "Build the ingestion endpoint".to_string(),
                    description: "HTTP endpoint that accepts batches".to_string(),
                    acceptance_criteria: vec!["rejects oversized batches".to_string()],
                    effort: Some("M".to_string()),
                },
                StorySpec {
                    title: "Persist batches".to_string(),
                    description: "Write batches to the store".to_string(),
                    acceptance_criteria: vec![],
                    effort: None,
                },
            ],
        }
    }

    #[tokio::test]
    async fn apply_creates_ready_stories_under_epic() {
        let store = WorkStore::in_memory(Duration::from_secs(600))
            .await
            .expect("store");
        let epic = WorkItem::new(WorkItemKind::Epic, "Batch ingestion");
        store.create_item(&epic).await.expect("create epic");

        let summary = ArchitectAgent::new()
            .apply(&store, &epic, decomposition(), "architect-test")
            .await
            .expect("apply");

        let children = store.list_children(&epic.id).await.expect("children");
        assert_eq!(children.len(), 2);
        assert!(children
            .iter()
            .all(|child| child.status == WorkItemStatus::Ready));
        assert!(children
            .iter()
            .all(|child| child.kind == WorkItemKind::Story));
        assert!(children[0].description.contains("rejects oversized batches"));

        let after = store.require_item(&epic.id).await.expect("reload epic");
        assert_eq!(after.status, WorkItemStatus::Ready);
        assert!(summary.contains("2 stories"));
        assert!(summary.contains("schema drift"));
    }

    #[tokio::test]
    async fn apply_rejects_non_epics() {
        let store = WorkStore::in_memory(Duration::from_secs(600))
            .await
            .expect("store");
        let story = WorkItem::new(WorkItemKind::Story, "Not an epic");
        store.create_item(&story).await.expect("create story");

        let result = ArchitectAgent::new()
            .apply(&store, &story, decomposition(), "architect-test")
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn empty_decomposition_leaves_epic_in_backlog() {
        let store = WorkStore::in_memory(Duration::from_secs(600))
            .await
            .expect("store");
        let epic = WorkItem::new(WorkItemKind::Epic, "Vague idea");
        store.create_item(&epic).await.expect("create epic");

        let response = ArchitectResponse {
            technical_approach: "unclear".to_string(),
            risks: vec![],
            dependencies: vec![],
            stories: vec![],
        };
        ArchitectAgent::new()
            .apply(&store, &epic, response, "architect-test")
            .await
            .expect("apply");

        let after = store.require_item(&epic.id).await.expect("reload");
        assert_eq!(after.status, WorkItemStatus::Backlog);
        assert!(store
            .list_children(&epic.id)
            .await
            .expect("children")
            .is_empty());
    }
}
