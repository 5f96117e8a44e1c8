//! Role agents and the pipeline they all run through.
//!
//! Every engagement follows the same path: claim the item, build a
//! prompt from the item and its recent history, execute the external
//! agent, extract a typed response, apply role-specific effects, and
//! release the lock. Failures along the way become `error` history
//! entries rather than engine errors, and the lock is released on every
//! path, including faults.

pub mod architect;
pub mod bug_buster;
pub mod developer;
pub mod reviewer;

pub use architect::{ArchitectAgent, ArchitectResponse, StorySpec};
pub use bug_buster::{BugBusterAgent, BugBusterResponse, TriageOutcome};
pub use developer::{DeveloperAgent, DeveloperResponse};
pub use reviewer::{ReviewVerdict, ReviewerAgent, ReviewerResponse};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use daedalus_exec::{AgentExecutor, ExecError};
use daedalus_store::{
    ErrorKind, ErrorRecord, HistoryAction, RoleKind, WorkHistory, WorkItem, WorkItemStatus,
    WorkStore,
};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backoff::BackoffCoordinator;
use crate::chaos::ErrorInjector;
use crate::error::Result;
use crate::extract::{excerpt, extract_as, ExtractError};

/// How one engagement between a role agent and a work item ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleOutcome {
    /// Another agent holds the item; nothing was done.
    Skipped,
    /// The agent ran but produced no usable response. An `error` history
    /// entry was recorded and the item was left for a later pass.
    Failed(ErrorKind),
    /// Effects were applied and recorded.
    Completed,
}

/// Domain behavior of one role: what to ask and what to do with the answer.
///
/// The mechanics shared by all roles (claiming, execution, extraction,
/// release) live in [`RoleRunner`].
#[async_trait]
pub trait RoleAgent: Send + Sync {
    /// Typed response this role expects back from its agent.
    type Response: DeserializeOwned + Send;

    /// Role identity used for claims, history attribution, and routing.
    fn role(&self) -> RoleKind;

    /// Whether a `ready` item should move to `in_progress` before the
    /// agent executes. Roles that produce work (rather than judge it)
    /// return true.
    fn starts_item(&self) -> bool {
        false
    }

    /// Render the prompt for one engagement.
    fn build_prompt(&self, item: &WorkItem, history: &[WorkHistory]) -> String;

    /// Apply this role's effects after a successful extraction and return
    /// the summary recorded as an `agent_output` history entry.
    async fn apply(
        &self,
        store: &WorkStore,
        item: &WorkItem,
        response: Self::Response,
        actor: &str,
    ) -> Result<String>;
}

/// Drives role agents through the uniform engagement pipeline.
pub struct RoleRunner {
    store: WorkStore,
    executor: Arc<dyn AgentExecutor>,
    injector: Arc<ErrorInjector>,
    backoff: Arc<BackoffCoordinator>,
    history_window: u32,
    heartbeat_interval: Duration,
}

impl RoleRunner {
    /// Create a runner over the given store and executor.
    pub fn new(
        store: WorkStore,
        executor: Arc<dyn AgentExecutor>,
        injector: Arc<ErrorInjector>,
        backoff: Arc<BackoffCoordinator>,
    ) -> Self {
        Self {
            store,
            executor,
            injector,
            backoff,
            history_window: 20,
            heartbeat_interval: Duration::from_secs(60),
        }
    }

    /// Set how many recent history entries are rendered into prompts.
    #[must_use]
    pub fn with_history_window(mut self, window: u32) -> Self {
        self.history_window = window;
        self
    }

    /// Set how often a running engagement refreshes its lock lease.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Run `agent` against one work item.
    ///
    /// The item is claimed under a fresh agent id and released on every
    /// exit path. A lost claim is a benign skip, not an error.
    pub async fn run<A: RoleAgent>(&self, agent: &A, item_id: &str) -> Result<RoleOutcome> {
        let role = agent.role();
        let agent_id = fresh_agent_id(role);

        if !self.store.claim(item_id, &agent_id).await? {
            debug!(item_id, %role, "item already claimed, skipping engagement");
            return Ok(RoleOutcome::Skipped);
        }

        let result = self.run_claimed(agent, item_id, &agent_id).await;

        match self.store.release(item_id, &agent_id).await {
            Ok(true) => {}
            Ok(false) => debug!(item_id, agent_id, "lock already released or reassigned"),
            Err(err) => warn!(item_id, agent_id, error = %err, "failed to release lock"),
        }

        result
    }

    async fn run_claimed<A: RoleAgent>(
        &self,
        agent: &A,
        item_id: &str,
        agent_id: &str,
    ) -> Result<RoleOutcome> {
        let role = agent.role();
        let mut item = self.store.require_item(item_id).await?;

        if agent.starts_item() && item.status == WorkItemStatus::Ready {
            self.store
                .set_status(item_id, WorkItemStatus::InProgress, agent_id)
                .await?;
            item = self.store.require_item(item_id).await?;
        }

        let history = self.store.recent_history(item_id, self.history_window).await?;
        let prompt = agent.build_prompt(&item, &history);
        info!(item_id, %role, agent_id, "engaging role agent");

        let raw = match self
            .execute_with_heartbeat(role, item_id, agent_id, &prompt)
            .await
        {
            Ok(raw) => raw,
            Err(message) => {
                self.record_failure(&item, ErrorKind::ExecutionError, &message, role, agent_id)
                    .await?;
                return Ok(RoleOutcome::Failed(ErrorKind::ExecutionError));
            }
        };

        let raw = match self.injector.maybe_corrupt(role, &raw) {
            Some(corrupted) => corrupted,
            None => raw,
        };

        let response = match extract_as::<A::Response>(&raw) {
            Ok(response) => response,
            Err(err) => {
                let kind = match &err {
                    ExtractError::ExecutorReported(_) => ErrorKind::ExecutionError,
                    ExtractError::NoJsonFound(_) | ExtractError::SchemaMismatch { .. } => {
                        ErrorKind::JsonParseError
                    }
                };
                self.record_failure(&item, kind, &err.to_string(), role, agent_id)
                    .await?;
                return Ok(RoleOutcome::Failed(kind));
            }
        };

        let summary = agent.apply(&self.store, &item, response, agent_id).await?;
        self.store
            .append_history(&WorkHistory::new(
                item_id,
                HistoryAction::AgentOutput,
                &summary,
                agent_id,
            ))
            .await?;
        info!(item_id, %role, "role engagement completed");
        Ok(RoleOutcome::Completed)
    }

    /// Execute the agent under keyed backoff while a background loop
    /// refreshes the lock lease, so long runs are not swept as stale.
    async fn execute_with_heartbeat(
        &self,
        role: RoleKind,
        item_id: &str,
        agent_id: &str,
        prompt: &str,
    ) -> std::result::Result<String, String> {
        let role_name = role.to_string();
        let key = format!("{role_name}:{item_id}");

        let execution = self.backoff.execute(
            &key,
            || self.executor.execute(&role_name, prompt),
            |err| matches!(err, ExecError::ExecutionFailed(_) | ExecError::Timeout(_)),
        );

        let heartbeat = async {
            let mut ticker = tokio::time::interval(self.heartbeat_interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                match self.store.heartbeat(item_id, agent_id).await {
                    Ok(true) => debug!(item_id, agent_id, "lock lease refreshed"),
                    Ok(false) => warn!(item_id, agent_id, "lock no longer held mid-engagement"),
                    Err(err) => warn!(item_id, error = %err, "heartbeat failed"),
                }
            }
        };

        tokio::select! {
            result = execution => result.map_err(|err| err.to_string()),
            _ = heartbeat => unreachable!("heartbeat loop never completes"),
        }
    }

    /// Record a failed engagement as a structured `error` history entry.
    async fn record_failure(
        &self,
        item: &WorkItem,
        kind: ErrorKind,
        message: &str,
        role: RoleKind,
        agent_id: &str,
    ) -> Result<()> {
        warn!(item_id = %item.id, %role, %kind, message, "role engagement failed");
        let record = ErrorRecord::new(kind, message, role, &item.id);
        let payload = serde_json::to_string(&record)?;
        self.store
            .append_history(&WorkHistory::new(
                &item.id,
                HistoryAction::Error,
                payload,
                agent_id,
            ))
            .await?;
        Ok(())
    }
}

/// Unique per-engagement agent id, e.g. `developer-3fa85f64`.
fn fresh_agent_id(role: RoleKind) -> String {
    let uuid = Uuid::new_v4().to_string();
    format!("{role}-{}", &uuid[..8])
}

/// Render recent history entries into prompt-friendly lines.
pub(crate) fn render_history(history: &[WorkHistory]) -> String {
    if history.is_empty() {
        return "(no prior history)".to_string();
    }
    history
        .iter()
        .map(|entry| {
            format!(
                "- [{}] {}: {}",
                entry.action,
                entry.created_by,
                excerpt(&entry.content, 240)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render an optional section of labelled lines, used by prompt builders.
pub(crate) fn render_list(label: &str, entries: &[String]) -> String {
    if entries.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = entries.iter().map(|entry| format!("- {entry}")).collect();
    format!("\n{label}:\n{}", lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffConfig;
    use daedalus_exec::ExecResult;
    use daedalus_store::WorkItemKind;
    use std::sync::Mutex;

    /// Executor stub that replays a fixed sequence of results, repeating
    /// the final one once the sequence runs out.
    struct StubExecutor {
        outputs: Mutex<Vec<std::result::Result<String, String>>>,
    }

    impl StubExecutor {
        fn with_outputs(outputs: Vec<std::result::Result<String, String>>) -> Self {
            Self {
                outputs: Mutex::new(outputs),
            }
        }

        fn always(output: &str) -> Self {
            Self::with_outputs(vec![Ok(output.to_string())])
        }

        fn failing(message: &str) -> Self {
            Self::with_outputs(vec![Err(message.to_string())])
        }
    }

    #[async_trait]
    impl AgentExecutor for StubExecutor {
        fn name(&self) -> &str {
            "stub"
        }

        async fn execute(&self, _role: &str, _prompt: &str) -> ExecResult<String> {
            let mut outputs = self.outputs.lock().expect("stub lock");
            let next = if outputs.len() > 1 {
                outputs.remove(0)
            } else {
                outputs[0].clone()
            };
            next.map_err(ExecError::ExecutionFailed)
        }

        async fn is_available(&self) -> bool {
            true
        }
    }

    mockall::mock! {
        pub Exec {}

        #[async_trait]
        impl AgentExecutor for Exec {
            fn name(&self) -> &str;
            async fn execute(&self, role: &str, prompt: &str) -> ExecResult<String>;
            async fn is_available(&self) -> bool;
        }
    }

    struct TestContext {
        store: WorkStore,
        runner: RoleRunner,
    }

    async fn create_test_context(executor: Arc<dyn AgentExecutor>) -> TestContext {
        let store = WorkStore::in_memory(Duration::from_secs(600))
            .await
            .expect("in-memory store");
        let backoff = Arc::new(BackoffCoordinator::new(
            BackoffConfig::default()
                .with_max_retries(0)
                .with_initial_delay_ms(1)
                .with_jitter_ms(0),
        ));
        let runner = RoleRunner::new(
            store.clone(),
            executor,
            Arc::new(ErrorInjector::disabled()),
            backoff,
        );
        TestContext { store, runner }
    }

    async fn seed_task(store: &WorkStore, status: WorkItemStatus) -> WorkItem {
        let item = WorkItem::new(WorkItemKind::Task, "Wire up the telemetry exporter")
            .with_description("Export metrics over OTLP")
            .with_status(status);
        store.create_item(&item).await.expect("create item");
        item
    }

    const DEVELOPER_JSON: &str =
        r#"{"summary": "implemented the exporter", "files_changed": ["src/exporter.rs"]}"#;

    #[tokio::test]
    async fn completed_engagement_applies_effects_and_releases() {
        let ctx = create_test_context(Arc::new(StubExecutor::always(DEVELOPER_JSON))).await;
        let item = seed_task(&ctx.store, WorkItemStatus::Ready).await;

        let outcome = ctx
            .runner
            .run(&DeveloperAgent::new(), &item.id)
            .await
            .expect("run");
        assert_eq!(outcome, RoleOutcome::Completed);

        let after = ctx.store.require_item(&item.id).await.expect("reload");
        assert_eq!(after.status, WorkItemStatus::Review);
        assert!(!after.is_locked());

        let history = ctx
            .store
            .recent_history(&item.id, 10)
            .await
            .expect("history");
        assert!(history
            .iter()
            .any(|entry| entry.action == HistoryAction::AgentOutput));
    }

    #[tokio::test]
    async fn lost_claim_is_a_benign_skip() {
        let ctx = create_test_context(Arc::new(StubExecutor::always(DEVELOPER_JSON))).await;
        let item = seed_task(&ctx.store, WorkItemStatus::Ready).await;
        assert!(ctx
            .store
            .claim(&item.id, "dispatcher-elsewhere")
            .await
            .expect("claim"));

        let outcome = ctx
            .runner
            .run(&DeveloperAgent::new(), &item.id)
            .await
            .expect("run");
        assert_eq!(outcome, RoleOutcome::Skipped);

        let history = ctx
            .store
            .recent_history(&item.id, 10)
            .await
            .expect("history");
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn executor_failure_records_execution_error() {
        let ctx =
            create_test_context(Arc::new(StubExecutor::failing("agent exited with status 1")))
                .await;
        let item = seed_task(&ctx.store, WorkItemStatus::Ready).await;

        let outcome = ctx
            .runner
            .run(&DeveloperAgent::new(), &item.id)
            .await
            .expect("run");
        assert_eq!(outcome, RoleOutcome::Failed(ErrorKind::ExecutionError));

        let after = ctx.store.require_item(&item.id).await.expect("reload");
        // The item already moved to in_progress and stays there for retry.
        assert_eq!(after.status, WorkItemStatus::InProgress);
        assert!(!after.is_locked());

        let history = ctx
            .store
            .recent_history(&item.id, 10)
            .await
            .expect("history");
        let error_entry = history
            .iter()
            .find(|entry| entry.action == HistoryAction::Error)
            .expect("error entry");
        let record: ErrorRecord = serde_json::from_str(&error_entry.content).expect("payload");
        assert_eq!(record.error_type, ErrorKind::ExecutionError);
        assert_eq!(record.work_item_id, item.id);
    }

    #[tokio::test]
    async fn unparseable_output_records_parse_error() {
        let ctx =
            create_test_context(Arc::new(StubExecutor::always("no json here at all"))).await;
        let item = seed_task(&ctx.store, WorkItemStatus::Ready).await;

        let outcome = ctx
            .runner
            .run(&DeveloperAgent::new(), &item.id)
            .await
            .expect("run");
        assert_eq!(outcome, RoleOutcome::Failed(ErrorKind::JsonParseError));

        let history = ctx
            .store
            .recent_history(&item.id, 10)
            .await
            .expect("history");
        let error_entry = history
            .iter()
            .find(|entry| entry.action == HistoryAction::Error)
            .expect("error entry");
        let record: ErrorRecord = serde_json::from_str(&error_entry.content).expect("payload");
        assert_eq!(record.error_type, ErrorKind::JsonParseError);
    }

    #[tokio::test]
    async fn error_text_output_records_execution_error() {
        let ctx = create_test_context(Arc::new(StubExecutor::always(
            "Error: the model endpoint refused the request",
        )))
        .await;
        let item = seed_task(&ctx.store, WorkItemStatus::Ready).await;

        let outcome = ctx
            .runner
            .run(&DeveloperAgent::new(), &item.id)
            .await
            .expect("run");
        assert_eq!(outcome, RoleOutcome::Failed(ErrorKind::ExecutionError));
    }

    #[tokio::test]
    async fn chaos_injection_surfaces_as_parse_failure() {
        let store = WorkStore::in_memory(Duration::from_secs(600))
            .await
            .expect("in-memory store");
        let injector = ErrorInjector::new(crate::chaos::ChaosConfig {
            enabled: true,
            injection_rate: 100,
            error_types: vec![crate::chaos::CorruptionKind::SyntaxError],
            seed: Some(3),
            ..Default::default()
        });
        let runner = RoleRunner::new(
            store.clone(),
            Arc::new(StubExecutor::always(DEVELOPER_JSON)),
            Arc::new(injector),
            Arc::new(BackoffCoordinator::new(BackoffConfig::default())),
        );
        let item = seed_task(&store, WorkItemStatus::Ready).await;

        let outcome = runner
            .run(&DeveloperAgent::new(), &item.id)
            .await
            .expect("run");
        assert_eq!(outcome, RoleOutcome::Failed(ErrorKind::JsonParseError));
    }

    #[tokio::test]
    async fn prompt_carries_item_context() {
        let mut mock = MockExec::new();
        mock.expect_execute()
            .withf(|role, prompt| {
                role == "developer" && prompt.contains("Wire up the telemetry exporter")
            })
            .times(1)
            .returning(|_, _| Ok(DEVELOPER_JSON.to_string()));

        let ctx = create_test_context(Arc::new(mock)).await;
        let item = seed_task(&ctx.store, WorkItemStatus::Ready).await;

        let outcome = ctx
            .runner
            .run(&DeveloperAgent::new(), &item.id)
            .await
            .expect("run");
        assert_eq!(outcome, RoleOutcome::Completed);
    }
}
