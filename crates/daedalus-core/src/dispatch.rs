//! Dispatch loop: walks available work items and decides what each needs.
//!
//! Each cycle sweeps stale locks, runs the self-healing sweep, fetches
//! available items, and processes them in priority order (bugs, then
//! stories and tasks, then epics). The dispatcher claims an item only
//! for the duration of the decision; role agents re-claim under their
//! own identity after the dispatcher releases.

use std::fmt;
use std::sync::Arc;
use std::sync::LazyLock;

use daedalus_exec::AgentExecutor;
use daedalus_store::{
    HistoryAction, RoleKind, WorkHistory, WorkItem, WorkItemKind, WorkItemStatus, WorkStore,
};
use futures::stream::{self, StreamExt};
use regex::Regex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backoff::{BackoffConfig, BackoffCoordinator};
use crate::chaos::ErrorInjector;
use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::roles::{ArchitectAgent, BugBusterAgent, DeveloperAgent, ReviewerAgent, RoleRunner};
use crate::selfheal::SelfHealer;

// ── Compiled patterns ────────────────────────────────────────────────────────

/// Title markers of throwaway epics: `[test]`, `demo:`, `Test epic ...`.
static RE_DISPOSABLE_TITLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(?:\[(?:test|demo|sandbox|wip|poc)\]|(?:test|demo|sandbox|wip)\s*[:\-]|(?:test|testing|demo)\s+(?:epic|only)\b)",
    )
    .unwrap()
});

/// Phrases that mark an epic as disposable wherever they appear.
static RE_DISPOSABLE_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:just\s+a\s+test|only\s+a\s+test|for\s+test(?:ing)?\s+purposes|do\s+not\s+implement|ignore\s+this|throwaway|playground|sandbox\s+epic)\b",
    )
    .unwrap()
});

// ── Decisions ────────────────────────────────────────────────────────────────

/// What the dispatcher decided to do with one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionAction {
    /// Route a backlog epic to the architect for decomposition.
    AssignArchitect,
    /// Route an item to a developer.
    AssignDeveloper,
    /// Route a backlog bug to the bug-buster for triage.
    AssignBugBuster,
    /// Route an item in review to the code quality reviewer.
    AssignReviewer,
    /// Close an epic whose children are all done.
    MarkComplete,
    /// Resume a ready item that already carries a developer assignment.
    MoveToInProgress,
    /// Close a disposable epic, recording why it was rejected.
    RejectEpic,
    /// Leave the item alone this cycle.
    Wait,
}

impl fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DecisionAction::AssignArchitect => "assign_architect",
            DecisionAction::AssignDeveloper => "assign_developer",
            DecisionAction::AssignBugBuster => "assign_bug_buster",
            DecisionAction::AssignReviewer => "assign_code_quality_reviewer",
            DecisionAction::MarkComplete => "mark_complete",
            DecisionAction::MoveToInProgress => "move_to_in_progress",
            DecisionAction::RejectEpic => "reject_epic",
            DecisionAction::Wait => "wait",
        };
        write!(f, "{name}")
    }
}

/// A decision plus the note recorded as a `decision` history entry.
#[derive(Debug, Clone)]
pub struct Decision {
    /// What to do.
    pub action: DecisionAction,
    /// Why, in the form persisted to history.
    pub note: String,
}

impl Decision {
    fn act(action: DecisionAction) -> Self {
        let note = action.to_string();
        Self { action, note }
    }

    fn with_note(action: DecisionAction, note: impl Into<String>) -> Self {
        Self {
            action,
            note: note.into(),
        }
    }
}

/// Inputs the decision procedure consumes for one item.
#[derive(Debug)]
pub struct DecisionContext<'a> {
    /// The item under consideration.
    pub item: &'a WorkItem,
    /// The item's children; populated for epics, empty otherwise.
    pub children: &'a [WorkItem],
    /// Developers currently working in-progress items, excluding this one.
    pub active_developers: u32,
    /// Configured developer ceiling.
    pub max_developers: u32,
}

/// The deterministic decision table over (kind, status).
pub fn decide(ctx: &DecisionContext<'_>) -> Decision {
    let item = ctx.item;
    match (item.kind, item.status) {
        (WorkItemKind::Epic, WorkItemStatus::Backlog) => match epic_acceptance_screen(item) {
            Some(reason) => {
                Decision::with_note(DecisionAction::RejectEpic, format!("reject_epic: {reason}"))
            }
            None => Decision::act(DecisionAction::AssignArchitect),
        },
        (WorkItemKind::Epic, WorkItemStatus::Done) => {
            Decision::with_note(DecisionAction::Wait, "wait: epic already done")
        }
        (WorkItemKind::Epic, _) => {
            let done = ctx
                .children
                .iter()
                .filter(|child| child.status.is_done())
                .count();
            let total = ctx.children.len();
            if total > 0 && done == total {
                Decision::with_note(
                    DecisionAction::MarkComplete,
                    format!("mark_complete: all {total} children done"),
                )
            } else {
                Decision::with_note(
                    DecisionAction::Wait,
                    format!("wait: {done} of {total} children done"),
                )
            }
        }
        (WorkItemKind::Bug, WorkItemStatus::Backlog) => {
            Decision::act(DecisionAction::AssignBugBuster)
        }
        (WorkItemKind::Story | WorkItemKind::Task, WorkItemStatus::Backlog) => {
            Decision::with_note(DecisionAction::Wait, "wait: awaiting grooming")
        }
        (_, WorkItemStatus::Ready) => {
            if ctx.active_developers >= ctx.max_developers {
                Decision::with_note(
                    DecisionAction::Wait,
                    format!(
                        "wait: developer capacity reached ({}/{})",
                        ctx.active_developers, ctx.max_developers
                    ),
                )
            } else if item.assigned_role == Some(RoleKind::Developer) {
                Decision::with_note(
                    DecisionAction::MoveToInProgress,
                    "move_to_in_progress: resuming assigned developer work",
                )
            } else {
                Decision::act(DecisionAction::AssignDeveloper)
            }
        }
        (_, WorkItemStatus::InProgress) => {
            if ctx.active_developers >= ctx.max_developers {
                Decision::with_note(
                    DecisionAction::Wait,
                    format!(
                        "wait: developer capacity reached ({}/{})",
                        ctx.active_developers, ctx.max_developers
                    ),
                )
            } else {
                Decision::with_note(
                    DecisionAction::AssignDeveloper,
                    "assign_developer: resuming in-progress work",
                )
            }
        }
        (_, WorkItemStatus::Review) => Decision::act(DecisionAction::AssignReviewer),
        (_, WorkItemStatus::Done) => {
            Decision::with_note(DecisionAction::Wait, "wait: item already done")
        }
    }
}

/// Screen a backlog epic for throwaway markers. Returns the rejection
/// reason when the epic should not be built.
fn epic_acceptance_screen(item: &WorkItem) -> Option<String> {
    if let Some(hit) = RE_DISPOSABLE_TITLE.find(&item.title) {
        return Some(format!(
            "title marks the epic as disposable ({:?})",
            hit.as_str().trim()
        ));
    }
    for text in [&item.title, &item.description] {
        if let Some(hit) = RE_DISPOSABLE_TEXT.find(text) {
            return Some(format!("contains a disposable-work marker ({:?})", hit.as_str()));
        }
    }
    None
}

// ── Dispatcher ───────────────────────────────────────────────────────────────

/// What one dispatch cycle accomplished.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// Stale locks recovered by the sweep.
    pub recovered_locks: usize,
    /// Bugs synthesized by self-healing.
    pub healed_bugs: usize,
    /// Items available for dispatch this cycle.
    pub available: usize,
    /// Items a decision was recorded for.
    pub dispatched: usize,
    /// Items skipped because another agent held them.
    pub skipped: usize,
}

/// Builder for [`Dispatcher`].
pub struct DispatcherBuilder {
    store: WorkStore,
    executor: Arc<dyn AgentExecutor>,
    config: OrchestratorConfig,
    injector: Option<Arc<ErrorInjector>>,
    backoff: Option<Arc<BackoffCoordinator>>,
}

impl DispatcherBuilder {
    /// Start a builder over the given store and executor.
    pub fn new(store: WorkStore, executor: Arc<dyn AgentExecutor>) -> Self {
        Self {
            store,
            executor,
            config: OrchestratorConfig::default(),
            injector: None,
            backoff: None,
        }
    }

    /// Use the given orchestrator configuration.
    #[must_use]
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach a chaos injector.
    #[must_use]
    pub fn with_injector(mut self, injector: Arc<ErrorInjector>) -> Self {
        self.injector = Some(injector);
        self
    }

    /// Use a shared backoff coordinator.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Arc<BackoffCoordinator>) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Validate the configuration and assemble the dispatcher.
    pub fn build(self) -> Result<Dispatcher> {
        self.config.validate()?;
        let injector = self
            .injector
            .unwrap_or_else(|| Arc::new(ErrorInjector::disabled()));
        let backoff = self
            .backoff
            .unwrap_or_else(|| Arc::new(BackoffCoordinator::new(BackoffConfig::default())));
        let runner = RoleRunner::new(self.store.clone(), self.executor, injector, backoff)
            .with_history_window(self.config.history_window)
            .with_heartbeat_interval(self.config.heartbeat_interval());
        let healer = SelfHealer::new(self.config.error_lookback_hours);
        let agent_id = format!("dispatcher-{}", &Uuid::new_v4().to_string()[..8]);

        let dev_slots = Arc::new(Semaphore::new(
            self.config.max_concurrent_developers as usize,
        ));

        Ok(Dispatcher {
            store: self.store,
            config: self.config,
            runner,
            healer,
            dev_slots,
            architect: ArchitectAgent::new(),
            developer: DeveloperAgent::new(),
            reviewer: ReviewerAgent::new(),
            bug_buster: BugBusterAgent::new(),
            agent_id,
        })
    }
}

/// Coordinates sweeping, healing, and per-item dispatch decisions.
pub struct Dispatcher {
    store: WorkStore,
    config: OrchestratorConfig,
    runner: RoleRunner,
    healer: SelfHealer,
    /// In-process developer slots. The store count gates across
    /// processes; this gates the in-flight engagements one cycle can
    /// admit concurrently, which the count alone cannot see.
    dev_slots: Arc<Semaphore>,
    architect: ArchitectAgent,
    developer: DeveloperAgent,
    reviewer: ReviewerAgent,
    bug_buster: BugBusterAgent,
    agent_id: String,
}

impl Dispatcher {
    /// Start building a dispatcher.
    pub fn builder(store: WorkStore, executor: Arc<dyn AgentExecutor>) -> DispatcherBuilder {
        DispatcherBuilder::new(store, executor)
    }

    /// Run dispatch cycles until shutdown is requested.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            agent_id = %self.agent_id,
            interval_ms = self.config.polling_interval_ms,
            "dispatcher starting"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.polling_interval()) => {
                    if let Err(err) = self.run_cycle().await {
                        error!(error = %err, "dispatch cycle failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("dispatcher shutting down");
                    break;
                }
            }
        }

        info!("dispatcher stopped");
        Ok(())
    }

    /// One full cycle: sweep stale locks, heal recorded errors, then
    /// decide and act on every available item in priority order.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let recovered = self.store.sweep_stale().await?;
        let healed = self.healer.sweep(&self.store).await?;

        let mut items = self.store.list_available().await?;
        items.sort_by(|a, b| {
            a.kind
                .dispatch_priority()
                .cmp(&b.kind.dispatch_priority())
                .then(a.created_at.cmp(&b.created_at))
        });
        let available = items.len();

        let outcomes: Vec<Option<DecisionAction>> = stream::iter(items)
            .map(|item| async move {
                let item_id = item.id.clone();
                match self.process_item(item).await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        error!(item_id = %item_id, error = %err, "failed to process item");
                        None
                    }
                }
            })
            .buffer_unordered(self.config.max_concurrent_managers)
            .collect()
            .await;

        let dispatched = outcomes.iter().filter(|outcome| outcome.is_some()).count();
        let report = CycleReport {
            recovered_locks: recovered.len(),
            healed_bugs: healed,
            available,
            dispatched,
            skipped: outcomes.len() - dispatched,
        };
        debug!(?report, "dispatch cycle complete");
        Ok(report)
    }

    /// Decide on one item and act on the decision. Returns `None` when
    /// the item was claimed elsewhere.
    async fn process_item(&self, item: WorkItem) -> Result<Option<DecisionAction>> {
        if !self.store.claim(&item.id, &self.agent_id).await? {
            debug!(item_id = %item.id, "item claimed elsewhere, skipping");
            return Ok(None);
        }

        let staged = self.decide_and_stage(&item).await;

        match self.store.release(&item.id, &self.agent_id).await {
            Ok(true) => {}
            Ok(false) => debug!(item_id = %item.id, "dispatcher lock already gone"),
            Err(err) => {
                warn!(item_id = %item.id, error = %err, "failed to release dispatcher lock")
            }
        }

        // Developer slot, when one was taken, stays held through the
        // engagement below.
        let (decision, current, _dev_slot) = staged?;
        self.invoke_role(&current, &decision).await?;
        Ok(Some(decision.action))
    }

    /// Compute the decision, record it, and apply its store-side effects
    /// while still holding the dispatcher claim. Returns the decision,
    /// the fresh item it was made against, and the developer slot taken
    /// for it, if any.
    async fn decide_and_stage(
        &self,
        item: &WorkItem,
    ) -> Result<(Decision, WorkItem, Option<OwnedSemaphorePermit>)> {
        // Fresh read: the listing snapshot may be stale by the time the
        // claim lands.
        let current = self.store.require_item(&item.id).await?;
        let children = if current.kind == WorkItemKind::Epic {
            self.store.list_children(&current.id).await?
        } else {
            Vec::new()
        };
        let active_developers = self
            .store
            .count_active_developers(Some(&current.id))
            .await?;

        let mut decision = decide(&DecisionContext {
            item: &current,
            children: &children,
            active_developers,
            max_developers: self.config.max_concurrent_developers,
        });

        // The store count races with other items staged in this same
        // cycle, so developer admissions also take an in-process slot.
        // No slot free means the decision degrades to a deferred no-op.
        let dev_slot = match decision.action {
            DecisionAction::AssignDeveloper | DecisionAction::MoveToInProgress => {
                match self.dev_slots.clone().try_acquire_owned() {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        decision = Decision::with_note(
                            DecisionAction::Wait,
                            format!(
                                "wait: developer capacity reached ({} in flight)",
                                self.config.max_concurrent_developers
                            ),
                        );
                        None
                    }
                }
            }
            _ => None,
        };

        info!(
            item_id = %current.id,
            kind = %current.kind,
            status = %current.status,
            action = %decision.action,
            "dispatch decision"
        );
        self.store
            .append_history(&WorkHistory::new(
                &current.id,
                HistoryAction::Decision,
                &decision.note,
                &self.agent_id,
            ))
            .await?;

        match decision.action {
            DecisionAction::AssignArchitect => {
                self.store
                    .set_assigned_role(&current.id, Some(RoleKind::Architect))
                    .await?;
            }
            DecisionAction::AssignDeveloper => {
                self.store
                    .set_assigned_role(&current.id, Some(RoleKind::Developer))
                    .await?;
            }
            DecisionAction::AssignBugBuster => {
                self.store
                    .set_assigned_role(&current.id, Some(RoleKind::BugBuster))
                    .await?;
            }
            DecisionAction::AssignReviewer => {
                self.store
                    .set_assigned_role(&current.id, Some(RoleKind::Reviewer))
                    .await?;
            }
            DecisionAction::MoveToInProgress => {
                self.store
                    .set_status(&current.id, WorkItemStatus::InProgress, &self.agent_id)
                    .await?;
            }
            DecisionAction::MarkComplete => {
                let status = self
                    .store
                    .recompute_epic_status(&current.id, &self.agent_id)
                    .await?;
                info!(epic_id = %current.id, %status, "epic rolled up");
            }
            DecisionAction::RejectEpic => {
                self.store
                    .set_status(&current.id, WorkItemStatus::Done, &self.agent_id)
                    .await?;
            }
            DecisionAction::Wait => {
                // Mid-flight epics mirror their children; recompute the
                // derived status every pass so interleaved child updates
                // surface without a cross-item transaction.
                if current.kind == WorkItemKind::Epic
                    && !current.status.is_done()
                    && current.status != WorkItemStatus::Backlog
                {
                    let status = self
                        .store
                        .recompute_epic_status(&current.id, &self.agent_id)
                        .await?;
                    debug!(epic_id = %current.id, %status, "epic roll-up refreshed");
                }
            }
        }

        Ok((decision, current, dev_slot))
    }

    /// Invoke the role agent a decision routed to, after the dispatcher
    /// claim has been released. The role re-claims under its own id.
    async fn invoke_role(&self, item: &WorkItem, decision: &Decision) -> Result<()> {
        let outcome = match decision.action {
            DecisionAction::AssignArchitect => {
                Some(self.runner.run(&self.architect, &item.id).await?)
            }
            DecisionAction::AssignDeveloper => {
                Some(self.runner.run(&self.developer, &item.id).await?)
            }
            DecisionAction::AssignBugBuster => {
                Some(self.runner.run(&self.bug_buster, &item.id).await?)
            }
            DecisionAction::AssignReviewer => {
                Some(self.runner.run(&self.reviewer, &item.id).await?)
            }
            DecisionAction::MoveToInProgress => match item.assigned_role {
                Some(RoleKind::Architect) => {
                    Some(self.runner.run(&self.architect, &item.id).await?)
                }
                Some(RoleKind::Developer) => {
                    Some(self.runner.run(&self.developer, &item.id).await?)
                }
                Some(RoleKind::Reviewer) => {
                    Some(self.runner.run(&self.reviewer, &item.id).await?)
                }
                Some(RoleKind::BugBuster) => {
                    Some(self.runner.run(&self.bug_buster, &item.id).await?)
                }
                None => {
                    warn!(item_id = %item.id, "move_to_in_progress with no assigned role");
                    None
                }
            },
            DecisionAction::MarkComplete
            | DecisionAction::RejectEpic
            | DecisionAction::Wait => None,
        };

        if let Some(outcome) = outcome {
            debug!(item_id = %item.id, ?outcome, "role engagement finished");
        }
        Ok(())
    }
}
