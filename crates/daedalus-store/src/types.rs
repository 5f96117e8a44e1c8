//! Core data types for the work-item hierarchy.
//!
//! The hierarchy is epics → stories/tasks → (independent) bugs. Status
//! moves backlog → ready → in_progress → review → done; epic status is
//! derived from children rather than set directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::{Result, StoreError};

/// What kind of work an item represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemKind {
    /// Large initiative, decomposed into stories by the architect
    Epic,
    /// User-facing slice of an epic
    Story,
    /// Technical work item, story-sized
    Task,
    /// Defect, either reported or synthesized by the self-healing sweep
    Bug,
}

impl WorkItemKind {
    /// Dispatch band for this kind. Lower dispatches first: bugs
    /// preempt feature work, epics only coordinate.
    pub fn dispatch_priority(&self) -> u8 {
        match self {
            Self::Bug => 0,
            Self::Story | Self::Task => 1,
            Self::Epic => 2,
        }
    }
}

impl std::fmt::Display for WorkItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Epic => write!(f, "epic"),
            Self::Story => write!(f, "story"),
            Self::Task => write!(f, "task"),
            Self::Bug => write!(f, "bug"),
        }
    }
}

impl std::str::FromStr for WorkItemKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "epic" => Ok(Self::Epic),
            "story" => Ok(Self::Story),
            "task" => Ok(Self::Task),
            "bug" => Ok(Self::Bug),
            other => Err(StoreError::InvalidKind(other.to_string())),
        }
    }
}

/// Lifecycle state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    /// Not yet groomed or triaged
    Backlog,
    /// Groomed and waiting for an agent
    Ready,
    /// An agent is working on it
    InProgress,
    /// Implementation finished, awaiting review
    Review,
    /// Terminal
    Done,
}

impl WorkItemStatus {
    /// Progress rank used by the epic roll-up. Higher means further
    /// along: backlog 0, ready 1, in_progress 2, review 3, done 4.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Backlog => 0,
            Self::Ready => 1,
            Self::InProgress => 2,
            Self::Review => 3,
            Self::Done => 4,
        }
    }

    /// Whether this is the terminal state.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Whether `next` is a legal worker-driven transition from this
    /// state. Epics are exempt: their status is derived from children
    /// via [`WorkItemStatus::roll_up`].
    pub fn can_transition_to(&self, next: WorkItemStatus) -> bool {
        matches!(
            (self, next),
            (Self::Backlog, Self::Ready)
                | (Self::Backlog, Self::Done)
                | (Self::Ready, Self::InProgress)
                | (Self::InProgress, Self::Review)
                | (Self::Review, Self::Done)
                | (Self::Review, Self::InProgress)
        )
    }

    /// Derive an epic's status from its children.
    ///
    /// The highest-ranked non-done child wins; the epic is done only
    /// when every child is done. `None` when there are no children
    /// (the epic keeps whatever status it has, e.g. backlog before
    /// decomposition).
    pub fn roll_up(children: impl IntoIterator<Item = WorkItemStatus>) -> Option<WorkItemStatus> {
        let mut saw_child = false;
        let mut best: Option<WorkItemStatus> = None;
        for status in children {
            saw_child = true;
            if status.is_done() {
                continue;
            }
            best = match best {
                Some(current) if current.rank() >= status.rank() => Some(current),
                _ => Some(status),
            };
        }
        if saw_child {
            Some(best.unwrap_or(Self::Done))
        } else {
            None
        }
    }
}

impl std::fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backlog => write!(f, "backlog"),
            Self::Ready => write!(f, "ready"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Review => write!(f, "review"),
            Self::Done => write!(f, "done"),
        }
    }
}

impl std::str::FromStr for WorkItemStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "backlog" => Ok(Self::Backlog),
            "ready" => Ok(Self::Ready),
            "in_progress" => Ok(Self::InProgress),
            "review" => Ok(Self::Review),
            "done" => Ok(Self::Done),
            other => Err(StoreError::InvalidStatus(other.to_string())),
        }
    }
}

/// Role an item is assigned to (and that agents run as).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleKind {
    /// Decomposes epics into stories
    Architect,
    /// Implements stories, tasks, and reproduced bugs
    Developer,
    /// Reviews items in the review state
    Reviewer,
    /// Triages and reproduces bugs
    BugBuster,
}

impl std::fmt::Display for RoleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Architect => write!(f, "architect"),
            Self::Developer => write!(f, "developer"),
            Self::Reviewer => write!(f, "reviewer"),
            Self::BugBuster => write!(f, "bug_buster"),
        }
    }
}

impl std::str::FromStr for RoleKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "architect" => Ok(Self::Architect),
            "developer" => Ok(Self::Developer),
            "reviewer" => Ok(Self::Reviewer),
            "bug_buster" => Ok(Self::BugBuster),
            other => Err(StoreError::InvalidRole(other.to_string())),
        }
    }
}

/// A unit of work in the hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique item ID (UUID)
    pub id: String,
    /// What kind of work this is
    pub kind: WorkItemKind,
    /// Parent item (stories/tasks under an epic), if any
    pub parent_id: Option<String>,
    /// Short summary
    pub title: String,
    /// Full description, acceptance criteria, investigation steps
    pub description: String,
    /// Lifecycle state
    pub status: WorkItemStatus,
    /// Role this item is currently routed to, if any
    pub assigned_role: Option<RoleKind>,
    /// Agent currently holding the processing lock, if any
    pub processing_agent_id: Option<String>,
    /// When the current lock holder claimed the item
    pub processing_started_at: Option<DateTime<Utc>>,
    /// History entry this bug was synthesized from (self-healing)
    pub source_error_id: Option<String>,
    /// When this item was created
    pub created_at: DateTime<Utc>,
    /// When this item was last modified
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    /// Create a new item in the backlog.
    pub fn new(kind: WorkItemKind, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            parent_id: None,
            title: title.into(),
            description: String::new(),
            status: WorkItemStatus::Backlog,
            assigned_role: None,
            processing_agent_id: None,
            processing_started_at: None,
            source_error_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Place the item under a parent.
    #[must_use]
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Set the initial status (items created mid-lifecycle, e.g.
    /// architect stories arrive ready).
    #[must_use]
    pub fn with_status(mut self, status: WorkItemStatus) -> Self {
        self.status = status;
        self
    }

    /// Route the item to a role.
    #[must_use]
    pub fn with_assigned_role(mut self, role: RoleKind) -> Self {
        self.assigned_role = Some(role);
        self
    }

    /// Link the item to the error history entry it was synthesized from.
    #[must_use]
    pub fn with_source_error(mut self, history_id: impl Into<String>) -> Self {
        self.source_error_id = Some(history_id.into());
        self
    }

    /// Whether some agent currently holds the processing lock,
    /// regardless of staleness.
    pub fn is_locked(&self) -> bool {
        self.processing_agent_id.is_some()
    }
}

/// Category of a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    /// A status transition
    StatusChange,
    /// Raw or summarized role-agent output
    AgentOutput,
    /// A dispatcher or reviewer decision
    Decision,
    /// A structured failure record ([`ErrorRecord`] JSON)
    Error,
}

impl std::fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StatusChange => write!(f, "status_change"),
            Self::AgentOutput => write!(f, "agent_output"),
            Self::Decision => write!(f, "decision"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for HistoryAction {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "status_change" => Ok(Self::StatusChange),
            "agent_output" => Ok(Self::AgentOutput),
            "decision" => Ok(Self::Decision),
            "error" => Ok(Self::Error),
            other => Err(StoreError::InvalidAction(other.to_string())),
        }
    }
}

/// Append-only audit record attached to a work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkHistory {
    /// Unique entry ID (UUID)
    pub id: String,
    /// Item this entry belongs to
    pub work_item_id: String,
    /// Entry category
    pub action: HistoryAction,
    /// Free text or JSON payload
    pub content: String,
    /// Agent or component that wrote the entry
    pub created_by: String,
    /// When the entry was written
    pub created_at: DateTime<Utc>,
}

impl WorkHistory {
    /// Create a new history entry.
    pub fn new(
        work_item_id: impl Into<String>,
        action: HistoryAction,
        content: impl Into<String>,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            work_item_id: work_item_id.into(),
            action,
            content: content.into(),
            created_by: created_by.into(),
            created_at: Utc::now(),
        }
    }
}

/// Investigation metadata the bug-buster attaches to a reproduced bug.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BugMetadata {
    /// Bug item this metadata belongs to
    pub work_item_id: String,
    /// Failing test that demonstrates the defect
    #[serde(default)]
    pub reproduction_test: Option<String>,
    /// Identified root cause
    #[serde(default)]
    pub root_cause: Option<String>,
    /// Steps to reproduce by hand
    #[serde(default)]
    pub reproduction_steps: Option<String>,
    /// Scratch files or branches left behind by the investigation
    #[serde(default)]
    pub temporary_artifacts: Option<String>,
    /// Proposed fix, if the investigation found one
    #[serde(default)]
    pub suggested_fix: Option<String>,
}

impl BugMetadata {
    /// Create empty metadata for a bug item.
    pub fn new(work_item_id: impl Into<String>) -> Self {
        Self {
            work_item_id: work_item_id.into(),
            ..Self::default()
        }
    }
}

/// Failure classification carried by `error` history entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The agent process failed, timed out, or reported an error
    ExecutionError,
    /// The agent ran but its output contained no recoverable JSON
    JsonParseError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExecutionError => write!(f, "EXECUTION_ERROR"),
            Self::JsonParseError => write!(f, "JSON_PARSE_ERROR"),
        }
    }
}

/// Structured payload stored in `error` history entries.
///
/// Role agents write one of these (JSON-encoded) on every failure; the
/// self-healing sweep reads them back to synthesize bugs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Failure classification
    pub error_type: ErrorKind,
    /// Human-readable failure message
    pub error_message: String,
    /// Role that hit the failure
    pub agent_type: RoleKind,
    /// Item being processed when the failure occurred
    pub work_item_id: String,
    /// When the failure occurred
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    /// Create a record stamped with the current time.
    pub fn new(
        error_type: ErrorKind,
        error_message: impl Into<String>,
        agent_type: RoleKind,
        work_item_id: impl Into<String>,
    ) -> Self {
        Self {
            error_type,
            error_message: error_message.into(),
            agent_type,
            work_item_id: work_item_id.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Internal row type for work item queries
#[derive(FromRow)]
pub(crate) struct WorkItemRow {
    pub id: String,
    pub kind: String,
    pub parent_id: Option<String>,
    pub title: String,
    pub description: String,
    pub status: String,
    pub assigned_role: Option<String>,
    pub processing_agent_id: Option<String>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub source_error_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<WorkItemRow> for WorkItem {
    type Error = StoreError;

    fn try_from(row: WorkItemRow) -> Result<Self> {
        Ok(WorkItem {
            id: row.id,
            kind: row.kind.parse()?,
            parent_id: row.parent_id,
            title: row.title,
            description: row.description,
            status: row.status.parse()?,
            assigned_role: row.assigned_role.as_deref().map(str::parse).transpose()?,
            processing_agent_id: row.processing_agent_id,
            processing_started_at: row.processing_started_at,
            source_error_id: row.source_error_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Internal row type for history queries
#[derive(FromRow)]
pub(crate) struct HistoryRow {
    pub id: String,
    pub work_item_id: String,
    pub action: String,
    pub content: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<HistoryRow> for WorkHistory {
    type Error = StoreError;

    fn try_from(row: HistoryRow) -> Result<Self> {
        Ok(WorkHistory {
            id: row.id,
            work_item_id: row.work_item_id,
            action: row.action.parse()?,
            content: row.content,
            created_by: row.created_by,
            created_at: row.created_at,
        })
    }
}

/// Internal row type for bug metadata queries
#[derive(FromRow)]
pub(crate) struct BugMetadataRow {
    pub work_item_id: String,
    pub reproduction_test: Option<String>,
    pub root_cause: Option<String>,
    pub reproduction_steps: Option<String>,
    pub temporary_artifacts: Option<String>,
    pub suggested_fix: Option<String>,
}

impl From<BugMetadataRow> for BugMetadata {
    fn from(row: BugMetadataRow) -> Self {
        BugMetadata {
            work_item_id: row.work_item_id,
            reproduction_test: row.reproduction_test,
            root_cause: row.root_cause,
            reproduction_steps: row.reproduction_steps,
            temporary_artifacts: row.temporary_artifacts,
            suggested_fix: row.suggested_fix,
        }
    }
}
