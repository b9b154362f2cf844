//! Core types for the task graph scheduler.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Declares a string-backed enum stored as TEXT in SQLite and serialized as
/// its snake_case name.
macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let s = value.as_str()?;
                $name::parse(s).ok_or_else(|| {
                    FromSqlError::Other(format!("invalid {} value '{}'", stringify!($name), s).into())
                })
            }
        }
    };
}

text_enum! {
    /// Lifecycle of a task.
    ///
    /// `blocked -> pending -> in_progress -> {completed | failed | rejected}`;
    /// terminal states never transition again.
    pub enum TaskStatus {
        Blocked => "blocked",
        Pending => "pending",
        InProgress => "in_progress",
        Completed => "completed",
        Failed => "failed",
        Rejected => "rejected",
    }
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Rejected
        )
    }
}

text_enum! {
    /// Informational priority. Claiming is FIFO regardless of priority.
    pub enum Priority {
        Low => "low",
        Medium => "medium",
        High => "high",
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

text_enum! {
    pub enum GroupStatus {
        Active => "active",
        Completed => "completed",
    }
}

text_enum! {
    /// Status of a registered worker instance.
    pub enum InstanceStatus {
        Idle => "idle",
        Working => "working",
        Paused => "paused",
        Stopped => "stopped",
    }
}

text_enum! {
    pub enum Severity {
        Low => "low",
        Medium => "medium",
        High => "high",
        Critical => "critical",
    }
}

text_enum! {
    pub enum EscalationStatus {
        Open => "open",
        Resolved => "resolved",
    }
}

text_enum! {
    /// Granularity at which spend is tracked.
    pub enum BudgetScope {
        Global => "global",
        Role => "role",
        Group => "group",
    }
}

text_enum! {
    pub enum BudgetPeriod {
        Daily => "daily",
        Weekly => "weekly",
        Monthly => "monthly",
    }
}

text_enum! {
    pub enum NotificationSeverity {
        Info => "info",
        Warning => "warning",
        Critical => "critical",
    }
}

text_enum! {
    pub enum DeliveryStatus {
        Pending => "pending",
        Success => "success",
        Failed => "failed",
    }
}

/// A goal container owning a set of tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub title: String,
    pub origin: String,
    pub status: GroupStatus,
    pub created_by: String,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

/// A task in the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub group_id: String,
    pub parent_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub task_type: String,
    pub priority: Priority,
    /// Target role.
    pub assigned_to: String,
    /// Instance currently holding the claim; set only while `in_progress`.
    pub claimed_by: Option<String>,
    /// Instance that last held the claim.
    pub executed_by: Option<String>,
    pub status: TaskStatus,
    pub created_by: String,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub rejection_reason: Option<String>,
    pub output_ref: Option<String>,
    pub revision_of: Option<String>,
}

/// Input for creating a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    pub group_id: String,
    pub title: String,
    pub description: Option<String>,
    pub task_type: String,
    pub assigned_to: String,
    pub created_by: String,
    #[serde(default)]
    pub priority: Priority,
    pub parent_id: Option<String>,
    #[serde(default)]
    pub blocked_by: Vec<String>,
    pub revision_of: Option<String>,
}

impl NewTask {
    pub fn new(
        group_id: impl Into<String>,
        title: impl Into<String>,
        task_type: impl Into<String>,
        assigned_to: impl Into<String>,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            title: title.into(),
            task_type: task_type.into(),
            assigned_to: assigned_to.into(),
            created_by: created_by.into(),
            ..Default::default()
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn blocked_by<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blocked_by = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn revision_of(mut self, task_id: impl Into<String>) -> Self {
        self.revision_of = Some(task_id.into());
        self
    }
}

/// A "must complete before" edge: `task_id` waits for `blocked_by`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dependency {
    pub task_id: String,
    pub blocked_by: String,
    pub resolved: bool,
    pub resolved_at: Option<i64>,
}

/// Status-partitioned view of tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Board {
    pub blocked: Vec<Task>,
    pub pending: Vec<Task>,
    pub in_progress: Vec<Task>,
    pub completed: Vec<Task>,
    pub failed: Vec<Task>,
    pub rejected: Vec<Task>,
}

impl Board {
    pub fn column(&self, status: TaskStatus) -> &[Task] {
        match status {
            TaskStatus::Blocked => &self.blocked,
            TaskStatus::Pending => &self.pending,
            TaskStatus::InProgress => &self.in_progress,
            TaskStatus::Completed => &self.completed,
            TaskStatus::Failed => &self.failed,
            TaskStatus::Rejected => &self.rejected,
        }
    }

    pub(crate) fn push(&mut self, task: Task) {
        match task.status {
            TaskStatus::Blocked => self.blocked.push(task),
            TaskStatus::Pending => self.pending.push(task),
            TaskStatus::InProgress => self.in_progress.push(task),
            TaskStatus::Completed => self.completed.push(task),
            TaskStatus::Failed => self.failed.push(task),
            TaskStatus::Rejected => self.rejected.push(task),
        }
    }

    pub fn total(&self) -> usize {
        TaskStatus::ALL.iter().map(|s| self.column(*s).len()).sum()
    }
}

/// A registered worker instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: String,
    pub role: String,
    pub status: InstanceStatus,
    pub current_task: Option<String>,
    pub started_at: i64,
    pub last_heartbeat: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    pub id: i64,
    pub task_id: Option<String>,
    pub from_agent: String,
    pub to_agent: Option<String>,
    pub reason: String,
    pub severity: Severity,
    pub status: EscalationStatus,
    pub resolution: Option<String>,
    pub created_at: i64,
    pub resolved_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostBudget {
    pub id: i64,
    pub scope: BudgetScope,
    /// `None` for the global scope.
    pub scope_id: Option<String>,
    pub budget_usd: f64,
    pub spent_usd: f64,
    pub period: BudgetPeriod,
    pub reset_at: Option<i64>,
    pub created_at: i64,
}

impl CostBudget {
    pub fn is_over(&self) -> bool {
        self.spent_usd >= self.budget_usd
    }

    pub fn remaining(&self) -> f64 {
        (self.budget_usd - self.spent_usd).max(0.0)
    }

    /// Fraction of the budget spent (1.0 = exhausted).
    pub fn utilization(&self) -> f64 {
        if self.budget_usd <= 0.0 {
            1.0
        } else {
            self.spent_usd / self.budget_usd
        }
    }
}

/// Result of an admission check against the cost budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetCheck {
    pub allowed: bool,
    pub remaining: Option<f64>,
    pub budget: Option<f64>,
    pub spent: Option<f64>,
    pub scope: Option<BudgetScope>,
    pub budget_id: Option<i64>,
}

impl BudgetCheck {
    pub(crate) fn unrestricted() -> Self {
        Self {
            allowed: true,
            remaining: None,
            budget: None,
            spent: None,
            scope: None,
            budget_id: None,
        }
    }

    pub(crate) fn from_budget(budget: &CostBudget) -> Self {
        Self {
            allowed: !budget.is_over(),
            remaining: Some(budget.remaining()),
            budget: Some(budget.budget_usd),
            spent: Some(budget.spent_usd),
            scope: Some(budget.scope),
            budget_id: Some(budget.id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub kind: String,
    pub severity: NotificationSeverity,
    pub title: String,
    pub body: String,
    pub ref_id: Option<String>,
    pub read: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub id: i64,
    pub url: String,
    /// Event kinds to deliver; empty means all.
    pub events: Vec<String>,
    #[serde(skip_serializing)]
    pub secret: Option<String>,
    pub active: bool,
    pub created_at: i64,
}

impl Webhook {
    pub fn wants(&self, event: &str) -> bool {
        self.events.is_empty() || self.events.iter().any(|e| e == event || e == "*")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: i64,
    pub webhook_id: i64,
    pub event: String,
    pub payload: String,
    pub status: DeliveryStatus,
    pub attempts: i32,
    pub response_status: Option<i32>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}
