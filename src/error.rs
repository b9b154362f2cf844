//! Structured error types for scheduler operations.
//!
//! Store operations return `anyhow::Result`; typed failures travel inside the
//! `anyhow::Error` as a [`SchedulerError`] so callers can `downcast_ref` and
//! branch on [`ErrorCode`].

use serde::Serialize;
use std::fmt;

/// Error codes for programmatic error handling.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors
    InvalidFieldValue,
    InvalidState,
    InvalidStatus,

    // Not found errors
    TaskNotFound,
    GroupNotFound,
    InstanceNotFound,
    BudgetNotFound,
    EscalationNotFound,
    NotificationNotFound,
    WebhookNotFound,

    // Constraint violations
    UnknownPrefix,
    UnregisteredPrefix,
    InvalidDependency,
    GuardrailExceeded,
    WebhookTargetRejected,

    // Internal errors
    DatabaseError,
    InternalError,
}

/// Structured scheduler error.
#[derive(Debug, Serialize)]
pub struct SchedulerError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl SchedulerError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            field: None,
            details: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    // Convenience constructors

    pub fn invalid_value(field: &str, reason: &str) -> Self {
        Self::new(ErrorCode::InvalidFieldValue, reason).with_field(field)
    }

    pub fn invalid_state(entity: &str, id: &str, actual: &str, expected: &str) -> Self {
        Self::new(
            ErrorCode::InvalidState,
            format!(
                "{} {} is '{}', expected '{}'",
                entity, id, actual, expected
            ),
        )
    }

    pub fn invalid_status(status: &str) -> Self {
        Self::new(
            ErrorCode::InvalidStatus,
            format!(
                "Invalid instance status '{}'. Valid: idle, working, paused, stopped",
                status
            ),
        )
        .with_field("status")
    }

    pub fn task_not_found(task_id: &str) -> Self {
        Self::new(
            ErrorCode::TaskNotFound,
            format!("Task not found: {}", task_id),
        )
    }

    pub fn group_not_found(group_id: &str) -> Self {
        Self::new(
            ErrorCode::GroupNotFound,
            format!("Group not found: {}", group_id),
        )
    }

    pub fn instance_not_found(instance_id: &str) -> Self {
        Self::new(
            ErrorCode::InstanceNotFound,
            format!("Instance not found: {}", instance_id),
        )
    }

    pub fn budget_not_found(budget_id: i64) -> Self {
        Self::new(
            ErrorCode::BudgetNotFound,
            format!("Budget not found: {}", budget_id),
        )
    }

    pub fn escalation_not_found(escalation_id: i64) -> Self {
        Self::new(
            ErrorCode::EscalationNotFound,
            format!("Escalation not found: {}", escalation_id),
        )
    }

    pub fn notification_not_found(notification_id: i64) -> Self {
        Self::new(
            ErrorCode::NotificationNotFound,
            format!("Notification not found: {}", notification_id),
        )
    }

    pub fn webhook_not_found(webhook_id: i64) -> Self {
        Self::new(
            ErrorCode::WebhookNotFound,
            format!("Webhook not found: {}", webhook_id),
        )
    }

    pub fn unknown_prefix(role: &str) -> Self {
        Self::new(
            ErrorCode::UnknownPrefix,
            format!("No id prefix registered for role '{}'", role),
        )
        .with_field("assigned_to")
    }

    pub fn unregistered_prefix(prefix: &str) -> Self {
        Self::new(
            ErrorCode::UnregisteredPrefix,
            format!("Prefix '{}' was never registered", prefix),
        )
    }

    pub fn invalid_dependency(task_id: &str, blocked_by: &str, reason: &str) -> Self {
        Self::new(
            ErrorCode::InvalidDependency,
            format!("Invalid dependency {} -> {}: {}", task_id, blocked_by, reason),
        )
        .with_field("blocked_by")
    }

    pub fn guardrail(name: &str, limit: u32) -> Self {
        Self::new(
            ErrorCode::GuardrailExceeded,
            format!("Guardrail '{}' exceeded (limit {})", name, limit),
        )
        .with_field(name)
    }

    pub fn webhook_target(url: &str, reason: &str) -> Self {
        Self::new(
            ErrorCode::WebhookTargetRejected,
            format!("Webhook target {} rejected: {}", url, reason),
        )
        .with_field("url")
    }

    pub fn database(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::DatabaseError, err.to_string())
    }

    pub fn internal(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::InternalError, err.to_string())
    }
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SchedulerError {}

// Allow using ? with anyhow errors by converting them
impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<SchedulerError>() {
            Ok(sched_err) => sched_err,
            Err(err) => match err.downcast::<rusqlite::Error>() {
                Ok(db_err) => SchedulerError::database(db_err),
                Err(err) => SchedulerError::internal(err),
            },
        }
    }
}

/// Extract the [`ErrorCode`] carried by an `anyhow::Error`, if any.
pub fn error_code(err: &anyhow::Error) -> Option<ErrorCode> {
    err.downcast_ref::<SchedulerError>().map(|e| e.code)
}

/// Result type for scheduler operations surfaced to callers.
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_survives_anyhow_round_trip() {
        let err: anyhow::Error = SchedulerError::unregistered_prefix("CD").into();
        assert_eq!(error_code(&err), Some(ErrorCode::UnregisteredPrefix));

        let back: SchedulerError = err.into();
        assert_eq!(back.code, ErrorCode::UnregisteredPrefix);
    }

    #[test]
    fn foreign_errors_become_internal() {
        let err = anyhow::anyhow!("boom");
        assert_eq!(error_code(&err), None);
        let converted: SchedulerError = err.into();
        assert_eq!(converted.code, ErrorCode::InternalError);
    }

    #[test]
    fn serializes_code_in_screaming_snake_case() {
        let err = SchedulerError::task_not_found("CD-001");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "TASK_NOT_FOUND");
        assert!(json.get("field").is_none());
    }
}
