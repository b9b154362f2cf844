//! Escalation records.

use super::{Database, optional};
use crate::error::SchedulerError;
use crate::events::{EventKind, SchedulerEvent};
use crate::types::{Escalation, EscalationStatus, Severity};
use anyhow::Result;
use rusqlite::{Connection, Row, params};
use tracing::{info, warn};

/// Input for [`Database::create_escalation`].
#[derive(Debug, Clone)]
pub struct NewEscalation {
    pub task_id: Option<String>,
    pub from_agent: String,
    pub to_agent: Option<String>,
    pub reason: String,
    pub severity: Severity,
}

fn parse_escalation_row(row: &Row) -> rusqlite::Result<Escalation> {
    Ok(Escalation {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        from_agent: row.get("from_agent")?,
        to_agent: row.get("to_agent")?,
        reason: row.get("reason")?,
        severity: row.get("severity")?,
        status: row.get("status")?,
        resolution: row.get("resolution")?,
        created_at: row.get("created_at")?,
        resolved_at: row.get("resolved_at")?,
    })
}

fn get_escalation_internal(conn: &Connection, id: i64) -> Result<Option<Escalation>> {
    optional(conn.query_row(
        "SELECT * FROM escalations WHERE id = ?1",
        params![id],
        parse_escalation_row,
    ))
}

impl Database {
    pub fn create_escalation(&self, new: NewEscalation) -> Result<Escalation> {
        let now = self.now_ms();
        let escalation = self.with_conn(|conn| {
            let id = conn.query_row(
                "INSERT INTO escalations (task_id, from_agent, to_agent, reason, severity, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'open', ?6)
                 RETURNING id",
                params![
                    &new.task_id,
                    &new.from_agent,
                    &new.to_agent,
                    &new.reason,
                    new.severity,
                    now
                ],
                |row| row.get(0),
            )?;
            Ok(Escalation {
                id,
                task_id: new.task_id,
                from_agent: new.from_agent,
                to_agent: new.to_agent,
                reason: new.reason,
                severity: new.severity,
                status: EscalationStatus::Open,
                resolution: None,
                created_at: now,
                resolved_at: None,
            })
        })?;

        warn!(
            escalation_id = escalation.id,
            task_id = escalation.task_id.as_deref().unwrap_or_default(),
            severity = %escalation.severity,
            reason = %escalation.reason,
            "Escalation raised"
        );
        self.publish(
            SchedulerEvent::new(EventKind::EscalationCreated, now)
                .with("escalation_id", escalation.id)
                .with("task_id", escalation.task_id.clone())
                .with("from_agent", escalation.from_agent.as_str())
                .with("severity", escalation.severity.as_str())
                .with("reason", escalation.reason.as_str()),
        );
        Ok(escalation)
    }

    /// Resolve an open escalation. Resolved escalations are terminal.
    pub fn resolve_escalation(&self, id: i64, resolution: &str) -> Result<Escalation> {
        let now = self.now_ms();
        let escalation = self.with_conn(|conn| {
            let escalation = get_escalation_internal(conn, id)?
                .ok_or_else(|| SchedulerError::escalation_not_found(id))?;
            if escalation.status != EscalationStatus::Open {
                return Err(SchedulerError::invalid_state(
                    "Escalation",
                    &id.to_string(),
                    escalation.status.as_str(),
                    EscalationStatus::Open.as_str(),
                )
                .into());
            }
            conn.execute(
                "UPDATE escalations SET status = 'resolved', resolution = ?2, resolved_at = ?3
                 WHERE id = ?1",
                params![id, resolution, now],
            )?;
            Ok(Escalation {
                status: EscalationStatus::Resolved,
                resolution: Some(resolution.to_string()),
                resolved_at: Some(now),
                ..escalation
            })
        })?;

        info!(escalation_id = id, "Escalation resolved");
        self.publish(
            SchedulerEvent::new(EventKind::EscalationResolved, now)
                .with("escalation_id", id)
                .with("task_id", escalation.task_id.clone())
                .with("resolution", resolution),
        );
        Ok(escalation)
    }

    pub fn get_escalation(&self, id: i64) -> Result<Option<Escalation>> {
        self.with_conn(|conn| get_escalation_internal(conn, id))
    }

    /// Escalations, newest first, optionally filtered by status.
    pub fn list_escalations(&self, status: Option<EscalationStatus>) -> Result<Vec<Escalation>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM escalations WHERE (?1 IS NULL OR status = ?1) ORDER BY id DESC",
            )?;
            let escalations = stmt
                .query_map(params![status], parse_escalation_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(escalations)
        })
    }

    pub fn has_open_escalation(&self, task_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let open: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM escalations WHERE task_id = ?1 AND status = 'open')",
                params![task_id],
                |row| row.get(0),
            )?;
            Ok(open)
        })
    }
}
