//! Group operations.
//!
//! Groups only become `completed` through [`Database::complete_group`]; task
//! completion never cascades into the owning group.

use super::sequences::next_id_internal;
use super::{Database, optional};
use crate::error::SchedulerError;
use crate::types::{Group, GroupStatus};
use anyhow::Result;
use rusqlite::{Connection, Row, params};
use tracing::info;

/// Sequence prefix reserved for group ids.
pub const GROUP_PREFIX: &str = "GRP";

fn parse_group_row(row: &Row) -> rusqlite::Result<Group> {
    Ok(Group {
        id: row.get("id")?,
        title: row.get("title")?,
        origin: row.get("origin")?,
        status: row.get("status")?,
        created_by: row.get("created_by")?,
        created_at: row.get("created_at")?,
        completed_at: row.get("completed_at")?,
    })
}

pub(crate) fn get_group_internal(conn: &Connection, group_id: &str) -> Result<Option<Group>> {
    optional(conn.query_row(
        "SELECT * FROM task_groups WHERE id = ?1",
        params![group_id],
        parse_group_row,
    ))
}

impl Database {
    /// Create an active group.
    pub fn create_group(&self, title: &str, origin: &str, created_by: &str) -> Result<Group> {
        if title.trim().is_empty() {
            return Err(SchedulerError::invalid_value("title", "Group title cannot be empty").into());
        }
        let now = self.now_ms();

        let group = self.transaction(|tx| {
            let id = next_id_internal(tx, GROUP_PREFIX)?;
            tx.execute(
                "INSERT INTO task_groups (id, title, origin, status, created_by, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![&id, title, origin, GroupStatus::Active, created_by, now],
            )?;
            Ok(Group {
                id,
                title: title.to_string(),
                origin: origin.to_string(),
                status: GroupStatus::Active,
                created_by: created_by.to_string(),
                created_at: now,
                completed_at: None,
            })
        })?;

        info!(group_id = %group.id, title, origin, "Group created");
        Ok(group)
    }

    pub fn get_group(&self, group_id: &str) -> Result<Option<Group>> {
        self.with_conn(|conn| get_group_internal(conn, group_id))
    }

    /// List groups, optionally filtered by status, oldest first.
    pub fn list_groups(&self, status: Option<GroupStatus>) -> Result<Vec<Group>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM task_groups
                 WHERE (?1 IS NULL OR status = ?1)
                 ORDER BY created_at, id",
            )?;
            let groups = stmt
                .query_map(params![status], parse_group_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(groups)
        })
    }

    /// Mark a group completed. Fails if it is unknown or already completed.
    pub fn complete_group(&self, group_id: &str) -> Result<Group> {
        let now = self.now_ms();
        let group = self.transaction(|tx| {
            let group = get_group_internal(tx, group_id)?
                .ok_or_else(|| SchedulerError::group_not_found(group_id))?;
            if group.status != GroupStatus::Active {
                return Err(SchedulerError::invalid_state(
                    "Group",
                    group_id,
                    group.status.as_str(),
                    GroupStatus::Active.as_str(),
                )
                .into());
            }
            tx.execute(
                "UPDATE task_groups SET status = ?1, completed_at = ?2 WHERE id = ?3",
                params![GroupStatus::Completed, now, group_id],
            )?;
            Ok(Group {
                status: GroupStatus::Completed,
                completed_at: Some(now),
                ..group
            })
        })?;
        info!(group_id, "Group completed");
        Ok(group)
    }
}
