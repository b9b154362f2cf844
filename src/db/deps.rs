//! Dependency edge queries.
//!
//! Edges are only written by `create_task` and resolved by `complete_task`;
//! this module reads them.

use super::Database;
use crate::error::SchedulerError;
use crate::types::Dependency;
use anyhow::Result;
use rusqlite::{Connection, Row, params};

fn parse_dependency_row(row: &Row) -> rusqlite::Result<Dependency> {
    Ok(Dependency {
        task_id: row.get("task_id")?,
        blocked_by: row.get("blocked_by")?,
        resolved: row.get("resolved")?,
        resolved_at: row.get("resolved_at")?,
    })
}

fn query_edges(conn: &Connection, sql: &str, task_id: &str) -> Result<Vec<Dependency>> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM tasks WHERE id = ?1)",
        params![task_id],
        |row| row.get(0),
    )?;
    if !exists {
        return Err(SchedulerError::task_not_found(task_id).into());
    }

    let mut stmt = conn.prepare(sql)?;
    let edges = stmt
        .query_map(params![task_id], parse_dependency_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(edges)
}

impl Database {
    /// Edges where `task_id` is the waiting side.
    pub fn get_blockers(&self, task_id: &str) -> Result<Vec<Dependency>> {
        self.with_conn(|conn| {
            query_edges(
                conn,
                "SELECT * FROM dependencies WHERE task_id = ?1 ORDER BY blocked_by",
                task_id,
            )
        })
    }

    /// Edges where `task_id` is the prerequisite.
    pub fn get_dependents(&self, task_id: &str) -> Result<Vec<Dependency>> {
        self.with_conn(|conn| {
            query_edges(
                conn,
                "SELECT * FROM dependencies WHERE blocked_by = ?1 ORDER BY task_id",
                task_id,
            )
        })
    }

    /// True while any incoming edge of `task_id` is unresolved.
    pub fn has_unresolved_blockers(&self, task_id: &str) -> Result<bool> {
        Ok(self.get_blockers(task_id)?.iter().any(|d| !d.resolved))
    }
}
