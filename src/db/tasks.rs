//! Task graph operations: creation, the claim protocol and terminal transitions.

use super::groups::get_group_internal;
use super::sequences::{next_id_internal, prefix_for_role_internal};
use super::{Database, Guardrails, optional};
use crate::error::SchedulerError;
use crate::events::{EventKind, SchedulerEvent};
use crate::types::{Board, GroupStatus, NewTask, Task, TaskStatus};
use anyhow::Result;
use rusqlite::{Connection, Row, params};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Outcome of [`Database::complete_task`].
#[derive(Debug, Clone, Serialize)]
pub struct Completion {
    pub task: Task,
    /// Dependents that moved from `blocked` to `pending`, in creation order.
    pub unblocked: Vec<String>,
}

pub fn parse_task_row(row: &Row) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get("id")?,
        group_id: row.get("group_id")?,
        parent_id: row.get("parent_id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        task_type: row.get("task_type")?,
        priority: row.get("priority")?,
        assigned_to: row.get("assigned_to")?,
        claimed_by: row.get("claimed_by")?,
        executed_by: row.get("executed_by")?,
        status: row.get("status")?,
        created_by: row.get("created_by")?,
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        rejection_reason: row.get("rejection_reason")?,
        output_ref: row.get("output_ref")?,
        revision_of: row.get("revision_of")?,
    })
}

pub(crate) fn get_task_internal(conn: &Connection, task_id: &str) -> Result<Option<Task>> {
    optional(conn.query_row(
        "SELECT * FROM tasks WHERE id = ?1",
        params![task_id],
        parse_task_row,
    ))
}

fn require_task(conn: &Connection, task_id: &str) -> Result<Task> {
    get_task_internal(conn, task_id)?.ok_or_else(|| SchedulerError::task_not_found(task_id).into())
}

fn require_in_progress(task: &Task) -> Result<()> {
    if task.status != TaskStatus::InProgress {
        return Err(SchedulerError::invalid_state(
            "Task",
            &task.id,
            task.status.as_str(),
            TaskStatus::InProgress.as_str(),
        )
        .into());
    }
    Ok(())
}

/// Number of tasks in the chain starting at `start` and following `link`.
fn chain_length(conn: &Connection, link: ChainLink, start: &str) -> Result<u32> {
    let column = link.column();
    let sql = format!(
        "WITH RECURSIVE chain(id, next, depth) AS (
             SELECT id, {column}, 1 FROM tasks WHERE id = ?1
             UNION ALL
             SELECT t.id, t.{column}, c.depth + 1 FROM tasks t JOIN chain c ON t.id = c.next
         )
         SELECT COALESCE(MAX(depth), 0) FROM chain"
    );
    let depth: i64 = conn.query_row(&sql, params![start], |row| row.get(0))?;
    Ok(depth as u32)
}

#[derive(Clone, Copy)]
enum ChainLink {
    Parent,
    Revision,
}

impl ChainLink {
    fn column(self) -> &'static str {
        match self {
            ChainLink::Parent => "parent_id",
            ChainLink::Revision => "revision_of",
        }
    }
}

fn query_tasks(conn: &Connection, sql: &str, args: impl rusqlite::Params) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(sql)?;
    let tasks = stmt
        .query_map(args, parse_task_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(tasks)
}

impl Database {
    /// Create a task, generating its id from the assigned role's prefix.
    ///
    /// The task starts `blocked` when any listed blocker is not yet
    /// completed, otherwise `pending`. Edges to blockers that are already
    /// completed are stored resolved. Every check runs before any write and
    /// the whole insert is one transaction.
    pub fn create_task(&self, new: NewTask, guardrails: &Guardrails) -> Result<Task> {
        if new.title.trim().is_empty() {
            return Err(SchedulerError::invalid_value("title", "Task title cannot be empty").into());
        }
        if new.assigned_to.trim().is_empty() {
            return Err(
                SchedulerError::invalid_value("assigned_to", "Task must target a role").into(),
            );
        }
        let now = self.now_ms();

        let task = self.transaction(|tx| {
            let group = get_group_internal(tx, &new.group_id)?
                .ok_or_else(|| SchedulerError::group_not_found(&new.group_id))?;
            if group.status != GroupStatus::Active {
                return Err(SchedulerError::invalid_state(
                    "Group",
                    &group.id,
                    group.status.as_str(),
                    GroupStatus::Active.as_str(),
                )
                .into());
            }

            let prefix = prefix_for_role_internal(tx, &new.assigned_to)?
                .ok_or_else(|| SchedulerError::unknown_prefix(&new.assigned_to))?;

            let in_group: i64 = tx.query_row(
                "SELECT COUNT(*) FROM tasks WHERE group_id = ?1",
                params![&new.group_id],
                |row| row.get(0),
            )?;
            if in_group >= i64::from(guardrails.max_tasks_per_group) {
                return Err(SchedulerError::guardrail(
                    "max_tasks_per_group",
                    guardrails.max_tasks_per_group,
                )
                .into());
            }

            if let Some(parent_id) = &new.parent_id {
                require_task(tx, parent_id).map_err(|_| {
                    SchedulerError::task_not_found(parent_id).with_field("parent_id")
                })?;
                let depth = chain_length(tx, ChainLink::Parent, parent_id)? + 1;
                if depth > guardrails.max_task_depth {
                    return Err(
                        SchedulerError::guardrail("max_task_depth", guardrails.max_task_depth)
                            .with_details(format!("task would sit at depth {}", depth))
                            .into(),
                    );
                }
            }

            if let Some(revision_of) = &new.revision_of {
                require_task(tx, revision_of).map_err(|_| {
                    SchedulerError::task_not_found(revision_of).with_field("revision_of")
                })?;
                let revisions = chain_length(tx, ChainLink::Revision, revision_of)?;
                if revisions > guardrails.max_rejection_cycles {
                    return Err(SchedulerError::guardrail(
                        "max_rejection_cycles",
                        guardrails.max_rejection_cycles,
                    )
                    .with_details(format!("this would be revision {}", revisions))
                    .into());
                }
            }

            let id = next_id_internal(tx, &prefix)?;

            // Duplicate blockers collapse into one edge.
            let blockers: BTreeSet<&str> = new.blocked_by.iter().map(String::as_str).collect();
            let mut edges = Vec::with_capacity(blockers.len());
            for blocker in blockers {
                if blocker == id {
                    return Err(
                        SchedulerError::invalid_dependency(&id, blocker, "task cannot block itself")
                            .into(),
                    );
                }
                let Some(blocking) = get_task_internal(tx, blocker)? else {
                    return Err(
                        SchedulerError::invalid_dependency(&id, blocker, "task does not exist")
                            .into(),
                    );
                };
                edges.push((blocker, blocking.status == TaskStatus::Completed));
            }

            let status = if edges.iter().all(|(_, resolved)| *resolved) {
                TaskStatus::Pending
            } else {
                TaskStatus::Blocked
            };

            tx.execute(
                "INSERT INTO tasks (id, group_id, parent_id, title, description, task_type,
                    priority, assigned_to, status, created_by, created_at, revision_of)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    &id,
                    &new.group_id,
                    &new.parent_id,
                    &new.title,
                    &new.description,
                    &new.task_type,
                    new.priority,
                    &new.assigned_to,
                    status,
                    &new.created_by,
                    now,
                    &new.revision_of,
                ],
            )?;

            for (blocker, resolved) in &edges {
                tx.execute(
                    "INSERT INTO dependencies (task_id, blocked_by, resolved, resolved_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![&id, blocker, resolved, resolved.then_some(now)],
                )?;
            }

            require_task(tx, &id)
        })?;

        info!(
            task_id = %task.id,
            group_id = %task.group_id,
            role = %task.assigned_to,
            status = %task.status,
            "Task created"
        );
        self.publish(
            SchedulerEvent::new(EventKind::TaskCreated, now)
                .with("task_id", task.id.as_str())
                .with("group_id", task.group_id.as_str())
                .with("assigned_to", task.assigned_to.as_str())
                .with("status", task.status.as_str()),
        );
        Ok(task)
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        self.with_conn(|conn| get_task_internal(conn, task_id))
    }

    /// Claim the oldest pending task for `role`.
    ///
    /// Selection and assignment are one conditional `UPDATE ... RETURNING`,
    /// so concurrent pollers, on this handle or on other connections to the
    /// same file, can never both win the same row. `None` means nothing was
    /// eligible.
    pub fn claim_task(&self, role: &str, instance_id: &str) -> Result<Option<Task>> {
        let now = self.now_ms();

        let claimed = self.transaction(|tx| {
            optional(tx.query_row(
                "UPDATE tasks
                 SET claimed_by = ?2, executed_by = ?2, status = 'in_progress', started_at = ?3
                 WHERE id = (
                     SELECT id FROM tasks
                     WHERE assigned_to = ?1 AND status = 'pending' AND claimed_by IS NULL
                     ORDER BY seq
                     LIMIT 1
                 )
                 AND status = 'pending' AND claimed_by IS NULL
                 RETURNING *",
                params![role, instance_id, now],
                parse_task_row,
            ))
        })?;

        match &claimed {
            Some(task) => {
                info!(task_id = %task.id, instance_id, role, "Task claimed");
                self.publish(
                    SchedulerEvent::new(EventKind::TaskClaimed, now)
                        .with("task_id", task.id.as_str())
                        .with("instance_id", instance_id)
                        .with("role", role),
                );
            }
            None => debug!(instance_id, role, "No eligible task"),
        }
        Ok(claimed)
    }

    /// Complete an in-progress task and resolve everything it was blocking.
    ///
    /// Edge resolution and the `blocked -> pending` flips commit together
    /// with the completion itself.
    pub fn complete_task(&self, task_id: &str, output_ref: Option<&str>) -> Result<Completion> {
        let now = self.now_ms();

        let completion = self.transaction(|tx| {
            let task = require_task(tx, task_id)?;
            require_in_progress(&task)?;

            tx.execute(
                "UPDATE tasks
                 SET status = 'completed', completed_at = ?2, claimed_by = NULL,
                     output_ref = COALESCE(?3, output_ref)
                 WHERE id = ?1",
                params![task_id, now, output_ref],
            )?;

            tx.execute(
                "UPDATE dependencies SET resolved = 1, resolved_at = ?2
                 WHERE blocked_by = ?1 AND resolved = 0",
                params![task_id, now],
            )?;

            let mut stmt = tx.prepare(
                "UPDATE tasks SET status = 'pending'
                 WHERE status = 'blocked'
                   AND id IN (SELECT task_id FROM dependencies WHERE blocked_by = ?1)
                   AND NOT EXISTS (
                       SELECT 1 FROM dependencies d
                       WHERE d.task_id = tasks.id AND d.resolved = 0
                   )
                 RETURNING id, seq",
            )?;
            let mut unblocked = stmt
                .query_map(params![task_id], |row| {
                    Ok((row.get::<_, i64>(1)?, row.get::<_, String>(0)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            drop(stmt);
            unblocked.sort();

            Ok(Completion {
                task: require_task(tx, task_id)?,
                unblocked: unblocked.into_iter().map(|(_, id)| id).collect(),
            })
        })?;

        let executor = completion.task.executed_by.as_deref().unwrap_or_default();
        info!(
            task_id,
            instance_id = executor,
            unblocked = completion.unblocked.len(),
            "Task completed"
        );
        self.publish(
            SchedulerEvent::new(EventKind::TaskCompleted, now)
                .with("task_id", task_id)
                .with("instance_id", executor)
                .with("unblocked", completion.unblocked.clone()),
        );
        for id in &completion.unblocked {
            debug!(task_id = %id, by = task_id, "Task unblocked");
            self.publish(
                SchedulerEvent::new(EventKind::TaskUnblocked, now)
                    .with("task_id", id.as_str())
                    .with("resolved_by", task_id),
            );
        }
        Ok(completion)
    }

    /// Reject an in-progress task. Dependents stay blocked.
    pub fn reject_task(&self, task_id: &str, reason: &str) -> Result<Task> {
        self.finish_unsuccessfully(task_id, TaskStatus::Rejected, reason)
    }

    /// Fail an in-progress task after an unrecoverable execution error.
    /// Dependents stay blocked.
    pub fn fail_task(&self, task_id: &str, reason: &str) -> Result<Task> {
        self.finish_unsuccessfully(task_id, TaskStatus::Failed, reason)
    }

    fn finish_unsuccessfully(&self, task_id: &str, status: TaskStatus, reason: &str) -> Result<Task> {
        let now = self.now_ms();
        let task = self.transaction(|tx| {
            let task = require_task(tx, task_id)?;
            require_in_progress(&task)?;
            tx.execute(
                "UPDATE tasks
                 SET status = ?2, completed_at = ?3, rejection_reason = ?4, claimed_by = NULL
                 WHERE id = ?1",
                params![task_id, status, now, reason],
            )?;
            require_task(tx, task_id)
        })?;

        let kind = match status {
            TaskStatus::Rejected => EventKind::TaskRejected,
            _ => EventKind::TaskFailed,
        };
        info!(task_id, status = %status, reason, "Task finished unsuccessfully");
        self.publish(
            SchedulerEvent::new(kind, now)
                .with("task_id", task_id)
                .with("instance_id", task.executed_by.as_deref().unwrap_or_default())
                .with("reason", reason),
        );
        Ok(task)
    }

    /// Move an in-progress claim to another instance.
    pub fn reassign_task(&self, task_id: &str, new_instance: &str) -> Result<Task> {
        let now = self.now_ms();
        let (previous, task) = self.transaction(|tx| {
            let task = require_task(tx, task_id)?;
            require_in_progress(&task)?;
            tx.execute(
                "UPDATE tasks SET claimed_by = ?2, executed_by = ?2 WHERE id = ?1",
                params![task_id, new_instance],
            )?;
            Ok((task.claimed_by, require_task(tx, task_id)?))
        })?;

        let previous = previous.unwrap_or_default();
        info!(task_id, from = %previous, to = new_instance, "Task reassigned");
        self.publish(
            SchedulerEvent::new(EventKind::TaskReassigned, now)
                .with("task_id", task_id)
                .with("from", previous)
                .with("to", new_instance),
        );
        Ok(task)
    }

    /// Tasks of a group in creation order.
    pub fn get_group_tasks(&self, group_id: &str) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            if get_group_internal(conn, group_id)?.is_none() {
                return Err(SchedulerError::group_not_found(group_id).into());
            }
            query_tasks(
                conn,
                "SELECT * FROM tasks WHERE group_id = ?1 ORDER BY seq",
                params![group_id],
            )
        })
    }

    /// Status-partitioned view of one group, or of every task.
    pub fn get_board(&self, group_id: Option<&str>) -> Result<Board> {
        let tasks = match group_id {
            Some(group_id) => self.get_group_tasks(group_id)?,
            None => self.with_conn(|conn| {
                query_tasks(conn, "SELECT * FROM tasks ORDER BY seq", [])
            })?,
        };

        let mut board = Board::default();
        for task in tasks {
            board.push(task);
        }
        Ok(board)
    }

    /// Number of tasks waiting to be claimed by `role`.
    pub fn count_pending(&self, role: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM tasks WHERE assigned_to = ?1 AND status = 'pending'",
                params![role],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }

    /// In-progress tasks whose claiming instance is no longer registered.
    pub fn orphaned_claims(&self) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            query_tasks(
                conn,
                "SELECT * FROM tasks
                 WHERE status = 'in_progress'
                   AND claimed_by IS NOT NULL
                   AND claimed_by NOT IN (SELECT instance_id FROM instances)
                 ORDER BY seq",
                [],
            )
        })
    }

    /// In-progress tasks claimed more than `timeout_seconds` ago by a
    /// registered instance that is not working on them, as happens when a
    /// restarted worker re-registers under its old id.
    pub fn abandoned_claims(&self, timeout_seconds: u64) -> Result<Vec<Task>> {
        let timeout_ms = i64::try_from(timeout_seconds.saturating_mul(1000)).unwrap_or(i64::MAX);
        let cutoff = self.now_ms().saturating_sub(timeout_ms);
        self.with_conn(|conn| {
            query_tasks(
                conn,
                "SELECT t.* FROM tasks t
                 JOIN instances i ON i.instance_id = t.claimed_by
                 WHERE t.status = 'in_progress'
                   AND t.started_at < ?1
                   AND (i.status != 'working' OR i.current_task IS NOT t.id)
                 ORDER BY t.seq",
                params![cutoff],
            )
        })
    }

    /// In-progress tasks currently claimed by `instance_id`.
    pub fn tasks_claimed_by(&self, instance_id: &str) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            query_tasks(
                conn,
                "SELECT * FROM tasks WHERE claimed_by = ?1 AND status = 'in_progress' ORDER BY seq",
                params![instance_id],
            )
        })
    }
}
