//! Instance registry: worker identity, status and heartbeat.

use super::{Database, optional};
use crate::error::SchedulerError;
use crate::events::{EventKind, SchedulerEvent};
use crate::types::{Instance, InstanceStatus};
use anyhow::Result;
use rusqlite::{Connection, Row, params};
use tracing::{debug, info};

fn parse_instance_row(row: &Row) -> rusqlite::Result<Instance> {
    Ok(Instance {
        instance_id: row.get("instance_id")?,
        role: row.get("role")?,
        status: row.get("status")?,
        current_task: row.get("current_task")?,
        started_at: row.get("started_at")?,
        last_heartbeat: row.get("last_heartbeat")?,
    })
}

fn get_instance_internal(conn: &Connection, instance_id: &str) -> Result<Option<Instance>> {
    optional(conn.query_row(
        "SELECT * FROM instances WHERE instance_id = ?1",
        params![instance_id],
        parse_instance_row,
    ))
}

impl Database {
    /// Register (or re-register) an instance.
    ///
    /// Always lands in `idle` with no current task and a fresh `started_at`,
    /// whatever state a previous registration left behind.
    pub fn register_instance(&self, instance_id: &str, role: &str) -> Result<Instance> {
        if instance_id.trim().is_empty() {
            return Err(
                SchedulerError::invalid_value("instance_id", "Instance id cannot be empty").into(),
            );
        }
        let now = self.now_ms();

        let instance = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO instances (instance_id, role, status, current_task, started_at, last_heartbeat)
                 VALUES (?1, ?2, 'idle', NULL, ?3, NULL)
                 ON CONFLICT(instance_id) DO UPDATE SET
                     role = excluded.role,
                     status = 'idle',
                     current_task = NULL,
                     started_at = excluded.started_at,
                     last_heartbeat = NULL",
                params![instance_id, role, now],
            )?;
            Ok(Instance {
                instance_id: instance_id.to_string(),
                role: role.to_string(),
                status: InstanceStatus::Idle,
                current_task: None,
                started_at: now,
                last_heartbeat: None,
            })
        })?;

        info!(instance_id, role, "Instance registered");
        self.publish_status_change(&instance);
        Ok(instance)
    }

    /// Update an instance's status and current task.
    ///
    /// `status` is the textual name; anything other than `idle`, `working`,
    /// `paused` or `stopped` fails with `InvalidStatus`.
    pub fn update_status(
        &self,
        instance_id: &str,
        status: &str,
        current_task: Option<&str>,
    ) -> Result<Instance> {
        let status = InstanceStatus::parse(status)
            .ok_or_else(|| SchedulerError::invalid_status(status))?;
        self.set_instance_status(instance_id, status, current_task)
    }

    /// Typed form of [`Database::update_status`].
    pub fn set_instance_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
        current_task: Option<&str>,
    ) -> Result<Instance> {
        let (previous, instance) = self.with_conn(|conn| {
            let previous = get_instance_internal(conn, instance_id)?
                .ok_or_else(|| SchedulerError::instance_not_found(instance_id))?;
            conn.execute(
                "UPDATE instances SET status = ?2, current_task = ?3 WHERE instance_id = ?1",
                params![instance_id, status, current_task],
            )?;
            let instance = Instance {
                status,
                current_task: current_task.map(str::to_string),
                ..previous.clone()
            };
            Ok((previous, instance))
        })?;

        if previous.status != status || previous.current_task != instance.current_task {
            debug!(
                instance_id,
                from = %previous.status,
                to = %status,
                task_id = current_task.unwrap_or_default(),
                "Instance status changed"
            );
            self.publish_status_change(&instance);
        }
        Ok(instance)
    }

    fn publish_status_change(&self, instance: &Instance) {
        self.publish(
            SchedulerEvent::new(EventKind::InstanceStatusChanged, self.now_ms())
                .with("instance_id", instance.instance_id.as_str())
                .with("role", instance.role.as_str())
                .with("status", instance.status.as_str())
                .with("current_task", instance.current_task.clone()),
        );
    }

    /// Record a liveness signal.
    pub fn heartbeat(&self, instance_id: &str) -> Result<()> {
        let now = self.now_ms();
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE instances SET last_heartbeat = ?2 WHERE instance_id = ?1",
                params![instance_id, now],
            )?;
            if updated == 0 {
                return Err(SchedulerError::instance_not_found(instance_id).into());
            }
            Ok(())
        })
    }

    /// Working instances whose last heartbeat (or start, if they never sent
    /// one) is older than `timeout_seconds`.
    pub fn get_stale(&self, timeout_seconds: u64) -> Result<Vec<Instance>> {
        let timeout_ms = i64::try_from(timeout_seconds.saturating_mul(1000)).unwrap_or(i64::MAX);
        let cutoff = self.now_ms().saturating_sub(timeout_ms);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM instances
                 WHERE status = 'working'
                   AND (last_heartbeat < ?1 OR (last_heartbeat IS NULL AND started_at < ?1))
                 ORDER BY instance_id",
            )?;
            let stale = stmt
                .query_map(params![cutoff], parse_instance_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(stale)
        })
    }

    /// Remove an instance from the registry.
    pub fn deregister_instance(&self, instance_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM instances WHERE instance_id = ?1",
                params![instance_id],
            )?;
            if removed == 0 {
                return Err(SchedulerError::instance_not_found(instance_id).into());
            }
            Ok(())
        })?;
        info!(instance_id, "Instance deregistered");
        Ok(())
    }

    pub fn get_instance(&self, instance_id: &str) -> Result<Option<Instance>> {
        self.with_conn(|conn| get_instance_internal(conn, instance_id))
    }

    /// Registered instances, optionally for one role.
    pub fn list_instances(&self, role: Option<&str>) -> Result<Vec<Instance>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM instances WHERE (?1 IS NULL OR role = ?1) ORDER BY instance_id",
            )?;
            let instances = stmt
                .query_map(params![role], parse_instance_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(instances)
        })
    }
}
