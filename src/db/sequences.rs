//! Per-prefix monotonic id sequences (`PM-001`, `CD-002`, ...).

use super::{Database, optional};
use crate::error::SchedulerError;
use anyhow::Result;
use rusqlite::{Connection, params};
use tracing::debug;

/// Format a sequence value as a task id.
pub fn format_id(prefix: &str, value: i64) -> String {
    format!("{}-{:03}", prefix, value)
}

/// Atomically take the next value for `prefix` on an existing connection.
///
/// A single `UPDATE ... RETURNING` both increments and reads, so concurrent
/// callers can never observe the same value.
pub(crate) fn next_id_internal(conn: &Connection, prefix: &str) -> Result<String> {
    let value: Option<i64> = optional(conn.query_row(
        "UPDATE id_sequences SET next_val = next_val + 1
         WHERE prefix = ?1
         RETURNING next_val - 1",
        params![prefix],
        |row| row.get(0),
    ))?;

    match value {
        Some(v) => Ok(format_id(prefix, v)),
        None => Err(SchedulerError::unregistered_prefix(prefix).into()),
    }
}

pub(crate) fn prefix_for_role_internal(conn: &Connection, role: &str) -> Result<Option<String>> {
    optional(conn.query_row(
        "SELECT prefix FROM role_prefixes WHERE role = ?1",
        params![role],
        |row| row.get(0),
    ))
}

impl Database {
    /// Register a prefix. No-op if it already exists.
    pub fn register_prefix(&self, prefix: &str) -> Result<()> {
        if prefix.trim().is_empty() {
            return Err(SchedulerError::invalid_value("prefix", "Prefix cannot be empty").into());
        }
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO id_sequences (prefix, next_val) VALUES (?1, 1)",
                params![prefix],
            )?;
            Ok(())
        })
    }

    /// Map a role to a prefix, registering the prefix if needed.
    ///
    /// Re-registering a role with a different prefix rebinds it; the old
    /// prefix keeps its counter so ids are never reused.
    pub fn register_role_prefix(&self, role: &str, prefix: &str) -> Result<()> {
        if role.trim().is_empty() {
            return Err(SchedulerError::invalid_value("role", "Role cannot be empty").into());
        }
        self.register_prefix(prefix)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO role_prefixes (role, prefix) VALUES (?1, ?2)
                 ON CONFLICT(role) DO UPDATE SET prefix = excluded.prefix",
                params![role, prefix],
            )?;
            debug!(role, prefix, "Registered role prefix");
            Ok(())
        })
    }

    /// Prefix registered for a role, if any.
    pub fn prefix_for_role(&self, role: &str) -> Result<Option<String>> {
        self.with_conn(|conn| prefix_for_role_internal(conn, role))
    }

    /// Take the next id for a prefix.
    pub fn next_id(&self, prefix: &str) -> Result<String> {
        self.with_conn(|conn| next_id_internal(conn, prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCode, error_code};

    #[test]
    fn ids_are_zero_padded_to_three_digits() {
        assert_eq!(format_id("CD", 1), "CD-001");
        assert_eq!(format_id("PM", 42), "PM-042");
        assert_eq!(format_id("PM", 1234), "PM-1234");
    }

    #[test]
    fn registering_twice_does_not_reset_the_counter() {
        let db = Database::open_in_memory().unwrap();
        db.register_prefix("CD").unwrap();
        assert_eq!(db.next_id("CD").unwrap(), "CD-001");
        db.register_prefix("CD").unwrap();
        assert_eq!(db.next_id("CD").unwrap(), "CD-002");
    }

    #[test]
    fn unregistered_prefix_fails() {
        let db = Database::open_in_memory().unwrap();
        let err = db.next_id("ZZ").unwrap_err();
        assert_eq!(error_code(&err), Some(ErrorCode::UnregisteredPrefix));
    }

    #[test]
    fn role_rebinding_keeps_old_counter() {
        let db = Database::open_in_memory().unwrap();
        db.register_role_prefix("coder", "CD").unwrap();
        db.next_id("CD").unwrap();
        db.register_role_prefix("coder", "CX").unwrap();
        assert_eq!(db.prefix_for_role("coder").unwrap().as_deref(), Some("CX"));
        assert_eq!(db.next_id("CD").unwrap(), "CD-002");
    }
}
