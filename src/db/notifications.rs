//! Human-facing notifications.

use super::Database;
use crate::error::SchedulerError;
use crate::types::{Notification, NotificationSeverity};
use anyhow::Result;
use rusqlite::{Connection, Row, params};

pub(crate) struct NewNotification {
    pub kind: String,
    pub severity: NotificationSeverity,
    pub title: String,
    pub body: String,
    pub ref_id: Option<String>,
}

fn parse_notification_row(row: &Row) -> rusqlite::Result<Notification> {
    Ok(Notification {
        id: row.get("id")?,
        kind: row.get("kind")?,
        severity: row.get("severity")?,
        title: row.get("title")?,
        body: row.get("body")?,
        ref_id: row.get("ref_id")?,
        read: row.get("is_read")?,
        created_at: row.get("created_at")?,
    })
}

pub(crate) fn insert_notification_internal(
    conn: &Connection,
    new: NewNotification,
    now: i64,
) -> Result<Notification> {
    let id = conn.query_row(
        "INSERT INTO notifications (kind, severity, title, body, ref_id, is_read, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)
         RETURNING id",
        params![&new.kind, new.severity, &new.title, &new.body, &new.ref_id, now],
        |row| row.get(0),
    )?;
    Ok(Notification {
        id,
        kind: new.kind,
        severity: new.severity,
        title: new.title,
        body: new.body,
        ref_id: new.ref_id,
        read: false,
        created_at: now,
    })
}

impl Database {
    /// Notifications, newest first.
    pub fn list_notifications(&self, unread_only: bool) -> Result<Vec<Notification>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM notifications WHERE (?1 = 0 OR is_read = 0) ORDER BY id DESC",
            )?;
            let notifications = stmt
                .query_map(params![unread_only], parse_notification_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(notifications)
        })
    }

    /// Mark a notification read. Marking an already-read one is a no-op.
    pub fn mark_notification_read(&self, id: i64) -> Result<()> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE notifications SET is_read = 1 WHERE id = ?1",
                params![id],
            )?;
            if updated == 0 {
                return Err(SchedulerError::notification_not_found(id).into());
            }
            Ok(())
        })
    }
}
