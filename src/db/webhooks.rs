//! Webhook registrations and delivery records.
//!
//! Target validation happens in [`crate::webhooks::WebhookDispatcher`];
//! registration is only reachable through it.

use super::{Database, optional};
use crate::error::SchedulerError;
use crate::types::{DeliveryStatus, Webhook, WebhookDelivery};
use anyhow::Result;
use rusqlite::{Row, params};

fn parse_webhook_row(row: &Row) -> rusqlite::Result<Webhook> {
    let events_json: String = row.get("events")?;
    let events = serde_json::from_str(&events_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Webhook {
        id: row.get("id")?,
        url: row.get("url")?,
        events,
        secret: row.get("secret")?,
        active: row.get("active")?,
        created_at: row.get("created_at")?,
    })
}

fn parse_delivery_row(row: &Row) -> rusqlite::Result<WebhookDelivery> {
    Ok(WebhookDelivery {
        id: row.get("id")?,
        webhook_id: row.get("webhook_id")?,
        event: row.get("event")?,
        payload: row.get("payload")?,
        status: row.get("status")?,
        attempts: row.get("attempts")?,
        response_status: row.get("response_status")?,
        last_error: row.get("last_error")?,
        created_at: row.get("created_at")?,
        completed_at: row.get("completed_at")?,
    })
}

impl Database {
    pub(crate) fn insert_webhook(
        &self,
        url: &str,
        events: &[String],
        secret: Option<&str>,
    ) -> Result<Webhook> {
        let now = self.now_ms();
        let events_json = serde_json::to_string(events)?;
        self.with_conn(|conn| {
            let id = conn.query_row(
                "INSERT INTO webhooks (url, events, secret, active, created_at)
                 VALUES (?1, ?2, ?3, 1, ?4)
                 RETURNING id",
                params![url, events_json, secret, now],
                |row| row.get(0),
            )?;
            Ok(Webhook {
                id,
                url: url.to_string(),
                events: events.to_vec(),
                secret: secret.map(str::to_string),
                active: true,
                created_at: now,
            })
        })
    }

    pub fn list_webhooks(&self, active_only: bool) -> Result<Vec<Webhook>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM webhooks WHERE (?1 = 0 OR active = 1) ORDER BY id",
            )?;
            let hooks = stmt
                .query_map(params![active_only], parse_webhook_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(hooks)
        })
    }

    /// Stop delivering to a webhook without losing its history.
    pub fn deactivate_webhook(&self, id: i64) -> Result<()> {
        self.with_conn(|conn| {
            let updated =
                conn.execute("UPDATE webhooks SET active = 0 WHERE id = ?1", params![id])?;
            if updated == 0 {
                return Err(SchedulerError::webhook_not_found(id).into());
            }
            Ok(())
        })
    }

    /// Open a delivery record in `pending`.
    pub(crate) fn create_delivery(&self, webhook_id: i64, event: &str, payload: &str) -> Result<i64> {
        let now = self.now_ms();
        self.with_conn(|conn| {
            let id = conn.query_row(
                "INSERT INTO webhook_deliveries (webhook_id, event, payload, status, attempts, created_at)
                 VALUES (?1, ?2, ?3, 'pending', 0, ?4)
                 RETURNING id",
                params![webhook_id, event, payload, now],
                |row| row.get(0),
            )?;
            Ok(id)
        })
    }

    /// Record one attempt. A terminal `status` also stamps `completed_at`.
    pub(crate) fn record_delivery_attempt(
        &self,
        delivery_id: i64,
        status: DeliveryStatus,
        response_status: Option<u16>,
        error: Option<&str>,
    ) -> Result<()> {
        let now = self.now_ms();
        let completed_at = (status != DeliveryStatus::Pending).then_some(now);
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE webhook_deliveries
                 SET attempts = attempts + 1, status = ?2, response_status = ?3,
                     last_error = ?4, completed_at = ?5
                 WHERE id = ?1",
                params![delivery_id, status, response_status, error, completed_at],
            )?;
            Ok(())
        })
    }

    pub fn get_delivery(&self, delivery_id: i64) -> Result<Option<WebhookDelivery>> {
        self.with_conn(|conn| {
            optional(conn.query_row(
                "SELECT * FROM webhook_deliveries WHERE id = ?1",
                params![delivery_id],
                parse_delivery_row,
            ))
        })
    }

    /// Deliveries for a webhook, oldest first.
    pub fn list_deliveries(&self, webhook_id: i64) -> Result<Vec<WebhookDelivery>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM webhook_deliveries WHERE webhook_id = ?1 ORDER BY id",
            )?;
            let deliveries = stmt
                .query_map(params![webhook_id], parse_delivery_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(deliveries)
        })
    }
}
