//! Cost gate: hierarchical spend budgets and threshold notifications.
//!
//! A budget is active while `reset_at` is unset or still in the future.
//! Admission checks walk global, then role, then group budgets and stop at
//! the first one that is exhausted. Spend is charged to every matching scope
//! at once.

use super::notifications::{NewNotification, insert_notification_internal};
use super::{Database, optional};
use crate::config::RenewalPolicy;
use crate::error::SchedulerError;
use crate::events::{EventKind, SchedulerEvent};
use crate::types::{
    BudgetCheck, BudgetPeriod, BudgetScope, CostBudget, Notification, NotificationSeverity,
};
use anyhow::Result;
use chrono::{DateTime, Datelike, Days, Months, NaiveDate, Utc};
use rusqlite::{Connection, Row, params};
use tracing::{debug, info, warn};

/// Utilization at which a warning notification is raised.
pub const WARNING_THRESHOLD: f64 = 0.8;

/// Unix-ms timestamp of the first period boundary strictly after `now_ms`.
///
/// Daily budgets roll over at the next UTC midnight, weekly budgets at the
/// next ISO week start (Monday), monthly budgets on the first of next month.
pub fn next_period_boundary(period: BudgetPeriod, now_ms: i64) -> i64 {
    let today = DateTime::<Utc>::from_timestamp_millis(now_ms)
        .unwrap_or_default()
        .date_naive();

    let next: Option<NaiveDate> = match period {
        BudgetPeriod::Daily => today.checked_add_days(Days::new(1)),
        BudgetPeriod::Weekly => {
            let days_left = 7 - u64::from(today.weekday().num_days_from_monday());
            today.checked_add_days(Days::new(days_left))
        }
        BudgetPeriod::Monthly => today
            .with_day(1)
            .and_then(|first| first.checked_add_months(Months::new(1))),
    };

    next.and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or(i64::MAX)
}

/// Notification `ref_id` for a budget.
pub fn budget_ref(budget_id: i64) -> String {
    format!("budget:{}", budget_id)
}

fn parse_budget_row(row: &Row) -> rusqlite::Result<CostBudget> {
    Ok(CostBudget {
        id: row.get("id")?,
        scope: row.get("scope")?,
        scope_id: row.get("scope_id")?,
        budget_usd: row.get("budget_usd")?,
        spent_usd: row.get("spent_usd")?,
        period: row.get("period")?,
        reset_at: row.get("reset_at")?,
        created_at: row.get("created_at")?,
    })
}

fn get_budget_internal(conn: &Connection, id: i64) -> Result<Option<CostBudget>> {
    optional(conn.query_row(
        "SELECT * FROM cost_budgets WHERE id = ?1",
        params![id],
        parse_budget_row,
    ))
}

/// Active budgets for one scope. `scope_id` is ignored for the global scope.
fn active_for_scope(
    conn: &Connection,
    scope: BudgetScope,
    scope_id: Option<&str>,
    now: i64,
) -> Result<Vec<CostBudget>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM cost_budgets
         WHERE scope = ?1
           AND (?1 = 'global' OR scope_id = ?2)
           AND (reset_at IS NULL OR reset_at > ?3)
         ORDER BY id",
    )?;
    let budgets = stmt
        .query_map(params![scope, scope_id, now], parse_budget_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(budgets)
}

fn has_unread_for(conn: &Connection, ref_id: &str) -> Result<bool> {
    let unread: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM notifications WHERE ref_id = ?1 AND is_read = 0)",
        params![ref_id],
        |row| row.get(0),
    )?;
    Ok(unread)
}

fn validate_scope(scope: BudgetScope, scope_id: Option<&str>) -> Result<()> {
    match (scope, scope_id) {
        (BudgetScope::Global, Some(_)) => Err(SchedulerError::invalid_value(
            "scope_id",
            "Global budgets cannot have a scope id",
        )
        .into()),
        (BudgetScope::Role | BudgetScope::Group, None) => Err(SchedulerError::invalid_value(
            "scope_id",
            "Role and group budgets need a scope id",
        )
        .into()),
        _ => Ok(()),
    }
}

impl Database {
    /// Create a budget whose period ends at the next calendar boundary.
    pub fn create_budget(
        &self,
        scope: BudgetScope,
        budget_usd: f64,
        scope_id: Option<&str>,
        period: BudgetPeriod,
    ) -> Result<CostBudget> {
        validate_scope(scope, scope_id)?;
        if !budget_usd.is_finite() || budget_usd <= 0.0 {
            return Err(
                SchedulerError::invalid_value("budget_usd", "Budget must be a positive amount")
                    .into(),
            );
        }
        let now = self.now_ms();
        let reset_at = next_period_boundary(period, now);
        let scope_id = match scope {
            BudgetScope::Global => None,
            _ => scope_id,
        };

        let budget = self.with_conn(|conn| {
            let id = conn.query_row(
                "INSERT INTO cost_budgets (scope, scope_id, budget_usd, spent_usd, period, reset_at, created_at)
                 VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6)
                 RETURNING id",
                params![scope, scope_id, budget_usd, period, reset_at, now],
                |row| row.get(0),
            )?;
            Ok(CostBudget {
                id,
                scope,
                scope_id: scope_id.map(str::to_string),
                budget_usd,
                spent_usd: 0.0,
                period,
                reset_at: Some(reset_at),
                created_at: now,
            })
        })?;

        info!(
            budget_id = budget.id,
            scope = %scope,
            scope_id = scope_id.unwrap_or_default(),
            budget_usd,
            period = %period,
            "Budget created"
        );
        Ok(budget)
    }

    /// Create a budget unless an active one already covers the scope.
    /// Returns `None` when one existed.
    pub fn ensure_budget(
        &self,
        scope: BudgetScope,
        budget_usd: f64,
        scope_id: Option<&str>,
        period: BudgetPeriod,
    ) -> Result<Option<CostBudget>> {
        validate_scope(scope, scope_id)?;
        let now = self.now_ms();
        let existing =
            self.with_conn(|conn| active_for_scope(conn, scope, scope_id, now))?;
        if !existing.is_empty() {
            return Ok(None);
        }
        self.create_budget(scope, budget_usd, scope_id, period).map(Some)
    }

    /// Admission check, global first, then role, then group.
    ///
    /// The first exhausted budget wins and is reported. When nothing is
    /// exhausted the matching budget with the least headroom is reported;
    /// with no matching budget at all the check is unrestricted.
    pub fn check_budget(&self, role: Option<&str>, group_id: Option<&str>) -> Result<BudgetCheck> {
        let now = self.now_ms();
        let scopes = [
            (BudgetScope::Global, None),
            (BudgetScope::Role, role),
            (BudgetScope::Group, group_id),
        ];

        self.with_conn(|conn| {
            let mut tightest: Option<CostBudget> = None;
            for (scope, scope_id) in scopes {
                if scope != BudgetScope::Global && scope_id.is_none() {
                    continue;
                }
                for budget in active_for_scope(conn, scope, scope_id, now)? {
                    if budget.is_over() {
                        debug!(
                            budget_id = budget.id,
                            scope = %budget.scope,
                            spent = budget.spent_usd,
                            budget = budget.budget_usd,
                            "Budget exhausted"
                        );
                        return Ok(BudgetCheck::from_budget(&budget));
                    }
                    if tightest
                        .as_ref()
                        .is_none_or(|t| budget.remaining() < t.remaining())
                    {
                        tightest = Some(budget);
                    }
                }
            }
            Ok(tightest
                .as_ref()
                .map(BudgetCheck::from_budget)
                .unwrap_or_else(BudgetCheck::unrestricted))
        })
    }

    /// Charge `cost_usd` to the global budget and to the role and group
    /// budgets when given, then raise threshold notifications.
    ///
    /// A budget at or above 80% utilization gets a notification (`critical`
    /// at 100%, otherwise `warning`) unless an unread one already references
    /// it. Returns the notifications created by this call.
    pub fn record_spend(
        &self,
        cost_usd: f64,
        role: Option<&str>,
        group_id: Option<&str>,
    ) -> Result<Vec<Notification>> {
        if !cost_usd.is_finite() || cost_usd < 0.0 {
            return Err(
                SchedulerError::invalid_value("cost_usd", "Spend must be a non-negative amount")
                    .into(),
            );
        }
        let now = self.now_ms();

        let created = self.transaction(|tx| {
            let charged = tx.execute(
                "UPDATE cost_budgets SET spent_usd = spent_usd + ?1
                 WHERE (reset_at IS NULL OR reset_at > ?2)
                   AND (scope = 'global'
                        OR (scope = 'role' AND scope_id = ?3)
                        OR (scope = 'group' AND scope_id = ?4))",
                params![cost_usd, now, role, group_id],
            )?;
            debug!(cost_usd, charged, "Spend recorded");

            let mut stmt = tx.prepare(
                "SELECT * FROM cost_budgets
                 WHERE (reset_at IS NULL OR reset_at > ?1)
                   AND spent_usd >= budget_usd * ?2
                 ORDER BY id",
            )?;
            let hot = stmt
                .query_map(params![now, WARNING_THRESHOLD], parse_budget_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            drop(stmt);

            let mut created = Vec::new();
            for budget in hot {
                let ref_id = budget_ref(budget.id);
                if has_unread_for(tx, &ref_id)? {
                    continue;
                }
                let severity = if budget.is_over() {
                    NotificationSeverity::Critical
                } else {
                    NotificationSeverity::Warning
                };
                let label = match &budget.scope_id {
                    Some(id) => format!("{} budget '{}'", budget.scope, id),
                    None => format!("{} budget", budget.scope),
                };
                let notification = insert_notification_internal(
                    tx,
                    NewNotification {
                        kind: "budget_threshold".to_string(),
                        severity,
                        title: format!("{} at {:.0}%", label, budget.utilization() * 100.0),
                        body: format!(
                            "Spent ${:.2} of ${:.2} ({} period).",
                            budget.spent_usd, budget.budget_usd, budget.period
                        ),
                        ref_id: Some(ref_id),
                    },
                    now,
                )?;
                created.push((budget, notification));
            }
            Ok(created)
        })?;

        for (budget, notification) in &created {
            warn!(
                budget_id = budget.id,
                scope = %budget.scope,
                utilization = budget.utilization(),
                severity = %notification.severity,
                "Budget threshold crossed"
            );
            self.publish(
                SchedulerEvent::new(EventKind::BudgetThreshold, now)
                    .with("budget_id", budget.id)
                    .with("scope", budget.scope.as_str())
                    .with("scope_id", budget.scope_id.clone())
                    .with("spent_usd", budget.spent_usd)
                    .with("budget_usd", budget.budget_usd)
                    .with("severity", notification.severity.as_str()),
            );
        }
        Ok(created.into_iter().map(|(_, n)| n).collect())
    }

    /// Apply the renewal policy to budgets whose period has ended.
    ///
    /// `Deactivate` leaves them inactive and changes nothing. `Reset` zeroes
    /// their spend and moves `reset_at` to the next boundary after now.
    /// Returns the ids of the expired budgets that were considered.
    pub fn renew_budgets(&self, policy: RenewalPolicy) -> Result<Vec<i64>> {
        let now = self.now_ms();
        self.transaction(|tx| {
            let mut stmt = tx.prepare(
                "SELECT * FROM cost_budgets WHERE reset_at IS NOT NULL AND reset_at <= ?1 ORDER BY id",
            )?;
            let expired = stmt
                .query_map(params![now], parse_budget_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            drop(stmt);

            if policy == RenewalPolicy::Reset {
                for budget in &expired {
                    let reset_at = next_period_boundary(budget.period, now);
                    tx.execute(
                        "UPDATE cost_budgets SET spent_usd = 0, reset_at = ?2 WHERE id = ?1",
                        params![budget.id, reset_at],
                    )?;
                    info!(budget_id = budget.id, reset_at, "Budget renewed");
                }
            } else if !expired.is_empty() {
                debug!(expired = expired.len(), "Expired budgets left inactive");
            }
            Ok(expired.into_iter().map(|b| b.id).collect())
        })
    }

    pub fn get_budget(&self, id: i64) -> Result<Option<CostBudget>> {
        self.with_conn(|conn| get_budget_internal(conn, id))
    }

    /// Every budget, active or not.
    pub fn list_budgets(&self) -> Result<Vec<CostBudget>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM cost_budgets ORDER BY id")?;
            let budgets = stmt
                .query_map([], parse_budget_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(budgets)
        })
    }

    pub fn delete_budget(&self, id: i64) -> Result<()> {
        self.with_conn(|conn| {
            let removed = conn.execute("DELETE FROM cost_budgets WHERE id = ?1", params![id])?;
            if removed == 0 {
                return Err(SchedulerError::budget_not_found(id).into());
            }
            Ok(())
        })
    }
}
