//! Escalation monitor.
//!
//! Periodically sweeps the registry and task graph for stuck work:
//! - working instances that stopped heartbeating while holding a task
//! - in-progress tasks whose claiming instance is no longer registered
//! - in-progress tasks whose registered claimant is not working on them
//!
//! and applies the budget renewal policy. A failing step is logged and the
//! sweep moves on; the loop itself only stops on cancellation.

use crate::config::{EscalationConfig, RenewalPolicy};
use crate::db::Database;
use crate::db::escalations::NewEscalation;
use crate::types::{Severity, Task, TaskStatus};
use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Agent name recorded on escalations the monitor raises.
pub const MONITOR_AGENT: &str = "escalation-monitor";

/// What one sweep did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// Tasks escalated because their instance went stale.
    pub stale: Vec<String>,
    /// Tasks escalated because their claimant is gone.
    pub orphaned: Vec<String>,
    /// Tasks escalated because their claimant moved on without them.
    pub abandoned: Vec<String>,
    /// Expired budgets handled by the renewal policy.
    pub expired_budgets: Vec<i64>,
    /// Steps that failed.
    pub errors: usize,
}

impl SweepReport {
    /// Escalations raised by the sweep.
    pub fn raised(&self) -> usize {
        self.stale.len() + self.orphaned.len() + self.abandoned.len()
    }
}

pub struct EscalationMonitor {
    db: Database,
    config: EscalationConfig,
    renewal: RenewalPolicy,
    shutdown: CancellationToken,
}

impl EscalationMonitor {
    pub fn new(db: Database, config: EscalationConfig, renewal: RenewalPolicy) -> Self {
        Self {
            db,
            config,
            renewal,
            shutdown: CancellationToken::new(),
        }
    }

    /// Use an externally owned shutdown token.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(&self) {
        let period = Duration::from_secs(self.config.sweep_interval_seconds.max(1));
        info!(
            interval_seconds = period.as_secs(),
            stale_timeout_seconds = self.config.stale_timeout_seconds,
            "Starting escalation monitor"
        );

        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let report = self.sweep();
                    if report.raised() > 0 {
                        info!(
                            stale = report.stale.len(),
                            orphaned = report.orphaned.len(),
                            abandoned = report.abandoned.len(),
                            "Escalation sweep raised escalations"
                        );
                    } else {
                        debug!(errors = report.errors, "Escalation sweep finished");
                    }
                }
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping escalation monitor");
                    break;
                }
            }
        }
    }

    /// Run every sweep step once.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        match self.escalate_stale() {
            Ok(tasks) => report.stale = tasks,
            Err(e) => {
                report.errors += 1;
                warn!(error = %e, "Stale instance sweep failed");
            }
        }

        match self.escalate_orphans() {
            Ok(tasks) => report.orphaned = tasks,
            Err(e) => {
                report.errors += 1;
                warn!(error = %e, "Orphaned claim sweep failed");
            }
        }

        match self.escalate_abandoned() {
            Ok(tasks) => report.abandoned = tasks,
            Err(e) => {
                report.errors += 1;
                warn!(error = %e, "Abandoned claim sweep failed");
            }
        }

        match self.db.renew_budgets(self.renewal) {
            Ok(ids) => report.expired_budgets = ids,
            Err(e) => {
                report.errors += 1;
                warn!(error = %e, "Budget renewal failed");
            }
        }

        report
    }

    fn escalate_stale(&self) -> Result<Vec<String>> {
        let stale = self.db.get_stale(self.config.stale_timeout_seconds)?;
        let mut escalated = Vec::new();

        for instance in stale {
            let mut held: BTreeSet<String> = self
                .db
                .tasks_claimed_by(&instance.instance_id)?
                .into_iter()
                .map(|t| t.id)
                .collect();
            // A current task that already finished is not stuck.
            if let Some(current) = &instance.current_task {
                let in_progress = self
                    .db
                    .get_task(current)?
                    .is_some_and(|t| t.status == TaskStatus::InProgress);
                if in_progress {
                    held.insert(current.clone());
                }
            }

            if held.is_empty() {
                debug!(instance_id = %instance.instance_id, "Stale instance holds no task");
                continue;
            }

            for task_id in held {
                // One bad task must not hide the rest.
                match self.raise_once(
                    &task_id,
                    &instance.instance_id,
                    Severity::High,
                    format!(
                        "Instance {} ({}) sent no heartbeat for over {}s while working on {}",
                        instance.instance_id,
                        instance.role,
                        self.config.stale_timeout_seconds,
                        task_id
                    ),
                ) {
                    Ok(true) => escalated.push(task_id),
                    Ok(false) => {}
                    Err(e) => warn!(task_id, error = %e, "Failed to escalate stale task"),
                }
            }
        }
        Ok(escalated)
    }

    fn escalate_orphans(&self) -> Result<Vec<String>> {
        let mut escalated = Vec::new();
        for task in self.db.orphaned_claims()? {
            let Task { id, claimed_by, .. } = task;
            let claimant = claimed_by.unwrap_or_default();
            match self.raise_once(
                &id,
                &claimant,
                Severity::Medium,
                format!(
                    "Task {} is claimed by {}, which is no longer registered",
                    id, claimant
                ),
            ) {
                Ok(true) => escalated.push(id),
                Ok(false) => {}
                Err(e) => warn!(task_id = %id, error = %e, "Failed to escalate orphaned claim"),
            }
        }
        Ok(escalated)
    }

    fn escalate_abandoned(&self) -> Result<Vec<String>> {
        let mut escalated = Vec::new();
        for task in self.db.abandoned_claims(self.config.stale_timeout_seconds)? {
            let Task { id, claimed_by, .. } = task;
            let claimant = claimed_by.unwrap_or_default();
            match self.raise_once(
                &id,
                &claimant,
                Severity::Medium,
                format!(
                    "Task {} is claimed by {}, which is registered but not working on it",
                    id, claimant
                ),
            ) {
                Ok(true) => escalated.push(id),
                Ok(false) => {}
                Err(e) => warn!(task_id = %id, error = %e, "Failed to escalate abandoned claim"),
            }
        }
        Ok(escalated)
    }

    /// Raise an escalation for `task_id` unless one is already open.
    fn raise_once(
        &self,
        task_id: &str,
        instance_id: &str,
        severity: Severity,
        reason: String,
    ) -> Result<bool> {
        if self.db.has_open_escalation(task_id)? {
            debug!(task_id, instance_id, "Escalation already open");
            return Ok(false);
        }
        self.db.create_escalation(NewEscalation {
            task_id: Some(task_id.to_string()),
            from_agent: MONITOR_AGENT.to_string(),
            to_agent: self.config.escalate_to.clone(),
            reason,
            severity,
        })?;
        Ok(true)
    }
}
