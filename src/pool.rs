//! Worker pool runtime.
//!
//! One [`WorkerLoop`] runs per instance. Each loop polls its role's queue,
//! gates every claim on pause state, cost budgets and a free execution slot,
//! runs the claimed task through the [`Executor`] inside the instance's
//! workspace, and records the outcome. The [`WorkerPool`] owns the loops plus
//! the escalation monitor and webhook dispatcher, scales roles up under load,
//! and shuts everything down with a bounded grace period.

use crate::config::{Config, RoleConfig, ServerConfig};
use crate::db::Database;
use crate::executor::{ExecutionError, ExecutionOptions, Executor, build_prompt, collect};
use crate::monitor::EscalationMonitor;
use crate::pause::RolePauses;
use crate::types::{InstanceStatus, Task};
use crate::webhooks::WebhookDispatcher;
use crate::workspace::WorkspaceManager;
use anyhow::{Result, anyhow};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, TryAcquireError};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{MissedTickBehavior, interval, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Timing knobs for worker loops and the pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub shutdown_grace: Duration,
    /// How often the pool reaps finished loops and re-evaluates scaling.
    pub scale_interval: Duration,
}

impl PoolSettings {
    pub fn from_config(server: &ServerConfig) -> Self {
        let floor = Duration::from_millis(1);
        Self {
            poll_interval: Duration::from_millis(server.poll_interval_ms).max(floor),
            heartbeat_interval: Duration::from_millis(server.heartbeat_interval_ms).max(floor),
            shutdown_grace: Duration::from_millis(server.shutdown_grace_ms),
            scale_interval: Duration::from_millis(server.poll_interval_ms).max(floor),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

/// Shared context handed to every worker loop.
pub struct WorkerContext {
    pub db: Database,
    pub executor: Arc<dyn Executor>,
    pub pauses: Arc<RolePauses>,
    /// Present when worktree isolation is configured.
    pub workspaces: Option<Arc<WorkspaceManager>>,
    /// Global cap on simultaneous executions.
    pub permits: Arc<Semaphore>,
    pub settings: PoolSettings,
}

impl WorkerContext {
    pub fn new(db: Database, executor: Arc<dyn Executor>, max_concurrent: usize) -> Self {
        Self {
            db,
            executor,
            pauses: Arc::new(RolePauses::new()),
            workspaces: None,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            settings: PoolSettings::default(),
        }
    }

    pub fn from_config(db: Database, executor: Arc<dyn Executor>, config: &Config) -> Result<Self> {
        let workspaces = WorkspaceManager::from_config(&config.workspace)?.map(Arc::new);
        Ok(Self {
            workspaces,
            settings: PoolSettings::from_config(&config.server),
            ..Self::new(db, executor, config.server.max_concurrent_executions)
        })
    }

    pub fn with_settings(mut self, settings: PoolSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_workspaces(mut self, workspaces: Arc<WorkspaceManager>) -> Self {
        self.workspaces = Some(workspaces);
        self
    }
}

/// What one pass of a worker loop did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Paused,
    OverBudget,
    /// Every execution slot is taken.
    Saturated,
    /// Nothing claimable for the role.
    Idle,
    Completed(String),
    Failed(String),
}

impl StepOutcome {
    fn did_work(&self) -> bool {
        matches!(self, StepOutcome::Completed(_) | StepOutcome::Failed(_))
    }
}

/// Branch a task's checkout lives on.
pub fn task_branch(task_id: &str) -> String {
    format!("task/{}", task_id)
}

/// Poll-claim-execute loop for one instance.
pub struct WorkerLoop {
    ctx: Arc<WorkerContext>,
    instance_id: String,
    role: String,
    instructions: Option<String>,
    shutdown: CancellationToken,
    paused: bool,
}

impl WorkerLoop {
    pub fn new(
        ctx: Arc<WorkerContext>,
        instance_id: impl Into<String>,
        role: impl Into<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            instance_id: instance_id.into(),
            role: role.into(),
            instructions: None,
            shutdown,
            paused: false,
        }
    }

    /// Text prepended to every prompt this loop builds.
    pub fn with_instructions(mut self, instructions: Option<String>) -> Self {
        self.instructions = instructions;
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Register, then poll until shutdown. Tasks already claimed run to
    /// completion; shutdown is only observed between steps.
    pub async fn run(mut self) -> Result<()> {
        self.ctx.db.register_instance(&self.instance_id, &self.role)?;
        info!(instance_id = %self.instance_id, role = %self.role, "Worker started");

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let worked = match self.step().await {
                Ok(outcome) => outcome.did_work(),
                Err(e) => {
                    error!(instance_id = %self.instance_id, error = %e, "Worker step failed");
                    false
                }
            };

            if !worked {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = sleep(self.ctx.settings.poll_interval) => {}
                }
            }
        }

        info!(instance_id = %self.instance_id, "Worker stopped");
        Ok(())
    }

    /// One pass: gate, claim, execute, record.
    pub async fn step(&mut self) -> Result<StepOutcome> {
        let db = &self.ctx.db;

        if self.ctx.pauses.is_paused(&self.role) {
            if !self.paused {
                db.set_instance_status(&self.instance_id, InstanceStatus::Paused, None)?;
                self.paused = true;
            }
            return Ok(StepOutcome::Paused);
        }
        if self.paused {
            db.set_instance_status(&self.instance_id, InstanceStatus::Idle, None)?;
            self.paused = false;
        }

        let check = db.check_budget(Some(&self.role), None)?;
        if !check.allowed {
            debug!(
                instance_id = %self.instance_id,
                scope = ?check.scope,
                "Budget exhausted, not claiming"
            );
            return Ok(StepOutcome::OverBudget);
        }

        // A claimed task never waits for an execution slot.
        let permit = match Arc::clone(&self.ctx.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => return Ok(StepOutcome::Saturated),
            Err(TryAcquireError::Closed) => return Err(anyhow!("execution semaphore closed")),
        };

        let Some(task) = db.claim_task(&self.role, &self.instance_id)? else {
            return Ok(StepOutcome::Idle);
        };
        info!(instance_id = %self.instance_id, task_id = %task.id, "Claimed task");

        // The group is only known after the claim.
        let check = db.check_budget(Some(&self.role), Some(&task.group_id))?;
        if !check.allowed {
            let scope = check.scope.map(|s| s.to_string()).unwrap_or_default();
            warn!(task_id = %task.id, scope = %scope, "Budget exhausted after claim, failing task");
            return Ok(self.abandon(&task, &format!("Cost budget exhausted ({} scope)", scope)));
        }

        db.set_instance_status(&self.instance_id, InstanceStatus::Working, Some(&task.id))?;

        // The first tick fires at once, so the claim is covered from here on.
        let heartbeat = CancellationToken::new();
        let ticker = self.spawn_heartbeat(heartbeat.clone());
        let outcome = {
            // Cancels the ticker even if this future is dropped mid-run.
            let _guard = heartbeat.drop_guard();
            self.execute(&task).await
        };
        let _ = ticker.await;
        drop(permit);

        db.set_instance_status(&self.instance_id, InstanceStatus::Idle, None)?;
        Ok(outcome)
    }

    /// Run a claimed task and record how it ended. Never leaves the task
    /// claimed or the workspace held.
    async fn execute(&self, task: &Task) -> StepOutcome {
        let branch = task_branch(&task.id);
        let workdir = match self.acquire_workspace(&branch).await {
            Ok(dir) => dir,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Workspace unavailable, failing task");
                return self.abandon(task, &format!("Workspace unavailable: {}", e));
            }
        };

        let outcome = match self.run_in(task, &branch, workdir).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Failed to record task outcome");
                self.abandon(task, &format!("Scheduler error: {}", e))
            }
        };

        if let Some(workspaces) = &self.ctx.workspaces {
            if let Err(e) = workspaces.release(&self.instance_id).await {
                warn!(instance_id = %self.instance_id, error = %e, "Failed to release workspace");
            }
        }
        outcome
    }

    async fn run_in(
        &self,
        task: &Task,
        branch: &str,
        workdir: Option<PathBuf>,
    ) -> Result<StepOutcome> {
        let db = &self.ctx.db;
        let blockers = db.get_blockers(&task.id)?;
        let prompt = build_prompt(task, self.instructions.as_deref(), &blockers);
        let output_ref = workdir.as_ref().map(|_| format!("branch:{}", branch));
        let options = ExecutionOptions {
            role: self.role.clone(),
            task_id: task.id.clone(),
            instance_id: self.instance_id.clone(),
            workdir,
        };

        let result = match self.ctx.executor.start(prompt, options).await {
            Ok(stream) => collect(stream).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(result) => {
                if result.usage.cost_usd > 0.0 {
                    if let Err(e) = db.record_spend(
                        result.usage.cost_usd,
                        Some(&self.role),
                        Some(&task.group_id),
                    ) {
                        warn!(task_id = %task.id, error = %e, "Failed to record spend");
                    }
                }
                let completion = db.complete_task(&task.id, output_ref.as_deref())?;
                info!(
                    task_id = %task.id,
                    cost_usd = result.usage.cost_usd,
                    duration_ms = result.usage.duration_ms,
                    unblocked = completion.unblocked.len(),
                    "Task completed"
                );
                Ok(StepOutcome::Completed(task.id.clone()))
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Execution failed");
                db.fail_task(&task.id, &failure_reason(&e))?;
                Ok(StepOutcome::Failed(task.id.clone()))
            }
        }
    }

    /// Fail a claimed task, logging instead of propagating if the database
    /// refuses (for example because someone else already finished it).
    fn abandon(&self, task: &Task, reason: &str) -> StepOutcome {
        if let Err(e) = self.ctx.db.fail_task(&task.id, reason) {
            warn!(task_id = %task.id, error = %e, "Failed to fail task");
        }
        StepOutcome::Failed(task.id.clone())
    }

    async fn acquire_workspace(&self, branch: &str) -> Result<Option<PathBuf>> {
        match &self.ctx.workspaces {
            Some(workspaces) => Ok(Some(workspaces.acquire(&self.instance_id, branch).await?)),
            None => Ok(None),
        }
    }

    fn spawn_heartbeat(&self, stop: CancellationToken) -> JoinHandle<()> {
        let db = self.ctx.db.clone();
        let instance_id = self.instance_id.clone();
        let period = self.ctx.settings.heartbeat_interval;
        tokio::spawn(async move {
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tick.tick() => {
                        if let Err(e) = db.heartbeat(&instance_id) {
                            warn!(instance_id = %instance_id, error = %e, "Heartbeat failed");
                        }
                    }
                }
            }
        })
    }
}

fn failure_reason(err: &ExecutionError) -> String {
    match err {
        ExecutionError::Failed(message) => message.clone(),
        other => other.to_string(),
    }
}

/// What shutdown did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    /// Instances marked stopped.
    pub stopped: Vec<String>,
    /// Instances whose loops outlived the grace period.
    pub aborted: Vec<String>,
    /// Tasks failed because their worker was aborted.
    pub failed_tasks: Vec<String>,
    pub released_workspaces: usize,
}

/// Owns every worker loop plus the background services.
pub struct WorkerPool {
    ctx: Arc<WorkerContext>,
    roles: BTreeMap<String, RoleConfig>,
    shutdown: CancellationToken,
    workers: JoinSet<String>,
    /// Live instance id -> role.
    running: HashMap<String, String>,
    /// Every instance this pool started.
    started: Vec<String>,
    next_index: HashMap<String, u32>,
    monitor: Option<EscalationMonitor>,
    dispatcher: Option<WebhookDispatcher>,
    services: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(ctx: Arc<WorkerContext>, roles: BTreeMap<String, RoleConfig>) -> Self {
        Self {
            ctx,
            roles,
            shutdown: CancellationToken::new(),
            workers: JoinSet::new(),
            running: HashMap::new(),
            started: Vec::new(),
            next_index: HashMap::new(),
            monitor: None,
            dispatcher: None,
            services: Vec::new(),
        }
    }

    pub fn with_monitor(mut self, monitor: EscalationMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: WebhookDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn pauses(&self) -> Arc<RolePauses> {
        Arc::clone(&self.ctx.pauses)
    }

    /// Live instances per role.
    pub fn running(&self, role: &str) -> usize {
        self.running.values().filter(|r| r.as_str() == role).count()
    }

    /// Start background services and the configured instances of every role.
    pub fn start(&mut self) -> Result<()> {
        if let Some(monitor) = self.monitor.take() {
            let monitor = monitor.with_shutdown(self.shutdown.child_token());
            self.services.push(monitor.start());
        }
        if let Some(dispatcher) = self.dispatcher.take() {
            let events = self.ctx.db.events().subscribe();
            let dispatcher = Arc::new(dispatcher.with_shutdown(self.shutdown.child_token()));
            self.services.push(dispatcher.start(events));
        }

        let initial: Vec<(String, u32)> = self
            .roles
            .iter()
            .map(|(role, cfg)| (role.clone(), cfg.instances))
            .collect();
        for (role, count) in initial {
            for _ in 0..count {
                self.spawn_worker(&role)?;
            }
        }
        info!(
            roles = self.roles.len(),
            instances = self.running.len(),
            "Worker pool started"
        );
        Ok(())
    }

    /// Start one more instance of `role`. Returns its id.
    pub fn spawn_worker(&mut self, role: &str) -> Result<String> {
        let cfg = self
            .roles
            .get(role)
            .ok_or_else(|| anyhow!("Unknown role '{}'", role))?;
        let instructions = cfg.instructions.clone();

        let index = self.next_index.entry(role.to_string()).or_insert(0);
        *index += 1;
        let instance_id = format!("{}-{}", role, index);

        let worker = WorkerLoop::new(
            Arc::clone(&self.ctx),
            instance_id.clone(),
            role,
            self.shutdown.child_token(),
        )
        .with_instructions(instructions);

        let id = instance_id.clone();
        self.workers.spawn(async move {
            if let Err(e) = worker.run().await {
                error!(instance_id = %id, error = %e, "Worker exited with error");
            }
            id
        });
        self.running.insert(instance_id.clone(), role.to_string());
        self.started.push(instance_id.clone());
        Ok(instance_id)
    }

    /// Forget loops that have exited.
    fn reap(&mut self) {
        while let Some(joined) = self.workers.try_join_next() {
            match joined {
                Ok(instance_id) => {
                    self.running.remove(&instance_id);
                }
                Err(e) => error!(error = %e, "Worker task panicked"),
            }
        }
    }

    /// Add one instance to every role whose backlog exceeds
    /// `scale_up_pending` per running instance, up to `max_instances`.
    pub fn autoscale(&mut self) -> Result<Vec<String>> {
        self.reap();

        let mut wanted = Vec::new();
        for (role, cfg) in &self.roles {
            if cfg.scale_up_pending == 0 {
                continue;
            }
            let running = self.running(role);
            if running >= cfg.max_instances as usize {
                continue;
            }
            let pending = self.ctx.db.count_pending(role)?;
            if pending > cfg.scale_up_pending as usize * running {
                debug!(role = %role, pending, running, "Scaling up");
                wanted.push(role.clone());
            }
        }

        let mut spawned = Vec::new();
        for role in wanted {
            let instance_id = self.spawn_worker(&role)?;
            info!(role = %role, instance_id = %instance_id, "Scaled up role");
            spawned.push(instance_id);
        }
        Ok(spawned)
    }

    /// Start, scale until `signal` resolves, then shut down.
    pub async fn run_until<F>(mut self, signal: F) -> Result<ShutdownReport>
    where
        F: Future<Output = ()>,
    {
        self.start()?;

        let stop = self.shutdown.clone();
        let mut tick = interval(self.ctx.settings.scale_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(signal);

        loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("Stop requested");
                    break;
                }
                _ = stop.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(e) = self.autoscale() {
                        warn!(error = %e, "Auto-scale pass failed");
                    }
                }
            }
        }

        let grace = self.ctx.settings.shutdown_grace;
        Ok(self.shutdown(grace).await)
    }

    /// Stop every loop, waiting up to `grace` before aborting stragglers.
    ///
    /// Aborted loops may leave a task mid-execution; those tasks are failed
    /// so they do not stay claimed by a stopped instance.
    pub async fn shutdown(mut self, grace: Duration) -> ShutdownReport {
        info!(
            workers = self.workers.len(),
            grace_ms = grace.as_millis() as u64,
            "Shutting down worker pool"
        );
        self.shutdown.cancel();

        let mut report = ShutdownReport::default();
        let drained = timeout(grace, async {
            while let Some(joined) = self.workers.join_next().await {
                if let Ok(instance_id) = joined {
                    self.running.remove(&instance_id);
                }
            }
        })
        .await;

        if drained.is_err() {
            report.aborted = self.running.keys().cloned().collect();
            report.aborted.sort();
            warn!(count = report.aborted.len(), "Grace period elapsed, aborting workers");
            self.workers.abort_all();
            while self.workers.join_next().await.is_some() {}
        }

        for instance_id in &report.aborted {
            match self.ctx.db.tasks_claimed_by(instance_id) {
                Ok(tasks) => {
                    for task in tasks {
                        match self.ctx.db.fail_task(&task.id, "Worker aborted during shutdown") {
                            Ok(_) => report.failed_tasks.push(task.id),
                            Err(e) => warn!(task_id = %task.id, error = %e, "Failed to fail task"),
                        }
                    }
                }
                Err(e) => warn!(instance_id = %instance_id, error = %e, "Failed to list claims"),
            }
        }

        for instance_id in &self.started {
            match self
                .ctx
                .db
                .set_instance_status(instance_id, InstanceStatus::Stopped, None)
            {
                Ok(_) => report.stopped.push(instance_id.clone()),
                Err(e) => warn!(instance_id = %instance_id, error = %e, "Failed to mark stopped"),
            }
        }

        for handle in self.services.drain(..) {
            if timeout(grace, handle).await.is_err() {
                warn!("Background service did not stop within the grace period");
            }
        }

        if let Some(workspaces) = &self.ctx.workspaces {
            report.released_workspaces = workspaces.release_all().await;
        }

        info!(
            stopped = report.stopped.len(),
            aborted = report.aborted.len(),
            "Worker pool stopped"
        );
        report
    }
}
