//! Task Graph Scheduler
//!
//! Runs pools of role-specialized workers against a persistent task graph,
//! and answers board, liveness and budget queries from the same database.

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::sync::Arc;
use task_graph_scheduler::cli::{BoardArgs, BudgetArgs, Cli, Command, StaleArgs};
use task_graph_scheduler::config::{Config, ConfigLoader, ConfigPaths};
use task_graph_scheduler::db::Database;
use task_graph_scheduler::executor::ProcessExecutor;
use task_graph_scheduler::format::{
    OutputFormat, format_board_markdown, format_budget_markdown, format_instances_markdown, render,
};
use task_graph_scheduler::logging::{LogTarget, init_logging};
use task_graph_scheduler::monitor::EscalationMonitor;
use task_graph_scheduler::pool::{WorkerContext, WorkerPool};
use task_graph_scheduler::webhooks::WebhookDispatcher;
use task_graph_scheduler::workspace::WorkspaceManager;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&LogTarget::parse(&cli.log), cli.verbose)?;

    let mut paths = ConfigPaths::discover();
    if let Some(config_path) = &cli.config {
        paths = paths.with_explicit_file(config_path);
    }
    let mut loader = ConfigLoader::load_with_paths(paths)?;
    if let Some(path) = loader.config_path() {
        info!(path = %path.display(), "Loaded project config");
    }

    let config = loader.config_mut();
    if let Some(db_path) = &cli.database {
        config.server.db_path = db_path.into();
    }
    let format = cli.format.unwrap_or(config.server.default_format);
    let config = loader.into_config();

    match cli.command {
        Some(Command::Serve) | None => serve(config).await?,
        Some(Command::Board(args)) => board(&config, args, format)?,
        Some(Command::Stale(args)) => stale(&config, args, format)?,
        Some(Command::Budget(args)) => budget(&config, args, format)?,
        Some(Command::Reconcile) => reconcile(&config).await?,
    }

    Ok(())
}

/// Open the database and bring role prefixes and seeded budgets in line
/// with the config.
fn open_database(config: &Config) -> Result<Database> {
    config.ensure_db_dir()?;
    let db = Database::open(&config.server.db_path)
        .with_context(|| format!("Failed to open {}", config.server.db_path.display()))?;

    for (role, role_config) in &config.roles {
        db.register_role_prefix(role, &role_config.prefix)?;
    }
    for seed in &config.budgets.seed {
        if let Some(budget) =
            db.ensure_budget(seed.scope, seed.budget_usd, seed.scope_id.as_deref(), seed.period)?
        {
            info!(budget_id = budget.id, scope = %budget.scope, "Seeded budget");
        }
    }
    Ok(db)
}

async fn serve(config: Config) -> Result<()> {
    let Some(executor) = ProcessExecutor::from_command(&config.executor.command) else {
        bail!("No executor configured: set executor.command in the config file");
    };

    let db = open_database(&config)?;
    let ctx = WorkerContext::from_config(db.clone(), Arc::new(executor), &config)?;

    if let Some(workspaces) = &ctx.workspaces {
        let removed = workspaces.reconcile().await?;
        if !removed.is_empty() {
            warn!(count = removed.len(), "Removed leftover worktrees");
        }
    }

    let monitor = EscalationMonitor::new(
        db.clone(),
        config.escalation.clone(),
        config.budgets.renewal,
    );
    let dispatcher = WebhookDispatcher::new(db, &config.webhooks)?;

    let pool = WorkerPool::new(Arc::new(ctx), config.roles.clone())
        .with_monitor(monitor)
        .with_dispatcher(dispatcher);

    let report = pool
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!(
        stopped = report.stopped.len(),
        aborted = report.aborted.len(),
        failed_tasks = report.failed_tasks.len(),
        released_workspaces = report.released_workspaces,
        "Scheduler stopped"
    );
    Ok(())
}

fn board(config: &Config, args: BoardArgs, format: OutputFormat) -> Result<()> {
    let db = open_database(config)?;
    let board = db.get_board(args.group.as_deref())?;
    println!("{}", render(&board, format, format_board_markdown)?);
    Ok(())
}

fn stale(config: &Config, args: StaleArgs, format: OutputFormat) -> Result<()> {
    let db = open_database(config)?;
    let timeout = args
        .timeout
        .unwrap_or(config.escalation.stale_timeout_seconds);
    let instances = db.get_stale(timeout)?;
    println!(
        "{}",
        render(&instances, format, |i| format_instances_markdown(i))?
    );
    Ok(())
}

fn budget(config: &Config, args: BudgetArgs, format: OutputFormat) -> Result<()> {
    let db = open_database(config)?;
    let check = db.check_budget(args.role.as_deref(), args.group.as_deref())?;
    println!("{}", render(&check, format, format_budget_markdown)?);
    Ok(())
}

async fn reconcile(config: &Config) -> Result<()> {
    let Some(workspaces) = WorkspaceManager::from_config(&config.workspace)? else {
        bail!("No workspace repository configured: set workspace.repo in the config file");
    };
    let removed = workspaces.reconcile().await?;
    for path in &removed {
        println!("{}", path.display());
    }
    info!(count = removed.len(), "Reconciled worktrees");
    Ok(())
}
