//! CLI command definitions for task-graph-scheduler
//!
//! This module defines the CLI structure using clap's derive macros.
//! The main entry point is the `Cli` struct which contains subcommands.

use crate::format::OutputFormat;
use clap::{Args, Parser, Subcommand};

/// Task graph scheduler for pools of autonomous workers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Path to database file (overrides config)
    #[arg(short, long, global = true)]
    pub database: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Logging output: 0/off, 1/stdout, 2/stderr (default), or filename
    #[arg(short, long, default_value = "2", global = true)]
    pub log: String,

    /// Output format for queries (overrides config)
    #[arg(short, long, value_enum, global = true)]
    pub format: Option<OutputFormat>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the worker pool until Ctrl-C (default if no subcommand given)
    Serve,

    /// Show tasks partitioned by status
    Board(BoardArgs),

    /// List working instances that stopped sending heartbeats
    Stale(StaleArgs),

    /// Check whether work may be claimed under the cost budgets
    Budget(BudgetArgs),

    /// Remove worktree checkouts left behind by a previous run
    Reconcile,
}

#[derive(Args, Debug)]
pub struct BoardArgs {
    /// Only show tasks of this group
    #[arg(short, long)]
    pub group: Option<String>,
}

#[derive(Args, Debug)]
pub struct StaleArgs {
    /// Heartbeat age in seconds (default: escalation.stale_timeout_seconds)
    #[arg(short, long)]
    pub timeout: Option<u64>,
}

#[derive(Args, Debug)]
pub struct BudgetArgs {
    /// Role to check
    #[arg(short, long)]
    pub role: Option<String>,

    /// Group to check
    #[arg(short, long)]
    pub group: Option<String>,
}
