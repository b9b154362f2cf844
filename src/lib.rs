//! Task Graph Scheduler Library
//!
//! Persistent task graph with atomic claiming and dependency cascades,
//! plus the runtime around it: instance liveness, escalations, cost budgets,
//! isolated worktrees, webhooks and the worker pool.

pub mod cli;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod executor;
pub mod format;
pub mod logging;
pub mod monitor;
pub mod pause;
pub mod pool;
pub mod types;
pub mod webhooks;
pub mod workspace;
