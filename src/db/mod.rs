//! Storage layer for the scheduler.
//!
//! All scheduler state lives in one SQLite database. Every mutation is either
//! a single conditional statement or runs inside [`Database::transaction`],
//! which takes SQLite's write lock up front (`BEGIN IMMEDIATE`). That is the
//! transactional boundary the claim and completion protocols rely on, whether
//! pollers share one `Database` handle or open their own connections to the
//! same file from other threads or processes.

pub mod budgets;
pub mod deps;
pub mod escalations;
pub mod groups;
pub mod instances;
pub mod notifications;
pub mod sequences;
pub mod tasks;
pub mod webhooks;

use crate::clock::{Clock, SystemClock};
use crate::events::{EventBus, SchedulerEvent};
use anyhow::{Result, anyhow};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

/// Limits enforced by `create_task`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Guardrails {
    /// Longest allowed `parent_id` chain, counting the new task.
    pub max_task_depth: u32,
    pub max_tasks_per_group: u32,
    /// Most revisions (`revision_of` hops) allowed back to the original task.
    pub max_rejection_cycles: u32,
}

impl Guardrails {
    /// No effective limits.
    pub fn unlimited() -> Self {
        Self {
            max_task_depth: u32::MAX,
            max_tasks_per_group: u32::MAX,
            max_rejection_cycles: u32::MAX,
        }
    }
}

impl Default for Guardrails {
    fn default() -> Self {
        Self {
            max_task_depth: 5,
            max_tasks_per_group: 200,
            max_rejection_cycles: 3,
        }
    }
}

/// Database handle wrapping a SQLite connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl Database {
    /// Open or create the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_clock(path, Arc::new(SystemClock))
    }

    /// Open or create the database with a custom time source.
    pub fn open_with_clock<P: AsRef<Path>>(path: P, clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = Connection::open(path)?;

        // WAL lets readers proceed while one writer holds the lock; the busy
        // timeout makes competing writers wait instead of failing.
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA foreign_keys=ON;
             PRAGMA busy_timeout=5000;",
        )?;

        Self::from_connection(conn, clock)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with_clock(Arc::new(SystemClock))
    }

    /// Open an in-memory database driven by the given clock.
    pub fn open_in_memory_with_clock(clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn, clock)
    }

    fn from_connection(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            clock,
            events: EventBus::default(),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Share an event bus with other components.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Run database migrations.
    fn run_migrations(&self) -> Result<()> {
        let mut conn = self.lock()?;
        embedded::migrations::runner().run(&mut *conn)?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection mutex poisoned"))
    }

    /// Execute a function with exclusive access to the connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Execute a function with mutable access to the connection.
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self.lock()?;
        f(&mut conn)
    }

    /// Run `f` inside an immediate write transaction.
    ///
    /// Commits when `f` returns `Ok`; any error rolls back every statement
    /// `f` executed.
    pub fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }

    /// Current time in Unix milliseconds, from the configured clock.
    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// The bus this store publishes transitions on.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn publish(&self, event: SchedulerEvent) {
        self.events.publish(event);
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

/// Map `QueryReturnedNoRows` to `None`.
pub(crate) fn optional<T>(result: rusqlite::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}
