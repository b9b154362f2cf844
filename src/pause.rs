//! Role pause state consulted by worker loops before claiming.
//!
//! Pausing only stops new claims; work already claimed runs to completion.
//! The state lives in memory and starts empty on every process start.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::info;

#[derive(Debug, Default)]
pub struct RolePauses {
    roles: Mutex<BTreeSet<String>>,
    all: AtomicBool,
}

impl RolePauses {
    pub fn new() -> Self {
        Self::default()
    }

    fn roles(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.roles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pause one role. Returns `true` if it was not already paused.
    pub fn pause_role(&self, role: &str) -> bool {
        let added = self.roles().insert(role.to_string());
        if added {
            info!(role, "Role paused");
        }
        added
    }

    /// Resume one role. Returns `true` if it was paused.
    pub fn resume_role(&self, role: &str) -> bool {
        let removed = self.roles().remove(role);
        if removed {
            info!(role, "Role resumed");
        }
        removed
    }

    pub fn pause_all(&self) {
        self.all.store(true, Ordering::SeqCst);
        info!("All roles paused");
    }

    /// Lift the global pause and every per-role pause.
    pub fn resume_all(&self) {
        self.all.store(false, Ordering::SeqCst);
        self.roles().clear();
        info!("All roles resumed");
    }

    pub fn is_paused(&self, role: &str) -> bool {
        self.all.load(Ordering::SeqCst) || self.roles().contains(role)
    }

    /// Roles paused individually, sorted.
    pub fn paused_roles(&self) -> Vec<String> {
        self.roles().iter().cloned().collect()
    }
}
