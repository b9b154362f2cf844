//! Scheduler configuration.
//!
//! Consolidates configuration from tiers with field-by-field YAML merging:
//! 1. **Defaults** - embedded
//! 2. **User** - `~/.task-graph-scheduler/config.yaml`
//! 3. **Project** - `$CWD/scheduler/config.yaml`, or the file given by `--config`
//! 4. **Environment** - variables below
//!
//! ## Environment Variables
//! - `TGS_CONFIG_PATH` - Explicit config file (replaces the project tier)
//! - `TGS_DB_PATH` - Database path
//! - `TGS_MAX_CONCURRENT` - Global cap on simultaneous executions
//! - `TGS_STALE_TIMEOUT` - Heartbeat staleness timeout in seconds
//! - `TGS_USER_DIR` - User config dir (default: `~/.task-graph-scheduler`)
//! - `TGS_PROJECT_DIR` - Project config dir (default: `./scheduler`)

mod loader;
mod merge;
mod types;

pub use loader::{ConfigLoader, ConfigPaths, ConfigTier};
pub use merge::{deep_merge, deep_merge_all};
pub use types::*;
