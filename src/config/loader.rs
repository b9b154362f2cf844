//! Configuration loader with tier-based merging.
//!
//! Loads configuration from multiple tiers and merges them field-by-field.

use super::merge::deep_merge_all;
use super::types::Config;
use anyhow::{Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Configuration tier priority (lowest to highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigTier {
    /// Embedded defaults (lowest priority)
    Defaults = 0,
    /// User-level config (~/.task-graph-scheduler/)
    User = 1,
    /// Project-level config ($CWD/scheduler/) or an explicit file
    Project = 2,
    /// Environment variables (highest priority)
    Environment = 3,
}

impl std::fmt::Display for ConfigTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigTier::Defaults => write!(f, "defaults"),
            ConfigTier::User => write!(f, "user"),
            ConfigTier::Project => write!(f, "project"),
            ConfigTier::Environment => write!(f, "environment"),
        }
    }
}

/// Paths for each configuration tier.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    /// Project-level config directory
    pub project_dir: Option<PathBuf>,
    /// User-level config directory
    pub user_dir: Option<PathBuf>,
    /// Explicit config file; replaces the project tier when set
    pub explicit_file: Option<PathBuf>,
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self::discover()
    }
}

impl ConfigPaths {
    /// Discover configuration paths from environment and defaults.
    pub fn discover() -> Self {
        let user_dir = std::env::var("TGS_USER_DIR")
            .ok()
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|h| h.join(".task-graph-scheduler")));

        let project_dir = std::env::var("TGS_PROJECT_DIR")
            .ok()
            .map(PathBuf::from)
            .or_else(|| Some(PathBuf::from("scheduler")));

        let explicit_file = std::env::var("TGS_CONFIG_PATH").ok().map(PathBuf::from);

        Self {
            project_dir,
            user_dir,
            explicit_file,
        }
    }

    /// Create paths with explicit directories.
    pub fn with_dirs(project_dir: Option<PathBuf>, user_dir: Option<PathBuf>) -> Self {
        Self {
            project_dir,
            user_dir,
            explicit_file: None,
        }
    }

    /// Use an explicit config file in place of the project tier.
    pub fn with_explicit_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.explicit_file = Some(path.into());
        self
    }

    fn project_file(&self) -> Option<PathBuf> {
        self.explicit_file
            .clone()
            .or_else(|| self.project_dir.as_ref().map(|d| d.join("config.yaml")))
    }
}

/// Configuration loader that handles tier-based merging.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// Paths for each tier
    pub paths: ConfigPaths,
    /// Loaded configuration
    config: Config,
    /// Path to the project config file that was used (if any)
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Load configuration from all tiers with proper merging.
    pub fn load() -> Result<Self> {
        Self::load_with_paths(ConfigPaths::discover())
    }

    /// Load configuration with explicit paths.
    pub fn load_with_paths(paths: ConfigPaths) -> Result<Self> {
        let mut configs: Vec<Value> = Vec::new();

        // Tier 1: Defaults (embedded)
        configs.push(serde_json::to_value(Config::default())?);

        // Tier 2: User config
        if let Some(ref user_dir) = paths.user_dir {
            if let Some(value) = read_yaml_tier(&user_dir.join("config.yaml"), ConfigTier::User)? {
                configs.push(value);
            }
        }

        // Tier 3: Project config (or explicit file, which must exist)
        let mut config_path = None;
        if let Some(file) = paths.project_file() {
            if paths.explicit_file.is_some() && !file.exists() {
                anyhow::bail!("Config file not found: {}", file.display());
            }
            if let Some(value) = read_yaml_tier(&file, ConfigTier::Project)? {
                configs.push(value);
                config_path = Some(file);
            }
        }

        let merged = deep_merge_all(configs);
        let mut config: Config =
            serde_json::from_value(merged).context("Invalid merged configuration")?;

        // Tier 4: Environment variable overrides
        Self::apply_env_overrides(&mut config);

        config.validate()?;

        Ok(Self {
            paths,
            config,
            config_path,
        })
    }

    /// Apply environment variable overrides to config.
    fn apply_env_overrides(config: &mut Config) {
        if let Ok(db_path) = std::env::var("TGS_DB_PATH") {
            config.server.db_path = PathBuf::from(db_path);
        }

        if let Ok(max) = std::env::var("TGS_MAX_CONCURRENT") {
            match max.parse() {
                Ok(max) => config.server.max_concurrent_executions = max,
                Err(_) => warn!(value = %max, "Ignoring invalid TGS_MAX_CONCURRENT"),
            }
        }

        if let Ok(timeout) = std::env::var("TGS_STALE_TIMEOUT") {
            match timeout.parse() {
                Ok(timeout) => config.escalation.stale_timeout_seconds = timeout,
                Err(_) => warn!(value = %timeout, "Ignoring invalid TGS_STALE_TIMEOUT"),
            }
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn into_config(self) -> Config {
        self.config
    }

    /// Project config file that contributed to the result, if any.
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }
}

/// Read one YAML tier. Missing files are skipped; malformed files are errors.
fn read_yaml_tier(path: &Path, tier: ConfigTier) -> Result<Option<Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {} config {}", tier, path.display()))?;
    let value: Value = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse {} config {}", tier, path.display()))?;
    debug!(tier = %tier, path = %path.display(), "Loaded config tier");
    Ok(Some(value))
}
