//! Configuration types and structures.

use crate::db::Guardrails;
use crate::db::groups::GROUP_PREFIX;
use crate::format::OutputFormat;
use crate::types::BudgetPeriod;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    /// Role name -> role settings.
    #[serde(default = "default_roles")]
    pub roles: BTreeMap<String, RoleConfig>,

    #[serde(default)]
    pub guardrails: GuardrailsConfig,

    #[serde(default)]
    pub escalation: EscalationConfig,

    #[serde(default)]
    pub budgets: BudgetsConfig,

    #[serde(default)]
    pub workspace: WorkspaceConfig,

    #[serde(default)]
    pub webhooks: WebhooksConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            roles: default_roles(),
            guardrails: GuardrailsConfig::default(),
            escalation: EscalationConfig::default(),
            budgets: BudgetsConfig::default(),
            workspace: WorkspaceConfig::default(),
            webhooks: WebhooksConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

/// Server-wide runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Delay between polls when a worker finds nothing to claim.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Interval at which working instances send heartbeats.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Cap on simultaneous external executions across all workers.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_executions: usize,

    /// How long shutdown waits for workers before aborting them.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Default output format for CLI queries.
    #[serde(default)]
    pub default_format: OutputFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            poll_interval_ms: default_poll_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            max_concurrent_executions: default_max_concurrent(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            default_format: OutputFormat::default(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("scheduler/tasks.db")
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_max_concurrent() -> usize {
    4
}

fn default_shutdown_grace_ms() -> u64 {
    30_000
}

/// Settings for one worker role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleConfig {
    /// Task id prefix, e.g. `CD` for `CD-001`.
    pub prefix: String,

    /// Instances started with the pool.
    #[serde(default = "default_instances")]
    pub instances: u32,

    /// Upper bound for auto-scaling.
    #[serde(default = "default_max_instances")]
    pub max_instances: u32,

    /// Scale up when pending tasks exceed this many per running instance.
    /// Zero disables auto-scaling for the role.
    #[serde(default)]
    pub scale_up_pending: u32,

    /// Free-form instructions prepended to every prompt for this role.
    #[serde(default)]
    pub instructions: Option<String>,
}

fn default_instances() -> u32 {
    1
}

fn default_max_instances() -> u32 {
    1
}

fn default_roles() -> BTreeMap<String, RoleConfig> {
    let mut roles = BTreeMap::new();
    for (role, prefix) in [("pm", "PM"), ("coder", "CD")] {
        roles.insert(
            role.to_string(),
            RoleConfig {
                prefix: prefix.to_string(),
                instances: default_instances(),
                max_instances: default_max_instances(),
                scale_up_pending: 0,
                instructions: None,
            },
        );
    }
    roles
}

/// Limits enforced when tasks are created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailsConfig {
    #[serde(default = "default_max_task_depth")]
    pub max_task_depth: u32,

    #[serde(default = "default_max_tasks_per_group")]
    pub max_tasks_per_group: u32,

    #[serde(default = "default_max_rejection_cycles")]
    pub max_rejection_cycles: u32,
}

impl Default for GuardrailsConfig {
    fn default() -> Self {
        Self {
            max_task_depth: default_max_task_depth(),
            max_tasks_per_group: default_max_tasks_per_group(),
            max_rejection_cycles: default_max_rejection_cycles(),
        }
    }
}

impl From<&GuardrailsConfig> for Guardrails {
    fn from(cfg: &GuardrailsConfig) -> Self {
        Guardrails {
            max_task_depth: cfg.max_task_depth,
            max_tasks_per_group: cfg.max_tasks_per_group,
            max_rejection_cycles: cfg.max_rejection_cycles,
        }
    }
}

fn default_max_task_depth() -> u32 {
    5
}

fn default_max_tasks_per_group() -> u32 {
    200
}

fn default_max_rejection_cycles() -> u32 {
    3
}

/// Liveness monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Heartbeat age after which a working instance is stale.
    #[serde(default = "default_stale_timeout")]
    pub stale_timeout_seconds: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,

    /// Agent or role that receives liveness escalations.
    #[serde(default)]
    pub escalate_to: Option<String>,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            stale_timeout_seconds: default_stale_timeout(),
            sweep_interval_seconds: default_sweep_interval(),
            escalate_to: None,
        }
    }
}

fn default_stale_timeout() -> u64 {
    3600
}

fn default_sweep_interval() -> u64 {
    60
}

/// What happens to a budget once its period boundary passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenewalPolicy {
    /// Expired budgets stop matching until recreated.
    #[default]
    Deactivate,
    /// Expired budgets are zeroed and roll over to the next period.
    Reset,
}

/// Budget seeding and renewal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetsConfig {
    #[serde(default)]
    pub renewal: RenewalPolicy,

    /// Budgets created at startup when no active budget exists for the scope.
    #[serde(default)]
    pub seed: Vec<BudgetSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSeed {
    pub scope: crate::types::BudgetScope,
    #[serde(default)]
    pub scope_id: Option<String>,
    pub budget_usd: f64,
    #[serde(default = "default_period")]
    pub period: BudgetPeriod,
}

fn default_period() -> BudgetPeriod {
    BudgetPeriod::Daily
}

/// Worktree isolation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Git repository workers operate on. Without one, workers run without
    /// an isolated checkout.
    #[serde(default)]
    pub repo: Option<PathBuf>,

    #[serde(default = "default_worktrees_dir")]
    pub worktrees_dir: PathBuf,

    /// Starting point for newly created branches.
    #[serde(default = "default_base_ref")]
    pub base_ref: String,

    /// Attempts per git command before giving up.
    #[serde(default = "default_git_attempts")]
    pub git_attempts: u32,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            repo: None,
            worktrees_dir: default_worktrees_dir(),
            base_ref: default_base_ref(),
            git_attempts: default_git_attempts(),
        }
    }
}

fn default_worktrees_dir() -> PathBuf {
    PathBuf::from("scheduler/worktrees")
}

fn default_base_ref() -> String {
    "HEAD".to_string()
}

fn default_git_attempts() -> u32 {
    3
}

/// Outbound webhook delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhooksConfig {
    /// Delay before each retry.
    #[serde(default = "default_backoff")]
    pub backoff_seconds: Vec<u64>,

    #[serde(default = "default_webhook_timeout_ms")]
    pub timeout_ms: u64,

    /// Permit loopback/private targets. Only meant for local development.
    #[serde(default)]
    pub allow_private_targets: bool,
}

impl Default for WebhooksConfig {
    fn default() -> Self {
        Self {
            backoff_seconds: default_backoff(),
            timeout_ms: default_webhook_timeout_ms(),
            allow_private_targets: false,
        }
    }
}

fn default_backoff() -> Vec<u64> {
    vec![1, 4, 16]
}

fn default_webhook_timeout_ms() -> u64 {
    10_000
}

/// External command run once per claimed task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Program followed by its arguments. The prompt is written to stdin.
    #[serde(default)]
    pub command: Vec<String>,
}

impl Config {
    /// Load configuration from a single file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        let mut prefixes = HashSet::new();
        for (role, cfg) in &self.roles {
            if cfg.prefix.trim().is_empty() {
                return Err(anyhow!("Role '{}' has an empty prefix", role));
            }
            if cfg.prefix == GROUP_PREFIX {
                return Err(anyhow!(
                    "Role '{}' uses prefix '{}', which is reserved for group ids",
                    role,
                    GROUP_PREFIX
                ));
            }
            if !prefixes.insert(cfg.prefix.as_str()) {
                return Err(anyhow!(
                    "Prefix '{}' is used by more than one role",
                    cfg.prefix
                ));
            }
            if cfg.max_instances < cfg.instances {
                return Err(anyhow!(
                    "Role '{}': max_instances ({}) is below instances ({})",
                    role,
                    cfg.max_instances,
                    cfg.instances
                ));
            }
        }
        if self.server.max_concurrent_executions == 0 {
            return Err(anyhow!("server.max_concurrent_executions must be positive"));
        }
        if self.escalation.stale_timeout_seconds == 0 {
            return Err(anyhow!("escalation.stale_timeout_seconds must be positive"));
        }
        for seed in &self.budgets.seed {
            if seed.budget_usd <= 0.0 {
                return Err(anyhow!("Budget seeds must have a positive budget_usd"));
            }
        }
        Ok(())
    }

    /// Ensure the database directory exists.
    pub fn ensure_db_dir(&self) -> Result<()> {
        if let Some(parent) = self.server.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.roles["coder"].prefix, "CD");
        assert_eq!(config.webhooks.backoff_seconds, vec![1, 4, 16]);
    }

    #[test]
    fn yaml_fills_missing_fields_with_defaults() {
        let yaml = r#"
server:
  max_concurrent_executions: 2
roles:
  reviewer:
    prefix: RV
    instances: 2
    max_instances: 4
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.max_concurrent_executions, 2);
        assert_eq!(config.server.poll_interval_ms, 2_000);
        assert_eq!(config.roles["reviewer"].instances, 2);
        assert_eq!(config.guardrails.max_rejection_cycles, 3);
        assert_eq!(config.budgets.renewal, RenewalPolicy::Deactivate);
    }

    #[test]
    fn duplicate_prefixes_are_rejected() {
        let yaml = r#"
roles:
  a: { prefix: XX }
  b: { prefix: XX }
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn max_instances_below_instances_is_rejected() {
        let yaml = r#"
roles:
  coder: { prefix: CD, instances: 3, max_instances: 1 }
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn group_prefix_is_reserved() {
        let yaml = r#"
roles:
  grouper: { prefix: GRP }
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }
}
