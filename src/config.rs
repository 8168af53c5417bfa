//! Configuration for the Hive workspace.
//!
//! Reads `.hive/hive.toml`; every section and key has a default so a bare
//! workspace works without a config file.
//!
//! # Configuration File Format
//!
//! ```toml
//! [manager]
//! slow_poll_interval_ms = 60000
//! stuck_threshold_ms = 300000
//! nudge_cooldown_ms = 300000
//! lock_stale_ms = 600000
//!
//! [scaling]
//! junior_max_complexity = 3
//! intermediate_max_complexity = 7
//! senior_capacity = 20
//!
//! [scaling.refactor]
//! enabled = true
//! capacity_percent = 20
//! allow_without_feature_work = false
//!
//! [qa]
//! max_agents = 5
//! stories_per_agent = 2.5
//!
//! [models.junior]
//! model = "haiku"
//! cli_tool = "claude"
//! safety_mode = "bypass"
//!
//! [cluster]
//! enabled = false
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::db::models::AgentType;

pub const HIVE_DIR: &str = ".hive";
pub const DB_FILE: &str = "hive.db";
pub const LOCK_FILE: &str = "manager.lock";
pub const LOG_FILE: &str = "manager.log";
pub const CONFIG_FILE: &str = "hive.toml";

/// Filesystem layout of one workspace.
#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub hive_dir: PathBuf,
}

impl WorkspacePaths {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            hive_dir: root.join(HIVE_DIR),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.hive_dir.join(DB_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.hive_dir.join(LOCK_FILE)
    }

    pub fn log_path(&self) -> PathBuf {
        self.hive_dir.join(LOG_FILE)
    }

    pub fn config_path(&self) -> PathBuf {
        self.hive_dir.join(CONFIG_FILE)
    }

    /// Prompt files handed to spawned CLIs as a positional argument.
    pub fn prompts_dir(&self) -> PathBuf {
        self.hive_dir.join("prompts")
    }

    /// Per-agent git worktrees.
    pub fn worktrees_dir(&self) -> PathBuf {
        self.root.join("repos")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HiveConfig {
    pub manager: ManagerConfig,
    pub scaling: ScalingConfig,
    pub qa: QaConfig,
    pub models: ModelsConfig,
    pub cluster: ClusterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Tick period of the supervision loop.
    pub slow_poll_interval_ms: u64,
    /// How long an idle state must persist before a nudge.
    pub stuck_threshold_ms: u64,
    /// Minimum gap between two nudges to the same session.
    pub nudge_cooldown_ms: u64,
    /// Lockfile age after which the singleton lock may be stolen.
    pub lock_stale_ms: u64,
    /// Skip syncing code-host PRs older than this many days; `None` syncs all.
    pub pr_max_age_days: Option<i64>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            slow_poll_interval_ms: 60_000,
            stuck_threshold_ms: 5 * 60_000,
            nudge_cooldown_ms: 5 * 60_000,
            lock_stale_ms: 10 * 60_000,
            pr_max_age_days: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    /// Upper complexity bound for the junior tier.
    pub junior_max_complexity: i64,
    /// Upper complexity bound for the intermediate tier.
    pub intermediate_max_complexity: i64,
    /// Story points one senior is expected to carry.
    pub senior_capacity: i64,
    pub refactor: RefactorConfig,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            junior_max_complexity: 3,
            intermediate_max_complexity: 7,
            senior_capacity: 20,
            refactor: RefactorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefactorConfig {
    pub enabled: bool,
    /// Refactor budget as a percentage of feature story points.
    pub capacity_percent: i64,
    /// Whether refactors may run when no feature work is planned.
    pub allow_without_feature_work: bool,
}

impl Default for RefactorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            capacity_percent: 20,
            allow_without_feature_work: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QaConfig {
    /// Hard ceiling on QA agents per team.
    pub max_agents: usize,
    /// Pending reviews one QA agent is expected to absorb.
    pub stories_per_agent: f64,
}

impl Default for QaConfig {
    fn default() -> Self {
        Self {
            max_agents: 5,
            stories_per_agent: 2.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyMode {
    /// Permission prompts auto-approved; the manager enforces this mode.
    #[default]
    Bypass,
    /// Leave the CLI's own permission prompts in place.
    Standard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelTierConfig {
    pub model: String,
    pub cli_tool: String,
    pub safety_mode: SafetyMode,
}

impl Default for ModelTierConfig {
    fn default() -> Self {
        Self {
            model: "sonnet".to_string(),
            cli_tool: "claude".to_string(),
            safety_mode: SafetyMode::Bypass,
        }
    }
}

impl ModelTierConfig {
    fn with_model(model: &str) -> Self {
        Self {
            model: model.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub tech_lead: ModelTierConfig,
    pub senior: ModelTierConfig,
    pub intermediate: ModelTierConfig,
    pub junior: ModelTierConfig,
    pub qa: ModelTierConfig,
    pub feature_test: ModelTierConfig,
    /// Model forced on every agent of a godmode requirement.
    pub godmode_model: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            tech_lead: ModelTierConfig::with_model("opus"),
            senior: ModelTierConfig::with_model("sonnet"),
            intermediate: ModelTierConfig::with_model("sonnet"),
            junior: ModelTierConfig::with_model("haiku"),
            qa: ModelTierConfig::with_model("sonnet"),
            feature_test: ModelTierConfig::with_model("sonnet"),
            godmode_model: "opus".to_string(),
        }
    }
}

impl ModelsConfig {
    pub fn for_tier(&self, tier: AgentType) -> &ModelTierConfig {
        match tier {
            AgentType::TechLead => &self.tech_lead,
            AgentType::Senior => &self.senior,
            AgentType::Intermediate => &self.intermediate,
            AgentType::Junior => &self.junior,
            AgentType::Qa => &self.qa,
            AgentType::FeatureTest => &self.feature_test,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub enabled: bool,
    pub node_id: Option<String>,
    pub public_url: Option<String>,
    pub sync_interval_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            node_id: None,
            public_url: None,
            sync_interval_ms: 30_000,
        }
    }
}

impl HiveConfig {
    /// Load from `.hive/hive.toml`, falling back to defaults when the file
    /// is absent. A present-but-invalid file is an error, not a silent
    /// default.
    pub fn load(paths: &WorkspacePaths) -> Result<Self> {
        let path = paths.config_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn save_default(paths: &WorkspacePaths) -> Result<()> {
        let rendered = toml::to_string_pretty(&Self::default())
            .context("Failed to render default config")?;
        std::fs::write(paths.config_path(), rendered).context("Failed to write default config")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let paths = WorkspacePaths::new(dir.path());
        std::fs::create_dir_all(&paths.hive_dir)?;
        let config = HiveConfig::load(&paths)?;
        assert_eq!(config.manager.slow_poll_interval_ms, 60_000);
        assert_eq!(config.scaling.junior_max_complexity, 3);
        assert_eq!(config.qa.max_agents, 5);
        assert!(!config.cluster.enabled);
        Ok(())
    }

    #[test]
    fn test_partial_file_overrides_only_named_keys() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let paths = WorkspacePaths::new(dir.path());
        std::fs::create_dir_all(&paths.hive_dir)?;
        std::fs::write(
            paths.config_path(),
            "[manager]\nnudge_cooldown_ms = 1000\n\n[models.junior]\nmodel = \"haiku-next\"\n",
        )?;

        let config = HiveConfig::load(&paths)?;
        assert_eq!(config.manager.nudge_cooldown_ms, 1000);
        assert_eq!(config.manager.slow_poll_interval_ms, 60_000);
        assert_eq!(config.models.junior.model, "haiku-next");
        assert_eq!(config.models.senior.model, "sonnet");
        Ok(())
    }

    #[test]
    fn test_invalid_file_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let paths = WorkspacePaths::new(dir.path());
        std::fs::create_dir_all(&paths.hive_dir)?;
        std::fs::write(paths.config_path(), "manager = \"not a table\"")?;
        assert!(HiveConfig::load(&paths).is_err());
        Ok(())
    }

    #[test]
    fn test_default_round_trips_through_toml() -> Result<()> {
        let rendered = toml::to_string_pretty(&HiveConfig::default())?;
        let parsed: HiveConfig = toml::from_str(&rendered)?;
        assert_eq!(parsed.scaling.senior_capacity, 20);
        assert_eq!(parsed.models.godmode_model, "opus");
        Ok(())
    }
}
