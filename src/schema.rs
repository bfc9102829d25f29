use anyhow::{Context, Result, bail};
use bulkops::{DEFAULT_INTERVAL_SECS, TrackedTypes, WildcardPatterns};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

// ============================================================================
// Main Config Schema
// ============================================================================

/// The bsa configuration (`config.toml`)
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct BsaConfig {
    /// Diff normalization settings
    #[serde(default)]
    pub diff_checking: DiffCheckingConfig,

    /// Which services the service list tracks
    #[serde(default)]
    pub service_list: TrackedTypes,

    /// Bridge to the orchestration engine
    #[serde(default)]
    pub backend: BackendConfig,

    /// Scheduling and parallelism defaults
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Short service-type names mapped to keypath prefixes
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}

impl BsaConfig {
    /// Load from a path; a missing file is an empty config
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("Config file {} does not exist, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Invalid TOML format in {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        log::debug!("Saved config to {}", path.display());
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.patterns()?;
        self.scheduler.validate()?;
        for (alias, prefix) in &self.aliases {
            if alias.is_empty() || alias.contains("::") {
                bail!("Invalid alias name '{alias}'");
            }
            if prefix.is_empty() {
                bail!("Alias '{alias}' has an empty keypath prefix");
            }
        }
        Ok(())
    }

    /// Compiled wildcard patterns, in configured order
    pub fn patterns(&self) -> Result<WildcardPatterns> {
        WildcardPatterns::new(&self.diff_checking.wildcards).context("Invalid wildcard pattern")
    }

    /// Expand `<alias>::<id>` shorthand into `<prefix>{<id>}`
    ///
    /// Anything without `::` is taken as a keypath and returned unchanged.
    pub fn expand_keypath(&self, input: &str) -> Result<String> {
        let input = input.trim();
        let Some((alias, id)) = input.split_once("::") else {
            return Ok(input.to_string());
        };
        let Some(prefix) = self.aliases.get(alias) else {
            let known: Vec<&str> = self.aliases.keys().map(String::as_str).collect();
            bail!(
                "Unknown service type '{alias}' (configured: {})",
                if known.is_empty() { "none".to_string() } else { known.join(", ") }
            );
        };
        if id.is_empty() {
            bail!("Missing service id in '{input}'");
        }
        Ok(format!("{prefix}{{{id}}}"))
    }
}

// ============================================================================
// Sections
// ============================================================================

/// `[diff_checking]`
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct DiffCheckingConfig {
    /// Ordered regex list; the n-th match becomes `*WILDCARD<n>*`
    #[serde(default)]
    pub wildcards: Vec<String>,
}

/// `[backend]`
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct BackendConfig {
    /// Bridge executable (`~` and `$VARS` are expanded)
    #[serde(default)]
    pub command: String,

    /// Arguments placed before every subcommand
    #[serde(default)]
    pub args: Vec<String>,
}

/// `[scheduler]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Seconds between consecutive scheduled units
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Parallel executions for batches and the schedule worker
    #[serde(default = "default_jobs")]
    pub jobs: usize,
}

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_SECS
}

fn default_jobs() -> usize {
    4
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            jobs: default_jobs(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            bail!("scheduler.interval_secs must be at least 1");
        }
        if self.jobs == 0 {
            bail!("scheduler.jobs must be at least 1");
        }
        Ok(())
    }
}
