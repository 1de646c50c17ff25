//! Configuration loading, validation, and management for reasonloop.
//!
//! Loads configuration from `~/.reasonloop/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.reasonloop/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Strategy the registry starts on
    #[serde(default = "default_strategy")]
    pub default_strategy: String,

    /// Hard cap on strategy cycles per session
    #[serde(default = "default_max_session_cycles")]
    pub max_session_cycles: u32,

    /// Deadline applied to every individual tool invocation
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,

    /// Context manager settings
    #[serde(default)]
    pub context: ContextConfig,

    /// Iterative (ReAct) strategy settings
    #[serde(default)]
    pub react: ReactConfig,

    /// Upfront-parallel (ReWOO) strategy settings
    #[serde(default)]
    pub rewoo: RewooConfig,

    /// Adaptive (plan-and-execute) strategy settings
    #[serde(default)]
    pub plan_execute: PlanExecuteConfig,

    /// Tree-search (LATS) strategy settings
    #[serde(default)]
    pub lats: LatsConfig,

    /// Automatic strategy selection
    #[serde(default)]
    pub selector: SelectorConfig,
}

fn default_strategy() -> String {
    "react".into()
}
fn default_max_session_cycles() -> u32 {
    50
}
fn default_tool_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Token budget used when a strategy does not pass its own
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Fraction of the budget above which entries are demoted to summaries
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: f32,

    /// Lines kept from the start of a demoted file
    #[serde(default = "default_summary_lines")]
    pub summary_head_lines: usize,

    /// Lines kept from the end of a demoted file
    #[serde(default = "default_summary_lines")]
    pub summary_tail_lines: usize,

    /// Lines kept from superseded content
    #[serde(default = "default_short_summary_lines")]
    pub short_summary_lines: usize,
}

fn default_max_tokens() -> usize {
    100_000
}
fn default_compression_threshold() -> f32 {
    0.7
}
fn default_summary_lines() -> usize {
    10
}
fn default_short_summary_lines() -> usize {
    3
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            compression_threshold: default_compression_threshold(),
            summary_head_lines: default_summary_lines(),
            summary_tail_lines: default_summary_lines(),
            short_summary_lines: default_short_summary_lines(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactConfig {
    #[serde(default = "default_react_iterations")]
    pub max_iterations: u32,
}

fn default_react_iterations() -> u32 {
    10
}

impl Default for ReactConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_react_iterations(),
        }
    }
}

/// How synthesis treats two successful steps reporting different facts
/// under the same key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Keep the output that completed last
    MostRecent,
    /// Keep the most detailed (longest) output
    MostSpecific,
    /// Keep every output and mark the key as ambiguous
    #[default]
    FlagAmbiguous,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RewooConfig {
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanExecuteConfig {
    #[serde(default = "default_max_replans")]
    pub max_replans: u32,

    /// Steps executed before the strategy gives up on the current plan
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,

    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
}

fn default_max_replans() -> u32 {
    3
}
fn default_max_steps() -> u32 {
    20
}

impl Default for PlanExecuteConfig {
    fn default() -> Self {
        Self {
            max_replans: default_max_replans(),
            max_steps: default_max_steps(),
            conflict_policy: ConflictPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatsConfig {
    /// Candidate actions generated per expansion
    #[serde(default = "default_num_candidates")]
    pub num_candidates: usize,

    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Reward a node must exceed to end the search as solved
    #[serde(default = "default_success_threshold")]
    pub success_threshold: f64,

    /// UCB exploration constant
    #[serde(default = "default_exploration_weight")]
    pub exploration_weight: f64,

    /// Share of the reward taken from the model's self-critique score;
    /// the rest comes from the task-success signal
    #[serde(default = "default_reflection_weight")]
    pub reflection_weight: f64,

    /// Upper bound on expansion rounds per run
    #[serde(default = "default_max_expansions")]
    pub max_expansions: usize,
}

fn default_num_candidates() -> usize {
    5
}
fn default_max_depth() -> usize {
    10
}
fn default_success_threshold() -> f64 {
    0.9
}
fn default_exploration_weight() -> f64 {
    std::f64::consts::SQRT_2
}
fn default_reflection_weight() -> f64 {
    0.5
}
fn default_max_expansions() -> usize {
    25
}

impl Default for LatsConfig {
    fn default() -> Self {
        Self {
            num_candidates: default_num_candidates(),
            max_depth: default_max_depth(),
            success_threshold: default_success_threshold(),
            exploration_weight: default_exploration_weight(),
            reflection_weight: default_reflection_weight(),
            max_expansions: default_max_expansions(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// Ask the model to pick a strategy when a session starts
    #[serde(default)]
    pub auto_select: bool,

    /// Recommendations below this confidence are ignored
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
}

fn default_min_confidence() -> f32 {
    0.6
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            auto_select: false,
            min_confidence: default_min_confidence(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.reasonloop/config.toml).
    ///
    /// Environment overrides (highest priority):
    /// - `REASONLOOP_STRATEGY`
    /// - `REASONLOOP_TOOL_TIMEOUT_SECS`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(strategy) = std::env::var("REASONLOOP_STRATEGY") {
            self.default_strategy = strategy;
        }
        if let Ok(raw) = std::env::var("REASONLOOP_TOOL_TIMEOUT_SECS") {
            self.tool_timeout_secs = raw.parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "REASONLOOP_TOOL_TIMEOUT_SECS must be an integer, got '{raw}'"
                ))
            })?;
        }
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".reasonloop")
    }

    /// Deadline applied to each tool invocation.
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_strategy.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "default_strategy must not be empty".into(),
            ));
        }
        if self.max_session_cycles == 0 {
            return Err(ConfigError::ValidationError(
                "max_session_cycles must be > 0".into(),
            ));
        }
        if self.tool_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "tool_timeout_secs must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.context.compression_threshold)
            || self.context.compression_threshold == 0.0
        {
            return Err(ConfigError::ValidationError(
                "context.compression_threshold must be in (0.0, 1.0]".into(),
            ));
        }
        if self.context.max_tokens == 0 {
            return Err(ConfigError::ValidationError(
                "context.max_tokens must be > 0".into(),
            ));
        }
        if self.react.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "react.max_iterations must be > 0".into(),
            ));
        }
        if self.lats.num_candidates == 0 || self.lats.max_depth == 0 {
            return Err(ConfigError::ValidationError(
                "lats.num_candidates and lats.max_depth must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.lats.success_threshold) {
            return Err(ConfigError::ValidationError(
                "lats.success_threshold must be between 0.0 and 1.0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.lats.reflection_weight) {
            return Err(ConfigError::ValidationError(
                "lats.reflection_weight must be between 0.0 and 1.0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.selector.min_confidence) {
            return Err(ConfigError::ValidationError(
                "selector.min_confidence must be between 0.0 and 1.0".into(),
            ));
        }
        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_strategy: default_strategy(),
            max_session_cycles: default_max_session_cycles(),
            tool_timeout_secs: default_tool_timeout_secs(),
            context: ContextConfig::default(),
            react: ReactConfig::default(),
            rewoo: RewooConfig::default(),
            plan_execute: PlanExecuteConfig::default(),
            lats: LatsConfig::default(),
            selector: SelectorConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
