//! Configuration loading, validation, and management for DriveTalk.
//!
//! Loads configuration from `~/.drivetalk/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use drivetalk_core::{Priority, QualityTier, StageBudget, StageKind};

/// The root configuration structure.
///
/// Maps directly to `~/.drivetalk/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Default log filter when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Signal ingest settings
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Context fusion settings
    #[serde(default)]
    pub fusion: FusionConfig,

    /// Resource allocator settings
    #[serde(default)]
    pub allocator: AllocatorConfig,

    /// Turn scheduler settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Session lifecycle settings
    #[serde(default)]
    pub sessions: SessionConfig,

    /// Telemetry sink settings
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Context-driven prompts the assistant raises on its own
    #[serde(default)]
    pub proactive: ProactiveConfig,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Bounded delta queue size; the oldest delta is dropped when full
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// First reconnect delay; doubles per failed attempt
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,

    /// Reconnect delay ceiling
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

fn default_queue_capacity() -> usize {
    1024
}
fn default_reconnect_base_ms() -> u64 {
    250
}
fn default_reconnect_max_ms() -> u64 {
    30_000
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionConfig {
    /// Deltas stamped further than this into the future are malformed
    #[serde(default = "default_max_clock_skew_ms")]
    pub max_clock_skew_ms: u64,

    /// Fields older than this are hidden from stages
    #[serde(default = "default_field_max_age_secs")]
    pub field_max_age_secs: u64,

    /// Open a session on the first delta for an unknown session id
    #[serde(default)]
    pub auto_open_sessions: bool,
}

fn default_max_clock_skew_ms() -> u64 {
    5_000
}
fn default_field_max_age_secs() -> u64 {
    300
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            max_clock_skew_ms: default_max_clock_skew_ms(),
            field_max_age_secs: default_field_max_age_secs(),
            auto_open_sessions: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Latency samples kept per stage
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Average stage latency above which a sample counts as a breach
    #[serde(default = "default_latency_threshold_ms")]
    pub latency_threshold_ms: u64,

    /// Queue depth above `multiple × max_concurrency` counts as a breach
    #[serde(default = "default_queue_capacity_multiple")]
    pub queue_capacity_multiple: f64,

    /// Fraction of both thresholds under which a sample counts as healthy
    #[serde(default = "default_comfort_ratio")]
    pub comfort_ratio: f64,

    /// Consecutive breaching samples before a downgrade
    #[serde(default = "default_downgrade_after")]
    pub downgrade_after: u32,

    /// Consecutive healthy samples before an upgrade
    #[serde(default = "default_upgrade_after")]
    pub upgrade_after: u32,

    /// Maximum concurrent invocations per stage
    #[serde(default)]
    pub stages: StageLimits,
}

fn default_window_size() -> usize {
    20
}
fn default_latency_threshold_ms() -> u64 {
    1_000
}
fn default_queue_capacity_multiple() -> f64 {
    2.0
}
fn default_comfort_ratio() -> f64 {
    0.5
}
fn default_downgrade_after() -> u32 {
    3
}
fn default_upgrade_after() -> u32 {
    10
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            latency_threshold_ms: default_latency_threshold_ms(),
            queue_capacity_multiple: default_queue_capacity_multiple(),
            comfort_ratio: default_comfort_ratio(),
            downgrade_after: default_downgrade_after(),
            upgrade_after: default_upgrade_after(),
            stages: StageLimits::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageLimits {
    #[serde(default = "default_understanding_slots")]
    pub understanding: u32,

    #[serde(default = "default_generation_slots")]
    pub generation: u32,

    #[serde(default = "default_synthesis_slots")]
    pub synthesis: u32,
}

fn default_understanding_slots() -> u32 {
    10
}
fn default_generation_slots() -> u32 {
    4
}
fn default_synthesis_slots() -> u32 {
    6
}

impl StageLimits {
    pub fn for_stage(&self, stage: StageKind) -> u32 {
        match stage {
            StageKind::Understanding => self.understanding,
            StageKind::Generation => self.generation,
            StageKind::Synthesis => self.synthesis,
        }
    }

    /// Same limit for every stage.
    pub fn uniform(limit: u32) -> Self {
        Self {
            understanding: limit,
            generation: limit,
            synthesis: limit,
        }
    }
}

impl Default for StageLimits {
    fn default() -> Self {
        Self {
            understanding: default_understanding_slots(),
            generation: default_generation_slots(),
            synthesis: default_synthesis_slots(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Period of the dispatcher's housekeeping tick (deadlines, tier sampling)
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// How long a cancelled stage may take to acknowledge
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,

    /// Upper bound for the apology synthesis after a failed turn
    #[serde(default = "default_fallback_timeout_ms")]
    pub fallback_timeout_ms: u64,

    /// Spoken after a failed or timed-out turn
    #[serde(default = "default_fallback_text")]
    pub fallback_text: String,

    /// Spoken when an utterance is below `min_confidence`
    #[serde(default = "default_reprompt_text")]
    pub reprompt_text: String,

    /// Transcripts below this confidence do not start a turn
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,

    /// Capacity of the output channel handed to the embedding application
    #[serde(default = "default_output_buffer")]
    pub output_buffer: usize,

    /// Soft latency budget per priority class
    #[serde(default)]
    pub latency_budgets: LatencyBudgets,

    /// Compute budget per quality tier
    #[serde(default)]
    pub tiers: TierBudgets,
}

fn default_tick_interval_ms() -> u64 {
    100
}
fn default_cancel_grace_ms() -> u64 {
    300
}
fn default_fallback_timeout_ms() -> u64 {
    2_000
}
fn default_fallback_text() -> String {
    "I'm sorry, I ran into a problem. Please try again.".into()
}
fn default_reprompt_text() -> String {
    "I didn't catch that. Could you please repeat?".into()
}
fn default_min_confidence() -> f32 {
    0.6
}
fn default_output_buffer() -> usize {
    256
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            cancel_grace_ms: default_cancel_grace_ms(),
            fallback_timeout_ms: default_fallback_timeout_ms(),
            fallback_text: default_fallback_text(),
            reprompt_text: default_reprompt_text(),
            min_confidence: default_min_confidence(),
            output_buffer: default_output_buffer(),
            latency_budgets: LatencyBudgets::default(),
            tiers: TierBudgets::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyBudgets {
    #[serde(default = "default_budget_low_ms")]
    pub low_ms: u64,
    #[serde(default = "default_budget_normal_ms")]
    pub normal_ms: u64,
    #[serde(default = "default_budget_high_ms")]
    pub high_ms: u64,
    #[serde(default = "default_budget_critical_ms")]
    pub critical_ms: u64,
}

fn default_budget_low_ms() -> u64 {
    8_000
}
fn default_budget_normal_ms() -> u64 {
    5_000
}
fn default_budget_high_ms() -> u64 {
    3_000
}
fn default_budget_critical_ms() -> u64 {
    1_500
}

impl LatencyBudgets {
    pub fn for_priority(&self, priority: Priority) -> u64 {
        match priority {
            Priority::Low => self.low_ms,
            Priority::Normal => self.normal_ms,
            Priority::High => self.high_ms,
            Priority::Critical => self.critical_ms,
        }
    }
}

impl Default for LatencyBudgets {
    fn default() -> Self {
        Self {
            low_ms: default_budget_low_ms(),
            normal_ms: default_budget_normal_ms(),
            high_ms: default_budget_high_ms(),
            critical_ms: default_budget_critical_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierBudgets {
    #[serde(default = "default_tier_normal")]
    pub normal: StageBudget,
    #[serde(default = "default_tier_degraded")]
    pub degraded: StageBudget,
    #[serde(default = "default_tier_minimal")]
    pub minimal: StageBudget,
}

fn default_tier_normal() -> StageBudget {
    StageBudget {
        context_turns: 5,
        max_tokens: 512,
    }
}
fn default_tier_degraded() -> StageBudget {
    StageBudget {
        context_turns: 3,
        max_tokens: 256,
    }
}
fn default_tier_minimal() -> StageBudget {
    StageBudget {
        context_turns: 1,
        max_tokens: 96,
    }
}

impl TierBudgets {
    pub fn for_tier(&self, tier: QualityTier) -> StageBudget {
        match tier {
            QualityTier::Normal => self.normal,
            QualityTier::Degraded => self.degraded,
            QualityTier::Minimal => self.minimal,
        }
    }
}

impl Default for TierBudgets {
    fn default() -> Self {
        Self {
            normal: default_tier_normal(),
            degraded: default_tier_degraded(),
            minimal: default_tier_minimal(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sessions without activity for this long are closed
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Completed turns kept per session
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_idle_timeout_secs() -> u64 {
    300
}
fn default_history_limit() -> usize {
    10
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            history_limit: default_history_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Whether the telemetry engine records events
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Turn traces retained before the oldest completed ones are pruned
    #[serde(default = "default_max_traces")]
    pub max_traces: usize,

    /// Also log every domain event as JSON at debug level
    #[serde(default)]
    pub log_events: bool,

    /// Turns slower than this end to end are counted as slow
    #[serde(default = "default_response_threshold_ms")]
    pub response_threshold_ms: u64,
}

fn default_max_traces() -> usize {
    5_000
}
fn default_response_threshold_ms() -> u64 {
    1_000
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_traces: default_max_traces(),
            log_events: false,
            response_threshold_ms: default_response_threshold_ms(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.drivetalk/config.toml).
    ///
    /// Environment overrides:
    /// - `DRIVETALK_LOG` — default log filter
    /// - `DRIVETALK_MAX_CONCURRENCY` — slot limit applied to every stage
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let config = Self::load_from(&config_path)?;
        config.with_env_overrides()
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

    /// Apply `DRIVETALK_*` environment overrides and re-validate.
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(level) = std::env::var("DRIVETALK_LOG") {
            self.log_level = level;
        }

        if let Ok(raw) = std::env::var("DRIVETALK_MAX_CONCURRENCY") {
            let limit: u32 = raw.parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "DRIVETALK_MAX_CONCURRENCY must be a positive integer, got '{raw}'"
                ))
            })?;
            self.allocator.stages = StageLimits::uniform(limit);
        }

        self.validate()?;
        Ok(self)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".drivetalk")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ingest.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "ingest.queue_capacity must be > 0".into(),
            ));
        }

        if self.ingest.reconnect_base_ms == 0
            || self.ingest.reconnect_base_ms > self.ingest.reconnect_max_ms
        {
            return Err(ConfigError::ValidationError(
                "ingest.reconnect_base_ms must be > 0 and <= reconnect_max_ms".into(),
            ));
        }

        for stage in StageKind::PIPELINE {
            if self.allocator.stages.for_stage(stage) == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "allocator.stages.{stage} must be > 0"
                )));
            }
        }

        if self.allocator.window_size == 0 {
            return Err(ConfigError::ValidationError(
                "allocator.window_size must be > 0".into(),
            ));
        }

        if !(self.allocator.comfort_ratio > 0.0 && self.allocator.comfort_ratio < 1.0) {
            return Err(ConfigError::ValidationError(
                "allocator.comfort_ratio must be between 0.0 and 1.0 (exclusive)".into(),
            ));
        }

        if self.allocator.downgrade_after == 0 || self.allocator.upgrade_after == 0 {
            return Err(ConfigError::ValidationError(
                "allocator.downgrade_after and upgrade_after must be > 0".into(),
            ));
        }

        if !(0.0..=1.0).contains(&self.scheduler.min_confidence) {
            return Err(ConfigError::ValidationError(
                "scheduler.min_confidence must be between 0.0 and 1.0".into(),
            ));
        }

        if self.scheduler.tick_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "scheduler.tick_interval_ms must be > 0".into(),
            ));
        }

        let budgets = &self.scheduler.latency_budgets;
        if [budgets.low_ms, budgets.normal_ms, budgets.high_ms, budgets.critical_ms].contains(&0) {
            return Err(ConfigError::ValidationError(
                "scheduler.latency_budgets must all be > 0".into(),
            ));
        }

        if self.telemetry.max_traces == 0 {
            return Err(ConfigError::ValidationError(
                "telemetry.max_traces must be > 0".into(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        for rule in &self.proactive.rules {
            if rule.name.is_empty() || rule.field.is_empty() || rule.prompt.is_empty() {
                return Err(ConfigError::ValidationError(
                    "proactive.rules need a name, field and prompt".into(),
                ));
            }
            if rule.conditions() != 1 {
                return Err(ConfigError::ValidationError(format!(
                    "proactive rule '{}' must set exactly one of below, above or equals",
                    rule.name
                )));
            }
            if !names.insert(rule.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "proactive rule '{}' is defined twice",
                    rule.name
                )));
            }
        }

        if self.sessions.history_limit == 0 {
            return Err(ConfigError::ValidationError(
                "sessions.history_limit must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            ingest: IngestConfig::default(),
            fusion: FusionConfig::default(),
            allocator: AllocatorConfig::default(),
            scheduler: SchedulerConfig::default(),
            sessions: SessionConfig::default(),
            telemetry: TelemetryConfig::default(),
            proactive: ProactiveConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProactiveConfig {
    /// Evaluate rules on every context change
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_proactive_rules")]
    pub rules: Vec<ProactiveRule>,
}

/// Queue a text turn when a context field crosses a condition.
///
/// Exactly one of `below`, `above` or `equals` is set. A rule fires when the
/// condition starts holding and re-arms once it stops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProactiveRule {
    pub name: String,

    /// Fused field name, e.g. `vehicle.fuel_level`
    pub field: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub below: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub above: Option<f64>,

    /// Compared against strings as-is and against other values in their JSON form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<String>,

    /// Text of the queued turn
    pub prompt: String,

    #[serde(default = "default_proactive_priority")]
    pub priority: Priority,
}

impl ProactiveRule {
    fn conditions(&self) -> usize {
        [self.below.is_some(), self.above.is_some(), self.equals.is_some()]
            .into_iter()
            .filter(|set| *set)
            .count()
    }
}

fn default_proactive_priority() -> Priority {
    Priority::High
}
fn default_proactive_rules() -> Vec<ProactiveRule> {
    vec![ProactiveRule {
        name: "low_fuel".into(),
        field: "vehicle.fuel_level".into(),
        below: Some(10.0),
        above: None,
        equals: None,
        prompt: "Fuel is running low. Would you like me to find a gas station nearby?".into(),
        priority: Priority::High,
    }]
}

impl Default for ProactiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rules: default_proactive_rules(),
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.tiers.normal.context_turns, 5);
        assert_eq!(config.sessions.history_limit, 10);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.allocator.stages.generation, config.allocator.stages.generation);
        assert_eq!(parsed.scheduler.cancel_grace_ms, config.scheduler.cancel_grace_ms);
    }

    #[test]
    fn invalid_comfort_ratio_rejected() {
        let mut config = AppConfig::default();
        config.allocator.comfort_ratio = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_stage_limit_rejected() {
        let mut config = AppConfig::default();
        config.allocator.stages.synthesis = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("synthesis"));
    }

    #[test]
    fn zero_trace_retention_rejected() {
        let mut config = AppConfig::default();
        assert_eq!(config.telemetry.response_threshold_ms, 1_000);
        config.telemetry.max_traces = 0;
        assert!(config.validate().unwrap_err().to_string().contains("max_traces"));
    }

    #[test]
    fn proactive_rules_need_one_condition() {
        let mut config = AppConfig::default();
        assert_eq!(config.proactive.rules[0].field, "vehicle.fuel_level");
        config.proactive.rules[0].above = Some(90.0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("low_fuel"));

        let mut config = AppConfig::default();
        let twin = config.proactive.rules[0].clone();
        config.proactive.rules.push(twin);
        assert!(config.validate().unwrap_err().to_string().contains("twice"));
    }

    #[test]
    fn proactive_rules_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[[proactive.rules]]
name = "rain"
field = "external.weather.condition"
equals = "rain"
prompt = "Rain ahead. Want me to turn on the wipers?"
priority = "normal"
"#
        )
        .unwrap();

        let config = AppConfig::load_from(file.path()).unwrap();
        assert!(config.proactive.enabled);
        assert_eq!(config.proactive.rules.len(), 1);
        let rule = &config.proactive.rules[0];
        assert_eq!(rule.equals.as_deref(), Some("rain"));
        assert_eq!(rule.priority, Priority::Normal);
        assert!(rule.below.is_none());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[allocator]
latency_threshold_ms = 800

[allocator.stages]
generation = 1

[scheduler.latency_budgets]
high_ms = 2000
"#
        )
        .unwrap();

        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.allocator.latency_threshold_ms, 800);
        assert_eq!(config.allocator.stages.generation, 1);
        assert_eq!(config.allocator.stages.understanding, 10);
        assert_eq!(config.scheduler.latency_budgets.for_priority(Priority::High), 2000);
        assert_eq!(config.scheduler.latency_budgets.for_priority(Priority::Low), 8000);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "allocator = [not valid").unwrap();
        assert!(matches!(
            AppConfig::load_from(file.path()),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn tier_budgets_shrink_with_tier() {
        let tiers = TierBudgets::default();
        assert!(tiers.for_tier(QualityTier::Normal).max_tokens > tiers.for_tier(QualityTier::Degraded).max_tokens);
        assert!(tiers.for_tier(QualityTier::Degraded).max_tokens > tiers.for_tier(QualityTier::Minimal).max_tokens);
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("latency_threshold_ms"));
        assert!(toml_str.contains("fallback_text"));
        assert!(toml_str.contains("[[proactive.rules]]"));
    }
}
