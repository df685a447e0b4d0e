//! Pipeline configuration.
//!
//! Every tuning constant of the pipeline lives here as data. A
//! [`PipelineConfig`] is built once at startup (from defaults, an optional
//! TOML/YAML/JSON file, and `SENSOFLOW__*` environment overrides) and
//! validated before any component sees it.
//!
//! ```toml
//! [attention.high]
//! window_multiplier = 0.2
//! min_window_ms = 20
//! max_window_ms = 500
//! batch_size = 1
//!
//! [sampler]
//! interval_ms = 2000
//! hysteresis = 0.05
//!
//! [controllers.novelty]
//! z_threshold = 3.0
//! ```

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use sensoflow_types::{AttentionLevel, LoadLevel, Millis};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Top-level configuration for the whole pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub attention: AttentionConfig,
    pub sampler: SamplerConfig,
    pub store: StoreConfig,
    pub lens: LensConfig,
    pub router: RouterConfig,
    pub advisory: AdvisoryConfig,
    pub controllers: ControllersConfig,
    pub synchrony: SynchronyConfig,
    pub maintenance: MaintenanceConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            attention: AttentionConfig::default(),
            sampler: SamplerConfig::default(),
            store: StoreConfig::default(),
            lens: LensConfig::default(),
            router: RouterConfig::default(),
            advisory: AdvisoryConfig::default(),
            controllers: ControllersConfig::default(),
            synchrony: SynchronyConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from an optional file plus environment overrides.
    ///
    /// Environment variables use the `SENSOFLOW` prefix and `__` as the
    /// nesting separator, e.g. `SENSOFLOW__SAMPLER__INTERVAL_MS=500`.
    pub fn load(path: Option<&Path>) -> Result<Self, PipelineError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("SENSOFLOW")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let parsed: PipelineConfig = config.try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), PipelineError> {
        for level in AttentionLevel::ALL {
            let profile = self.attention.profile(level);
            if !(profile.window_multiplier.is_finite() && profile.window_multiplier > 0.0) {
                return Err(invalid(format!(
                    "attention.{level}.window_multiplier must be positive"
                )));
            }
            if profile.min_window_ms > profile.max_window_ms {
                return Err(invalid(format!(
                    "attention.{level}: min_window_ms exceeds max_window_ms"
                )));
            }
        }

        self.sampler.thresholds.validate()?;
        if self.sampler.weights.total() <= 0.0 {
            return Err(invalid("sampler.weights must not all be zero"));
        }
        if !(0.0..0.5).contains(&self.sampler.hysteresis) {
            return Err(invalid("sampler.hysteresis must be in [0, 0.5)"));
        }
        for level in LoadLevel::ALL {
            let multiplier = self.sampler.multipliers.for_level(level);
            if !(multiplier.is_finite() && multiplier > 0.0) {
                return Err(invalid(format!("sampler.multipliers.{level} must be positive")));
            }
            let factor = self.store.load_factors.for_level(level);
            if !(factor.is_finite() && factor > 0.0 && factor <= 1.0) {
                return Err(invalid(format!("store.load_factors.{level} must be in (0, 1]")));
            }
        }

        if self.lens.tiers.realtime_ms == 0 {
            return Err(invalid("lens.tiers periods must be non-zero"));
        }
        if !(self.lens.tiers.realtime_ms <= self.lens.tiers.smooth_ms
            && self.lens.tiers.smooth_ms <= self.lens.tiers.reduced_ms
            && self.lens.tiers.reduced_ms <= self.lens.tiers.minimal_ms)
        {
            return Err(invalid("lens.tiers must be ascending"));
        }
        if self.lens.sink_capacity == 0 || self.lens.max_buffered == 0 {
            return Err(invalid("lens capacities must be non-zero"));
        }
        if self.lens.recover_fill >= self.lens.degrade_fill {
            return Err(invalid("lens.recover_fill must be below lens.degrade_fill"));
        }

        if self.router.shard_capacity == 0 || self.router.raw_capacity == 0 {
            return Err(invalid("router capacities must be non-zero"));
        }

        let novelty = &self.controllers.novelty;
        if !(novelty.min_std_dev >= 0.0 && novelty.min_relative_std_dev >= 0.0) {
            return Err(invalid("controllers.novelty std dev floors must not be negative"));
        }

        let bounds = &self.controllers;
        if !(bounds.factor_min > 0.0 && bounds.factor_min <= 1.0 && bounds.factor_max >= 1.0) {
            return Err(invalid("controllers factor bounds must bracket 1.0"));
        }
        let target_sum: f64 = self.controllers.homeostatic.target.iter().sum();
        if (target_sum - 1.0).abs() > 0.01 {
            return Err(invalid("controllers.homeostatic.target must sum to 1.0"));
        }
        if self.controllers.predictive.history_len < 8 {
            return Err(invalid("controllers.predictive.history_len must be at least 8"));
        }

        if self.synchrony.window < 3 {
            return Err(invalid("synchrony.window must be at least 3"));
        }
        if !(0.0..1.0).contains(&self.synchrony.smoothing) {
            return Err(invalid("synchrony.smoothing must be in [0, 1)"));
        }

        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> PipelineError {
    PipelineError::InvalidConfig(reason.into())
}

// ============================================================================
// Attention
// ============================================================================

/// Window shaping for one attention level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AttentionProfile {
    pub window_multiplier: f64,
    pub min_window_ms: u64,
    pub max_window_ms: u64,
    pub batch_size: u32,
}

impl AttentionProfile {
    pub fn min_window(&self) -> Millis {
        Millis(self.min_window_ms)
    }

    pub fn max_window(&self) -> Millis {
        Millis(self.max_window_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionConfig {
    pub high: AttentionProfile,
    pub medium: AttentionProfile,
    pub low: AttentionProfile,
    pub none: AttentionProfile,
    /// How long a pair keeps its level after its last view goes away.
    pub idle_decay_ms: u64,
    /// How often lingering levels are swept.
    pub decay_sweep_interval_ms: u64,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            high: AttentionProfile {
                window_multiplier: 0.2,
                min_window_ms: 20,
                max_window_ms: 500,
                batch_size: 1,
            },
            medium: AttentionProfile {
                window_multiplier: 1.0,
                min_window_ms: 100,
                max_window_ms: 2_000,
                batch_size: 5,
            },
            low: AttentionProfile {
                window_multiplier: 4.0,
                min_window_ms: 500,
                max_window_ms: 10_000,
                batch_size: 10,
            },
            none: AttentionProfile {
                window_multiplier: 10.0,
                min_window_ms: 1_000,
                max_window_ms: 30_000,
                batch_size: 20,
            },
            idle_decay_ms: 10_000,
            decay_sweep_interval_ms: 1_000,
        }
    }
}

impl AttentionConfig {
    pub fn profile(&self, level: AttentionLevel) -> &AttentionProfile {
        match level {
            AttentionLevel::High => &self.high,
            AttentionLevel::Medium => &self.medium,
            AttentionLevel::Low => &self.low,
            AttentionLevel::None => &self.none,
        }
    }

    pub fn idle_decay(&self) -> Duration {
        Duration::from_millis(self.idle_decay_ms)
    }

    pub fn decay_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.decay_sweep_interval_ms.max(1))
    }
}

// ============================================================================
// Load sampler
// ============================================================================

/// Relative weight of each load signal in the blend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalWeights {
    pub cpu: f64,
    pub queue: f64,
    pub memory: f64,
    pub run_queue: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            cpu: 0.45,
            queue: 0.30,
            memory: 0.15,
            run_queue: 0.10,
        }
    }
}

impl SignalWeights {
    pub fn total(&self) -> f64 {
        self.cpu.max(0.0) + self.queue.max(0.0) + self.memory.max(0.0) + self.run_queue.max(0.0)
    }
}

/// Ascending blend thresholds for entering each elevated load level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadThresholds {
    pub elevated: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for LoadThresholds {
    fn default() -> Self {
        Self {
            elevated: 0.5,
            high: 0.7,
            critical: 0.85,
        }
    }
}

impl LoadThresholds {
    /// Threshold for entering `level`; `Normal` has none.
    pub fn for_level(&self, level: LoadLevel) -> Option<f64> {
        match level {
            LoadLevel::Normal => None,
            LoadLevel::Elevated => Some(self.elevated),
            LoadLevel::High => Some(self.high),
            LoadLevel::Critical => Some(self.critical),
        }
    }

    pub fn as_array(&self) -> [f64; 3] {
        [self.elevated, self.high, self.critical]
    }

    pub fn from_array(values: [f64; 3]) -> Self {
        Self {
            elevated: values[0],
            high: values[1],
            critical: values[2],
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let [e, h, c] = self.as_array();
        if !(0.0 < e && e < h && h < c && c < 1.0) {
            return Err(invalid(
                "sampler.thresholds must be strictly ascending inside (0, 1)",
            ));
        }
        Ok(())
    }
}

/// Delivery window multiplier per load level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadMultipliers {
    pub normal: f64,
    pub elevated: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for LoadMultipliers {
    fn default() -> Self {
        Self {
            normal: 1.0,
            elevated: 1.5,
            high: 2.5,
            critical: 4.0,
        }
    }
}

impl LoadMultipliers {
    pub fn for_level(&self, level: LoadLevel) -> f64 {
        match level {
            LoadLevel::Normal => self.normal,
            LoadLevel::Elevated => self.elevated,
            LoadLevel::High => self.high,
            LoadLevel::Critical => self.critical,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub interval_ms: u64,
    pub weights: SignalWeights,
    pub thresholds: LoadThresholds,
    /// Extra margin a blend must drop below a threshold before the level
    /// falls. `0.0` switches purely on thresholds.
    pub hysteresis: f64,
    pub memory_protection_threshold: f64,
    pub multipliers: LoadMultipliers,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,
            weights: SignalWeights::default(),
            thresholds: LoadThresholds::default(),
            hysteresis: 0.0,
            memory_protection_threshold: 0.85,
            multipliers: LoadMultipliers::default(),
        }
    }
}

impl SamplerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

// ============================================================================
// Tiered store
// ============================================================================

/// Capacity limits for a family of attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeProfile {
    pub name: String,
    /// Case-insensitive substrings matched against the attribute id.
    pub patterns: Vec<String>,
    pub hot_limit: usize,
    pub warm_limit: usize,
}

/// Capacity scale per load level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadFactors {
    pub normal: f64,
    pub elevated: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for LoadFactors {
    fn default() -> Self {
        Self {
            normal: 1.0,
            elevated: 0.5,
            high: 0.2,
            critical: 0.05,
        }
    }
}

impl LoadFactors {
    pub fn for_level(&self, level: LoadLevel) -> f64 {
        match level {
            LoadLevel::Normal => self.normal,
            LoadLevel::Elevated => self.elevated,
            LoadLevel::High => self.high,
            LoadLevel::Critical => self.critical,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub profiles: Vec<AttributeProfile>,
    pub default_hot_limit: usize,
    pub default_warm_limit: usize,
    pub load_factors: LoadFactors,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            profiles: vec![
                AttributeProfile {
                    name: "pose".to_string(),
                    patterns: vec!["pose".to_string(), "skeleton".to_string()],
                    hot_limit: 1,
                    warm_limit: 0,
                },
                AttributeProfile {
                    name: "physiological".to_string(),
                    patterns: vec![
                        "ecg".to_string(),
                        "ppg".to_string(),
                        "eeg".to_string(),
                        "emg".to_string(),
                        "respiration".to_string(),
                    ],
                    hot_limit: 150,
                    warm_limit: 500,
                },
            ],
            default_hot_limit: 50,
            default_warm_limit: 100,
            load_factors: LoadFactors::default(),
        }
    }
}

// ============================================================================
// Lens
// ============================================================================

/// Flush periods for each quality tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierPeriods {
    pub realtime_ms: u64,
    pub smooth_ms: u64,
    pub reduced_ms: u64,
    pub minimal_ms: u64,
}

impl Default for TierPeriods {
    fn default() -> Self {
        Self {
            realtime_ms: 32,
            smooth_ms: 50,
            reduced_ms: 100,
            minimal_ms: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LensConfig {
    pub tiers: TierPeriods,
    /// Capacity of each consumer's outbound flush channel.
    pub sink_capacity: usize,
    /// Measurements a buffer may hold before dropping the oldest.
    pub max_buffered: usize,
    /// Sink fill ratio at which a consumer is degraded one tier.
    pub degrade_fill: f64,
    /// Sink fill ratio at or below which a consumer recovers one tier.
    pub recover_fill: f64,
    pub sweep_interval_ms: u64,
    /// How long a detached consumer's final batch may wait for room in a
    /// full channel before it is counted as dropped.
    pub detach_grace_ms: u64,
}

impl Default for LensConfig {
    fn default() -> Self {
        Self {
            tiers: TierPeriods::default(),
            sink_capacity: 64,
            max_buffered: 4_096,
            degrade_fill: 0.75,
            recover_fill: 0.25,
            sweep_interval_ms: 60_000,
            detach_grace_ms: 1_000,
        }
    }
}

impl LensConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn detach_grace(&self) -> Duration {
        Duration::from_millis(self.detach_grace_ms)
    }
}

// ============================================================================
// Router & advisory
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Broadcast capacity of each attention shard.
    pub shard_capacity: usize,
    /// Broadcast capacity of the raw (ungated) stream.
    pub raw_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            shard_capacity: 1_024,
            raw_capacity: 4_096,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisoryConfig {
    pub base_window_ms: u64,
    pub interval_ms: u64,
    /// Window multiplier for non-paused pairs while memory protection is on.
    pub memory_protection_multiplier: f64,
}

impl Default for AdvisoryConfig {
    fn default() -> Self {
        Self {
            base_window_ms: 500,
            interval_ms: 1_000,
            memory_protection_multiplier: 5.0,
        }
    }
}

impl AdvisoryConfig {
    pub fn base_window(&self) -> Millis {
        Millis(self.base_window_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

// ============================================================================
// Controllers
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoveltyConfig {
    pub enabled: bool,
    pub z_threshold: f64,
    /// Samples required before a baseline is trusted.
    pub min_samples: u64,
    /// Smallest standard deviation a baseline is credited with, in value
    /// units. Keeps a constant baseline from turning one step into a spike.
    pub min_std_dev: f64,
    /// Same floor as a fraction of `|mean|`; the larger of the two applies.
    pub min_relative_std_dev: f64,
    pub boost_factor: f64,
    pub boost_duration_ms: u64,
}

impl Default for NoveltyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            z_threshold: 3.0,
            min_samples: 20,
            min_std_dev: 0.5,
            min_relative_std_dev: 0.01,
            boost_factor: 0.5,
            boost_duration_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    pub enabled: bool,
    pub attention_weight: f64,
    pub novelty_weight: f64,
    pub alarm_weight: f64,
    /// Power-law exponent of the competition.
    pub exponent: f64,
    /// Fraction of the budget split evenly as a guaranteed floor.
    pub min_share: f64,
    /// How long a novelty signal keeps raising a pair's priority.
    pub novelty_memory_ms: u64,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            attention_weight: 0.6,
            novelty_weight: 0.3,
            alarm_weight: 0.1,
            exponent: 2.0,
            min_share: 0.2,
            novelty_memory_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HomeostaticConfig {
    pub enabled: bool,
    pub period_ms: u64,
    /// Target share of time in normal / elevated / high / critical.
    pub target: [f64; 4],
    pub gain: f64,
    pub min_threshold: f64,
    pub max_threshold: f64,
}

impl Default for HomeostaticConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            period_ms: 60_000,
            target: [0.70, 0.20, 0.08, 0.02],
            gain: 0.05,
            min_threshold: 0.05,
            max_threshold: 0.99,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircadianConfig {
    pub enabled: bool,
    pub lookahead_minutes: u64,
    /// EWMA weight of a new observation in its hourly bucket.
    pub alpha: f64,
    pub sensitivity: f64,
    pub min_observations: u64,
    pub min_factor: f64,
    pub max_factor: f64,
}

impl Default for CircadianConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lookahead_minutes: 5,
            alpha: 0.1,
            sensitivity: 0.5,
            min_observations: 10,
            min_factor: 0.8,
            max_factor: 1.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictiveConfig {
    pub enabled: bool,
    /// Attention samples kept per pair (one per controller tick).
    pub history_len: usize,
    /// Share of non-DC spectral power the dominant period must hold.
    pub min_power_ratio: f64,
    /// How many ticks ahead to anticipate.
    pub lead_ticks: usize,
    pub pre_boost: f64,
    pub pre_throttle: f64,
}

impl Default for PredictiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            history_len: 64,
            min_power_ratio: 0.3,
            lead_ticks: 2,
            pre_boost: 0.75,
            pre_throttle: 1.33,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllersConfig {
    pub tick_interval_ms: u64,
    pub factor_min: f64,
    pub factor_max: f64,
    pub novelty: NoveltyConfig,
    pub arbiter: ArbiterConfig,
    pub homeostatic: HomeostaticConfig,
    pub circadian: CircadianConfig,
    pub predictive: PredictiveConfig,
}

impl Default for ControllersConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            factor_min: 0.5,
            factor_max: 5.0,
            novelty: NoveltyConfig::default(),
            arbiter: ArbiterConfig::default(),
            homeostatic: HomeostaticConfig::default(),
            circadian: CircadianConfig::default(),
            predictive: PredictiveConfig::default(),
        }
    }
}

impl ControllersConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

// ============================================================================
// Synchrony & maintenance
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynchronyConfig {
    /// Samples kept per sensor.
    pub window: usize,
    /// Value range below which a signal is considered flat.
    pub flat_epsilon: f64,
    /// Weight of the previous smoothed value.
    pub smoothing: f64,
}

impl Default for SynchronyConfig {
    fn default() -> Self {
        Self {
            window: 32,
            flat_epsilon: 1e-6,
            smoothing: 0.85,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub interval_ms: u64,
    /// Pairs with no data for this long are retired.
    pub sensor_idle_timeout_ms: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            sensor_idle_timeout_ms: 300_000,
        }
    }
}

impl MaintenanceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn sensor_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.sensor_idle_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn default_windows_reproduce_client_table() {
        let config = PipelineConfig::default();
        let base = config.advisory.base_window_ms as f64;
        let expected = [
            (AttentionLevel::High, 100.0, 1),
            (AttentionLevel::Medium, 500.0, 5),
            (AttentionLevel::Low, 2000.0, 10),
            (AttentionLevel::None, 5000.0, 20),
        ];
        for (level, window, batch) in expected {
            let profile = config.attention.profile(level);
            assert!((base * profile.window_multiplier - window).abs() < 1e-9);
            assert_eq!(profile.batch_size, batch);
        }
    }

    #[test]
    fn rejects_unordered_thresholds() {
        let mut config = PipelineConfig::default();
        config.sampler.thresholds.high = 0.4;
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_inverted_window_bounds() {
        let mut config = PipelineConfig::default();
        config.attention.medium.min_window_ms = 5_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_target_distribution() {
        let mut config = PipelineConfig::default();
        config.controllers.homeostatic.target = [0.5, 0.1, 0.1, 0.1];
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_negative_novelty_floor() {
        let mut config = PipelineConfig::default();
        config.controllers.novelty.min_relative_std_dev = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_partial_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[sampler]
interval_ms = 250
hysteresis = 0.05

[attention.high]
window_multiplier = 0.25
min_window_ms = 16
max_window_ms = 400
batch_size = 2

[controllers.novelty]
z_threshold = 4.0
"#
        )
        .unwrap();

        let config = PipelineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.sampler.interval_ms, 250);
        assert_eq!(config.sampler.hysteresis, 0.05);
        assert_eq!(config.attention.high.min_window_ms, 16);
        assert_eq!(config.controllers.novelty.z_threshold, 4.0);
        // untouched sections keep their defaults
        assert_eq!(config.lens, LensConfig::default());
        assert_eq!(config.controllers.novelty.min_samples, 20);
    }

    #[test]
    fn load_rejects_invalid_values() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[sampler.thresholds]\nelevated = 0.9\nhigh = 0.7\ncritical = 0.95\n")
            .unwrap();
        assert!(PipelineConfig::load(Some(file.path())).is_err());
    }
}
