//! Backpressure advisory - the payload pushed to producers.

use crate::{AttentionLevel, LoadLevel};

/// Backpressure advice for one `(sensor, attribute)` pair.
///
/// Producers MUST stop transmitting while `paused` is true, and should
/// still flush locally queued work on an explicit close.
///
/// # Example
///
/// ```rust
/// use sensoflow_types::{AttentionLevel, BackpressureAdvisory, LoadLevel};
///
/// let advisory = BackpressureAdvisory::builder()
///     .attention_level(AttentionLevel::High)
///     .system_load(LoadLevel::Elevated)
///     .recommended_batch_window(100)
///     .recommended_batch_size(1)
///     .load_multiplier(1.5)
///     .timestamp(1_703_160_000_000)
///     .build();
///
/// assert!(!advisory.should_pause());
/// assert_eq!(advisory.effective_batch_window(), 150);
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BackpressureAdvisory {
    /// Current attention level.
    pub attention_level: AttentionLevel,

    /// Current system load level.
    #[cfg_attr(feature = "serde", serde(default))]
    pub system_load: LoadLevel,

    /// Whether the node is shedding memory.
    #[cfg_attr(feature = "serde", serde(default))]
    pub memory_protection_active: bool,

    /// Whether the producer should pause sending data.
    #[cfg_attr(feature = "serde", serde(default))]
    pub paused: bool,

    /// Recommended time window between batch sends (ms).
    pub recommended_batch_window: u32,

    /// Recommended batch size.
    pub recommended_batch_size: u32,

    /// Load multiplier applied to the batch window.
    #[cfg_attr(feature = "serde", serde(default = "default_load_multiplier"))]
    pub load_multiplier: f32,

    /// Server timestamp when the advisory was generated (epoch ms).
    pub timestamp: i64,
}

#[cfg(feature = "serde")]
fn default_load_multiplier() -> f32 {
    1.0
}

impl Default for BackpressureAdvisory {
    fn default() -> Self {
        Self {
            attention_level: AttentionLevel::None,
            system_load: LoadLevel::Normal,
            memory_protection_active: false,
            paused: false,
            recommended_batch_window: 500,
            recommended_batch_size: 5,
            load_multiplier: 1.0,
            timestamp: 0,
        }
    }
}

impl BackpressureAdvisory {
    /// Create a builder for constructing advisories.
    pub fn builder() -> BackpressureAdvisoryBuilder {
        BackpressureAdvisoryBuilder::new()
    }

    /// The pause rule shared by server and clients.
    ///
    /// Low-interest pairs pause when memory protection is active or the
    /// node is critically loaded; medium and high interest never pause.
    pub fn pause_required(
        attention: AttentionLevel,
        load: LoadLevel,
        memory_protection_active: bool,
    ) -> bool {
        attention.is_pausable() && (memory_protection_active || load == LoadLevel::Critical)
    }

    /// Returns whether sending should be paused.
    pub fn should_pause(&self) -> bool {
        self.paused
    }

    /// Returns the effective batch window considering load.
    pub fn effective_batch_window(&self) -> u32 {
        (self.recommended_batch_window as f32 * self.load_multiplier) as u32
    }
}

/// Builder for [`BackpressureAdvisory`].
///
/// `paused` is derived from attention, load and memory protection unless
/// set explicitly.
#[derive(Debug, Default)]
pub struct BackpressureAdvisoryBuilder {
    attention_level: AttentionLevel,
    system_load: LoadLevel,
    memory_protection_active: bool,
    paused: Option<bool>,
    recommended_batch_window: Option<u32>,
    recommended_batch_size: Option<u32>,
    load_multiplier: Option<f32>,
    timestamp: Option<i64>,
}

impl BackpressureAdvisoryBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pair's aggregate attention.
    pub fn attention_level(mut self, level: AttentionLevel) -> Self {
        self.attention_level = level;
        self
    }

    /// Set the host load level.
    pub fn system_load(mut self, level: LoadLevel) -> Self {
        self.system_load = level;
        self
    }

    /// Mark memory protection as on or off.
    pub fn memory_protection_active(mut self, active: bool) -> Self {
        self.memory_protection_active = active;
        self
    }

    /// Override the derived pause decision.
    pub fn paused(mut self, paused: bool) -> Self {
        self.paused = Some(paused);
        self
    }

    /// Override the derived batch window, in milliseconds.
    pub fn recommended_batch_window(mut self, window_ms: u32) -> Self {
        self.recommended_batch_window = Some(window_ms);
        self
    }

    /// Override the derived batch size.
    pub fn recommended_batch_size(mut self, size: u32) -> Self {
        self.recommended_batch_size = Some(size);
        self
    }

    /// Override the derived load multiplier.
    pub fn load_multiplier(mut self, multiplier: f32) -> Self {
        self.load_multiplier = Some(multiplier);
        self
    }

    /// Set a specific timestamp (milliseconds since Unix epoch).
    pub fn timestamp(mut self, ts: i64) -> Self {
        self.timestamp = Some(ts);
        self
    }

    /// Build the advisory.
    pub fn build(self) -> BackpressureAdvisory {
        let defaults = BackpressureAdvisory::default();
        let paused = self.paused.unwrap_or_else(|| {
            BackpressureAdvisory::pause_required(
                self.attention_level,
                self.system_load,
                self.memory_protection_active,
            )
        });

        BackpressureAdvisory {
            attention_level: self.attention_level,
            system_load: self.system_load,
            memory_protection_active: self.memory_protection_active,
            paused,
            recommended_batch_window: self
                .recommended_batch_window
                .unwrap_or(defaults.recommended_batch_window),
            recommended_batch_size: self
                .recommended_batch_size
                .unwrap_or(defaults.recommended_batch_size),
            load_multiplier: self.load_multiplier.unwrap_or(defaults.load_multiplier),
            timestamp: self.timestamp.unwrap_or_else(default_timestamp),
        }
    }
}

#[cfg(feature = "std")]
fn default_timestamp() -> i64 {
    crate::current_timestamp_ms()
}

#[cfg(not(feature = "std"))]
fn default_timestamp() -> i64 {
    0
}
