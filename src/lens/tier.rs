//! Flush quality tiers.

use std::time::Duration;

use sensoflow_types::LoadLevel;
use serde::Serialize;

use crate::config::TierPeriods;

/// How often a consumer buffer is flushed, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    /// ~30 flushes per second.
    #[default]
    Realtime,
    /// ~20 flushes per second.
    Smooth,
    /// ~10 flushes per second.
    Reduced,
    /// ~5 flushes per second.
    Minimal,
    /// No flushes until resumed or closed.
    Paused,
}

impl QualityTier {
    /// Flush period, or `None` when paused.
    pub fn period(&self, periods: &TierPeriods) -> Option<Duration> {
        let ms = match self {
            QualityTier::Realtime => periods.realtime_ms,
            QualityTier::Smooth => periods.smooth_ms,
            QualityTier::Reduced => periods.reduced_ms,
            QualityTier::Minimal => periods.minimal_ms,
            QualityTier::Paused => return None,
        };
        Some(Duration::from_millis(ms.max(1)))
    }

    /// Best tier allowed at a load level.
    pub fn floor_for(load: LoadLevel) -> Self {
        match load {
            LoadLevel::Normal => QualityTier::Realtime,
            LoadLevel::Elevated => QualityTier::Smooth,
            LoadLevel::High => QualityTier::Reduced,
            LoadLevel::Critical => QualityTier::Minimal,
        }
    }

    /// One step worse, stopping at `Minimal`.
    pub fn degrade(self) -> Self {
        match self {
            QualityTier::Realtime => QualityTier::Smooth,
            QualityTier::Smooth => QualityTier::Reduced,
            QualityTier::Reduced | QualityTier::Minimal => QualityTier::Minimal,
            QualityTier::Paused => QualityTier::Paused,
        }
    }

    /// One step better, never above `floor`.
    pub fn recover(self, floor: QualityTier) -> Self {
        let better = match self {
            QualityTier::Realtime | QualityTier::Smooth => QualityTier::Realtime,
            QualityTier::Reduced => QualityTier::Smooth,
            QualityTier::Minimal => QualityTier::Reduced,
            QualityTier::Paused => QualityTier::Paused,
        };
        better.max(floor)
    }

    pub(crate) fn to_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => QualityTier::Realtime,
            1 => QualityTier::Smooth,
            2 => QualityTier::Reduced,
            3 => QualityTier::Minimal,
            _ => QualityTier::Paused,
        }
    }
}

/// Next active tier given the load floor and the sink's fill ratio.
pub fn next_tier(
    current: QualityTier,
    floor: QualityTier,
    fill: f64,
    degrade_fill: f64,
    recover_fill: f64,
) -> QualityTier {
    let tier = current.max(floor);
    if fill >= degrade_fill {
        tier.degrade()
    } else if fill <= recover_fill {
        tier.recover(floor)
    } else {
        tier
    }
}
