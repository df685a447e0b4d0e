//! Discrete attention and load classifications.

use core::fmt;

/// How closely viewers are watching a `(sensor, attribute)` pair.
///
/// The order is total and meaningful: when several views target the same
/// pair the highest level wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum AttentionLevel {
    /// No active viewers - minimal updates needed.
    #[default]
    None,
    /// Low attention - slower updates acceptable.
    Low,
    /// Medium attention - normal updates.
    Medium,
    /// High attention - fast updates needed.
    High,
}

impl AttentionLevel {
    /// All levels, lowest first.
    pub const ALL: [AttentionLevel; 4] = [
        AttentionLevel::None,
        AttentionLevel::Low,
        AttentionLevel::Medium,
        AttentionLevel::High,
    ];

    /// Levels that have a routing shard (everything except `None`).
    pub const SHARDED: [AttentionLevel; 3] =
        [AttentionLevel::High, AttentionLevel::Medium, AttentionLevel::Low];

    /// Dense index, usable for per-level arrays.
    pub const fn index(&self) -> usize {
        match self {
            AttentionLevel::None => 0,
            AttentionLevel::Low => 1,
            AttentionLevel::Medium => 2,
            AttentionLevel::High => 3,
        }
    }

    /// Inverse of [`AttentionLevel::index`], saturating at `High`.
    pub const fn from_index(index: usize) -> Self {
        match index {
            0 => AttentionLevel::None,
            1 => AttentionLevel::Low,
            2 => AttentionLevel::Medium,
            _ => AttentionLevel::High,
        }
    }

    /// Apply an optional device-energy ceiling.
    pub fn capped(self, ceiling: Option<AttentionLevel>) -> Self {
        match ceiling {
            Some(ceiling) => self.min(ceiling),
            None => self,
        }
    }

    /// Whether this level is low enough to be paused under pressure.
    pub const fn is_pausable(&self) -> bool {
        matches!(self, AttentionLevel::None | AttentionLevel::Low)
    }

    /// Lowercase name used on the wire.
    pub const fn as_str(&self) -> &'static str {
        match self {
            AttentionLevel::None => "none",
            AttentionLevel::Low => "low",
            AttentionLevel::Medium => "medium",
            AttentionLevel::High => "high",
        }
    }
}

impl fmt::Display for AttentionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource pressure on the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum LoadLevel {
    /// System running smoothly.
    #[default]
    Normal,
    /// Moderate load.
    Elevated,
    /// Heavy load.
    High,
    /// System overloaded.
    Critical,
}

impl LoadLevel {
    /// All levels, least loaded first.
    pub const ALL: [LoadLevel; 4] = [
        LoadLevel::Normal,
        LoadLevel::Elevated,
        LoadLevel::High,
        LoadLevel::Critical,
    ];

    /// Dense index, usable for per-level arrays.
    pub const fn index(&self) -> usize {
        match self {
            LoadLevel::Normal => 0,
            LoadLevel::Elevated => 1,
            LoadLevel::High => 2,
            LoadLevel::Critical => 3,
        }
    }

    /// Inverse of [`LoadLevel::index`], saturating at `Critical`.
    pub const fn from_index(index: usize) -> Self {
        match index {
            0 => LoadLevel::Normal,
            1 => LoadLevel::Elevated,
            2 => LoadLevel::High,
            _ => LoadLevel::Critical,
        }
    }

    /// Lowercase name used on the wire.
    pub const fn as_str(&self) -> &'static str {
        match self {
            LoadLevel::Normal => "normal",
            LoadLevel::Elevated => "elevated",
            LoadLevel::High => "high",
            LoadLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for LoadLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
