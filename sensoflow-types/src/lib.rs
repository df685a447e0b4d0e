//! # sensoflow-types
//!
//! Core value types shared by every layer of the sensoflow pipeline and by
//! the producers/consumers talking to it.
//!
//! ## Design Goals
//!
//! - **Zero required dependencies**: Core types work without any serialization framework
//! - **Optional serialization**: Enable the `serde` feature for JSON and friends
//! - **Ordered levels**: [`AttentionLevel`] and [`LoadLevel`] are totally ordered,
//!   so aggregation is just `max`
//! - **Stable wire payloads**: [`BackpressureAdvisory`] carries exactly the fields
//!   producers rely on
//!
//! ## Features
//!
//! - `std` (default): Standard library support (wall-clock timestamps)
//! - `serde`: serialization via serde, enum values rendered in lowercase
//!
//! ## Example
//!
//! ```rust
//! use sensoflow_types::{AttentionLevel, BackpressureAdvisory, LoadLevel};
//!
//! let advisory = BackpressureAdvisory::builder()
//!     .attention_level(AttentionLevel::Low)
//!     .system_load(LoadLevel::Critical)
//!     .recommended_batch_window(2000)
//!     .recommended_batch_size(10)
//!     .build();
//!
//! assert!(advisory.should_pause());
//! ```

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod advisory;
mod ids;
mod level;
mod measurement;
mod millis;

pub use advisory::*;
pub use ids::*;
pub use level::*;
pub use measurement::*;
pub use millis::*;

/// Get current timestamp in milliseconds since Unix epoch.
#[cfg(feature = "std")]
pub fn current_timestamp_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
