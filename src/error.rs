//! Error types for the pipeline.

use sensoflow_types::ConsumerId;
use thiserror::Error;

/// Errors surfaced by the pipeline's public operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The configuration could not be loaded or deserialized.
    #[error("Failed to load configuration: {0}")]
    Config(#[from] config::ConfigError),

    /// The configuration loaded but violates a constraint.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The consumer was never attached or has already been detached.
    #[error("Unknown consumer: {0}")]
    UnknownConsumer(ConsumerId),

    /// The pipeline has been shut down.
    #[error("Pipeline is closed")]
    Closed,
}

/// Errors a controller may return instead of a factor.
///
/// The pipeline treats every variant the same way: the controller
/// contributes a neutral factor of `1.0` and the failure is logged.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ControllerError {
    /// Not enough history to produce a meaningful factor.
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    /// The computation produced NaN or infinity.
    #[error("Non-finite factor from {0}")]
    NonFinite(&'static str),

    /// The controller is disabled or its inputs are missing.
    #[error("Controller unavailable: {0}")]
    Unavailable(String),
}
