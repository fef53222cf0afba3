use thiserror::Error;

/// Expected failure tiers of one goal run. Perception, Resolution and
/// Dispatch errors are absorbed where they occur and surfaced only as
/// control-surface telemetry; Planning (after fallbacks) and ErrorCeiling
/// are the two that reach the top-level state machine.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Perception failed: {0}")]
    Perception(String),

    #[error("Planning failed: {0}")]
    Planning(String),

    #[error("Action resolution failed: {0}")]
    Resolution(String),

    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    #[error("Consecutive failure ceiling reached ({0} errors)")]
    ErrorCeiling(u32),

    #[error("Control surface error: {0}")]
    ControlSurface(String),
}
