//! Error taxonomy for the serving core.
//!
//! Per-request errors (`DuplicateRequest`, `AdapterDisabled`,
//! `RequestValidation`) are routed to a single stream. Engine-wide errors
//! (`StepFailure`, `IterationTimeout`, `InvariantViolation`, `EngineDead`)
//! latch the supervisor's errored flag and fan out to every live stream.

use std::time::Duration;

use crate::ids::RequestId;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    #[error("duplicate request id: {0}")]
    DuplicateRequest(RequestId),

    #[error("adapter disabled for this request")]
    AdapterDisabled,

    #[error("request validation failed: {0}")]
    RequestValidation(String),

    #[error("engine step failed: {0}")]
    StepFailure(String),

    #[error("engine iteration exceeded timeout of {0:?}")]
    IterationTimeout(Duration),

    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),

    #[error("request canceled")]
    Cancelled,

    #[error("engine background loop is not running")]
    EngineDead,
}

impl CoreError {
    /// Whether this error is a whole-engine failure that must be latched
    /// and fanned out to every live stream, rather than routed to one.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoreError::StepFailure(_)
                | CoreError::IterationTimeout(_)
                | CoreError::InvariantViolation(_)
                | CoreError::EngineDead
        )
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
