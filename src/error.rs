//! Error types for the face analytics cascade

use thiserror::Error;

/// Errors raised by an inference backend
#[derive(Error, Debug)]
pub enum BackendError {
    /// The request or model has no tensor with this name
    #[error("no tensor named '{0}'")]
    UnknownTensor(String),

    /// A tensor was read with the wrong element type
    #[error("tensor '{name}' holds {actual} data, {expected} was requested")]
    ElementType {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// Outputs were requested while an asynchronous run is still in flight
    #[error("request is still running")]
    Busy,

    /// Failure reported by the underlying runtime
    #[error(transparent)]
    Runtime(#[from] anyhow::Error),
}

/// Main error type for the cascade
#[derive(Error, Debug)]
pub enum CascadeError {
    /// The bound model does not match the tensor layout a stage requires
    #[error("{stage}: {reason}")]
    ContractViolation { stage: &'static str, reason: String },

    /// A result was requested outside the last submitted batch
    #[error("{stage}: result index {index} is outside the submitted batch of {len}")]
    IndexOutOfRange {
        stage: &'static str,
        index: usize,
        len: usize,
    },

    /// More faces were enqueued than the stage batch can hold
    #[error("number of detected faces more than maximum ({max_batch}) processed by {stage}")]
    CapacityExceeded { stage: &'static str, max_batch: usize },

    /// Latency lookup for a stage that was never started
    #[error("no timer with name '{0}'")]
    UnknownStage(String),

    /// The stage has a model path but was never bound to a backend
    #[error("{0} is not bound to an inference backend")]
    NotBound(&'static str),

    /// Results were read before `wait` completed an asynchronous submit
    #[error("{0}: results are not ready, wait for the request first")]
    ResultsPending(&'static str),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl CascadeError {
    pub fn contract(stage: &'static str, reason: impl Into<String>) -> Self {
        CascadeError::ContractViolation {
            stage,
            reason: reason.into(),
        }
    }

    /// Whether this error describes a model/stage contract mismatch
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, CascadeError::ContractViolation { .. })
    }
}

/// Convenience Result type for cascade operations
pub type Result<T> = std::result::Result<T, CascadeError>;
