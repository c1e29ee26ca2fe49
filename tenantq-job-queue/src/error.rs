//! Error types for the job queue system.

use std::time::Duration;

use thiserror::Error;

use crate::types::{JobId, TenantId};

/// Errors that may occur while interacting with the job queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job store error: {0}")]
    Storage(String),

    #[error("tenant not found: {0}")]
    TenantNotFound(TenantId),

    #[error("tenant connection failed: {0}")]
    Connection(String),

    #[error("job handler failed: {message}")]
    Handler { message: String, retryable: bool },

    #[error("job timed out after {0:?}")]
    Timeout(Duration),

    #[error("no handler registered for job type {0}")]
    UnknownJobType(String),

    #[error("invalid job payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unknown queue connection: {0}")]
    UnknownConnection(String),

    #[error("unsupported queue driver: {0}")]
    UnsupportedDriver(String),

    #[error("invalid queue configuration: {0}")]
    InvalidConfig(String),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("lease expired with no attempts left ({0} made)")]
    LeaseExhausted(u32),
}

impl QueueError {
    /// Whether another attempt at the same job could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(_)
            | Self::TenantNotFound(_)
            | Self::Connection(_)
            | Self::Timeout(_)
            | Self::UnknownJobType(_) => true,
            Self::Handler { retryable, .. } => *retryable,
            Self::Serialization(_)
            | Self::UnknownConnection(_)
            | Self::UnsupportedDriver(_)
            | Self::InvalidConfig(_)
            | Self::NotFound(_)
            | Self::LeaseExhausted(_) => false,
        }
    }
}
