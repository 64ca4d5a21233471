//! Error taxonomy for the pipeline.
//!
//! The receiver never surfaces any of these over HTTP (the webhook ack is
//! always 200-empty); they exist so fan-out and worker code can tell apart
//! "drop it", "retry it", and "same outcome on retry".

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessError {
    /// Malformed body, bad signature, missing order SN. The event is dropped.
    #[error("validation error: {0}")]
    Validation(String),

    /// HTTP timeout, connection refused, DNS failure. Retryable where the
    /// calling policy allows it.
    #[error("transport error: {0}")]
    Transport(String),

    /// The upstream API answered with its own error envelope. Retrying locally
    /// would hit the same response.
    #[error("upstream api error: {0}")]
    UpstreamDomain(String),

    /// Redis unreachable or timed out. Feeds the circuit breaker.
    #[error("broker error: {0}")]
    Broker(String),
}

impl ProcessError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::UpstreamDomain(msg.into())
    }
}

impl From<reqwest::Error> for ProcessError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<redis::RedisError> for ProcessError {
    fn from(err: redis::RedisError) -> Self {
        Self::Broker(err.to_string())
    }
}

pub type ProcessResult<T> = Result<T, ProcessError>;
