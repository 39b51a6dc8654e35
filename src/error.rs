use thiserror::Error;

/// Input errors rejected synchronously by `Orchestrator::start_batch`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("target set is empty")]
    EmptyTargetSet,

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("invalid target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },
}

/// Defined failures of the ping primitive. Reported as `PingOutcome::Failed`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PingError {
    #[error("could not resolve '{target}'")]
    Resolve { target: String },

    #[error("icmp socket unavailable: {0}")]
    Socket(String),

    #[error("ping failed: {0}")]
    Failed(String),
}

/// Defined failures of the port-check primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortCheckError {
    #[error("connect timed out")]
    TimedOut,

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("{0}")]
    Other(String),
}
