use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ProbeError;

/// Default number of ICMP echo requests per target.
pub const DEFAULT_PING_COUNT: u32 = 4;
/// Default TCP port checked alongside the ping.
pub const DEFAULT_PORT: u16 = 23;
/// Default TCP connect timeout.
pub const DEFAULT_PORT_TIMEOUT: Duration = Duration::from_secs(3);
/// Upper bound on echo requests per target; ICMP sequence numbers are 16 bits wide.
pub const MAX_PING_COUNT: u32 = u16::MAX as u32;

/// A host identifier (address or name). Case-preserved; used as the registry key.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Target(String);

impl Target {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Target {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Target {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Immutable per-batch probe configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProbeParameters {
    pub ping_count: u32,
    /// `None` disables the port check.
    pub port: Option<u16>,
    #[serde(with = "duration_ms")]
    pub port_timeout: Duration,
}

impl Default for ProbeParameters {
    fn default() -> Self {
        Self {
            ping_count: DEFAULT_PING_COUNT,
            port: Some(DEFAULT_PORT),
            port_timeout: DEFAULT_PORT_TIMEOUT,
        }
    }
}

impl ProbeParameters {
    pub fn new(ping_count: u32, port: Option<u16>, port_timeout: Duration) -> Self {
        Self {
            ping_count,
            port,
            port_timeout,
        }
    }

    /// Reject parameters a batch cannot run with.
    pub fn validate(&self) -> Result<(), ProbeError> {
        if self.ping_count == 0 {
            return Err(ProbeError::InvalidParameters(
                "ping count must be at least 1".into(),
            ));
        }
        if self.ping_count > MAX_PING_COUNT {
            return Err(ProbeError::InvalidParameters(format!(
                "ping count must be at most {MAX_PING_COUNT}"
            )));
        }
        if self.port == Some(0) {
            return Err(ProbeError::InvalidParameters(
                "port must be in range 1-65535".into(),
            ));
        }
        if self.port.is_some() && self.port_timeout.is_zero() {
            return Err(ProbeError::InvalidParameters(
                "port timeout must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Range-check a raw port number coming from an untyped surface (HTTP, config file).
pub fn port_from_raw(raw: u32) -> Result<u16, ProbeError> {
    match u16::try_from(raw) {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(ProbeError::InvalidParameters(format!(
            "port out of range: {raw} (expected 1-65535)"
        ))),
    }
}

/// Statistics record returned by the ping primitive.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct PingStats {
    pub avg_latency_ms: f64,
    pub packet_loss_pct: f64,
    pub transmitted: u32,
    pub received: u32,
}

/// Success record returned by the port-check primitive.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct PortCheck {
    pub connected: bool,
    pub elapsed_ms: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PingOutcome {
    Measured {
        avg_latency_ms: f64,
        /// Unrounded; in `[0, 100]`.
        packet_loss_pct: f64,
    },
    Failed {
        reason: String,
    },
}

impl PingOutcome {
    pub fn from_stats(stats: &PingStats) -> Self {
        PingOutcome::Measured {
            avg_latency_ms: stats.avg_latency_ms,
            packet_loss_pct: stats.packet_loss_pct,
        }
    }

    /// Loss percentage rounded to whole percent, for display only.
    pub fn loss_display(&self) -> Option<f64> {
        match self {
            PingOutcome::Measured {
                packet_loss_pct, ..
            } => Some(packet_loss_pct.round()),
            PingOutcome::Failed { .. } => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PortOutcome {
    Open { response_time_ms: f64 },
    Closed { reason: String },
    TimedOut,
    Skipped,
}

/// Combined result for one target, or a task-level failure.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Probed {
        target: Target,
        ping: PingOutcome,
        port: PortOutcome,
        completed_at: String,
    },
    TaskError {
        target: Target,
        message: String,
        completed_at: String,
    },
}

impl ProbeOutcome {
    pub fn target(&self) -> &Target {
        match self {
            ProbeOutcome::Probed { target, .. } | ProbeOutcome::TaskError { target, .. } => target,
        }
    }

    pub fn is_task_error(&self) -> bool {
        matches!(self, ProbeOutcome::TaskError { .. })
    }
}

/// Lifecycle of a registered task.
///
/// `Idle -> Running -> {Completed, Cancelled, TaskErrored} -> Removed`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Idle,
    Running,
    Completed,
    Cancelled,
    TaskErrored,
    Removed,
}

impl TaskState {
    pub fn is_terminal_run_state(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Cancelled | TaskState::TaskErrored
        )
    }
}

/// Returned by a successful `start_batch`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BatchStarted {
    pub batch_id: u64,
    pub total: usize,
    pub targets: Vec<Target>,
    pub params: ProbeParameters,
}

/// Point-in-time view of the running batch.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchStatus {
    pub batch_id: u64,
    pub total: usize,
    pub pending: usize,
    pub completed: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub batch_id: u64,
    pub total: usize,
}

/// Channel form of the result sink callbacks.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ProbeEvent {
    BatchStarted(BatchStarted),
    Outcome { batch_id: u64, outcome: ProbeOutcome },
    BatchComplete(BatchSummary),
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
