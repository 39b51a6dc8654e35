use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use time::{format_description::well_known, OffsetDateTime};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::PortCheckError;
use crate::primitives::{PingerHandle, PortCheckerHandle};
use crate::types::{PingOutcome, PortOutcome, ProbeOutcome, ProbeParameters, Target};

/// What a finished task hands back to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskReport {
    /// A combined outcome or a task error.
    Reported(ProbeOutcome),
    /// Cancelled at some boundary; nothing is emitted for this target.
    Silent,
}

/// Ping + port check for a single target.
///
/// Cancellation is observed before the ping, before the port check and before the
/// outcome is built. The primitives themselves are not interrupted.
pub struct ProbeTask {
    target: Target,
    params: Arc<ProbeParameters>,
    cancel: CancellationToken,
    pinger: PingerHandle,
    checker: PortCheckerHandle,
    limiter: Option<Arc<Semaphore>>,
}

impl ProbeTask {
    pub fn new(
        target: Target,
        params: Arc<ProbeParameters>,
        cancel: CancellationToken,
        pinger: PingerHandle,
        checker: PortCheckerHandle,
    ) -> Self {
        Self {
            target,
            params,
            cancel,
            pinger,
            checker,
            limiter: None,
        }
    }

    /// Wait for a permit from `limiter` before doing any work.
    pub fn with_limiter(mut self, limiter: Option<Arc<Semaphore>>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Run to completion. A panic anywhere in the probe becomes `TaskError`
    /// unless the task was cancelled in the meantime.
    pub async fn run(self) -> TaskReport {
        let target = self.target.clone();
        let cancel = self.cancel.clone();

        match AssertUnwindSafe(self.probe()).catch_unwind().await {
            Ok(Some(outcome)) if !cancel.is_cancelled() => TaskReport::Reported(outcome),
            Ok(_) => {
                debug!(host = %target, "probe cancelled");
                TaskReport::Silent
            }
            Err(_) if cancel.is_cancelled() => TaskReport::Silent,
            Err(payload) => TaskReport::Reported(ProbeOutcome::TaskError {
                target,
                message: panic_message(payload.as_ref()),
                completed_at: now_rfc3339(),
            }),
        }
    }

    async fn probe(self) -> Option<ProbeOutcome> {
        let _permit = match &self.limiter {
            Some(sem) => tokio::select! {
                permit = sem.clone().acquire_owned() => Some(permit.ok()?),
                _ = self.cancel.cancelled() => return None,
            },
            None => None,
        };

        if self.cancel.is_cancelled() {
            return None;
        }

        let target = self.target.as_str();
        let ping = if self.params.ping_count > 0 {
            match self.pinger.ping(target, self.params.ping_count).await {
                Ok(stats) => PingOutcome::from_stats(&stats),
                Err(e) => {
                    debug!(host = %target, error = %e, "ping failed");
                    PingOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
            }
        } else {
            PingOutcome::Failed {
                reason: "no echo requests sent".into(),
            }
        };

        if self.cancel.is_cancelled() {
            return None;
        }

        let port = match self.params.port {
            None => PortOutcome::Skipped,
            Some(port) => {
                match self
                    .checker
                    .check(target, port, self.params.port_timeout)
                    .await
                {
                    Ok(c) if c.connected => PortOutcome::Open {
                        response_time_ms: c.elapsed_ms,
                    },
                    Ok(_) => PortOutcome::Closed {
                        reason: "not connected".into(),
                    },
                    Err(PortCheckError::TimedOut) => PortOutcome::TimedOut,
                    Err(PortCheckError::ConnectionRefused(reason))
                    | Err(PortCheckError::Other(reason)) => PortOutcome::Closed { reason },
                }
            }
        };

        if self.cancel.is_cancelled() {
            return None;
        }

        Some(ProbeOutcome::Probed {
            target: self.target.clone(),
            ping,
            port,
            completed_at: now_rfc3339(),
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("probe panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("probe panicked: {s}")
    } else {
        "probe panicked".to_string()
    }
}

pub(crate) fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
