#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use pingport_rs::error::{PingError, PortCheckError};
use pingport_rs::orchestrator::{Orchestrator, OrchestratorConfig};
use pingport_rs::primitives::{Pinger, PortChecker};
use pingport_rs::types::{BatchSummary, PingStats, PortCheck, ProbeEvent, ProbeOutcome};

/// Pinger with per-target scripted results. It sleeps for `delay` and never
/// looks at cancellation, so a stop has to abort it.
#[derive(Default)]
pub struct ScriptedPinger {
    pub delay: Duration,
    pub stats: HashMap<String, PingStats>,
    pub failures: HashSet<String>,
    pub panics: HashSet<String>,
    pub calls: AtomicUsize,
    active: Mutex<HashMap<String, usize>>,
    active_total: AtomicUsize,
    pub max_per_target: AtomicUsize,
    pub max_total: AtomicUsize,
}

struct ActiveGuard<'a> {
    pinger: &'a ScriptedPinger,
    target: String,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        if let Some(n) = self.pinger.active.lock().get_mut(&self.target) {
            *n -= 1;
        }
        self.pinger.active_total.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedPinger {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn reply(mut self, target: &str, avg_latency_ms: f64, packet_loss_pct: f64) -> Self {
        let received = ((100.0 - packet_loss_pct) / 25.0).round() as u32;
        self.stats.insert(
            target.to_string(),
            PingStats {
                avg_latency_ms,
                packet_loss_pct,
                transmitted: 4,
                received,
            },
        );
        self
    }

    pub fn failing(mut self, target: &str) -> Self {
        self.failures.insert(target.to_string());
        self
    }

    pub fn panicking(mut self, target: &str) -> Self {
        self.panics.insert(target.to_string());
        self
    }

    /// Probes currently inside `ping`.
    pub fn active(&self) -> usize {
        self.active_total.load(Ordering::SeqCst)
    }

    fn enter(&self, target: &str) -> ActiveGuard<'_> {
        let per_target = {
            let mut map = self.active.lock();
            let n = map.entry(target.to_string()).or_insert(0);
            *n += 1;
            *n
        };
        self.max_per_target.fetch_max(per_target, Ordering::SeqCst);
        let total = self.active_total.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_total.fetch_max(total, Ordering::SeqCst);
        ActiveGuard {
            pinger: self,
            target: target.to_string(),
        }
    }
}

#[async_trait]
impl Pinger for ScriptedPinger {
    async fn ping(&self, target: &str, count: u32) -> Result<PingStats, PingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _guard = self.enter(target);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.panics.contains(target) {
            panic!("scripted panic for {target}");
        }
        if self.failures.contains(target) {
            return Err(PingError::Failed("request timed out".into()));
        }
        Ok(self.stats.get(target).copied().unwrap_or(PingStats {
            avg_latency_ms: 1.0,
            packet_loss_pct: 0.0,
            transmitted: count,
            received: count,
        }))
    }
}

/// Port checker that reports the listed targets open, with a scripted connect
/// time, and refuses the rest.
#[derive(Default)]
pub struct ScriptedChecker {
    pub delay: Duration,
    pub open: HashMap<String, f64>,
    pub calls: AtomicUsize,
}

impl ScriptedChecker {
    pub fn with_open(self, target: &str) -> Self {
        self.with_open_after(target, 2.0)
    }

    pub fn with_open_after(mut self, target: &str, elapsed_ms: f64) -> Self {
        self.open.insert(target.to_string(), elapsed_ms);
        self
    }
}

#[async_trait]
impl PortChecker for ScriptedChecker {
    async fn check(
        &self,
        target: &str,
        _port: u16,
        _timeout: Duration,
    ) -> Result<PortCheck, PortCheckError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(&elapsed_ms) = self.open.get(target) {
            Ok(PortCheck {
                connected: true,
                elapsed_ms,
            })
        } else {
            Err(PortCheckError::ConnectionRefused("connection refused".into()))
        }
    }
}

pub fn config(grace: Duration) -> OrchestratorConfig {
    OrchestratorConfig {
        grace_period: grace,
        max_concurrency: None,
    }
}

pub fn build(
    pinger: Arc<ScriptedPinger>,
    checker: Arc<ScriptedChecker>,
    config: OrchestratorConfig,
) -> (Orchestrator, mpsc::UnboundedReceiver<ProbeEvent>) {
    Orchestrator::with_channel(pinger, checker, config)
}

/// Receive events until a `BatchComplete` arrives (or 10 s pass).
pub async fn collect_batch(
    rx: &mut mpsc::UnboundedReceiver<ProbeEvent>,
) -> (Vec<(u64, ProbeOutcome)>, Option<BatchSummary>) {
    let mut outcomes = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(ProbeEvent::Outcome { batch_id, outcome })) => outcomes.push((batch_id, outcome)),
            Ok(Some(ProbeEvent::BatchComplete(s))) => return (outcomes, Some(s)),
            Ok(Some(ProbeEvent::BatchStarted(_))) => {}
            Ok(None) | Err(_) => return (outcomes, None),
        }
    }
}

/// Everything currently queued, without waiting.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<ProbeEvent>) -> Vec<ProbeEvent> {
    let mut out = Vec::new();
    while let Ok(e) = rx.try_recv() {
        out.push(e);
    }
    out
}
