//! The two black-box probe primitives and their production implementations.
//!
//! Both return defined failures as `Err` values; the probe task turns those into
//! outcome data. Neither implementation observes cancellation: the orchestrator
//! aborts the surrounding task when a stop request outlives the grace period.

use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use surge_ping::{Client, Config, IcmpPacket, PingIdentifier, PingSequence, ICMP};
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tracing::debug;

use crate::error::{PingError, PortCheckError};
use crate::types::{PingStats, PortCheck};

/// Default per-echo reply timeout.
pub const DEFAULT_ECHO_TIMEOUT: Duration = Duration::from_secs(1);
const ECHO_INTERVAL: Duration = Duration::from_millis(200);
const ECHO_PAYLOAD_LEN: usize = 56;

#[async_trait]
pub trait Pinger: Send + Sync {
    /// Send `count` echo requests to `target` and summarize the replies.
    async fn ping(&self, target: &str, count: u32) -> Result<PingStats, PingError>;
}

#[async_trait]
pub trait PortChecker: Send + Sync {
    /// Attempt one TCP connect to `target:port`, bounded by `timeout`.
    /// The socket is closed before this returns.
    async fn check(
        &self,
        target: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<PortCheck, PortCheckError>;
}

pub type PingerHandle = Arc<dyn Pinger>;
pub type PortCheckerHandle = Arc<dyn PortChecker>;

/// ICMP echo pinger backed by `surge-ping`.
#[derive(Debug, Clone)]
pub struct IcmpPinger {
    echo_timeout: Duration,
    interval: Duration,
}

impl IcmpPinger {
    pub fn new(echo_timeout: Duration) -> Self {
        Self {
            echo_timeout,
            interval: ECHO_INTERVAL,
        }
    }
}

impl Default for IcmpPinger {
    fn default() -> Self {
        Self::new(DEFAULT_ECHO_TIMEOUT)
    }
}

#[async_trait]
impl Pinger for IcmpPinger {
    async fn ping(&self, target: &str, count: u32) -> Result<PingStats, PingError> {
        let ip = resolve_host(target)
            .await
            .ok_or_else(|| PingError::Resolve {
                target: target.to_string(),
            })?;

        let config = match ip {
            IpAddr::V4(_) => Config::default(),
            IpAddr::V6(_) => Config::builder().kind(ICMP::V6).build(),
        };
        let client = Client::new(&config).map_err(|e| PingError::Socket(e.to_string()))?;
        let mut pinger = client.pinger(ip, next_identifier()).await;
        pinger.timeout(self.echo_timeout);

        let payload = [0u8; ECHO_PAYLOAD_LEN];
        let mut totals = EchoTotals::default();
        for seq in 0..count {
            if seq > 0 {
                time::sleep(self.interval).await;
            }
            // count is capped at MAX_PING_COUNT, so the sequence number never wraps
            match pinger.ping(PingSequence(seq as u16), &payload).await {
                Ok((IcmpPacket::V4(_), rtt)) | Ok((IcmpPacket::V6(_), rtt)) => totals.record(rtt),
                Err(e) => debug!(host = %target, seq, error = %e, "echo lost"),
            }
        }

        Ok(totals.stats(count))
    }
}

/// Running reply totals for one ping run.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct EchoTotals {
    received: u32,
    sum_ms: f64,
}

impl EchoTotals {
    pub(crate) fn record(&mut self, rtt: Duration) {
        self.received += 1;
        self.sum_ms += rtt.as_secs_f64() * 1000.0;
    }

    /// Average is over received replies only.
    pub(crate) fn stats(&self, transmitted: u32) -> PingStats {
        let avg_latency_ms = if self.received == 0 {
            0.0
        } else {
            self.sum_ms / f64::from(self.received)
        };
        let packet_loss_pct = if transmitted == 0 {
            0.0
        } else {
            f64::from(transmitted.saturating_sub(self.received)) / f64::from(transmitted) * 100.0
        };
        PingStats {
            avg_latency_ms,
            packet_loss_pct,
            transmitted,
            received: self.received,
        }
    }
}

fn next_identifier() -> PingIdentifier {
    static NEXT: AtomicU16 = AtomicU16::new(1);
    PingIdentifier(NEXT.fetch_add(1, Ordering::Relaxed))
}

/// Strip a trailing `:port` and anything that cannot appear in a hostname.
fn sanitize_hostname(hostname: &str) -> Option<String> {
    let hostname = hostname.split(':').next().unwrap_or(hostname);
    let sanitized: String = hostname
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '.' || *c == '-')
        .collect();
    if sanitized.is_empty() {
        None
    } else {
        Some(sanitized)
    }
}

async fn resolve_host(target: &str) -> Option<IpAddr> {
    if let Ok(ip) = target.parse::<IpAddr>() {
        return Some(ip);
    }
    let host = sanitize_hostname(target)?;
    let ip = match tokio::net::lookup_host((host.as_str(), 0)).await {
        Ok(mut addrs) => addrs.next().map(|a| a.ip()),
        Err(e) => {
            debug!(host = %target, error = %e, "resolve failed");
            None
        }
    };
    ip
}

/// Plain TCP connect checker.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpPortChecker;

#[async_trait]
impl PortChecker for TcpPortChecker {
    async fn check(
        &self,
        target: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<PortCheck, PortCheckError> {
        let deadline = Instant::now() + timeout;

        let addr = match time::timeout_at(deadline, resolve_socket_addr(target, port)).await {
            Ok(Ok(addr)) => addr,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(PortCheckError::TimedOut),
        };

        let start = Instant::now();
        match time::timeout_at(deadline, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
                drop(stream);
                Ok(PortCheck {
                    connected: true,
                    elapsed_ms,
                })
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                Err(PortCheckError::ConnectionRefused(e.to_string()))
            }
            Ok(Err(e)) => Err(PortCheckError::Other(e.to_string())),
            Err(_) => Err(PortCheckError::TimedOut),
        }
    }
}

async fn resolve_socket_addr(target: &str, port: u16) -> Result<SocketAddr, PortCheckError> {
    if let Ok(ip) = target.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    let mut addrs = tokio::net::lookup_host((target, port))
        .await
        .map_err(|e| PortCheckError::Other(format!("resolve failed: {e}")))?;
    addrs
        .next()
        .ok_or_else(|| PortCheckError::Other(format!("no address for {target}")))
}
