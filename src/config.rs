use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::ProbeError;
use crate::orchestrator::{OrchestratorConfig, DEFAULT_GRACE_PERIOD};
use crate::primitives::DEFAULT_ECHO_TIMEOUT;
use crate::types::{
    port_from_raw, ProbeParameters, DEFAULT_PING_COUNT, DEFAULT_PORT, DEFAULT_PORT_TIMEOUT,
};

/// Settings file. Every field is optional in the JSON; missing ones take defaults.
/// `"port": null` disables the port check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub ping_count: u32,
    pub port: Option<u32>,
    pub port_timeout_ms: u64,
    pub ping_timeout_ms: u64,
    pub grace_ms: u64,
    pub max_concurrency: Option<usize>,
    pub bind: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ping_count: DEFAULT_PING_COUNT,
            port: Some(u32::from(DEFAULT_PORT)),
            port_timeout_ms: DEFAULT_PORT_TIMEOUT.as_millis() as u64,
            ping_timeout_ms: DEFAULT_ECHO_TIMEOUT.as_millis() as u64,
            grace_ms: DEFAULT_GRACE_PERIOD.as_millis() as u64,
            max_concurrency: None,
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("invalid config file: {}", path.display()))
    }

    /// Load `path` if given, defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load_from_path(p),
            None => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), content)
            .with_context(|| format!("failed to write config file: {}", path.as_ref().display()))
    }

    /// Per-batch parameters derived from this configuration.
    pub fn probe_parameters(&self) -> Result<ProbeParameters, ProbeError> {
        let port = self.port.map(port_from_raw).transpose()?;
        let params = ProbeParameters::new(
            self.ping_count,
            port,
            Duration::from_millis(self.port_timeout_ms),
        );
        params.validate()?;
        Ok(params)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            grace_period: Duration::from_millis(self.grace_ms),
            max_concurrency: self.max_concurrency.filter(|n| *n > 0),
        }
    }

    pub fn echo_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms.max(1))
    }
}
