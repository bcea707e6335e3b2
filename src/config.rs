//! Sandbox configuration and host environment capture.
//!
//! Environment variables are read exactly once into a [`RuntimeEnv`] and
//! passed explicitly from there on; nothing in the crate re-reads the
//! process environment mid-flight.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Port the in-guest agent (envd) listens on.
pub const ENVD_PORT: u16 = 49983;

/// Default bound on the guest-agent handshake.
pub const DEFAULT_ENVD_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-sandbox request configuration, owned by the scheduler above us.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub sandbox_id: String,
    pub template_id: String,
    pub build_id: String,
    pub team_id: String,
    pub kernel_version: String,
    pub hypervisor_version: String,
    pub huge_pages: bool,
    /// Guest agent version; decides which handshake protocol applies.
    pub envd_version: String,
    /// Environment uploaded to the guest during the new-protocol handshake.
    pub env_vars: HashMap<String, String>,
}

/// Host environment captured once at init.
#[derive(Debug, Clone)]
pub struct RuntimeEnv {
    /// Bound on the guest-agent handshake (`ENVD_TIMEOUT`).
    pub envd_timeout: Duration,
    /// Guest agent port; fixed in production, overridable in tests.
    pub envd_port: u16,
    /// Passed through to the guest via MMDS (`LOGS_COLLECTOR_PUBLIC_IP`).
    pub logs_collector_ip: String,
}

impl Default for RuntimeEnv {
    fn default() -> Self {
        Self {
            envd_timeout: DEFAULT_ENVD_TIMEOUT,
            envd_port: ENVD_PORT,
            logs_collector_ip: String::new(),
        }
    }
}

impl RuntimeEnv {
    /// Reads `ENVD_TIMEOUT` and `LOGS_COLLECTOR_PUBLIC_IP` from the process
    /// environment. A malformed timeout is an error, not a silent default.
    pub fn capture() -> Result<Self> {
        let envd_timeout = match std::env::var("ENVD_TIMEOUT") {
            Ok(raw) => parse_duration(&raw)
                .with_context(|| format!("invalid ENVD_TIMEOUT value {raw:?}"))?,
            Err(_) => DEFAULT_ENVD_TIMEOUT,
        };
        Ok(Self {
            envd_timeout,
            envd_port: ENVD_PORT,
            logs_collector_ip: std::env::var("LOGS_COLLECTOR_PUBLIC_IP").unwrap_or_default(),
        })
    }
}

/// Parses duration strings of the form `10s`, `1500ms`, `2m` or a bare
/// number of seconds.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        bail!("empty duration");
    }
    let (digits, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => raw.split_at(idx),
        None => (raw, "s"),
    };
    let value: u64 = digits
        .parse()
        .with_context(|| format!("invalid duration value {raw:?}"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        other => bail!("unknown duration unit {other:?} in {raw:?}"),
    }
}
