//! Host-side handshake with the in-guest agent (envd).
//!
//! Two protocols exist in the fleet. Agents at `0.1.1` and newer take an
//! explicit init call that uploads the sandbox's environment variables and
//! confirm readiness over `/health`; init failures are fatal for the
//! constructor. Older agents only support a fire-and-forget clock sync,
//! and a failed sync is logged but does not fail the sandbox.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::debug;

/// Minimum agent version speaking the init protocol.
const NEW_PROTOCOL_VERSION: (u64, u64, u64) = (0, 1, 1);

/// Whether `version` speaks the init protocol. Unparseable versions are
/// treated as legacy.
pub fn supports_init_protocol(version: &str) -> bool {
    match parse_version(version) {
        Some(v) => v >= NEW_PROTOCOL_VERSION,
        None => false,
    }
}

fn parse_version(version: &str) -> Option<(u64, u64, u64)> {
    let version = version.trim().trim_start_matches('v');
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = match parts.next() {
        Some(p) => p.parse().ok()?,
        None => 0,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

fn envd_url(host_ip: Ipv4Addr, port: u16, path: &str) -> String {
    format!("http://{host_ip}:{port}{path}")
}

/// New-protocol init: upload env vars, then poll `/health` until the agent
/// answers. The caller bounds the whole call with the envd timeout.
pub async fn init_envd(
    client: &reqwest::Client,
    host_ip: Ipv4Addr,
    port: u16,
    env_vars: &HashMap<String, String>,
) -> Result<()> {
    let body = serde_json::json!({ "envVars": env_vars });
    let resp = client
        .post(envd_url(host_ip, port, "/init"))
        .json(&body)
        .send()
        .await
        .context("envd init request failed")?;
    if !resp.status().is_success() {
        bail!("envd init returned status {}", resp.status());
    }

    // The agent answers /health only once init is applied.
    loop {
        match client.get(envd_url(host_ip, port, "/health")).send().await {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            Ok(resp) => {
                debug!(http_status = resp.status().as_u16(), "envd not ready yet")
            }
            Err(e) => debug!(error = %e, "envd not ready yet"),
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Legacy handshake: a single clock sync call.
pub async fn sync_old_envd(client: &reqwest::Client, host_ip: Ipv4Addr, port: u16) -> Result<()> {
    let resp = client
        .post(envd_url(host_ip, port, "/sync"))
        .send()
        .await
        .context("envd sync request failed")?;
    if !resp.status().is_success() {
        bail!("envd sync returned status {}", resp.status());
    }
    Ok(())
}
