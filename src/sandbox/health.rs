//! Cancellation context and the sandbox health loop.
//!
//! [`CancelContext`] is a small cause-carrying cancellation token: any task
//! can cancel it with the error that triggered the cancellation, and any
//! number of tasks can await it. The builder uses one to abort hypervisor
//! boot when the pager dies (so callers see "pager exited", not a bare
//! cancellation), and every sandbox owns a second one that bounds the
//! health loop.
//!
//! The health loop is a single background task:
//!
//! ```text
//! every 5 s ──► GET http://<slot-ip>:<envd-port>/health  (2 s timeout)
//!                   └► healthy: AtomicBool (single writer)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How often the guest agent is probed.
pub const HEALTH_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Per-probe timeout; well under the probe period.
pub const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Default)]
struct CancelState {
    cancelled: bool,
    cause: Option<Arc<anyhow::Error>>,
}

/// A cancellable token carrying the error that caused the cancellation.
///
/// Cloning is cheap and shares the underlying state. Only the first
/// `cancel` records a cause; later calls are no-ops.
#[derive(Clone, Default)]
pub struct CancelContext {
    state: Arc<Mutex<CancelState>>,
    notify: Arc<Notify>,
}

impl CancelContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the context, waking every waiter. The first call wins.
    pub fn cancel(&self, cause: anyhow::Error) {
        {
            let mut state = self.state.lock().expect("cancel state lock poisoned");
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            state.cause = Some(Arc::new(cause));
        }
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().expect("cancel state lock poisoned").cancelled
    }

    /// The error recorded by the winning `cancel`, once cancelled.
    pub fn cause(&self) -> Option<Arc<anyhow::Error>> {
        self.state
            .lock()
            .expect("cancel state lock poisoned")
            .cause
            .clone()
    }

    /// Resolves once the context is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancelContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelContext")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Parameters of one sandbox's health probing.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    /// Full probe URL, e.g. `http://10.1.0.4:49983/health`.
    pub url: String,
    pub period: Duration,
    pub timeout: Duration,
}

impl HealthProbe {
    pub fn for_guest(host_ip: std::net::Ipv4Addr, envd_port: u16) -> Self {
        Self {
            url: format!("http://{host_ip}:{envd_port}/health"),
            period: HEALTH_PROBE_INTERVAL,
            timeout: HEALTH_PROBE_TIMEOUT,
        }
    }
}

/// Spawns the health loop for one sandbox.
///
/// The loop is the only writer of `healthy`; transitions are logged as
/// structured events. It observes `ctx` cancellation within one probe
/// period and never touches any other sandbox resource.
pub fn spawn_health_loop(
    sandbox_id: String,
    probe: HealthProbe,
    ctx: CancelContext,
    healthy: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let client = reqwest::Client::builder()
            .timeout(probe.timeout)
            .build()
            .expect("reqwest client build failed");

        let mut interval = tokio::time::interval(probe.period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; the first probe should not.
        interval.tick().await;
        let mut was_healthy = true;

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    debug!(sandbox_id = %sandbox_id, "health loop exiting");
                    return;
                }
                _ = interval.tick() => {}
            }

            let result = client.get(&probe.url).send().await;
            let ok = matches!(&result, Ok(resp) if resp.status().is_success());
            healthy.store(ok, Ordering::SeqCst);

            if ok != was_healthy {
                if ok {
                    info!(sandbox_id = %sandbox_id, "sandbox healthy again");
                } else {
                    match result {
                        Ok(resp) => warn!(
                            sandbox_id = %sandbox_id,
                            http_status = resp.status().as_u16(),
                            "sandbox unhealthy"
                        ),
                        Err(e) => warn!(
                            sandbox_id = %sandbox_id,
                            error = %e,
                            "sandbox unhealthy"
                        ),
                    }
                }
                was_healthy = ok;
            }
        }
    })
}
