//! Sandbox lifecycle: ordered construction, supervision, teardown.
//!
//! ## Construction
//!
//! ```text
//! create(deps, opts)
//!     ├► template cache ──► {snapfile, memfile, rootfs}
//!     ├► network pool ────► slot                 (undo: return slot)
//!     ├► sandbox files                           (undo: remove dir)
//!     ├► rootfs CoW overlay + servicing task     (undo: close overlay)
//!     ├► pager ───────────► listening            (undo: stop pager)
//!     │      └► exit watcher ─► cancels boot ctx with cause
//!     ├► hypervisor ──────► live, consumed pager ready
//!     │                         (priority undo: stop hypervisor + pager,
//!     │                          cancel health context)
//!     ├► envd handshake   (new protocol: fatal; legacy: logged)
//!     ├► DNS + proxy                             (undo: remove both)
//!     └► health loop task
//! ```
//!
//! Every step registers its undo in the [`Cleanup`] registry before the
//! next fallible call, so a failure at step N unwinds exactly steps 1..N−1.
//! The registry is returned to the caller on success *and* on failure; in
//! the failure case the caller must run it.
//!
//! [`Cleanup`]: cleanup::Cleanup

pub mod cleanup;
pub mod envd;
pub mod files;
pub mod health;
pub mod snapshot;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use crate::config::{RuntimeEnv, SandboxConfig};
use crate::device::DevicePool;
use crate::hypervisor::{Hypervisor, HypervisorFactory, HypervisorSpec, MmdsMetadata};
use crate::net::{Dns, NetworkPool, NetworkSlot, Proxy};
use crate::pager::{Pager, PagerFactory};
use crate::rootfs::{RootfsDevice, RootfsFactory};
use crate::template::{Template, TemplateCache};
use cleanup::Cleanup;
use files::SandboxFiles;
use health::CancelContext;

/// Host services a sandbox is built against. All handles are shared.
#[derive(Clone)]
pub struct SandboxDeps {
    pub template_cache: Arc<dyn TemplateCache>,
    pub network_pool: Arc<dyn NetworkPool>,
    pub device_pool: Arc<dyn DevicePool>,
    pub rootfs_factory: Arc<dyn RootfsFactory>,
    pub pager_factory: Arc<dyn PagerFactory>,
    pub hypervisor_factory: Arc<dyn HypervisorFactory>,
    pub dns: Arc<dyn Dns>,
    pub proxy: Arc<dyn Proxy>,
}

/// Per-request construction parameters.
#[derive(Debug, Clone)]
pub struct SandboxOptions {
    pub config: SandboxConfig,
    pub runtime: RuntimeEnv,
    /// Root under which per-sandbox files are created.
    pub base_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    /// Root build of the template's ancestry chain.
    pub base_template_id: String,
    /// Identifies this host to the pager.
    pub client_id: String,
    pub trace_id: Option<String>,
}

/// Identity triple attached to every log line about a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxMetadata {
    pub sandbox_id: String,
    pub template_id: String,
    pub team_id: String,
}

/// A live sandbox. Destroyed only via [`Sandbox::stop`], which drains the
/// cleanup registry exactly once.
pub struct Sandbox {
    config: SandboxConfig,
    files: SandboxFiles,
    slot: NetworkSlot,
    template: Arc<dyn Template>,
    rootfs: Arc<dyn RootfsDevice>,
    pager: Arc<dyn Pager>,
    hypervisor: Arc<dyn Hypervisor>,
    cleanup: Cleanup,
    health_ctx: CancelContext,
    healthy: Arc<AtomicBool>,
    pager_exit: Option<oneshot::Receiver<Result<()>>>,
    started_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
    cleanup_id: Uuid,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("config", &self.config)
            .field("started_at", &self.started_at)
            .field("end_at", &self.end_at)
            .field("cleanup_id", &self.cleanup_id)
            .finish_non_exhaustive()
    }
}

impl Sandbox {
    /// Builds a sandbox from a template.
    ///
    /// The returned [`Cleanup`] is valid in both arms: on success it is the
    /// sandbox's own teardown (also reachable via [`Sandbox::stop`]); on
    /// failure the caller must run it to release whatever the failed
    /// construction had already acquired.
    pub async fn create(deps: SandboxDeps, opts: SandboxOptions) -> (Cleanup, Result<Sandbox>) {
        let span = crate::logging::sandbox_span(&SandboxMetadata {
            sandbox_id: opts.config.sandbox_id.clone(),
            template_id: opts.config.template_id.clone(),
            team_id: opts.config.team_id.clone(),
        });
        let cleanup = Cleanup::new();
        let result = Self::create_inner(&deps, opts, &cleanup)
            .instrument(span)
            .await;
        (cleanup, result)
    }

    async fn create_inner(
        deps: &SandboxDeps,
        opts: SandboxOptions,
        cleanup: &Cleanup,
    ) -> Result<Sandbox> {
        let SandboxOptions {
            config,
            runtime,
            base_dir,
            started_at: _,
            end_at,
            base_template_id,
            client_id,
            trace_id,
        } = opts;

        let template = deps
            .template_cache
            .get_template(
                &config.template_id,
                &config.build_id,
                &config.kernel_version,
                &config.hypervisor_version,
                config.huge_pages,
            )
            .await
            .context("failed to get template snapshot data")?;

        let slot = deps
            .network_pool
            .get()
            .await
            .context("failed to get network slot")?;
        info!(slot_idx = slot.idx, host_ip = %slot.host_ip, "acquired network slot");
        cleanup.add("network-slot-return", {
            let pool = Arc::clone(&deps.network_pool);
            let slot = slot.clone();
            move || async move {
                pool.release(slot)
                    .await
                    .context("failed to return network slot")
            }
        });

        let sandbox_files = SandboxFiles::new(&base_dir, &config.sandbox_id, template.files());
        sandbox_files.ensure_dir().await?;
        cleanup.add("sandbox-files-remove", {
            let sandbox_files = sandbox_files.clone();
            move || async move { sandbox_files.remove().await }
        });

        let readonly_rootfs = template.rootfs().await.context("failed to get rootfs")?;
        let rootfs_overlay = deps
            .rootfs_factory
            .create(
                readonly_rootfs,
                &sandbox_files.rootfs_cache_path(),
                sandbox_files.rootfs_block_size(),
                Arc::clone(&deps.device_pool),
            )
            .await
            .context("failed to create rootfs overlay")?;
        cleanup.add("rootfs-overlay-close", {
            let overlay = Arc::clone(&rootfs_overlay);
            move || async move {
                overlay.close().await;
                Ok(())
            }
        });

        // The servicing loop runs for the sandbox's lifetime; its failures
        // surface through the exit path, not here.
        tokio::spawn({
            let overlay = Arc::clone(&rootfs_overlay);
            let sandbox_id = config.sandbox_id.clone();
            async move {
                if let Err(e) = overlay.start().await {
                    error!(sandbox_id = %sandbox_id, error = %e, "rootfs overlay error");
                }
            }
        });

        let memfile = template.memfile().await.context("failed to get memfile")?;
        let pager = deps
            .pager_factory
            .create(
                memfile,
                &sandbox_files.uffd_socket_path(),
                sandbox_files.memfile_page_size(),
                &client_id,
            )
            .await
            .context("failed to create pager")?;
        cleanup.add("pager-stop", {
            let pager = Arc::clone(&pager);
            move || async move { pager.stop().context("failed to stop pager") }
        });
        pager
            .start(&config.sandbox_id)
            .await
            .context("failed to start pager")?;

        // If the pager dies while the hypervisor is still booting, the boot
        // context is cancelled with the pager's error as cause, so the
        // constructor reports "pager exited", not a bare cancellation.
        let boot_ctx = CancelContext::new();
        let (pager_exit_tx, pager_exit_rx) = oneshot::channel::<Result<()>>();
        tokio::spawn({
            let pager = Arc::clone(&pager);
            let boot_ctx = boot_ctx.clone();
            async move {
                let exit = pager.exited().await;
                let cause = match &exit {
                    Ok(()) => anyhow!("pager process exited"),
                    Err(e) => anyhow!("pager process exited: {e:#}"),
                };
                let _ = pager_exit_tx.send(exit);
                boot_ctx.cancel(cause);
            }
        });

        let snapfile = template.snapfile().await.context("failed to get snapfile")?;
        let hypervisor = deps
            .hypervisor_factory
            .create(HypervisorSpec {
                slot: slot.clone(),
                files: sandbox_files.clone(),
                mmds: MmdsMetadata {
                    sandbox_id: config.sandbox_id.clone(),
                    template_id: config.template_id.clone(),
                    logs_collector_address: runtime.logs_collector_ip.clone(),
                    trace_id: trace_id.unwrap_or_default(),
                    team_id: config.team_id.clone(),
                },
                snapfile,
                rootfs: Arc::clone(&rootfs_overlay),
                pager: Arc::clone(&pager),
                base_template_id,
            })
            .await
            .context("failed to create hypervisor")?;

        {
            let start = hypervisor.start(&boot_ctx);
            tokio::pin!(start);
            tokio::select! {
                res = &mut start => res.context("failed to start hypervisor")?,
                _ = boot_ctx.cancelled() => {
                    let cause = boot_ctx
                        .cause()
                        .map(|c| format!("{c:#}"))
                        .unwrap_or_else(|| "boot context cancelled".to_string());
                    bail!("failed to start hypervisor: {cause}");
                }
            }
        }
        info!("initialized hypervisor");

        let health_ctx = CancelContext::new();
        cleanup.add_priority("hypervisor-pager-stop", {
            let hypervisor = Arc::clone(&hypervisor);
            let pager = Arc::clone(&pager);
            let health_ctx = health_ctx.clone();
            move || async move {
                let mut errors = Vec::new();
                if let Err(e) = hypervisor.stop().await {
                    errors.push(e.context("failed to stop hypervisor"));
                }
                if let Err(e) = pager.stop() {
                    errors.push(e.context("failed to stop pager"));
                }
                health_ctx.cancel(anyhow!("sandbox stopped"));
                cleanup::join_errors(errors)
            }
        });

        let client = reqwest::Client::new();
        if envd::supports_init_protocol(&config.envd_version) {
            tokio::time::timeout(
                runtime.envd_timeout,
                envd::init_envd(&client, slot.host_ip, runtime.envd_port, &config.env_vars),
            )
            .await
            .map_err(|_| anyhow!("envd init took longer than {:?}", runtime.envd_timeout))?
            .context("failed to init new envd")?;
            info!("initialized new envd");
        } else {
            let sync = tokio::time::timeout(
                runtime.envd_timeout,
                envd::sync_old_envd(&client, slot.host_ip, runtime.envd_port),
            )
            .await
            .map_err(|_| anyhow!("envd sync took longer than {:?}", runtime.envd_timeout))
            .and_then(|res| res);
            match sync {
                Ok(()) => info!("synced old envd"),
                Err(e) => warn!(error = %format!("{e:#}"), "failed to sync old envd"),
            }
        }

        let started_at = Utc::now();

        deps.dns.add(&config.sandbox_id, slot.host_ip).await;
        deps.proxy
            .add_sandbox(&config.sandbox_id, slot.host_ip, &config.team_id)
            .await;
        info!(ip = %slot.host_ip, "added DNS record");
        cleanup.add("dns-proxy-remove", {
            let dns = Arc::clone(&deps.dns);
            let proxy = Arc::clone(&deps.proxy);
            let sandbox_id = config.sandbox_id.clone();
            let ip = slot.host_ip;
            move || async move {
                dns.remove(&sandbox_id, ip).await;
                proxy.remove_sandbox(&sandbox_id, ip).await;
                Ok(())
            }
        });

        let healthy = Arc::new(AtomicBool::new(true));
        health::spawn_health_loop(
            config.sandbox_id.clone(),
            health::HealthProbe::for_guest(slot.host_ip, runtime.envd_port),
            health_ctx.clone(),
            Arc::clone(&healthy),
        );

        Ok(Sandbox {
            config,
            files: sandbox_files,
            slot,
            template,
            rootfs: rootfs_overlay,
            pager,
            hypervisor,
            cleanup: cleanup.clone(),
            health_ctx,
            healthy,
            pager_exit: Some(pager_exit_rx),
            started_at,
            end_at,
            cleanup_id: Uuid::new_v4(),
        })
    }

    /// Blocks until either the hypervisor or the pager exits, tears the
    /// sandbox down, drains the peer and returns the joined errors.
    ///
    /// May be called once per sandbox; the exit signals are single-receiver.
    pub async fn wait(&mut self) -> Result<()> {
        let mut pager_exit = self
            .pager_exit
            .take()
            .context("wait already called for this sandbox")?;

        enum First {
            Hypervisor(Result<()>),
            Pager(Result<()>),
        }

        let first = {
            let hypervisor_exit = self.hypervisor.exited();
            tokio::pin!(hypervisor_exit);
            tokio::select! {
                res = &mut hypervisor_exit => First::Hypervisor(res),
                res = &mut pager_exit => First::Pager(res.unwrap_or(Ok(()))),
            }
        };

        let mut errors = Vec::new();
        match first {
            First::Hypervisor(hypervisor_res) => {
                if let Err(e) = hypervisor_res {
                    errors.push(e.context("hypervisor exited with error"));
                }
                if let Err(e) = self.stop().await {
                    errors.push(e);
                }
                if let Ok(Err(e)) = pager_exit.await {
                    errors.push(e.context("pager exited with error"));
                }
            }
            First::Pager(pager_res) => {
                if let Err(e) = pager_res {
                    errors.push(e.context("pager exited with error"));
                }
                if let Err(e) = self.stop().await {
                    errors.push(e);
                }
                if let Err(e) = self.hypervisor.exited().await {
                    errors.push(e.context("hypervisor exited with error"));
                }
            }
        }

        cleanup::join_errors(errors)
    }

    /// Tears the sandbox down by draining the cleanup registry. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        self.cleanup.run().await.context("failed to stop sandbox")
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn slot(&self) -> &NetworkSlot {
        &self.slot
    }

    pub fn files(&self) -> &SandboxFiles {
        &self.files
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn end_at(&self) -> DateTime<Utc> {
        self.end_at
    }

    /// Extends the sandbox's scheduled lifetime. The outer scheduler polls
    /// `end_at`; nothing in this crate enforces it.
    pub fn extend_end_at(&mut self, end_at: DateTime<Utc>) {
        self.end_at = end_at;
    }

    /// Last observed guest health. Written only by the health loop.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn cleanup_id(&self) -> Uuid {
        self.cleanup_id
    }

    pub fn logger_metadata(&self) -> SandboxMetadata {
        SandboxMetadata {
            sandbox_id: self.config.sandbox_id.clone(),
            template_id: self.config.template_id.clone(),
            team_id: self.config.team_id.clone(),
        }
    }
}
