//! Hypervisor process contract.
//!
//! The hypervisor is an external process restored from a template snapfile.
//! It registers its guest memory with the pager over the sandbox's uffd
//! socket and must consume the pager's ready signal before resuming the
//! guest. The core drives it through [`Hypervisor`] and constructs it
//! through [`HypervisorFactory`].

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::net::NetworkSlot;
use crate::pager::Pager;
use crate::rootfs::RootfsDevice;
use crate::sandbox::files::SandboxFiles;
use crate::sandbox::health::CancelContext;
use crate::template::LocalFile;

/// Metadata exposed to the guest via the hypervisor's metadata service.
/// Opaque to the core; the guest agent reads it at boot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MmdsMetadata {
    pub sandbox_id: String,
    pub template_id: String,
    pub logs_collector_address: String,
    pub trace_id: String,
    pub team_id: String,
}

/// Everything a hypervisor needs to restore one sandbox.
pub struct HypervisorSpec {
    pub slot: NetworkSlot,
    pub files: SandboxFiles,
    pub mmds: MmdsMetadata,
    pub snapfile: LocalFile,
    pub rootfs: Arc<dyn RootfsDevice>,
    /// The hypervisor awaits [`Pager::ready`] before resuming the guest.
    pub pager: Arc<dyn Pager>,
    /// Root build of the template's ancestry chain.
    pub base_template_id: String,
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Restores from the snapfile and blocks until the VM is live. The boot
    /// context is cancelled (with cause) if the pager dies mid-boot;
    /// implementations should abandon the boot when they observe it.
    async fn start(&self, boot_ctx: &CancelContext) -> Result<()>;

    /// Pauses guest execution.
    async fn pause(&self) -> Result<()>;

    /// Writes a full memory dump to `memfile_path` and a new snapfile
    /// reflecting current CPU/device state to `snapfile_path`. The VM must
    /// be paused.
    async fn create_snapshot(&self, snapfile_path: &Path, memfile_path: &Path) -> Result<()>;

    /// Terminates the hypervisor process. Idempotent.
    async fn stop(&self) -> Result<()>;

    /// Resolves with the process's final error once it exits.
    ///
    /// Cancel-safe: the returned future may be dropped and requested again;
    /// implementations must back it with shared state, not a consuming
    /// channel.
    async fn exited(&self) -> Result<()>;
}

/// Constructor seam for the hypervisor.
#[async_trait]
pub trait HypervisorFactory: Send + Sync {
    async fn create(&self, spec: HypervisorSpec) -> Result<Arc<dyn Hypervisor>>;
}
