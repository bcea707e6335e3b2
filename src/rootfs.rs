//! Rootfs copy-on-write device contract.
//!
//! The CoW layer exposes a host block device whose reads fall through to the
//! template's readonly rootfs and whose writes land in a per-sandbox cache
//! file, marking the written block dirty. The implementation (cache format,
//! nbd wiring) lives outside this crate; the core drives it through
//! [`RootfsDevice`] and constructs it through [`RootfsFactory`].

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::device::DevicePool;
use crate::template::diff::{BlockSet, DiffFile};
use crate::template::Artifact;

/// Callback `export` uses to quiesce the VM before reading dirty blocks
/// back. Invoked at most once.
pub type QuiesceFn = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send>;

#[async_trait]
pub trait RootfsDevice: Send + Sync {
    /// Runs the device's I/O servicing loop. Long-running; resolves when the
    /// device shuts down or fails. The sandbox spawns this in the
    /// background and surfaces failures through its own exit path.
    async fn start(&self) -> Result<()>;

    /// Host block-device path backing the overlay.
    async fn device_path(&self) -> Result<PathBuf>;

    /// Drains every dirty block into `sink` in ascending block order and
    /// returns the dirty set. Destructive: the device may invoke `quiesce`
    /// to stop the VM before reading back, and must not service further
    /// writes afterwards.
    async fn export(&self, sink: &mut DiffFile, quiesce: QuiesceFn) -> Result<BlockSet>;

    /// Releases the overlay: detaches the block device and closes the cache
    /// layer. Idempotent.
    async fn close(&self);
}

/// Constructor seam for the CoW layer.
#[async_trait]
pub trait RootfsFactory: Send + Sync {
    async fn create(
        &self,
        readonly_base: Arc<Artifact>,
        cache_path: &Path,
        block_size: u64,
        device_pool: Arc<dyn DevicePool>,
    ) -> Result<Arc<dyn RootfsDevice>>;
}
