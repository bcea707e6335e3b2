//! Kernel block-device pool.
//!
//! The host pre-provisions a pool of kernel block devices (nbd-style); the
//! rootfs CoW layer attaches to one for the sandbox's lifetime. Allocation
//! itself is out of scope here — the core only needs acquire/release.

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait DevicePool: Send + Sync {
    /// Leases a free block-device path (e.g. `/dev/nbd3`).
    async fn acquire(&self) -> Result<PathBuf>;

    async fn release(&self, path: PathBuf) -> Result<()>;
}
