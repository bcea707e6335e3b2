//! Userfault pager contract.
//!
//! The pager is a separate host process servicing page faults for the guest
//! memory region: it lazily feeds pages out of the template memfile and
//! tracks which pages the guest dirties. The hypervisor registers with it
//! over a unix socket during restore; [`Pager::ready`] resolves once that
//! registration arrived, and the hypervisor must not resume the guest
//! before then.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::template::diff::BlockSet;
use crate::template::Artifact;

#[async_trait]
pub trait Pager: Send + Sync {
    /// Starts the pager process and begins listening for the hypervisor's
    /// register message.
    async fn start(&self, sandbox_id: &str) -> Result<()>;

    /// Resolves once the hypervisor has registered its memory region.
    /// May be awaited more than once.
    async fn ready(&self) -> Result<()>;

    /// Stops fielding new faults and freezes the dirty set.
    fn disable(&self) -> Result<()>;

    /// The frozen page-granular dirty set. Only valid after [`disable`].
    ///
    /// [`disable`]: Pager::disable
    fn dirty(&self) -> Result<BlockSet>;

    /// Terminates the pager process. Idempotent.
    fn stop(&self) -> Result<()>;

    /// Resolves with the pager's final error once the process exits.
    ///
    /// Cancel-safe: the returned future may be dropped and requested again;
    /// implementations must back it with shared state, not a consuming
    /// channel.
    async fn exited(&self) -> Result<()>;
}

/// Constructor seam for the pager.
#[async_trait]
pub trait PagerFactory: Send + Sync {
    async fn create(
        &self,
        memfile: Arc<Artifact>,
        socket_path: &Path,
        page_size: u64,
        client_id: &str,
    ) -> Result<Arc<dyn Pager>>;
}
