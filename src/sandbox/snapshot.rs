//! Incremental snapshots.
//!
//! A snapshot turns a running sandbox into a new template generation:
//!
//! ```text
//! pause VM ─► freeze pager ─► full memory dump + new snapfile
//!     ─► dirty-page diff (drop pages identical to the parent's copy)
//!     ─► release external build lock
//!     ─► merge mapping with parent (newer generation wins)
//!     ─► flush + export rootfs CoW layer ─► merge rootfs mapping
//!     ─► {snapfile, memfile diff + header, rootfs diff + header}
//! ```
//!
//! The full memory dump exists only between the hypervisor writing it and
//! the diff being cut; it is removed on every exit path. A failed pause
//! leaves the sandbox running and the snapshot errors out; a failure later
//! in the pipeline leaves it paused — either way the caller is expected to
//! stop the sandbox.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use tracing::{info, Instrument};
use uuid::Uuid;

use crate::rootfs::QuiesceFn;
use crate::sandbox::files::SnapshotFiles;
use crate::sandbox::Sandbox;
use crate::template::diff::{create_diff, Diff, DiffFile, DiffOutcome};
use crate::template::header::{create_mapping, merge_mappings, Header};
use crate::template::LocalFile;

/// The artifact triple of one snapshot.
#[derive(Debug)]
pub struct Snapshot {
    pub snapfile: LocalFile,
    pub memfile_diff: Diff,
    pub memfile_diff_header: Header,
    pub rootfs_diff: Diff,
    pub rootfs_diff_header: Header,
}

/// Best-effort file removal on scope exit.
struct RemoveOnDrop(PathBuf);

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

impl Sandbox {
    /// Captures an incremental snapshot of the running sandbox as the
    /// generation identified by `snapshot_files`' build id.
    ///
    /// The caller holds an external lock over that build id; it is released
    /// through `release_lock` once the memfile artifact is finalized
    /// locally. On error the sandbox may be left paused — stop it.
    pub async fn snapshot(
        &self,
        snapshot_files: &SnapshotFiles,
        release_lock: impl FnOnce() + Send,
    ) -> Result<Snapshot> {
        let span = crate::logging::sandbox_span(&self.logger_metadata());
        self.snapshot_inner(snapshot_files, release_lock)
            .instrument(span)
            .await
    }

    async fn snapshot_inner(
        &self,
        snapshot_files: &SnapshotFiles,
        release_lock: impl FnOnce() + Send,
    ) -> Result<Snapshot> {
        let build_id =
            Uuid::parse_str(snapshot_files.build_id()).context("failed to parse build id")?;

        let original_memfile = self
            .template
            .memfile()
            .await
            .context("failed to get original memfile")?;
        let memfile_metadata = original_memfile.header().metadata.next_generation(build_id);

        // No probe may race the pause.
        self.health_ctx.cancel(anyhow!("snapshot in progress"));

        self.hypervisor.pause().await.context("error pausing vm")?;
        self.pager.disable().context("failed to disable pager")?;

        tokio::fs::create_dir_all(snapshot_files.cache_dir())
            .await
            .with_context(|| {
                format!(
                    "create snapshot cache dir {}",
                    snapshot_files.cache_dir().display()
                )
            })?;

        let full_snapshot_path = snapshot_files.memfile_full_snapshot_path();
        let full_snapshot_guard = RemoveOnDrop(full_snapshot_path.clone());
        self.hypervisor
            .create_snapshot(&snapshot_files.snapfile_path(), &full_snapshot_path)
            .await
            .context("error creating snapshot")?;

        let dirty_pages = self.pager.dirty().context("failed to read pager dirty set")?;

        let page_size = self.files.memfile_page_size();
        let mut memfile_sink = DiffFile::create(snapshot_files.memfile_diff_path()).await?;
        let DiffOutcome {
            refined: memfile_dirty,
            skipped,
        } = create_diff(
            &full_snapshot_path,
            page_size,
            &dirty_pages,
            Some(original_memfile.as_ref()),
            &mut memfile_sink,
        )
        .await
        .context("failed to create memfile diff")?;
        info!(
            dirty_pages = memfile_dirty.count(),
            skipped_pages = skipped.count(),
            "created memfile diff"
        );

        // The dump is a full guest-memory image; reclaim it as soon as the
        // diff is cut rather than at scope end.
        drop(full_snapshot_guard);

        release_lock();

        let memfile_mapping = create_mapping(build_id, &memfile_dirty);
        let memfile_mappings =
            merge_mappings(&original_memfile.header().mapping, &memfile_mapping);

        let snapfile =
            LocalFile::new(snapshot_files.snapfile_path()).context("failed to open new snapfile")?;

        let original_rootfs = self
            .template
            .rootfs()
            .await
            .context("failed to get original rootfs")?;
        let rootfs_metadata = original_rootfs.header().metadata.next_generation(build_id);

        let device_path = self
            .rootfs
            .device_path()
            .await
            .context("failed to get rootfs path")?;
        flush_block_device(&device_path)
            .with_context(|| format!("failed to flush rootfs device {}", device_path.display()))?;
        info!("synced rootfs");

        let mut rootfs_sink = DiffFile::create(snapshot_files.rootfs_diff_path()).await?;
        let quiesce: QuiesceFn = {
            let cleanup = self.cleanup.clone();
            Box::new(move || {
                Box::pin(async move { cleanup.run().await.context("failed to stop sandbox") })
            })
        };
        let rootfs_dirty = self
            .rootfs
            .export(&mut rootfs_sink, quiesce)
            .await
            .context("failed to export rootfs")?;
        info!(dirty_blocks = rootfs_dirty.count(), "exported rootfs");

        let rootfs_mapping = create_mapping(build_id, &rootfs_dirty);
        let rootfs_mappings = merge_mappings(&original_rootfs.header().mapping, &rootfs_mapping);

        let rootfs_block_size = self.files.rootfs_block_size();
        let rootfs_diff = rootfs_sink
            .into_diff(rootfs_block_size)
            .await
            .context("failed to convert rootfs diff file to local diff")?;
        let memfile_diff = memfile_sink
            .into_diff(page_size)
            .await
            .context("failed to convert memfile diff file to local diff")?;

        if memfile_diff.len_bytes() != memfile_dirty.count() * page_size {
            bail!(
                "memfile diff is {} bytes, expected {} dirty pages of {}",
                memfile_diff.len_bytes(),
                memfile_dirty.count(),
                page_size
            );
        }
        if rootfs_diff.len_bytes() != rootfs_dirty.count() * rootfs_block_size {
            bail!(
                "rootfs diff is {} bytes, expected {} dirty blocks of {}",
                rootfs_diff.len_bytes(),
                rootfs_dirty.count(),
                rootfs_block_size
            );
        }

        let memfile_diff_header = Header::new(memfile_metadata, memfile_mappings)?;
        let rootfs_diff_header = Header::new(rootfs_metadata, rootfs_mappings)?;

        info!(
            build_id = %build_id,
            base_build_id = %memfile_metadata.base_build_id,
            generation = memfile_metadata.generation,
            memfile_diff_size = memfile_diff.len_bytes(),
            memfile_mapping_len = memfile_diff_header.mapping.len(),
            rootfs_diff_size = rootfs_diff.len_bytes(),
            rootfs_mapping_len = rootfs_diff_header.mapping.len(),
            "snapshot complete"
        );

        Ok(Snapshot {
            snapfile,
            memfile_diff,
            memfile_diff_header,
            rootfs_diff,
            rootfs_diff_header,
        })
    }
}

// ---------------------------------------------------------------------------
// Block-layer flush
// ---------------------------------------------------------------------------

#[cfg(target_os = "linux")]
nix::ioctl_none!(blkflsbuf, 0x12, 97);

/// Flushes the kernel's buffered writes for the rootfs device: BLKFLSBUF
/// followed by fsync. Regular files (test rigs without a real block
/// device) take no block-layer flush and only get the fsync.
#[cfg(target_os = "linux")]
fn flush_block_device(path: &Path) -> Result<()> {
    use std::os::fd::AsRawFd;

    let file = std::fs::File::open(path)
        .with_context(|| format!("open rootfs device {}", path.display()))?;
    match unsafe { blkflsbuf(file.as_raw_fd()) } {
        Ok(_) => {}
        Err(nix::errno::Errno::ENOTTY) => {}
        Err(e) => return Err(anyhow!(e)).context("ioctl BLKFLSBUF failed"),
    }
    file.sync_all().context("failed to fsync rootfs device")?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn flush_block_device(_path: &Path) -> Result<()> {
    bail!("rootfs device flush is only supported on Linux")
}
