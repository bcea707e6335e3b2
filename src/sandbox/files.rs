//! Host path layout for sandboxes and snapshots.
//!
//! All per-sandbox paths hang off a single directory derived from the
//! sandbox id, so teardown is one recursive remove. Snapshot artifacts for
//! a target build live in the template cache directory keyed by build id.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::template::TemplateFiles;

/// Per-sandbox host paths and image geometry.
#[derive(Debug, Clone)]
pub struct SandboxFiles {
    sandbox_id: String,
    sandbox_dir: PathBuf,
    memfile_page_size: u64,
    rootfs_block_size: u64,
}

impl SandboxFiles {
    pub fn new(base_dir: &Path, sandbox_id: &str, template: &TemplateFiles) -> Self {
        Self {
            sandbox_id: sandbox_id.to_string(),
            sandbox_dir: base_dir.join("sandbox").join(sandbox_id),
            memfile_page_size: template.memfile_page_size(),
            rootfs_block_size: template.rootfs_block_size,
        }
    }

    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    pub fn sandbox_dir(&self) -> &Path {
        &self.sandbox_dir
    }

    /// Cache file the CoW rootfs overlay writes into.
    pub fn rootfs_cache_path(&self) -> PathBuf {
        self.sandbox_dir.join("rootfs.cache")
    }

    /// Unix socket the pager listens on for the hypervisor's registration.
    pub fn uffd_socket_path(&self) -> PathBuf {
        self.sandbox_dir.join("uffd.sock")
    }

    pub fn memfile_page_size(&self) -> u64 {
        self.memfile_page_size
    }

    pub fn rootfs_block_size(&self) -> u64 {
        self.rootfs_block_size
    }

    pub async fn ensure_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.sandbox_dir)
            .await
            .with_context(|| format!("create sandbox dir {}", self.sandbox_dir.display()))
    }

    /// Removes every per-sandbox file. Idempotent.
    pub async fn remove(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.sandbox_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| {
                format!("remove sandbox dir {}", self.sandbox_dir.display())
            }),
        }
    }
}

/// Paths for the artifacts of one snapshot, keyed by the target build id.
#[derive(Debug, Clone)]
pub struct SnapshotFiles {
    build_id: String,
    cache_dir: PathBuf,
}

impl SnapshotFiles {
    pub fn new(cache_dir: &Path, build_id: &str) -> Self {
        Self {
            build_id: build_id.to_string(),
            cache_dir: cache_dir.join(build_id),
        }
    }

    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// New hypervisor state file.
    pub fn snapfile_path(&self) -> PathBuf {
        self.cache_dir.join("snapfile")
    }

    /// Full memory dump, deleted once the diff is cut.
    pub fn memfile_full_snapshot_path(&self) -> PathBuf {
        self.cache_dir.join("memfile.full")
    }

    pub fn memfile_diff_path(&self) -> PathBuf {
        self.cache_dir.join("memfile.diff")
    }

    pub fn rootfs_diff_path(&self) -> PathBuf {
        self.cache_dir.join("rootfs.diff")
    }
}
