//! Templates: the (snapfile, memfile, rootfs) triples sandboxes boot from.
//!
//! A template is lazily materialized — fetching and caching the backing
//! files is the template cache's business, behind the [`TemplateCache`]
//! trait. The core only needs the three artifacts: the opaque snapfile, and
//! the memfile/rootfs images, each of which is a data file plus a
//! generational [`header::Header`].

pub mod diff;
pub mod header;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use header::Header;

/// Base page size used for memfiles without huge pages.
pub const PAGE_SIZE: u64 = 4096;

/// Huge-page size used for memfiles when the template was built with
/// huge pages enabled.
pub const HUGE_PAGE_SIZE: u64 = 2 * 1024 * 1024;

/// One generation of an image artifact: a data file and its header.
///
/// For a generation-zero template the data file is the full image; for
/// derived generations it is that build's diff. Either way the header's
/// mapping says which virtual blocks the file holds locally.
#[derive(Debug)]
pub struct Artifact {
    path: PathBuf,
    header: Header,
}

impl Artifact {
    pub fn new(path: PathBuf, header: Header) -> Result<Self> {
        if !path.is_file() {
            bail!("artifact data file {} does not exist", path.display());
        }
        Ok(Self { path, header })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Reads the bytes of `virtual_block` if this generation owns them
    /// locally — the mapping entry covering the block must be sourced from
    /// this artifact's own build. Returns `Ok(None)` for blocks inherited
    /// from ancestors.
    pub fn read_own_block(&self, virtual_block: u64, buf: &mut [u8]) -> Result<Option<()>> {
        let block_size = self.header.metadata.block_size;
        if buf.len() as u64 != block_size {
            bail!(
                "read buffer is {} bytes, artifact block size is {}",
                buf.len(),
                block_size
            );
        }
        let entry = match self.header.lookup(virtual_block) {
            Some(entry) if entry.source_build_id == self.header.metadata.build_id => entry,
            _ => return Ok(None),
        };
        let source_block =
            entry.source_block_start + (virtual_block - entry.virtual_block_start);

        use std::io::{Read, Seek, SeekFrom};
        let mut file = std::fs::File::open(&self.path)
            .with_context(|| format!("open artifact {}", self.path.display()))?;
        file.seek(SeekFrom::Start(source_block * block_size))
            .context("seek in artifact")?;
        file.read_exact(buf).with_context(|| {
            format!(
                "read block {virtual_block} (local block {source_block}) from {}",
                self.path.display()
            )
        })?;
        Ok(Some(()))
    }
}

/// A plain local file, used for snapfiles — opaque hypervisor state stored
/// verbatim.
#[derive(Debug, Clone)]
pub struct LocalFile {
    path: PathBuf,
}

impl LocalFile {
    pub fn new(path: PathBuf) -> Result<Self> {
        if !path.is_file() {
            bail!("local file {} does not exist", path.display());
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Identity and geometry of a template, used to derive per-sandbox paths.
#[derive(Debug, Clone)]
pub struct TemplateFiles {
    pub template_id: String,
    pub build_id: String,
    pub kernel_version: String,
    pub hypervisor_version: String,
    pub huge_pages: bool,
    /// Rootfs block size in bytes, typically 2 MiB.
    pub rootfs_block_size: u64,
}

impl TemplateFiles {
    /// Page size the memfile pager operates at.
    pub fn memfile_page_size(&self) -> u64 {
        if self.huge_pages {
            HUGE_PAGE_SIZE
        } else {
            PAGE_SIZE
        }
    }
}

/// A materialized template. Artifact getters may fetch on first use.
#[async_trait]
pub trait Template: Send + Sync {
    fn files(&self) -> &TemplateFiles;

    async fn memfile(&self) -> Result<Arc<Artifact>>;

    async fn rootfs(&self) -> Result<Arc<Artifact>>;

    async fn snapfile(&self) -> Result<LocalFile>;
}

/// Host-wide template store keyed by template and build.
#[async_trait]
pub trait TemplateCache: Send + Sync {
    async fn get_template(
        &self,
        template_id: &str,
        build_id: &str,
        kernel_version: &str,
        hypervisor_version: &str,
        huge_pages: bool,
    ) -> Result<Arc<dyn Template>>;
}
