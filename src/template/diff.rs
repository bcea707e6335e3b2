//! Dirty-block sets and diff files.
//!
//! A diff is the persisted delta of one generation: the dirty blocks of the
//! image written back-to-back in ascending block-index order, with no
//! framing. [`DiffFile`] is the append-only sink used while a snapshot is
//! being cut; [`Diff`] is its finalized random-access form. The byte length
//! of a diff always equals `dirty block count · block size` — the header's
//! mapping is meaningless otherwise.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::template::Artifact;

/// An ordered set of block indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockSet {
    blocks: BTreeSet<u64>,
}

impl BlockSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, block: u64) -> bool {
        self.blocks.insert(block)
    }

    pub fn contains(&self, block: u64) -> bool {
        self.blocks.contains(&block)
    }

    pub fn count(&self) -> u64 {
        self.blocks.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Ascending iteration; this is the order diff blocks are laid out in.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.blocks.iter().copied()
    }

    pub fn is_subset(&self, other: &BlockSet) -> bool {
        self.blocks.is_subset(&other.blocks)
    }
}

impl FromIterator<u64> for BlockSet {
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> Self {
        Self {
            blocks: iter.into_iter().collect(),
        }
    }
}

/// Append-only sink for dirty blocks, in ascending index order.
///
/// The writer is responsible for the ordering; [`DiffFile`] only tracks the
/// byte count so [`DiffFile::into_diff`] can enforce the size invariant.
#[derive(Debug)]
pub struct DiffFile {
    path: PathBuf,
    file: tokio::fs::File,
    bytes_written: u64,
}

impl DiffFile {
    pub async fn create(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create diff directory {}", parent.display()))?;
        }
        let file = tokio::fs::File::create(&path)
            .await
            .with_context(|| format!("create diff file {}", path.display()))?;
        Ok(Self {
            path,
            file,
            bytes_written: 0,
        })
    }

    /// Appends one block worth of bytes.
    pub async fn write_block(&mut self, block: &[u8]) -> Result<()> {
        self.file
            .write_all(block)
            .await
            .with_context(|| format!("append to diff file {}", self.path.display()))?;
        self.bytes_written += block.len() as u64;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes and converts the sink into a random-access [`Diff`] keyed by
    /// `block_size`. Fails if the accumulated length does not divide evenly.
    pub async fn into_diff(mut self, block_size: u64) -> Result<Diff> {
        self.file
            .flush()
            .await
            .with_context(|| format!("flush diff file {}", self.path.display()))?;
        self.file
            .sync_all()
            .await
            .with_context(|| format!("sync diff file {}", self.path.display()))?;
        if self.bytes_written % block_size != 0 {
            bail!(
                "diff file {} has {} bytes, not a multiple of block size {}",
                self.path.display(),
                self.bytes_written,
                block_size
            );
        }
        Ok(Diff {
            path: self.path,
            block_size,
            block_count: self.bytes_written / block_size,
        })
    }
}

/// A finalized diff: dirty blocks back-to-back, readable by diff-local index.
#[derive(Debug, Clone)]
pub struct Diff {
    path: PathBuf,
    block_size: u64,
    block_count: u64,
}

impl Diff {
    /// Opens an existing diff file, validating the size invariant.
    pub async fn open(path: PathBuf, block_size: u64) -> Result<Self> {
        let len = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("stat diff file {}", path.display()))?
            .len();
        if len % block_size != 0 {
            bail!(
                "diff file {} has {} bytes, not a multiple of block size {}",
                path.display(),
                len,
                block_size
            );
        }
        Ok(Self {
            path,
            block_size,
            block_count: len / block_size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    pub fn len_bytes(&self) -> u64 {
        self.block_count * self.block_size
    }

    /// Reads the block at diff-local index `index` into `buf`.
    pub async fn read_block(&self, index: u64, buf: &mut [u8]) -> Result<()> {
        if index >= self.block_count {
            bail!(
                "diff block index {index} out of range (diff holds {} blocks)",
                self.block_count
            );
        }
        if buf.len() as u64 != self.block_size {
            bail!(
                "read buffer is {} bytes, block size is {}",
                buf.len(),
                self.block_size
            );
        }
        let mut file = tokio::fs::File::open(&self.path)
            .await
            .with_context(|| format!("open diff file {}", self.path.display()))?;
        file.seek(std::io::SeekFrom::Start(index * self.block_size))
            .await
            .context("seek in diff file")?;
        file.read_exact(buf).await.context("read diff block")?;
        Ok(())
    }
}

/// Result of a diff computation.
#[derive(Debug)]
pub struct DiffOutcome {
    /// Blocks actually written to the sink. Always a subset of the candidate
    /// set handed to [`create_diff`].
    pub refined: BlockSet,
    /// Candidate blocks dropped because they were byte-identical to the
    /// parent generation's own copy.
    pub skipped: BlockSet,
}

/// Copies the candidate dirty blocks of `source` into `sink` in ascending
/// index order, skipping blocks whose bytes match the parent artifact's
/// locally owned copy.
///
/// Blocks the parent sources from older generations are never filtered;
/// keeping them dirty is always correct, just not minimal.
pub async fn create_diff(
    source: &Path,
    block_size: u64,
    candidate: &BlockSet,
    parent: Option<&Artifact>,
    sink: &mut DiffFile,
) -> Result<DiffOutcome> {
    let mut file = tokio::fs::File::open(source)
        .await
        .with_context(|| format!("open diff source {}", source.display()))?;

    let mut block = vec![0u8; block_size as usize];
    let mut parent_block = vec![0u8; block_size as usize];
    let mut refined = BlockSet::new();
    let mut skipped = BlockSet::new();

    for index in candidate.iter() {
        file.seek(std::io::SeekFrom::Start(index * block_size))
            .await
            .with_context(|| format!("seek to block {index} in {}", source.display()))?;
        file.read_exact(&mut block)
            .await
            .with_context(|| format!("read block {index} from {}", source.display()))?;

        if let Some(parent) = parent {
            if parent.read_own_block(index, &mut parent_block)?.is_some()
                && parent_block == block
            {
                skipped.insert(index);
                continue;
            }
        }

        sink.write_block(&block).await?;
        refined.insert(index);
    }

    Ok(DiffOutcome { refined, skipped })
}
