//! Generational artifact headers.
//!
//! Every template artifact (memfile or rootfs image) carries a [`Header`]:
//! fixed [`Metadata`] plus a [`Mapping`] — a sorted, disjoint interval table
//! that locates each virtual block of the image in the diff of some build in
//! the ancestry chain. A restore walks the mapping and reads each block from
//! the newest generation that contains it; parent bytes are never rewritten.
//!
//! ```text
//! virtual image   [0 ............................ size/block_size)
//! mapping         [0,16)→gen0   [16,17)→gen2   [17,4096)→gen0 ...
//!                                    │
//!                                    └► block 0 of gen2's diff file
//! ```
//!
//! [`merge_mappings`] is the primitive that makes generational storage work:
//! a two-pointer walk over two sorted interval lists where the newer
//! generation wins every overlap.

use anyhow::{bail, Context, Result};
use uuid::Uuid;

/// Current on-disk header version.
pub const HEADER_VERSION: u32 = 1;

/// Smallest permitted block size (one small page).
pub const MIN_BLOCK_SIZE: u64 = 4096;

/// Fixed-size metadata describing one generation of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    /// Header format version.
    pub version: u32,
    /// Monotonically increasing counter along the ancestry chain.
    pub generation: u32,
    /// Power of two, ≥ 4 KiB. 4 KiB for memfiles, 2 MiB for rootfs images.
    pub block_size: u64,
    /// Virtual image size in bytes; multiple of `block_size`.
    pub size: u64,
    /// Build that produced this generation.
    pub build_id: Uuid,
    /// Root of the ancestry chain; identical across all generations.
    pub base_build_id: Uuid,
}

impl Metadata {
    /// Validates the block-size and size invariants.
    pub fn validate(&self) -> Result<()> {
        if self.block_size < MIN_BLOCK_SIZE || !self.block_size.is_power_of_two() {
            bail!(
                "invalid block size {}: must be a power of two ≥ {}",
                self.block_size,
                MIN_BLOCK_SIZE
            );
        }
        if self.size % self.block_size != 0 {
            bail!(
                "image size {} is not a multiple of block size {}",
                self.size,
                self.block_size
            );
        }
        Ok(())
    }

    /// Metadata for the next generation of this artifact, produced by
    /// `build_id`. Block size, image size and the chain root carry over.
    pub fn next_generation(&self, build_id: Uuid) -> Metadata {
        Metadata {
            version: HEADER_VERSION,
            generation: self.generation + 1,
            block_size: self.block_size,
            size: self.size,
            build_id,
            base_build_id: self.base_build_id,
        }
    }

    /// Number of blocks in the virtual image.
    pub fn block_count(&self) -> u64 {
        self.size / self.block_size
    }
}

/// One interval of the mapping. All quantities are in blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingEntry {
    /// First virtual block this entry covers.
    pub virtual_block_start: u64,
    /// Number of covered blocks.
    pub length: u64,
    /// Build whose diff holds the bytes.
    pub source_build_id: Uuid,
    /// First block inside that build's diff file.
    pub source_block_start: u64,
}

impl MappingEntry {
    fn end(&self) -> u64 {
        self.virtual_block_start + self.length
    }

    /// The tail of this entry from virtual block `at` on, with the source
    /// offset advanced to match.
    fn split_tail(&self, at: u64) -> MappingEntry {
        debug_assert!(at > self.virtual_block_start && at < self.end());
        let skip = at - self.virtual_block_start;
        MappingEntry {
            virtual_block_start: at,
            length: self.length - skip,
            source_build_id: self.source_build_id,
            source_block_start: self.source_block_start + skip,
        }
    }
}

/// Metadata plus mapping, as persisted next to each diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub metadata: Metadata,
    pub mapping: Vec<MappingEntry>,
}

impl Header {
    /// Builds a header, rejecting unsorted or overlapping mappings.
    pub fn new(metadata: Metadata, mapping: Vec<MappingEntry>) -> Result<Self> {
        metadata.validate()?;
        validate_mapping(&mapping)?;
        Ok(Self { metadata, mapping })
    }

    /// A generation-zero header: the whole image is sourced from its own
    /// build, one entry, identity offsets.
    pub fn base(metadata: Metadata) -> Result<Self> {
        metadata.validate()?;
        let mapping = vec![MappingEntry {
            virtual_block_start: 0,
            length: metadata.block_count(),
            source_build_id: metadata.build_id,
            source_block_start: 0,
        }];
        Ok(Self { metadata, mapping })
    }

    /// Virtual blocks covered by the mapping.
    pub fn mapped_blocks(&self) -> u64 {
        self.mapping.iter().map(|e| e.length).sum()
    }

    /// The mapping entry covering `virtual_block`, if any.
    pub fn lookup(&self, virtual_block: u64) -> Option<&MappingEntry> {
        let idx = self
            .mapping
            .partition_point(|e| e.virtual_block_start <= virtual_block);
        let entry = self.mapping.get(idx.checked_sub(1)?)?;
        (virtual_block < entry.end()).then_some(entry)
    }
}

fn validate_mapping(mapping: &[MappingEntry]) -> Result<()> {
    let mut prev_end = 0u64;
    for (i, entry) in mapping.iter().enumerate() {
        if entry.length == 0 {
            bail!("mapping entry {i} has zero length");
        }
        if i > 0 && entry.virtual_block_start < prev_end {
            bail!(
                "mapping entry {i} starts at block {} inside the previous entry (ends at {})",
                entry.virtual_block_start,
                prev_end
            );
        }
        prev_end = entry.end();
    }
    Ok(())
}

/// Builds the mapping for a fresh diff: each contiguous run of dirty blocks
/// becomes one entry sourced from `build_id`, with source blocks laid out
/// consecutively in the order the diff was written (ascending index).
pub fn create_mapping(build_id: Uuid, dirty: &crate::template::diff::BlockSet) -> Vec<MappingEntry> {
    let mut entries: Vec<MappingEntry> = Vec::new();
    let mut written = 0u64;
    for block in dirty.iter() {
        match entries.last_mut() {
            Some(last) if last.end() == block => last.length += 1,
            _ => entries.push(MappingEntry {
                virtual_block_start: block,
                length: 1,
                source_build_id: build_id,
                source_block_start: written,
            }),
        }
        written += 1;
    }
    entries
}

/// Merges a parent mapping with the mapping of a newer generation.
///
/// Wherever the two overlap the newer generation wins; parent entries are
/// split around the overlap with their source offsets advanced. The result
/// is sorted with disjoint ranges and covers exactly the union of both
/// inputs' ranges (for a well-formed chain, the parent's full range).
pub fn merge_mappings(parent: &[MappingEntry], newer: &[MappingEntry]) -> Vec<MappingEntry> {
    let mut out: Vec<MappingEntry> = Vec::with_capacity(parent.len() + newer.len());
    let mut newer_iter = newer.iter().peekable();
    let mut pending: Option<MappingEntry> = None;
    let mut parent_iter = parent.iter();

    loop {
        let cur = match pending.take().or_else(|| parent_iter.next().cloned()) {
            Some(cur) => cur,
            None => break,
        };
        let cur_start = cur.virtual_block_start;
        let cur_end = cur.end();

        // Newer entries that end before this parent piece slot in as-is.
        while let Some(n) = newer_iter.peek() {
            if n.end() <= cur_start {
                out.push((*n).clone());
                newer_iter.next();
            } else {
                break;
            }
        }

        match newer_iter.peek() {
            Some(n) if n.virtual_block_start < cur_end => {
                let n_start = n.virtual_block_start;
                let n_end = n.end();
                if n_start > cur_start {
                    // Surviving head of the parent piece.
                    out.push(MappingEntry {
                        virtual_block_start: cur_start,
                        length: n_start - cur_start,
                        source_build_id: cur.source_build_id,
                        source_block_start: cur.source_block_start,
                    });
                }
                if n_end < cur_end {
                    // Newer entry is contained: emit it, keep the parent tail.
                    out.push((*n).clone());
                    newer_iter.next();
                    pending = Some(cur.split_tail(n_end));
                }
                // Otherwise the newer entry spans past this parent piece and
                // stays pending; it is emitted once the parents it shadows
                // are consumed.
            }
            _ => out.push(cur),
        }
    }

    out.extend(newer_iter.cloned());
    out
}

// ---------------------------------------------------------------------------
// Wire format
//
// Fixed field order, little endian:
//   metadata: version u32 | generation u32 | block_size u64 | size u64
//           | build_id u128 | base_build_id u128
//   mapping:  entry_count u64, then per entry
//             virtual_block_start u64 | length u64
//           | source_build_id u128 | source_block_start u64
// ---------------------------------------------------------------------------

const METADATA_BYTES: usize = 4 + 4 + 8 + 8 + 16 + 16;
const ENTRY_BYTES: usize = 8 + 8 + 16 + 8;

impl Header {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(METADATA_BYTES + 8 + self.mapping.len() * ENTRY_BYTES);
        buf.extend_from_slice(&self.metadata.version.to_le_bytes());
        buf.extend_from_slice(&self.metadata.generation.to_le_bytes());
        buf.extend_from_slice(&self.metadata.block_size.to_le_bytes());
        buf.extend_from_slice(&self.metadata.size.to_le_bytes());
        buf.extend_from_slice(&self.metadata.build_id.as_u128().to_le_bytes());
        buf.extend_from_slice(&self.metadata.base_build_id.as_u128().to_le_bytes());
        buf.extend_from_slice(&(self.mapping.len() as u64).to_le_bytes());
        for entry in &self.mapping {
            buf.extend_from_slice(&entry.virtual_block_start.to_le_bytes());
            buf.extend_from_slice(&entry.length.to_le_bytes());
            buf.extend_from_slice(&entry.source_build_id.as_u128().to_le_bytes());
            buf.extend_from_slice(&entry.source_block_start.to_le_bytes());
        }
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        let metadata = Metadata {
            version: reader.u32().context("header truncated in version")?,
            generation: reader.u32().context("header truncated in generation")?,
            block_size: reader.u64().context("header truncated in block size")?,
            size: reader.u64().context("header truncated in size")?,
            build_id: Uuid::from_u128(reader.u128().context("header truncated in build id")?),
            base_build_id: Uuid::from_u128(
                reader.u128().context("header truncated in base build id")?,
            ),
        };
        if metadata.version != HEADER_VERSION {
            bail!("unsupported header version {}", metadata.version);
        }
        let count = reader.u64().context("header truncated in mapping count")?;
        let mut mapping = Vec::with_capacity(count.min(1 << 20) as usize);
        for i in 0..count {
            mapping.push(MappingEntry {
                virtual_block_start: reader
                    .u64()
                    .with_context(|| format!("header truncated in mapping entry {i}"))?,
                length: reader
                    .u64()
                    .with_context(|| format!("header truncated in mapping entry {i}"))?,
                source_build_id: Uuid::from_u128(
                    reader
                        .u128()
                        .with_context(|| format!("header truncated in mapping entry {i}"))?,
                ),
                source_block_start: reader
                    .u64()
                    .with_context(|| format!("header truncated in mapping entry {i}"))?,
            });
        }
        Header::new(metadata, mapping)
    }
}

struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .context("unexpected end of input")?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    fn u128(&mut self) -> Result<u128> {
        Ok(u128::from_le_bytes(self.take(16)?.try_into().expect("16 bytes")))
    }
}
