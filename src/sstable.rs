//! Sorted run ("SSTable"): a sequence of [`Block`]s plus a bloom filter
//! and footer, written once and read many times.
//!
//! File layout: `[block1][block2]…[blockN][bloomFilterBytes][footer]`.
//! Each block is preceded on disk by its `[u32 blockLen]`. The footer is
//! fixed 8 bytes: `[blockCount:u32][bloomLen:u32]`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::block::{Block, BlockBuilder, BlockError};
use crate::bloom::BloomFilter;
use crate::bytesutil::key_in_range;
use crate::codec::{CodecError, ValueOrTombstone};

#[derive(Debug, Error)]
pub enum SSTableError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("block error: {0}")]
    Block(#[from] BlockError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("corrupt format: {0}")]
    CorruptFormat(String),
}

const FOOTER_LEN: usize = 8;

/// Three-valued lookup result, mirroring the memtable's result shape so
/// callers never have to distinguish "tombstone" from "absent" by
/// nullability (spec §9 design notes). A run's blocks can themselves
/// hold tombstones (compaction only drops them at the bottom level), so
/// `Tombstone` here means "deleted by this run" and must shadow any
/// value found in an older run or a deeper level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SSTableGetResult {
    Value(Vec<u8>),
    Tombstone,
    NotFound,
}

/// An immutable, memory-mapped sorted run.
pub struct SSTable {
    pub path: PathBuf,
    pub level: usize,
    mmap: Mmap,
    blocks_meta: Vec<BlockRange>,
    bloom: BloomFilter,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
    pub file_size: u64,
}

struct BlockRange {
    offset: usize,
    len: usize,
    min_key: Vec<u8>,
    max_key: Vec<u8>,
}

impl SSTable {
    /// Builds a new sorted run from ordered blocks and a bloom filter
    /// covering every live key they contain, writing to a temporary path
    /// and renaming into place so a crash never leaves a half-written
    /// file at the final name.
    pub fn build(
        path: impl AsRef<Path>,
        level: usize,
        blocks: Vec<Block>,
        bloom: BloomFilter,
    ) -> Result<Self, SSTableError> {
        let path = path.as_ref().to_path_buf();
        let tmp_path = path.with_extension("dat.tmp");

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;

        let mut blocks_meta = Vec::with_capacity(blocks.len());
        let mut offset = 0usize;
        let mut min_key: Option<Vec<u8>> = None;
        let mut max_key: Option<Vec<u8>> = None;

        for block in &blocks {
            let encoded = block.encode();
            file.write_all(&(encoded.len() as u32).to_be_bytes())?;
            file.write_all(&encoded)?;

            if min_key.is_none() {
                min_key = Some(block.min_key().to_vec());
            }
            max_key = Some(block.max_key().to_vec());

            blocks_meta.push(BlockRange {
                offset: offset + 4,
                len: encoded.len(),
                min_key: block.min_key().to_vec(),
                max_key: block.max_key().to_vec(),
            });
            offset += 4 + encoded.len();
        }

        let bloom_bytes = bloom.encode();
        file.write_all(&bloom_bytes)?;
        let bloom_len = bloom_bytes.len() as u32;

        let mut footer = Vec::with_capacity(FOOTER_LEN);
        footer.extend_from_slice(&(blocks.len() as u32).to_be_bytes());
        footer.extend_from_slice(&bloom_len.to_be_bytes());
        file.write_all(&footer)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &path)?;

        let file_size = fs::metadata(&path)?.len();
        let min_key = min_key.unwrap_or_default();
        let max_key = max_key.unwrap_or_default();

        debug!(
            path = %path.display(),
            level,
            blocks = blocks_meta.len(),
            file_size,
            "built sorted run"
        );

        let mmap_file = File::open(&path)?;
        let mmap = unsafe { Mmap::map(&mmap_file)? };

        Ok(SSTable {
            path,
            level,
            mmap,
            blocks_meta,
            bloom,
            min_key,
            max_key,
            file_size,
        })
    }

    /// Opens an existing run from disk: reads the footer, then the
    /// bloom filter, then the block offset table (by scanning block
    /// length prefixes back-to-front from the footer's block count).
    pub fn open(path: impl AsRef<Path>, level: usize) -> Result<Self, SSTableError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let file_size = file.metadata()?.len();
        let mmap = unsafe { Mmap::map(&file)? };

        if (mmap.len() as u64) < FOOTER_LEN as u64 {
            return Err(SSTableError::CorruptFormat("file shorter than footer".into()));
        }
        let footer_start = mmap.len() - FOOTER_LEN;
        let block_count =
            u32::from_be_bytes(mmap[footer_start..footer_start + 4].try_into().unwrap()) as usize;
        let bloom_len =
            u32::from_be_bytes(mmap[footer_start + 4..footer_start + 8].try_into().unwrap())
                as usize;

        if bloom_len > footer_start {
            return Err(SSTableError::CorruptFormat("bloom length out of range".into()));
        }
        let bloom_start = footer_start - bloom_len;
        let bloom = BloomFilter::decode(&mmap[bloom_start..footer_start])?;

        let mut blocks_meta = Vec::with_capacity(block_count);
        let mut offset = 0usize;
        let mut min_key: Option<Vec<u8>> = None;
        let mut max_key: Option<Vec<u8>> = None;

        for _ in 0..block_count {
            if offset + 4 > bloom_start {
                return Err(SSTableError::CorruptFormat("block length runs past data region".into()));
            }
            let block_len =
                u32::from_be_bytes(mmap[offset..offset + 4].try_into().unwrap()) as usize;
            let data_start = offset + 4;
            let data_end = data_start + block_len;
            if data_end > bloom_start {
                return Err(SSTableError::CorruptFormat("block runs past data region".into()));
            }
            let block = Block::decode(&mmap[data_start..data_end])?;
            if min_key.is_none() {
                min_key = Some(block.min_key().to_vec());
            }
            max_key = Some(block.max_key().to_vec());
            blocks_meta.push(BlockRange {
                offset: data_start,
                len: block_len,
                min_key: block.min_key().to_vec(),
                max_key: block.max_key().to_vec(),
            });
            offset = data_end;
        }

        Ok(SSTable {
            path,
            level,
            mmap,
            blocks_meta,
            bloom,
            min_key: min_key.unwrap_or_default(),
            max_key: max_key.unwrap_or_default(),
            file_size,
        })
    }

    pub fn key_in_range(&self, key: &[u8]) -> bool {
        !self.blocks_meta.is_empty() && key_in_range(key, &self.min_key, &self.max_key)
    }

    fn decode_block_at(&self, range: &BlockRange) -> Result<Block, SSTableError> {
        let bytes = &self.mmap[range.offset..range.offset + range.len];
        Ok(Block::decode(bytes)?)
    }

    /// 1. Bloom filter check; 2. binary search blocks by range; 3. in-block lookup.
    pub fn get(&self, key: &[u8]) -> Result<SSTableGetResult, SSTableError> {
        if !self.bloom.might_contain(key) {
            trace!(path = %self.path.display(), "bloom filter negative");
            return Ok(SSTableGetResult::NotFound);
        }
        if !self.key_in_range(key) {
            return Ok(SSTableGetResult::NotFound);
        }

        let found = self
            .blocks_meta
            .binary_search_by(|range| {
                if key < range.min_key.as_slice() {
                    std::cmp::Ordering::Greater
                } else if key > range.max_key.as_slice() {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .ok();

        let Some(idx) = found else {
            return Ok(SSTableGetResult::NotFound);
        };

        let block = self.decode_block_at(&self.blocks_meta[idx])?;
        match block.get(key) {
            Some(ValueOrTombstone::Value(value)) => Ok(SSTableGetResult::Value(value.clone())),
            Some(ValueOrTombstone::Tombstone) => Ok(SSTableGetResult::Tombstone),
            None => Ok(SSTableGetResult::NotFound),
        }
    }

    /// Iterates every (key, value-or-tombstone) pair in ascending key
    /// order, used by compaction's multiway merge. Streams block-by-block:
    /// only one decoded block is resident at a time.
    pub fn iter(
        &self,
    ) -> impl Iterator<Item = Result<(Vec<u8>, ValueOrTombstone), SSTableError>> + '_ {
        self.blocks_meta.iter().flat_map(move |range| {
            match self.decode_block_at(range) {
                Ok(block) => {
                    let entries: Vec<_> = block
                        .entries()
                        .iter()
                        .map(|e| Ok((e.key.clone(), e.value.clone())))
                        .collect();
                    entries.into_iter()
                }
                Err(e) => vec![Err(e)].into_iter(),
            }
        })
    }

    pub fn delete_file(&self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove superseded sorted run");
        }
    }
}
