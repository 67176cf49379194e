//! An ordered, self-checksummed unit of storage within a sorted run.

use crate::bytesutil::{crc64, key_in_range};
use crate::codec::{MARKER_DATA, MARKER_TOMBSTONE, ValueOrTombstone};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("corrupt format: {0}")]
    CorruptFormat(String),
}

/// A single key paired with either its value or a tombstone, as stored
/// in a block. Tombstones are carried all the way into sorted runs so a
/// deletion can shadow an older value at a lower level; compaction is
/// the only place that ever drops one (§4.9, bottom level only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEntry {
    pub key: Vec<u8>,
    pub value: ValueOrTombstone,
}

fn value_len(value: &ValueOrTombstone) -> usize {
    match value {
        ValueOrTombstone::Value(v) => v.len(),
        ValueOrTombstone::Tombstone => 0,
    }
}

#[derive(Debug, Clone)]
pub struct Block {
    entries: Vec<BlockEntry>,
    min_key: Vec<u8>,
    max_key: Vec<u8>,
}

impl Block {
    fn new(entries: Vec<BlockEntry>) -> Self {
        let min_key = entries.first().map(|e| e.key.clone()).unwrap_or_default();
        let max_key = entries.last().map(|e| e.key.clone()).unwrap_or_default();
        Block {
            entries,
            min_key,
            max_key,
        }
    }

    pub fn min_key(&self) -> &[u8] {
        &self.min_key
    }

    pub fn max_key(&self) -> &[u8] {
        &self.max_key
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[BlockEntry] {
        &self.entries
    }

    fn contains_key_range(&self, key: &[u8]) -> bool {
        !self.entries.is_empty() && key_in_range(key, &self.min_key, &self.max_key)
    }

    /// Sorted-map lookup within the block; short-circuits when the key
    /// falls outside `[minKey, maxKey]`. `None` means the key is absent
    /// from this block, not that it was deleted — callers distinguish a
    /// `Some(Tombstone)` (found, deleted) from a miss.
    pub fn get(&self, key: &[u8]) -> Option<&ValueOrTombstone> {
        if !self.contains_key_range(key) {
            return None;
        }
        self.entries
            .binary_search_by(|e| e.key.as_slice().cmp(key))
            .ok()
            .map(|idx| &self.entries[idx].value)
    }

    fn checksum(entries: &[BlockEntry]) -> u64 {
        let mut buf = Vec::new();
        for e in entries {
            buf.extend_from_slice(&e.key);
            match &e.value {
                ValueOrTombstone::Value(v) => {
                    buf.push(MARKER_DATA);
                    buf.extend_from_slice(v);
                }
                ValueOrTombstone::Tombstone => buf.push(MARKER_TOMBSTONE),
            }
        }
        crc64(&buf)
    }

    /// Serialized form:
    /// `[entryCount:u32][checksum:u64]([keyLen][key][marker][valLen][value])×entryCount`.
    /// `valLen` is always `0` for a tombstone entry.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.entries.len() as u32).to_be_bytes());
        buf.extend_from_slice(&Self::checksum(&self.entries).to_be_bytes());
        for e in &self.entries {
            buf.extend_from_slice(&(e.key.len() as u32).to_be_bytes());
            buf.extend_from_slice(&e.key);
            match &e.value {
                ValueOrTombstone::Value(v) => {
                    buf.push(MARKER_DATA);
                    buf.extend_from_slice(&(v.len() as u32).to_be_bytes());
                    buf.extend_from_slice(v);
                }
                ValueOrTombstone::Tombstone => {
                    buf.push(MARKER_TOMBSTONE);
                    buf.extend_from_slice(&0u32.to_be_bytes());
                }
            }
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BlockError> {
        if bytes.len() < 12 {
            return Err(BlockError::CorruptFormat("block too short".into()));
        }
        let entry_count = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let stored_checksum = u64::from_be_bytes(bytes[4..12].try_into().unwrap());

        let mut offset = 12usize;
        let mut entries = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            let key_len = read_u32(bytes, offset)? as usize;
            offset += 4;
            let key = bytes
                .get(offset..offset + key_len)
                .ok_or_else(|| BlockError::CorruptFormat("truncated block key".into()))?
                .to_vec();
            offset += key_len;
            let marker = *bytes
                .get(offset)
                .ok_or_else(|| BlockError::CorruptFormat("truncated block marker".into()))?;
            offset += 1;
            let val_len = read_u32(bytes, offset)? as usize;
            offset += 4;
            let value = match marker {
                MARKER_DATA => {
                    let bytes = bytes
                        .get(offset..offset + val_len)
                        .ok_or_else(|| BlockError::CorruptFormat("truncated block value".into()))?
                        .to_vec();
                    offset += val_len;
                    ValueOrTombstone::Value(bytes)
                }
                MARKER_TOMBSTONE => {
                    if val_len != 0 {
                        return Err(BlockError::CorruptFormat(
                            "tombstone entry carries a value".into(),
                        ));
                    }
                    ValueOrTombstone::Tombstone
                }
                other => {
                    return Err(BlockError::CorruptFormat(format!(
                        "unknown block entry marker {other}"
                    )));
                }
            };
            entries.push(BlockEntry { key, value });
        }

        let computed_checksum = Self::checksum(&entries);
        if computed_checksum != stored_checksum {
            return Err(BlockError::CorruptFormat("block checksum mismatch".into()));
        }

        Ok(Block::new(entries))
    }
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32, BlockError> {
    let slice = bytes
        .get(at..at + 4)
        .ok_or_else(|| BlockError::CorruptFormat("truncated u32 in block".into()))?;
    Ok(u32::from_be_bytes(slice.try_into().unwrap()))
}

/// Accumulates ordered entries into size-bounded [`Block`]s.
///
/// Guarantees: within a block, keys are sorted; across blocks in the
/// returned list, each block's max key is less than the next block's
/// min key. Callers are responsible for feeding keys in ascending order
/// (the memtable and compaction merge both already iterate that way).
pub struct BlockBuilder {
    block_size: usize,
    current: Vec<BlockEntry>,
    current_size: usize,
    blocks: Vec<Block>,
}

impl BlockBuilder {
    pub fn new(block_size: usize) -> Self {
        BlockBuilder {
            block_size,
            current: Vec::new(),
            current_size: 0,
            blocks: Vec::new(),
        }
    }

    fn entry_cost(key: &[u8], value: &ValueOrTombstone) -> usize {
        4 + key.len() + 1 + 4 + value_len(value)
    }

    pub fn add(&mut self, key: Vec<u8>, value: ValueOrTombstone) {
        let cost = Self::entry_cost(&key, &value);
        if !self.current.is_empty() && self.current_size + cost > self.block_size {
            self.seal_current();
        }
        self.current_size += cost;
        self.current.push(BlockEntry { key, value });
    }

    fn seal_current(&mut self) {
        let entries = std::mem::take(&mut self.current);
        self.current_size = 0;
        self.blocks.push(Block::new(entries));
    }

    /// Seals the tail block (if non-empty) and returns the ordered list
    /// of blocks.
    pub fn build(mut self) -> Vec<Block> {
        if !self.current.is_empty() {
            self.seal_current();
        }
        self.blocks
    }
}
