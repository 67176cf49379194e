//! In-memory write buffer: an ordered map from key to value-or-tombstone,
//! with size accounting and a flush path to a new Level-0 sorted run.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use thiserror::Error;
use tracing::debug;

use crate::block::BlockBuilder;
use crate::bloom::BloomFilter;
use crate::codec::ValueOrTombstone;
use crate::sstable::{SSTable, SSTableError};

#[derive(Debug, Error)]
pub enum MemtableError {
    #[error("sstable error: {0}")]
    SSTable(#[from] SSTableError),
}

/// Three-valued memtable lookup result (spec §9: model live/tombstone/
/// absent as a tagged value, never by nullability alone).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemtableGetResult {
    Value(Vec<u8>),
    Tombstone,
    Absent,
}

#[derive(Debug, Clone)]
enum Entry {
    Value(Vec<u8>),
    Tombstone,
}

struct Inner {
    tree: BTreeMap<Vec<u8>, Entry>,
    approximate_size: usize,
}

pub struct Memtable {
    inner: RwLock<Inner>,
    memtable_size: usize,
    max_sequence: AtomicU64,
}

impl Memtable {
    pub fn new(memtable_size: usize) -> Self {
        Memtable {
            inner: RwLock::new(Inner {
                tree: BTreeMap::new(),
                approximate_size: 0,
            }),
            memtable_size,
            max_sequence: AtomicU64::new(0),
        }
    }

    /// Records the highest WAL sequence number reflected in this
    /// memtable, used when marking the WAL flushed after a successful
    /// flush to a sorted run.
    pub fn observe_sequence(&self, sequence: u64) {
        self.max_sequence.fetch_max(sequence, Ordering::SeqCst);
    }

    pub fn max_sequence(&self) -> u64 {
        self.max_sequence.load(Ordering::SeqCst)
    }

    /// Insert or replace. Size changes by `+|k|+|v|` on insert, by
    /// `|v| - |oldV|` on replace.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) {
        let mut inner = self.inner.write().expect("memtable lock poisoned");
        let added = key.len() + value.len();
        let removed = match inner.tree.get(&key) {
            Some(Entry::Value(old)) => old.len(),
            Some(Entry::Tombstone) | None => 0,
        };
        inner.tree.insert(key, Entry::Value(value));
        inner.approximate_size = inner.approximate_size + added - removed;
    }

    /// Stores a tombstone sentinel. Size decreases by `|oldV|` when
    /// shadowing a live value; the sentinel itself contributes zero.
    pub fn delete(&self, key: Vec<u8>) {
        let mut inner = self.inner.write().expect("memtable lock poisoned");
        let removed = match inner.tree.get(&key) {
            Some(Entry::Value(old)) => old.len(),
            Some(Entry::Tombstone) | None => 0,
        };
        inner.tree.insert(key, Entry::Tombstone);
        inner.approximate_size -= removed;
    }

    pub fn get(&self, key: &[u8]) -> MemtableGetResult {
        let inner = self.inner.read().expect("memtable lock poisoned");
        match inner.tree.get(key) {
            Some(Entry::Value(v)) => MemtableGetResult::Value(v.clone()),
            Some(Entry::Tombstone) => MemtableGetResult::Tombstone,
            None => MemtableGetResult::Absent,
        }
    }

    pub fn should_flush(&self) -> bool {
        let inner = self.inner.read().expect("memtable lock poisoned");
        inner.approximate_size >= self.memtable_size
    }

    pub fn approximate_size(&self) -> usize {
        self.inner.read().expect("memtable lock poisoned").approximate_size
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().expect("memtable lock poisoned").tree.is_empty()
    }

    /// Iterates in key order, carrying tombstones into the new run rather
    /// than dropping them: a tombstone must survive at least until a
    /// bottom-level compaction sees it, or a delete could resurrect an
    /// older value still sitting in a deeper level (§8, §4.9). Builds a
    /// new Level-0 sorted run at `path`; returns `None` only when the
    /// memtable holds no entries at all.
    pub fn flush_to_sstable(
        &self,
        path: impl AsRef<std::path::Path>,
        block_size: usize,
        bloom_fpp: f64,
    ) -> Result<Option<SSTable>, MemtableError> {
        let inner = self.inner.read().expect("memtable lock poisoned");
        let entry_count = inner.tree.len();

        if entry_count == 0 {
            debug!("flush_to_sstable: memtable empty, nothing to flush");
            return Ok(None);
        }

        let mut builder = BlockBuilder::new(block_size);
        let mut bloom = BloomFilter::new(entry_count, bloom_fpp);
        for (key, entry) in inner.tree.iter() {
            bloom.insert(key);
            let value = match entry {
                Entry::Value(v) => ValueOrTombstone::Value(v.clone()),
                Entry::Tombstone => ValueOrTombstone::Tombstone,
            };
            builder.add(key.clone(), value);
        }
        drop(inner);

        let blocks = builder.build();
        let sstable = SSTable::build(path, 0, blocks, bloom)?;
        debug!(entry_count, "flushed memtable to new level-0 sorted run");
        Ok(Some(sstable))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn put_then_get_returns_value() {
        let mt = Memtable::new(1024);
        mt.put(b"k".to_vec(), b"v".to_vec());
        assert_eq!(mt.get(b"k"), MemtableGetResult::Value(b"v".to_vec()));
    }

    #[test]
    fn delete_shadows_with_tombstone() {
        let mt = Memtable::new(1024);
        mt.put(b"k".to_vec(), b"v".to_vec());
        mt.delete(b"k".to_vec());
        assert_eq!(mt.get(b"k"), MemtableGetResult::Tombstone);
    }

    #[test]
    fn absent_key_is_distinct_from_tombstone() {
        let mt = Memtable::new(1024);
        assert_eq!(mt.get(b"missing"), MemtableGetResult::Absent);
    }

    #[test]
    fn size_accounting_on_insert_and_replace() {
        let mt = Memtable::new(1024);
        mt.put(b"k".to_vec(), b"abc".to_vec());
        assert_eq!(mt.approximate_size(), 1 + 3);
        mt.put(b"k".to_vec(), b"de".to_vec());
        assert_eq!(mt.approximate_size(), 1 + 2);
    }

    #[test]
    fn should_flush_once_size_threshold_reached() {
        let mt = Memtable::new(4);
        assert!(!mt.should_flush());
        mt.put(b"k".to_vec(), b"abcd".to_vec());
        assert!(mt.should_flush());
    }

    #[test]
    fn flush_preserves_tombstones_in_the_sorted_run() {
        let dir = TempDir::new().unwrap();
        let mt = Memtable::new(1024);
        mt.put(b"a".to_vec(), b"1".to_vec());
        mt.put(b"b".to_vec(), b"2".to_vec());
        mt.delete(b"b".to_vec());

        let sstable = mt
            .flush_to_sstable(dir.path().join("run.dat"), 4096, 0.01)
            .unwrap()
            .unwrap();

        use crate::sstable::SSTableGetResult;
        assert_eq!(sstable.get(b"a").unwrap(), SSTableGetResult::Value(b"1".to_vec()));
        assert_eq!(sstable.get(b"b").unwrap(), SSTableGetResult::Tombstone);
    }

    #[test]
    fn flushing_empty_memtable_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let mt = Memtable::new(1024);
        let result = mt.flush_to_sstable(dir.path().join("run.dat"), 4096, 0.01).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn flushing_all_tombstones_still_persists_the_deletions() {
        let dir = TempDir::new().unwrap();
        let mt = Memtable::new(1024);
        mt.put(b"a".to_vec(), b"1".to_vec());
        mt.delete(b"a".to_vec());
        let sstable = mt
            .flush_to_sstable(dir.path().join("run.dat"), 4096, 0.01)
            .unwrap()
            .unwrap();

        use crate::sstable::SSTableGetResult;
        assert_eq!(sstable.get(b"a").unwrap(), SSTableGetResult::Tombstone);
    }
}
