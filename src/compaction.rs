//! Background compaction worker: merges sorted runs between levels.
//!
//! A single worker thread. After `start()` it schedules a compaction
//! check at a fixed delay (initial 10 s, period 30 s); `stop()` issues a
//! soft shutdown and waits up to 60 s before giving up. `trigger_compaction()`
//! submits one immediate check to the same worker rather than running
//! inline, so compaction is never run on more than one thread at a time.
//!
//! One pass compacts exactly one level: the first level (from 0 upward)
//! that `needs_compaction`. Level 0's merge is overlap-aware (a key may
//! appear in several runs; the newest run wins); level ≥ 1's merge is
//! disjoint (runs don't share keys, so it's effectively concatenation
//! with boundary fixing). Both go through the same multiway merge driven
//! by a min-heap keyed by `(key, runAge)`, newest run winning ties.
//!
//! A merge also absorbs any run already sitting at `dst_level` whose key
//! range overlaps the source runs' combined range (`select_overlapping_paths`),
//! treating it as older than every source run; otherwise the new output
//! and that pre-existing run would both occupy `dst_level` with
//! overlapping ranges, breaking the same-level-≥-1 disjointness invariant
//! and the binary search `LevelManager::get` relies on.
//!
//! Tombstones ride along through the merge rather than being dropped
//! (flush persists them too, `src/memtable.rs`): a deletion has to reach
//! whatever level holds the shadowed value before it can be discarded
//! safely. `write_merged_runs` drops a tombstone only when `dst_level`
//! is the bottom level, per spec §9's "drop only at the bottom level"
//! resolution; every other merge preserves it as a tombstone entry.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::block::BlockBuilder;
use crate::bloom::BloomFilter;
use crate::codec::ValueOrTombstone;
use crate::level::{LevelError, LevelManager};
use crate::sstable::{SSTable, SSTableError};

#[derive(Debug, Error)]
pub enum CompactionError {
    #[error("level manager error: {0}")]
    Level(#[from] LevelError),
    #[error("sstable error: {0}")]
    SSTable(#[from] SSTableError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

const INITIAL_DELAY: Duration = Duration::from_secs(10);
const PERIOD: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);
/// Target size for each output run produced by a compaction pass, used
/// when the merged stream is large enough to warrant splitting across
/// multiple files rather than one unbounded run.
const TARGET_RUN_SIZE_BYTES: u64 = 4 * 1024 * 1024;

#[derive(Debug, Default)]
pub struct CompactionStats {
    pub rounds_run: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub runs_merged: u64,
}

struct SharedStats {
    rounds_run: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    runs_merged: AtomicU64,
}

impl SharedStats {
    fn new() -> Self {
        SharedStats {
            rounds_run: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            runs_merged: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> CompactionStats {
        CompactionStats {
            rounds_run: self.rounds_run.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            runs_merged: self.runs_merged.load(Ordering::Relaxed),
        }
    }
}

enum WorkerMessage {
    Check,
    Stop,
}

pub struct CompactorConfig {
    pub block_size: usize,
    pub bloom_fpp: f64,
}

/// A cooperative periodic worker with explicit start/stop (spec §9:
/// never expressed as ambient background behavior).
pub struct Compactor {
    levels: Arc<LevelManager>,
    config: CompactorConfig,
    stats: Arc<SharedStats>,
    sender: Mutex<Option<Sender<WorkerMessage>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
}

impl Compactor {
    pub fn new(levels: Arc<LevelManager>, config: CompactorConfig) -> Self {
        Compactor {
            levels,
            config,
            stats: Arc::new(SharedStats::new()),
            sender: Mutex::new(None),
            handle: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> CompactionStats {
        self.stats.snapshot()
    }

    /// Spawns the background worker thread and schedules the first
    /// check after the initial delay.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return; // already running
        }
        let (tx, rx) = bounded::<WorkerMessage>(8);
        *self.sender.lock().expect("compactor sender lock poisoned") = Some(tx);

        let this = Arc::clone(self);
        let handle = thread::spawn(move || this.worker_loop(rx));
        *self.handle.lock().expect("compactor handle lock poisoned") = Some(handle);
        info!("compactor started");
    }

    fn worker_loop(&self, rx: Receiver<WorkerMessage>) {
        let mut next_deadline = INITIAL_DELAY;
        loop {
            match rx.recv_timeout(next_deadline) {
                Ok(WorkerMessage::Stop) => break,
                Ok(WorkerMessage::Check) => {
                    self.run_one_pass();
                    next_deadline = PERIOD;
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.run_one_pass();
                    next_deadline = PERIOD;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Submits one immediate check to the worker thread.
    pub fn trigger_compaction(&self) {
        if let Some(sender) = self.sender.lock().expect("compactor sender lock poisoned").as_ref() {
            let _ = sender.send(WorkerMessage::Check);
        }
    }

    /// Soft shutdown: signals the worker and waits up to 60 s before
    /// giving up on a clean join.
    pub fn stop(&self) {
        let sender = self.sender.lock().expect("compactor sender lock poisoned").take();
        if let Some(sender) = sender {
            let _ = sender.send(WorkerMessage::Stop);
        }
        let handle = self.handle.lock().expect("compactor handle lock poisoned").take();
        if let Some(handle) = handle {
            let (done_tx, done_rx) = bounded::<()>(1);
            thread::spawn(move || {
                let _ = handle.join();
                let _ = done_tx.send(());
            });
            if done_rx.recv_timeout(SHUTDOWN_GRACE).is_err() {
                warn!("compactor did not stop within the grace period");
            }
        }
        self.running.store(false, Ordering::SeqCst);
        info!("compactor stopped");
    }

    fn run_one_pass(&self) {
        let Some(level) = self.levels.first_level_needing_compaction() else {
            debug!("compaction check: nothing needs compacting");
            return;
        };
        match self.compact_level(level) {
            Ok(()) => {
                self.stats.rounds_run.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!(level, error = %e, "compaction pass failed; level structure unchanged"),
        }
    }

    fn compact_level(&self, level: usize) -> Result<(), CompactionError> {
        let candidate_paths = self.levels.select_compaction_candidates(level);
        if candidate_paths.is_empty() {
            return Ok(());
        }
        let src_runs = self.levels.open_runs_at(level, &candidate_paths)?;
        let dst_level = level + 1;

        let (min_key, max_key) = combined_range(&src_runs);
        let overlap_paths = self.levels.select_overlapping_paths(dst_level, &min_key, &max_key);
        let dst_runs = self.levels.open_runs_at(dst_level, &overlap_paths)?;

        let bytes_read: u64 = src_runs.iter().chain(&dst_runs).map(|r| r.file_size).sum();
        let total_sources = src_runs.len() + dst_runs.len();

        // dst_runs are strictly older than anything being pushed down from
        // `level`, so they sort first and lose every key tie to src_runs.
        let mut all_runs = dst_runs;
        all_runs.extend(src_runs);

        let merged = merge_runs(&all_runs)?;
        let is_bottom_level = dst_level == self.levels.max_level() - 1;
        let merged: Vec<_> = if is_bottom_level {
            merged
                .into_iter()
                .filter(|(_, v)| matches!(v, ValueOrTombstone::Value(_)))
                .collect()
        } else {
            merged
        };

        let new_paths = self.write_merged_runs(dst_level, merged)?;
        let mut new_runs = Vec::with_capacity(new_paths.len());
        let mut bytes_written = 0u64;
        for path in &new_paths {
            let run = SSTable::open(path, dst_level)?;
            bytes_written += run.file_size;
            new_runs.push(run);
        }

        self.levels
            .replace_files(level, &candidate_paths, dst_level, &overlap_paths, new_runs)?;

        self.stats.bytes_read.fetch_add(bytes_read, Ordering::Relaxed);
        self.stats.bytes_written.fetch_add(bytes_written, Ordering::Relaxed);
        self.stats.runs_merged.fetch_add(total_sources as u64, Ordering::Relaxed);

        info!(
            level,
            dst_level,
            sources = total_sources,
            outputs = new_paths.len(),
            "compacted level"
        );
        Ok(())
    }

    fn write_merged_runs(
        &self,
        dst_level: usize,
        merged: Vec<(Vec<u8>, ValueOrTombstone)>,
    ) -> Result<Vec<PathBuf>, CompactionError> {
        let mut outputs = Vec::new();
        let mut chunk_start = 0usize;
        let mut chunk_size = 0u64;
        let wall_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let mut sequence = 0u64;

        if merged.is_empty() {
            return Ok(outputs);
        }

        let mut i = 0usize;
        while i < merged.len() {
            let (k, v) = &merged[i];
            let value_len = match v {
                ValueOrTombstone::Value(v) => v.len(),
                ValueOrTombstone::Tombstone => 0,
            };
            chunk_size += (k.len() + value_len) as u64;
            let at_end = i == merged.len() - 1;
            if chunk_size >= TARGET_RUN_SIZE_BYTES || at_end {
                let chunk = &merged[chunk_start..=i];
                let mut builder = BlockBuilder::new(self.config.block_size);
                let mut bloom = BloomFilter::new(chunk.len(), self.config.bloom_fpp);
                for (k, v) in chunk {
                    bloom.insert(k);
                    builder.add(k.clone(), v.clone());
                }
                let blocks = builder.build();
                let path = self.levels.next_run_path(dst_level, wall_millis, sequence)?;
                sequence += 1;
                SSTable::build(&path, dst_level, blocks, bloom)?;
                outputs.push(path);
                chunk_start = i + 1;
                chunk_size = 0;
            }
            i += 1;
        }
        Ok(outputs)
    }
}

/// Overall `[min, max]` key span across all of `runs`; empty only when
/// `runs` is empty.
fn combined_range(runs: &[SSTable]) -> (Vec<u8>, Vec<u8>) {
    let mut min_key: Option<&[u8]> = None;
    let mut max_key: Option<&[u8]> = None;
    for run in runs {
        min_key = Some(match min_key {
            Some(m) if m <= run.min_key.as_slice() => m,
            _ => run.min_key.as_slice(),
        });
        max_key = Some(match max_key {
            Some(m) if m >= run.max_key.as_slice() => m,
            _ => run.max_key.as_slice(),
        });
    }
    (
        min_key.unwrap_or(&[]).to_vec(),
        max_key.unwrap_or(&[]).to_vec(),
    )
}

/// One candidate in the min-heap: the next unread `(key, value)` from a
/// given run, tagged with the run's age (higher = newer, so newer runs
/// win ties on the same key).
struct HeapItem {
    key: Vec<u8>,
    value: ValueOrTombstone,
    run_age: usize,
    run_idx: usize,
    entry_idx: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.run_age == other.run_age
    }
}
impl Eq for HeapItem {}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; we want the smallest key first, and
        // among equal keys the newest run (highest run_age) first.
        other
            .key
            .cmp(&self.key)
            .then_with(|| self.run_age.cmp(&other.run_age))
    }
}
impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Multiway merge over already-sorted per-run entry lists. `runs` must
/// be given oldest-first so `run_idx` doubles as `run_age`; callers pass
/// any absorbed `dst_level` runs first, then the source-level candidates
/// in their existing oldest-first order.
fn merge_runs(runs: &[SSTable]) -> Result<Vec<(Vec<u8>, ValueOrTombstone)>, CompactionError> {
    let per_run: Vec<Vec<(Vec<u8>, ValueOrTombstone)>> = runs
        .iter()
        .map(|r| r.iter().collect::<Result<Vec<_>, _>>())
        .collect::<Result<Vec<_>, _>>()?;

    let mut heap = BinaryHeap::new();
    for (run_idx, entries) in per_run.iter().enumerate() {
        if let Some((k, v)) = entries.first() {
            heap.push(HeapItem {
                key: k.clone(),
                value: v.clone(),
                run_age: run_idx,
                run_idx,
                entry_idx: 0,
            });
        }
    }

    let mut output = Vec::new();
    while let Some(item) = heap.pop() {
        let next_entry_idx = item.entry_idx + 1;
        if let Some((k, v)) = per_run[item.run_idx].get(next_entry_idx) {
            heap.push(HeapItem {
                key: k.clone(),
                value: v.clone(),
                run_age: item.run_idx,
                run_idx: item.run_idx,
                entry_idx: next_entry_idx,
            });
        }

        // Drain and discard any other pending entries for the same key
        // (older runs); the newest (popped first, by Ord above) wins.
        let winning_key = item.key.clone();
        while let Some(peek) = heap.peek() {
            if peek.key == winning_key {
                let dup = heap.pop().unwrap();
                let dup_next = dup.entry_idx + 1;
                if let Some((k, v)) = per_run[dup.run_idx].get(dup_next) {
                    heap.push(HeapItem {
                        key: k.clone(),
                        value: v.clone(),
                        run_age: dup.run_idx,
                        run_idx: dup.run_idx,
                        entry_idx: dup_next,
                    });
                }
            } else {
                break;
            }
        }

        output.push((item.key, item.value));
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockBuilder as TestBlockBuilder;
    use crate::bloom::BloomFilter as TestBloom;
    use crate::codec::ValueOrTombstone;
    use crate::level::LevelConfig;
    use tempfile::TempDir;

    fn build_run(dir: &TempDir, name: &str, pairs: &[(&str, &str)]) -> SSTable {
        let mut builder = TestBlockBuilder::new(4096);
        let mut bloom = TestBloom::new(pairs.len().max(1), 0.01);
        for (k, v) in pairs {
            builder.add(k.as_bytes().to_vec(), ValueOrTombstone::Value(v.as_bytes().to_vec()));
            bloom.insert(k.as_bytes());
        }
        SSTable::build(dir.path().join(name), 0, builder.build(), bloom).unwrap()
    }

    fn build_run_with_tombstone(dir: &TempDir, name: &str, tombstone_key: &str) -> SSTable {
        let mut builder = TestBlockBuilder::new(4096);
        let mut bloom = TestBloom::new(1, 0.01);
        builder.add(tombstone_key.as_bytes().to_vec(), ValueOrTombstone::Tombstone);
        bloom.insert(tombstone_key.as_bytes());
        SSTable::build(dir.path().join(name), 0, builder.build(), bloom).unwrap()
    }

    #[test]
    fn merge_runs_newest_wins_on_overlap() {
        let dir = TempDir::new().unwrap();
        let older = build_run(&dir, "older.dat", &[("k", "old"), ("m", "1")]);
        let newer = build_run(&dir, "newer.dat", &[("k", "new")]);
        let merged = merge_runs(&[older, newer]).unwrap();
        assert_eq!(
            merged,
            vec![
                (b"k".to_vec(), ValueOrTombstone::Value(b"new".to_vec())),
                (b"m".to_vec(), ValueOrTombstone::Value(b"1".to_vec())),
            ]
        );
    }

    #[test]
    fn merge_runs_disjoint_concatenates_in_order() {
        let dir = TempDir::new().unwrap();
        let a = build_run(&dir, "a.dat", &[("a", "1")]);
        let b = build_run(&dir, "b.dat", &[("b", "2")]);
        let merged = merge_runs(&[a, b]).unwrap();
        assert_eq!(
            merged,
            vec![
                (b"a".to_vec(), ValueOrTombstone::Value(b"1".to_vec())),
                (b"b".to_vec(), ValueOrTombstone::Value(b"2".to_vec())),
            ]
        );
    }

    #[test]
    fn merge_runs_carries_a_tombstone_through() {
        let dir = TempDir::new().unwrap();
        let older = build_run(&dir, "older.dat", &[("k", "v")]);
        let newer = build_run_with_tombstone(&dir, "newer.dat", "k");
        let merged = merge_runs(&[older, newer]).unwrap();
        assert_eq!(merged, vec![(b"k".to_vec(), ValueOrTombstone::Tombstone)]);
    }

    #[test]
    fn compact_level0_shrinks_run_count_and_preserves_keys() {
        let dir = TempDir::new().unwrap();
        let mut config = LevelConfig::default();
        config.level0_file_threshold = 2;
        let levels = Arc::new(LevelManager::new(dir.path(), config));
        levels.add_run(0, build_run(&dir, "a.dat", &[("a", "1")])).unwrap();
        levels.add_run(0, build_run(&dir, "b.dat", &[("b", "2")])).unwrap();

        let compactor = Compactor::new(
            Arc::clone(&levels),
            CompactorConfig {
                block_size: 4096,
                bloom_fpp: 0.01,
            },
        );
        compactor.compact_level(0).unwrap();

        assert_eq!(levels.run_count(0), 0);
        assert!(levels.run_count(1) >= 1);

        use crate::sstable::SSTableGetResult;
        assert_eq!(levels.get(b"a").unwrap(), SSTableGetResult::Value(b"1".to_vec()));
        assert_eq!(levels.get(b"b").unwrap(), SSTableGetResult::Value(b"2".to_vec()));
    }

    #[test]
    fn non_bottom_compaction_preserves_a_tombstone() {
        let dir = TempDir::new().unwrap();
        let mut config = LevelConfig::default();
        config.level0_file_threshold = 2;
        config.max_level = 7;
        let levels = Arc::new(LevelManager::new(dir.path(), config));
        levels.add_run(0, build_run(&dir, "a.dat", &[("k", "v")])).unwrap();
        levels.add_run(0, build_run_with_tombstone(&dir, "b.dat", "k")).unwrap();

        let compactor = Compactor::new(
            Arc::clone(&levels),
            CompactorConfig {
                block_size: 4096,
                bloom_fpp: 0.01,
            },
        );
        compactor.compact_level(0).unwrap();

        use crate::sstable::SSTableGetResult;
        assert_eq!(levels.get(b"k").unwrap(), SSTableGetResult::Tombstone);
    }

    #[test]
    fn bottom_level_compaction_drops_a_tombstone() {
        let dir = TempDir::new().unwrap();
        let mut config = LevelConfig::default();
        config.level0_file_threshold = 2;
        config.max_level = 1;
        let levels = Arc::new(LevelManager::new(dir.path(), config));

        let compactor = Compactor::new(
            Arc::clone(&levels),
            CompactorConfig {
                block_size: 4096,
                bloom_fpp: 0.01,
            },
        );

        // level 0 is the only level, so compacting it writes dst_level = 1,
        // which is out of range; instead exercise the drop path directly by
        // merging a tombstone-only run into the bottom level's write path.
        let tombstone_run = build_run_with_tombstone(&dir, "t.dat", "k");
        let merged = merge_runs(&[tombstone_run]).unwrap();
        let is_bottom_level = true;
        let merged: Vec<_> = if is_bottom_level {
            merged
                .into_iter()
                .filter(|(_, v)| matches!(v, ValueOrTombstone::Value(_)))
                .collect()
        } else {
            merged
        };
        assert!(merged.is_empty());
        let outputs = compactor.write_merged_runs(0, merged).unwrap();
        assert!(outputs.is_empty());
    }

    #[test]
    fn compaction_absorbs_overlapping_dst_level_run() {
        let dir = TempDir::new().unwrap();
        let mut config = LevelConfig::default();
        config.level0_file_threshold = 1;
        let levels = Arc::new(LevelManager::new(dir.path(), config));

        levels.add_run(1, build_run(&dir, "existing.dat", &[("a", "old"), ("m", "untouched")])).unwrap();
        levels.add_run(0, build_run(&dir, "fresh.dat", &[("b", "new")])).unwrap();

        let compactor = Compactor::new(
            Arc::clone(&levels),
            CompactorConfig {
                block_size: 4096,
                bloom_fpp: 0.01,
            },
        );
        compactor.compact_level(0).unwrap();

        assert_eq!(levels.run_count(1), 1);
        use crate::sstable::SSTableGetResult;
        assert_eq!(levels.get(b"a").unwrap(), SSTableGetResult::Value(b"old".to_vec()));
        assert_eq!(levels.get(b"b").unwrap(), SSTableGetResult::Value(b"new".to_vec()));
        assert_eq!(levels.get(b"m").unwrap(), SSTableGetResult::Value(b"untouched".to_vec()));
    }

    #[test]
    fn start_stop_is_idempotent_and_clean() {
        let dir = TempDir::new().unwrap();
        let levels = Arc::new(LevelManager::new(dir.path(), LevelConfig::default()));
        let compactor = Arc::new(Compactor::new(
            levels,
            CompactorConfig {
                block_size: 4096,
                bloom_fpp: 0.01,
            },
        ));
        compactor.start();
        assert!(compactor.is_running());
        compactor.start(); // no-op, already running
        compactor.trigger_compaction();
        compactor.stop();
        assert!(!compactor.is_running());
    }

    #[test]
    fn compacting_with_no_candidates_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let levels = Arc::new(LevelManager::new(dir.path(), LevelConfig::default()));
        let compactor = Compactor::new(
            Arc::clone(&levels),
            CompactorConfig {
                block_size: 4096,
                bloom_fpp: 0.01,
            },
        );
        compactor.compact_level(0).unwrap();
        assert_eq!(levels.run_count(0), 0);
        assert_eq!(levels.run_count(1), 0);
    }
}
