//! Owns the set of sorted runs per level, routes reads across them, and
//! selects compaction victims.
//!
//! Level 0 holds time-ordered, possibly-overlapping runs; level ≥ 1
//! holds key-disjoint runs sorted by min key. A reader-writer lock
//! protects the whole level map; callers needing a consistent view
//! across `get` and a structural mutation take the same lock the
//! mutation does.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::sstable::{SSTable, SSTableError, SSTableGetResult};

#[derive(Debug, Error)]
pub enum LevelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sstable error: {0}")]
    SSTable(#[from] SSTableError),
    #[error("level {0} exceeds configured maxLevel")]
    LevelOutOfRange(usize),
}

pub struct LevelConfig {
    pub max_level: usize,
    pub level_multiplier: u64,
    pub level0_file_threshold: usize,
    pub level1_max_size: u64,
}

impl Default for LevelConfig {
    fn default() -> Self {
        LevelConfig {
            max_level: 7,
            level_multiplier: 10,
            level0_file_threshold: 4,
            level1_max_size: 10 * 1024 * 1024,
        }
    }
}

struct LevelsState {
    levels: Vec<Vec<SSTable>>,
}

pub struct LevelManager {
    state: RwLock<LevelsState>,
    config: LevelConfig,
    data_directory: PathBuf,
}

impl LevelManager {
    pub fn new(data_directory: impl AsRef<Path>, config: LevelConfig) -> Self {
        let levels = (0..config.max_level).map(|_| Vec::new()).collect();
        LevelManager {
            state: RwLock::new(LevelsState { levels }),
            config,
            data_directory: data_directory.as_ref().to_path_buf(),
        }
    }

    pub fn data_directory(&self) -> &Path {
        &self.data_directory
    }

    pub fn max_level(&self) -> usize {
        self.config.max_level
    }

    fn level_dir(&self, level: usize) -> PathBuf {
        self.data_directory.join(format!("level_{level}"))
    }

    /// Per-level size cap: `cap[0] = ∞` (governed by file count),
    /// `cap[i] = level1MaxSize · levelMultiplier^(i-1)` for `i ≥ 1`.
    pub fn capacity_bytes(&self, level: usize) -> Option<u64> {
        if level == 0 {
            None
        } else {
            Some(self.config.level1_max_size * self.config.level_multiplier.pow((level - 1) as u32))
        }
    }

    /// For each `level_<i>` directory under the data directory, reads
    /// every `*.dat` file and adds it to that level. Missing directories
    /// are skipped.
    pub fn load_existing_sstables(&self) -> Result<(), LevelError> {
        let mut state = self.state.write().expect("level manager lock poisoned");
        for level in 0..self.config.max_level {
            let dir = self.level_dir(level);
            if !dir.is_dir() {
                continue;
            }
            let mut entries: Vec<_> = fs::read_dir(&dir)?
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().map(|ext| ext == "dat").unwrap_or(false))
                .map(|e| e.path())
                .collect();
            entries.sort();
            for path in entries {
                match SSTable::open(&path, level) {
                    Ok(run) => state.levels[level].push(run),
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping corrupt sorted run on load"),
                }
            }
            if level >= 1 {
                state.levels[level].sort_by(|a, b| a.min_key.cmp(&b.min_key));
            }
        }
        Ok(())
    }

    /// Appends at level 0; inserts in min-key order at level ≥ 1. Fails
    /// if `level >= maxLevel`.
    pub fn add_run(&self, level: usize, run: SSTable) -> Result<(), LevelError> {
        if level >= self.config.max_level {
            return Err(LevelError::LevelOutOfRange(level));
        }
        let mut state = self.state.write().expect("level manager lock poisoned");
        if level == 0 {
            state.levels[0].push(run);
        } else {
            let pos = state.levels[level]
                .binary_search_by(|r| r.min_key.cmp(&run.min_key))
                .unwrap_or_else(|p| p);
            state.levels[level].insert(pos, run);
        }
        Ok(())
    }

    /// For each level-0 run in reverse insertion order (newest first),
    /// queries it if its bloom filter admits the key; first hit — a
    /// value or a tombstone — wins and is returned immediately, since a
    /// tombstone shadows anything older. Otherwise, for each level ≥ 1,
    /// binary-searches runs by key range and probes the one that might
    /// contain it, again stopping on the first hit.
    pub fn get(&self, key: &[u8]) -> Result<SSTableGetResult, LevelError> {
        let state = self.state.read().expect("level manager lock poisoned");

        for run in state.levels[0].iter().rev() {
            match run.get(key)? {
                SSTableGetResult::Value(v) => {
                    trace!(level = 0, "level manager hit");
                    return Ok(SSTableGetResult::Value(v));
                }
                SSTableGetResult::Tombstone => {
                    trace!(level = 0, "level manager tombstone hit");
                    return Ok(SSTableGetResult::Tombstone);
                }
                SSTableGetResult::NotFound => {}
            }
        }

        for level in 1..state.levels.len() {
            let runs = &state.levels[level];
            let idx = runs.binary_search_by(|r| {
                if key < r.min_key.as_slice() {
                    std::cmp::Ordering::Greater
                } else if key > r.max_key.as_slice() {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            });
            if let Ok(idx) = idx {
                match runs[idx].get(key)? {
                    SSTableGetResult::Value(v) => {
                        trace!(level, "level manager hit");
                        return Ok(SSTableGetResult::Value(v));
                    }
                    SSTableGetResult::Tombstone => {
                        trace!(level, "level manager tombstone hit");
                        return Ok(SSTableGetResult::Tombstone);
                    }
                    SSTableGetResult::NotFound => {}
                }
            }
        }

        Ok(SSTableGetResult::NotFound)
    }

    /// True at level 0 iff file count ≥ `level0FileThreshold`; true at
    /// level ≥ 1 iff total file size exceeds `cap[level]`.
    pub fn needs_compaction(&self, level: usize) -> bool {
        let state = self.state.read().expect("level manager lock poisoned");
        let Some(runs) = state.levels.get(level) else {
            return false;
        };
        if level == 0 {
            runs.len() >= self.config.level0_file_threshold
        } else {
            let total: u64 = runs.iter().map(|r| r.file_size).sum();
            match self.capacity_bytes(level) {
                Some(cap) => total > cap,
                None => false,
            }
        }
    }

    /// Returns the first level (from 0 upward) that needs compaction.
    pub fn first_level_needing_compaction(&self) -> Option<usize> {
        let max_level = self.config.max_level;
        (0..max_level).find(|&level| self.needs_compaction(level))
    }

    /// At level 0, all runs; at level ≥ 1, the largest single run by
    /// file size.
    pub fn select_compaction_candidates(&self, level: usize) -> Vec<PathBuf> {
        let state = self.state.read().expect("level manager lock poisoned");
        let Some(runs) = state.levels.get(level) else {
            return Vec::new();
        };
        if level == 0 {
            runs.iter().map(|r| r.path.clone()).collect()
        } else {
            runs.iter()
                .max_by_key(|r| r.file_size)
                .map(|r| vec![r.path.clone()])
                .unwrap_or_default()
        }
    }

    /// Returns the paths of runs at `level` whose key range overlaps
    /// `[min_key, max_key]`. Used before a compaction pass writes into
    /// `dst_level`, so the runs already there that would otherwise end
    /// up sharing a key range with the new output get folded into the
    /// same merge (spec §8: runs at the same level ≥ 1 stay disjoint).
    pub fn select_overlapping_paths(&self, level: usize, min_key: &[u8], max_key: &[u8]) -> Vec<PathBuf> {
        let state = self.state.read().expect("level manager lock poisoned");
        let Some(runs) = state.levels.get(level) else {
            return Vec::new();
        };
        runs.iter()
            .filter(|r| min_key <= r.max_key.as_slice() && r.min_key.as_slice() <= max_key)
            .map(|r| r.path.clone())
            .collect()
    }

    /// Atomically removes `src_old_paths` from `src_level`, removes
    /// `dst_old_paths` from `dst_level` (the runs absorbed into the new
    /// merge because their key ranges overlapped it), and appends each of
    /// `new_runs` to `dst_level` in order. Old files are deleted only
    /// after the structural swap succeeds.
    pub fn replace_files(
        &self,
        src_level: usize,
        src_old_paths: &[PathBuf],
        dst_level: usize,
        dst_old_paths: &[PathBuf],
        new_runs: Vec<SSTable>,
    ) -> Result<(), LevelError> {
        if dst_level >= self.config.max_level {
            return Err(LevelError::LevelOutOfRange(dst_level));
        }
        let mut state = self.state.write().expect("level manager lock poisoned");

        let mut removed = Vec::new();
        state.levels[src_level].retain(|run| {
            if src_old_paths.contains(&run.path) {
                removed.push(run.path.clone());
                false
            } else {
                true
            }
        });
        if dst_level != src_level {
            state.levels[dst_level].retain(|run| {
                if dst_old_paths.contains(&run.path) {
                    removed.push(run.path.clone());
                    false
                } else {
                    true
                }
            });
        }

        for run in new_runs {
            if dst_level == 0 {
                state.levels[0].push(run);
            } else {
                let pos = state.levels[dst_level]
                    .binary_search_by(|r| r.min_key.cmp(&run.min_key))
                    .unwrap_or_else(|p| p);
                state.levels[dst_level].insert(pos, run);
            }
        }
        drop(state);

        debug!(src_level, dst_level, removed = removed.len(), "replaced sorted runs after compaction");
        for path in removed {
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove superseded sorted run file");
            }
        }
        Ok(())
    }

    pub fn run_count(&self, level: usize) -> usize {
        self.state
            .read()
            .expect("level manager lock poisoned")
            .levels
            .get(level)
            .map(|r| r.len())
            .unwrap_or(0)
    }

    pub fn total_size(&self, level: usize) -> u64 {
        self.state
            .read()
            .expect("level manager lock poisoned")
            .levels
            .get(level)
            .map(|runs| runs.iter().map(|r| r.file_size).sum())
            .unwrap_or(0)
    }

    /// Returns the runs at `level` matching `paths`, for the compactor
    /// to build a merge iterator over without holding the level lock
    /// across the whole merge. Runs are cloned by reopening from disk.
    pub fn open_runs_at(&self, level: usize, paths: &[PathBuf]) -> Result<Vec<SSTable>, LevelError> {
        paths
            .iter()
            .map(|p| SSTable::open(p, level).map_err(LevelError::from))
            .collect()
    }

    pub fn next_run_path(&self, level: usize, wall_millis: u64, sequence: u64) -> Result<PathBuf, LevelError> {
        let dir = self.level_dir(level);
        fs::create_dir_all(&dir)?;
        Ok(dir.join(format!("sstable_{wall_millis}_{sequence}.dat")))
    }

    pub fn fsync_level_dirs(&self) -> Result<(), LevelError> {
        for level in 0..self.config.max_level {
            let dir = self.level_dir(level);
            if dir.is_dir() {
                let f = fs::File::open(&dir)?;
                f.sync_all()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockBuilder;
    use crate::bloom::BloomFilter;
    use crate::codec::ValueOrTombstone;
    use tempfile::TempDir;

    fn make_run(dir: &TempDir, name: &str, key: &str, value: &str) -> SSTable {
        let mut builder = BlockBuilder::new(4096);
        let mut bloom = BloomFilter::new(1, 0.01);
        builder.add(key.as_bytes().to_vec(), ValueOrTombstone::Value(value.as_bytes().to_vec()));
        bloom.insert(key.as_bytes());
        let blocks = builder.build();
        SSTable::build(dir.path().join(name), 0, blocks, bloom).unwrap()
    }

    #[test]
    fn level0_queried_newest_first() {
        let dir = TempDir::new().unwrap();
        let manager = LevelManager::new(dir.path(), LevelConfig::default());
        manager.add_run(0, make_run(&dir, "a.dat", "k", "old")).unwrap();
        manager.add_run(0, make_run(&dir, "b.dat", "k", "new")).unwrap();
        let result = manager.get(b"k").unwrap();
        assert_eq!(result, SSTableGetResult::Value(b"new".to_vec()));
    }

    #[test]
    fn needs_compaction_at_level0_by_file_count() {
        let dir = TempDir::new().unwrap();
        let mut config = LevelConfig::default();
        config.level0_file_threshold = 2;
        let manager = LevelManager::new(dir.path(), config);
        assert!(!manager.needs_compaction(0));
        manager.add_run(0, make_run(&dir, "a.dat", "a", "1")).unwrap();
        manager.add_run(0, make_run(&dir, "b.dat", "b", "2")).unwrap();
        assert!(manager.needs_compaction(0));
    }

    #[test]
    fn level1_runs_stay_key_sorted_on_insert() {
        let dir = TempDir::new().unwrap();
        let manager = LevelManager::new(dir.path(), LevelConfig::default());
        manager.add_run(1, make_run(&dir, "c.dat", "c", "3")).unwrap();
        manager.add_run(1, make_run(&dir, "a.dat", "a", "1")).unwrap();
        manager.add_run(1, make_run(&dir, "b.dat", "b", "2")).unwrap();
        assert_eq!(manager.get(b"a").unwrap(), SSTableGetResult::Value(b"1".to_vec()));
        assert_eq!(manager.get(b"b").unwrap(), SSTableGetResult::Value(b"2".to_vec()));
        assert_eq!(manager.get(b"c").unwrap(), SSTableGetResult::Value(b"3".to_vec()));
    }

    #[test]
    fn add_run_beyond_max_level_fails() {
        let dir = TempDir::new().unwrap();
        let mut config = LevelConfig::default();
        config.max_level = 1;
        let manager = LevelManager::new(dir.path(), config);
        let run = make_run(&dir, "a.dat", "a", "1");
        assert!(matches!(manager.add_run(1, run), Err(LevelError::LevelOutOfRange(1))));
    }

    #[test]
    fn replace_files_swaps_runs_atomically() {
        let dir = TempDir::new().unwrap();
        let manager = LevelManager::new(dir.path(), LevelConfig::default());
        let old_path = dir.path().join("old.dat");
        let old_run = {
            let mut builder = BlockBuilder::new(4096);
            let mut bloom = BloomFilter::new(1, 0.01);
            builder.add(b"k".to_vec(), ValueOrTombstone::Value(b"v".to_vec()));
            bloom.insert(b"k");
            SSTable::build(&old_path, 0, builder.build(), bloom).unwrap()
        };
        manager.add_run(0, old_run).unwrap();

        let new_path = dir.path().join("level_1").join("new.dat");
        let new_run = {
            let mut builder = BlockBuilder::new(4096);
            let mut bloom = BloomFilter::new(1, 0.01);
            builder.add(b"k".to_vec(), ValueOrTombstone::Value(b"v2".to_vec()));
            bloom.insert(b"k");
            fs::create_dir_all(new_path.parent().unwrap()).unwrap();
            SSTable::build(&new_path, 1, builder.build(), bloom).unwrap()
        };

        manager.replace_files(0, &[old_path.clone()], 1, &[], vec![new_run]).unwrap();
        assert_eq!(manager.run_count(0), 0);
        assert_eq!(manager.run_count(1), 1);
        assert!(!old_path.exists());
    }

    #[test]
    fn replace_files_absorbs_overlapping_dst_level_runs() {
        let dir = TempDir::new().unwrap();
        let manager = LevelManager::new(dir.path(), LevelConfig::default());
        manager.add_run(1, make_run(&dir, "existing.dat", "b", "old")).unwrap();

        let overlap_paths = manager.select_overlapping_paths(1, b"a", b"m");
        assert_eq!(overlap_paths.len(), 1);

        let new_path = dir.path().join("level_1").join("merged.dat");
        let new_run = {
            let mut builder = BlockBuilder::new(4096);
            let mut bloom = BloomFilter::new(1, 0.01);
            builder.add(b"b".to_vec(), ValueOrTombstone::Value(b"new".to_vec()));
            bloom.insert(b"b");
            fs::create_dir_all(new_path.parent().unwrap()).unwrap();
            SSTable::build(&new_path, 1, builder.build(), bloom).unwrap()
        };

        manager.replace_files(0, &[], 1, &overlap_paths, vec![new_run]).unwrap();
        assert_eq!(manager.run_count(1), 1);
        assert_eq!(manager.get(b"b").unwrap(), SSTableGetResult::Value(b"new".to_vec()));
    }
}
