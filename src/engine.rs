//! Engine facade: orchestrates `put`/`get`/`delete`, holds the global
//! reader-writer lock that separates mutators/flush from concurrent
//! readers, and owns every other subsystem.

use std::fmt;
use std::fs;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, info, trace};

use crate::cache::ShardedCache;
use crate::codec::{CodecError, ValueOrTombstone};
use crate::compaction::{CompactionError, CompactionStats, Compactor, CompactorConfig};
use crate::config::EngineConfig;
use crate::level::{LevelConfig, LevelError, LevelManager};
use crate::memtable::{Memtable, MemtableError, MemtableGetResult};
use crate::sstable::SSTableError;
use crate::sstable::SSTableGetResult;
use crate::transaction::{Transaction, TransactionManager};
use crate::wal::{Wal, WalError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("engine is closed")]
    EngineClosed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("wal error: {0}")]
    Wal(#[from] WalError),
    #[error("memtable error: {0}")]
    Memtable(#[from] MemtableError),
    #[error("sstable error: {0}")]
    SSTable(#[from] SSTableError),
    #[error("level error: {0}")]
    Level(#[from] LevelError),
    #[error("compaction error: {0}")]
    Compaction(#[from] CompactionError),
    #[error("transaction conflict: {0}")]
    Conflict(String),
    #[error("illegal state: {0}")]
    IllegalState(String),
}

pub struct EngineStats {
    pub level_run_counts: Vec<usize>,
    pub level_size_bytes: Vec<u64>,
    pub memtable_size_bytes: usize,
    pub cache_entries: usize,
    pub compaction: CompactionStats,
}

impl fmt::Display for EngineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "memtable_size_bytes={}", self.memtable_size_bytes)?;
        writeln!(f, "cache_entries={}", self.cache_entries)?;
        for (level, (count, size)) in self
            .level_run_counts
            .iter()
            .zip(self.level_size_bytes.iter())
            .enumerate()
        {
            writeln!(f, "level_{level}: runs={count} bytes={size}")?;
        }
        writeln!(
            f,
            "compaction: rounds={} bytes_read={} bytes_written={} runs_merged={}",
            self.compaction.rounds_run,
            self.compaction.bytes_read,
            self.compaction.bytes_written,
            self.compaction.runs_merged
        )
    }
}

struct EngineInner {
    active_memtable: Memtable,
    wal: Wal,
    closed: bool,
}

pub(crate) struct EngineState {
    inner: RwLock<EngineInner>,
    config: EngineConfig,
    levels: Arc<LevelManager>,
    cache: ShardedCache,
    compactor: Arc<Compactor>,
    tx_manager: TransactionManager,
}

/// The public engine handle. Cheap to clone — every clone shares the
/// same underlying state via `Arc`.
#[derive(Clone)]
pub struct Engine {
    state: Arc<EngineState>,
}

impl Engine {
    /// Opens the engine against `config`'s data and WAL directories:
    /// creates them if missing, replays the WAL into a fresh memtable,
    /// loads existing sorted runs per level, clears the cache (recovered
    /// state has no corresponding cache entries yet), and starts the
    /// background compactor.
    pub fn open(config: EngineConfig) -> Result<Self, EngineError> {
        fs::create_dir_all(&config.data_directory)?;
        fs::create_dir_all(&config.wal_directory)?;

        let wal = Wal::open(&config.wal_directory, config.wal_sync_immediate)?;
        let memtable = Memtable::new(config.memtable_size);
        let report = wal.recover(&memtable)?;
        info!(
            recovered = report.recovered,
            corrupted = report.corrupted,
            "engine open: wal recovery complete"
        );

        let level_config = LevelConfig {
            max_level: config.max_level,
            level_multiplier: config.level_multiplier,
            level0_file_threshold: config.level0_file_threshold,
            level1_max_size: config.level1_max_size,
        };
        let levels = Arc::new(LevelManager::new(&config.data_directory, level_config));
        levels.load_existing_sstables()?;

        let cache = ShardedCache::new(config.cache_shard_count, config.cache_shard_capacity);

        let compactor = Arc::new(Compactor::new(
            Arc::clone(&levels),
            CompactorConfig {
                block_size: config.block_size,
                bloom_fpp: config.bloom_filter_fpp,
            },
        ));
        compactor.start();

        let state = Arc::new_cyclic(|weak| EngineState {
            inner: RwLock::new(EngineInner {
                active_memtable: memtable,
                wal,
                closed: false,
            }),
            config,
            levels,
            cache,
            compactor,
            tx_manager: TransactionManager::new(weak.clone()),
        });

        Ok(Engine { state })
    }

    fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Maps a key/value validation failure to `EngineError::InvalidArgument`
    /// (spec §7: null/too-long key, null/too-large value are InvalidArgument,
    /// not a generic codec error) while letting any other `CodecError`
    /// variant fall through to `EngineError::Codec` unchanged.
    fn map_validation_error(e: CodecError) -> EngineError {
        match e {
            CodecError::InvalidArgument(msg) => EngineError::InvalidArgument(msg),
            other => EngineError::Codec(other),
        }
    }

    fn validate_key(key: &[u8]) -> Result<(), EngineError> {
        crate::codec::validate_key(key).map_err(Self::map_validation_error)
    }

    fn validate_put(key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        crate::codec::validate_key(key).map_err(Self::map_validation_error)?;
        crate::codec::validate_value(value).map_err(Self::map_validation_error)?;
        Ok(())
    }

    /// Under the write lock: append to WAL, insert into the memtable,
    /// update the cache, then flush if the memtable has grown past its
    /// configured size — still under the same write lock.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), EngineError> {
        Self::validate_put(&key, &value)?;
        let mut guard = self.state.inner.write().expect("engine lock poisoned");
        if guard.closed {
            return Err(EngineError::EngineClosed);
        }
        trace!(key_len = key.len(), "put");
        let sequence = guard.wal.append(key.clone(), ValueOrTombstone::Value(value.clone()))?;
        guard.active_memtable.put(key.clone(), value.clone());
        guard.active_memtable.observe_sequence(sequence);
        self.state.cache.put(key, value);
        if guard.active_memtable.should_flush() {
            self.flush_locked(&mut guard)?;
        }
        Ok(())
    }

    /// Under the write lock: WAL tombstone, memtable tombstone, cache
    /// removal.
    pub fn delete(&self, key: Vec<u8>) -> Result<(), EngineError> {
        Self::validate_key(&key)?;
        let mut guard = self.state.inner.write().expect("engine lock poisoned");
        if guard.closed {
            return Err(EngineError::EngineClosed);
        }
        trace!(key_len = key.len(), "delete");
        let sequence = guard.wal.append(key.clone(), ValueOrTombstone::Tombstone)?;
        guard.active_memtable.delete(key.clone());
        guard.active_memtable.observe_sequence(sequence);
        self.state.cache.remove(&key);
        if guard.active_memtable.should_flush() {
            self.flush_locked(&mut guard)?;
        }
        Ok(())
    }

    /// Under the read lock: cache, then active memtable, then the level
    /// manager. On a hit from the memtable or disk, populates the cache.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        Self::validate_key(key)?;
        let guard = self.state.inner.read().expect("engine lock poisoned");
        if guard.closed {
            return Err(EngineError::EngineClosed);
        }

        if let Some(value) = self.state.cache.get(key) {
            trace!("get: cache hit");
            return Ok(Some(value));
        }

        match guard.active_memtable.get(key) {
            MemtableGetResult::Value(v) => {
                self.state.cache.put(key.to_vec(), v.clone());
                return Ok(Some(v));
            }
            MemtableGetResult::Tombstone => return Ok(None),
            MemtableGetResult::Absent => {}
        }

        match self.state.levels.get(key)? {
            SSTableGetResult::Value(v) => {
                self.state.cache.put(key.to_vec(), v.clone());
                Ok(Some(v))
            }
            SSTableGetResult::Tombstone => Ok(None),
            SSTableGetResult::NotFound => Ok(None),
        }
    }

    /// Delegates to the compactor. Errors with `IllegalState` rather than
    /// triggering a no-op if the background compactor has already been
    /// stopped by `close` (spec §7: "compactor not running").
    pub fn compact(&self) -> Result<(), EngineError> {
        if !self.state.compactor.is_running() {
            return Err(EngineError::IllegalState("compactor is not running".to_string()));
        }
        self.state.compactor.trigger_compaction();
        Ok(())
    }

    pub fn stats(&self) -> EngineStats {
        let max_level = self.state.levels.max_level();
        let level_run_counts = (0..max_level).map(|l| self.state.levels.run_count(l)).collect();
        let level_size_bytes = (0..max_level).map(|l| self.state.levels.total_size(l)).collect();
        let guard = self.state.inner.read().expect("engine lock poisoned");
        EngineStats {
            level_run_counts,
            level_size_bytes,
            memtable_size_bytes: guard.active_memtable.approximate_size(),
            cache_entries: self.state.cache.len(),
            compaction: self.state.compactor.stats(),
        }
    }

    pub fn begin_transaction(&self) -> Transaction {
        self.state.tx_manager.begin(Arc::clone(&self.state))
    }

    pub(crate) fn tx_manager(&self) -> &TransactionManager {
        &self.state.tx_manager
    }

    /// Flush procedure, already holding the write lock: snapshot the
    /// active memtable into a new Level-0 run, replace it with an empty
    /// one, mark the WAL flushed (optionally truncating).
    fn flush_locked(&self, guard: &mut EngineInner) -> Result<(), EngineError> {
        if guard.active_memtable.is_empty() {
            return Ok(()); // flushing an empty memtable is a no-op
        }
        let wall_millis = Self::now_millis();
        let max_sequence = guard.active_memtable.max_sequence();
        let path = self
            .state
            .levels
            .next_run_path(0, wall_millis, max_sequence)?;

        let built = guard
            .active_memtable
            .flush_to_sstable(&path, self.state.config.block_size, self.state.config.bloom_filter_fpp)?;

        if let Some(sstable) = built {
            self.state.levels.add_run(0, sstable)?;
            debug!(wall_millis, max_sequence, "flushed active memtable to level 0");
        }

        guard.active_memtable = Memtable::new(self.state.config.memtable_size);
        if self.state.config.wal_truncate_enabled {
            guard.wal.truncate()?;
        }
        Ok(())
    }

    /// Under the write lock: stop the compactor, flush a non-empty
    /// memtable, close the WAL. Idempotent.
    pub fn close(&self) -> Result<(), EngineError> {
        let mut guard = self.state.inner.write().expect("engine lock poisoned");
        if guard.closed {
            return Ok(());
        }
        self.state.compactor.stop();
        if !guard.active_memtable.is_empty() {
            self.flush_locked(&mut guard)?;
        }
        self.state.levels.fsync_level_dirs()?;
        guard.closed = true;
        info!("engine closed");
        Ok(())
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.state.config
    }

    pub(crate) fn from_state(state: Arc<EngineState>) -> Self {
        Engine { state }
    }
}
