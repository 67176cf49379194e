//! Engine configuration (spec §6 configuration table).

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_directory: PathBuf,
    pub wal_directory: PathBuf,
    pub memtable_size: usize,
    pub block_size: usize,
    pub bloom_filter_fpp: f64,
    pub cache_shard_count: usize,
    pub cache_shard_capacity: usize,
    pub wal_sync_immediate: bool,
    pub wal_truncate_enabled: bool,
    pub max_level: usize,
    pub level_multiplier: u64,
    pub level0_file_threshold: usize,
    pub level1_max_size: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            data_directory: PathBuf::from("/tmp/lsm-data"),
            wal_directory: PathBuf::from("/tmp/lsm-wal"),
            memtable_size: 64 * 1024 * 1024,
            block_size: 4096,
            bloom_filter_fpp: 0.01,
            cache_shard_count: 16,
            cache_shard_capacity: 10_000,
            wal_sync_immediate: false,
            wal_truncate_enabled: true,
            max_level: 7,
            level_multiplier: 10,
            level0_file_threshold: 4,
            level1_max_size: 10 * 1024 * 1024,
        }
    }
}
