//! An embeddable, persistent key-value storage engine built on a
//! log-structured merge tree: writes land in a write-ahead log and an
//! in-memory memtable, memtables flush to immutable sorted runs on
//! disk, and a background compactor keeps the number and size of runs
//! bounded as data grows.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | Facade: open, put, get, delete, flush, compact, stats |
//! | [`memtable`] | Sorted in-memory write buffer |
//! | [`wal`] | CRC-protected write-ahead log and crash recovery |
//! | [`sstable`] | Immutable, sorted, mmap-backed on-disk runs |
//! | [`block`] | Fixed-size data blocks within a run |
//! | [`bloom`] | Per-run bloom filter for negative point lookups |
//! | [`level`] | Per-level run bookkeeping and compaction candidate selection |
//! | [`compaction`] | Background worker: multiway merge of runs within a level |
//! | [`cache`] | Sharded LRU cache of recently read/written values |
//! | [`transaction`] | Optimistic-read/pessimistic-write transactions |
//! | [`codec`] | Wire formats shared by the WAL, blocks, bloom filter, and index |
//! | [`config`] | Engine configuration and defaults |
//! | [`bytesutil`] | Key/value comparison and hashing primitives |
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use lsmtree_kv::config::EngineConfig;
//! use lsmtree_kv::engine::Engine;
//!
//! let config = EngineConfig {
//!     data_directory: "/tmp/my_db/data".into(),
//!     wal_directory: "/tmp/my_db/wal".into(),
//!     ..EngineConfig::default()
//! };
//!
//! let engine = Engine::open(config).unwrap();
//!
//! engine.put(b"hello".to_vec(), b"world".to_vec()).unwrap();
//! assert_eq!(engine.get(b"hello").unwrap(), Some(b"world".to_vec()));
//!
//! engine.delete(b"hello".to_vec()).unwrap();
//! assert_eq!(engine.get(b"hello").unwrap(), None);
//!
//! engine.close().unwrap();
//! ```

pub mod block;
pub mod bloom;
pub mod bytesutil;
pub mod cache;
pub mod codec;
pub mod compaction;
pub mod config;
pub mod engine;
pub mod level;
pub mod memtable;
pub mod sstable;
pub mod transaction;
pub mod wal;

pub use config::EngineConfig;
pub use engine::{Engine, EngineError, EngineStats};
pub use transaction::{Transaction, TransactionError};
