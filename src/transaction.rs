//! Transaction manager and transactions: monotonic transaction ids,
//! per-key pessimistic writer locks drawn from a process-wide registry,
//! and optimistic read-set validation at commit.
//!
//! The locking scheme is pessimistic for writes (per-key locks held from
//! first mutation to commit/rollback) and optimistic for reads
//! (validated at commit), which together give snapshot isolation against
//! committed state *at validation time*, not at transaction start.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use thiserror::Error;

use crate::codec::CodecError;
use crate::engine::{Engine, EngineError, EngineState};

/// Mirrors `Engine`'s own key/value validation error mapping so a
/// transactional `put`/`delete` surfaces `EngineError::InvalidArgument`
/// rather than a generic codec error (spec §7).
fn map_validation_error(e: CodecError) -> EngineError {
    match e {
        CodecError::InvalidArgument(msg) => EngineError::InvalidArgument(msg),
        other => EngineError::Codec(other),
    }
}

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("transaction is not active")]
    Inactive,
    #[error("transaction conflict: {0}")]
    Conflict(String),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

/// A simple mutual-exclusion lock keyed by a byte key. Only the writer
/// side is used in this spec — readers validate optimistically instead
/// of taking a lock.
struct KeyLock {
    locked: Mutex<bool>,
    released: Condvar,
}

impl KeyLock {
    fn new() -> Self {
        KeyLock {
            locked: Mutex::new(false),
            released: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut guard = self.locked.lock().expect("key lock poisoned");
        while *guard {
            guard = self.released.wait(guard).expect("key lock poisoned");
        }
        *guard = true;
    }

    fn release(&self) {
        let mut guard = self.locked.lock().expect("key lock poisoned");
        *guard = false;
        self.released.notify_all();
    }
}

/// Owns the process-wide per-key lock registry and the set of active
/// transaction ids. Holds a non-owning back-reference to the engine it
/// serves — the engine owns the transaction manager, so a strong
/// reference here would form an ownership cycle (spec §9).
pub struct TransactionManager {
    engine: Weak<EngineState>,
    next_id: AtomicU64,
    active: Mutex<HashSet<u64>>,
    registry: Mutex<HashMap<Vec<u8>, Arc<KeyLock>>>,
}

impl TransactionManager {
    pub(crate) fn new(engine: Weak<EngineState>) -> Self {
        TransactionManager {
            engine,
            next_id: AtomicU64::new(1),
            active: Mutex::new(HashSet::new()),
            registry: Mutex::new(HashMap::new()),
        }
    }

    fn key_lock(&self, key: &[u8]) -> Arc<KeyLock> {
        let mut registry = self.registry.lock().expect("lock registry poisoned");
        registry
            .entry(key.to_vec())
            .or_insert_with(|| Arc::new(KeyLock::new()))
            .clone()
    }

    pub(crate) fn begin(&self, state: Arc<EngineState>) -> Transaction {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.active.lock().expect("active set poisoned").insert(id);
        Transaction {
            id,
            engine: Engine::from_state(state),
            data: Mutex::new(TransactionData {
                read_set: HashMap::new(),
                write_set: HashMap::new(),
                delete_set: HashSet::new(),
                locked_keys: Vec::new(),
                active: true,
            }),
        }
    }

    fn deactivate(&self, id: u64) {
        self.active.lock().expect("active set poisoned").remove(&id);
    }

    /// Upgrades the non-owning back-reference into a callable handle.
    /// `None` once the engine itself has been fully dropped, which can
    /// only happen after every `Engine`/`Transaction` handle sharing it
    /// has already gone away.
    #[allow(dead_code)]
    pub(crate) fn engine(&self) -> Option<Engine> {
        self.engine.upgrade().map(Engine::from_state)
    }
}

struct TransactionData {
    read_set: HashMap<Vec<u8>, Option<Vec<u8>>>,
    write_set: HashMap<Vec<u8>, Vec<u8>>,
    delete_set: HashSet<Vec<u8>>,
    locked_keys: Vec<(Vec<u8>, Arc<KeyLock>)>,
    active: bool,
}

pub struct Transaction {
    id: u64,
    engine: Engine,
    data: Mutex<TransactionData>,
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn ensure_locked(&self, data: &mut TransactionData, key: &[u8]) {
        if data.locked_keys.iter().any(|(k, _)| k == key) {
            return;
        }
        let lock = self.engine.tx_manager().key_lock(key);
        lock.acquire();
        data.locked_keys.push((key.to_vec(), lock));
    }

    /// If `k` is in the write set, returns its pending value; if `k` is
    /// in the delete set, returns absent; otherwise reads through the
    /// engine and records the observed value in the read set.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TransactionError> {
        let mut data = self.data.lock().expect("transaction data poisoned");
        if !data.active {
            return Err(TransactionError::Inactive);
        }
        if let Some(v) = data.write_set.get(key) {
            return Ok(Some(v.clone()));
        }
        if data.delete_set.contains(key) {
            return Ok(None);
        }
        let observed = self.engine.get(key)?;
        data.read_set.insert(key.to_vec(), observed.clone());
        Ok(observed)
    }

    /// Acquires the per-key writer lock, then records the write,
    /// clearing the key from the delete set.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), TransactionError> {
        crate::codec::validate_key(&key).map_err(map_validation_error)?;
        crate::codec::validate_value(&value).map_err(map_validation_error)?;
        let mut data = self.data.lock().expect("transaction data poisoned");
        if !data.active {
            return Err(TransactionError::Inactive);
        }
        self.ensure_locked(&mut data, &key);
        data.delete_set.remove(&key);
        data.write_set.insert(key, value);
        Ok(())
    }

    pub fn delete(&self, key: Vec<u8>) -> Result<(), TransactionError> {
        crate::codec::validate_key(&key).map_err(map_validation_error)?;
        let mut data = self.data.lock().expect("transaction data poisoned");
        if !data.active {
            return Err(TransactionError::Inactive);
        }
        self.ensure_locked(&mut data, &key);
        data.write_set.remove(&key);
        data.delete_set.insert(key);
        Ok(())
    }

    fn release_locks_and_deactivate(&self, data: &mut TransactionData) {
        for (_, lock) in data.locked_keys.drain(..) {
            lock.release();
        }
        data.active = false;
        self.engine.tx_manager().deactivate(self.id);
    }

    /// 1. Re-reads every observed key; aborts with `Conflict` on any
    ///    mismatch. 2. Applies the write set (key order) then the delete
    ///    set via the engine. 3. Releases locks and marks inactive.
    pub fn commit(&self) -> Result<(), TransactionError> {
        let mut data = self.data.lock().expect("transaction data poisoned");
        if !data.active {
            return Err(TransactionError::Inactive);
        }

        for (key, expected) in data.read_set.iter() {
            let actual = self.engine.get(key)?;
            if actual != *expected {
                self.release_locks_and_deactivate(&mut data);
                return Err(TransactionError::Conflict(format!(
                    "read-set validation failed for key {key:?}"
                )));
            }
        }

        let mut write_keys: Vec<_> = data.write_set.keys().cloned().collect();
        write_keys.sort();
        for key in write_keys {
            let value = data.write_set[&key].clone();
            self.engine.put(key, value)?;
        }

        let mut delete_keys: Vec<_> = data.delete_set.iter().cloned().collect();
        delete_keys.sort();
        for key in delete_keys {
            self.engine.delete(key)?;
        }

        self.release_locks_and_deactivate(&mut data);
        Ok(())
    }

    /// Releases locks, drops the write/delete sets, marks inactive.
    /// Idempotent.
    pub fn rollback(&self) {
        let mut data = self.data.lock().expect("transaction data poisoned");
        if !data.active {
            return;
        }
        data.write_set.clear();
        data.delete_set.clear();
        self.release_locks_and_deactivate(&mut data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use tempfile::TempDir;

    fn open_test_engine(dir: &TempDir) -> Engine {
        let config = EngineConfig {
            data_directory: dir.path().join("data"),
            wal_directory: dir.path().join("wal"),
            ..EngineConfig::default()
        };
        Engine::open(config).unwrap()
    }

    #[test]
    fn read_then_write_commits_cleanly() {
        let dir = TempDir::new().unwrap();
        let engine = open_test_engine(&dir);
        engine.put(b"k".to_vec(), b"v0".to_vec()).unwrap();

        let tx = engine.begin_transaction();
        assert_eq!(tx.get(b"k").unwrap(), Some(b"v0".to_vec()));
        tx.put(b"k".to_vec(), b"v1".to_vec()).unwrap();
        tx.commit().unwrap();

        assert_eq!(engine.get(b"k").unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn conflicting_commit_is_rejected() {
        let dir = TempDir::new().unwrap();
        let engine = open_test_engine(&dir);
        engine.put(b"k".to_vec(), b"v0".to_vec()).unwrap();

        let t1 = engine.begin_transaction();
        let t2 = engine.begin_transaction();

        t1.get(b"k").unwrap();
        t2.put(b"k".to_vec(), b"from_t2".to_vec()).unwrap();
        t2.commit().unwrap();

        t1.put(b"k".to_vec(), b"from_t1".to_vec()).unwrap();
        assert!(matches!(t1.commit(), Err(TransactionError::Conflict(_))));
        assert_eq!(engine.get(b"k").unwrap(), Some(b"from_t2".to_vec()));
    }

    #[test]
    fn rollback_discards_pending_writes() {
        let dir = TempDir::new().unwrap();
        let engine = open_test_engine(&dir);
        let tx = engine.begin_transaction();
        tx.put(b"k".to_vec(), b"v".to_vec()).unwrap();
        tx.rollback();
        assert_eq!(engine.get(b"k").unwrap(), None);
    }

    #[test]
    fn rollback_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let engine = open_test_engine(&dir);
        let tx = engine.begin_transaction();
        tx.rollback();
        tx.rollback();
    }

    #[test]
    fn operations_after_commit_are_illegal_state() {
        let dir = TempDir::new().unwrap();
        let engine = open_test_engine(&dir);
        let tx = engine.begin_transaction();
        tx.put(b"k".to_vec(), b"v".to_vec()).unwrap();
        tx.commit().unwrap();
        assert!(matches!(tx.get(b"k"), Err(TransactionError::Inactive)));
    }

    #[test]
    fn delete_clears_prior_write_in_same_transaction() {
        let dir = TempDir::new().unwrap();
        let engine = open_test_engine(&dir);
        let tx = engine.begin_transaction();
        tx.put(b"k".to_vec(), b"v".to_vec()).unwrap();
        tx.delete(b"k".to_vec()).unwrap();
        assert_eq!(tx.get(b"k").unwrap(), None);
        tx.commit().unwrap();
        assert_eq!(engine.get(b"k").unwrap(), None);
    }
}
