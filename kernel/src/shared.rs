// Serialized Chain Access
//
// Each chain operation is a short run of dependent writes. Two runs on the
// same partition must never interleave, so every operation first takes
// the gate of its partition and holds it to the end. Runs on different
// partitions touch disjoint records and proceed side by side; the store
// lock is only held for one store call at a time.
//
// A run's writes are logged as they happen. If the run fails, the log is
// replayed backwards to restore the previous link values. The partition
// gate is still held at that point, so nothing else has seen or changed
// those records.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::chain::{ChainConfig, ChainError, ChainManager, LinkState};
use crate::record::{
    LinkField, PartitionKey, Predicate, Record, RecordId, RecordStore, StoreError,
};

type Gates = HashMap<PartitionKey, Arc<Mutex<()>>>;

/// Thread-safe handle pairing a store with a chain manager.
pub struct SharedChains<S> {
    store: Arc<Mutex<S>>,
    gates: Arc<Mutex<Gates>>,
    manager: Arc<ChainManager>,
}

impl<S> Clone for SharedChains<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            gates: Arc::clone(&self.gates),
            manager: Arc::clone(&self.manager),
        }
    }
}

impl<S: RecordStore> SharedChains<S> {
    pub fn new(store: S, config: ChainConfig) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
            gates: Arc::new(Mutex::new(HashMap::new())),
            manager: Arc::new(ChainManager::new(config)),
        }
    }

    pub fn create(
        &self,
        partition: PartitionKey,
        attributes: serde_json::Value,
    ) -> Result<Record, ChainError> {
        let key = partition.clone();
        self.run(&key, |manager, store| manager.create(store, partition, attributes))
    }

    pub fn insert_first(&self, id: RecordId) -> Result<(), ChainError> {
        let partition = self.partition_of(id)?;
        self.run(&partition, |manager, store| manager.insert_first(store, id))
    }

    pub fn insert_last(&self, id: RecordId) -> Result<(), ChainError> {
        let partition = self.partition_of(id)?;
        self.run(&partition, |manager, store| manager.insert_last(store, id))
    }

    /// A target in another partition is rejected before any write, so
    /// only the gate of `id`'s partition is needed.
    pub fn insert_after(&self, id: RecordId, target: RecordId) -> Result<(), ChainError> {
        let partition = self.partition_of(id)?;
        self.run(&partition, |manager, store| {
            manager.insert_after(store, id, target)
        })
    }

    pub fn remove(&self, id: RecordId) -> Result<(), ChainError> {
        let partition = self.partition_of(id)?;
        self.run(&partition, |manager, store| manager.remove(store, id))
    }

    pub fn destroy(&self, id: RecordId) -> Result<(), ChainError> {
        let partition = self.partition_of(id)?;
        self.run(&partition, |manager, store| manager.destroy(store, id))
    }

    pub fn state(&self, id: RecordId) -> Result<LinkState, ChainError> {
        self.manager.state(&*lock(&self.store), id)
    }

    /// Chain order read behind the partition gate, so no writer can tear it.
    pub fn ordered(&self, partition: &PartitionKey) -> Result<Vec<Record>, ChainError> {
        let gate = self.gate(partition);
        let _held = lock(&gate);
        let session = Session::new(&self.store);
        self.manager.ordered(&session, partition)
    }

    /// Read-only access to the underlying store.
    pub fn with_store<T>(&self, f: impl FnOnce(&S) -> T) -> T {
        f(&lock(&self.store))
    }

    pub fn with_store_mut<T>(&self, f: impl FnOnce(&mut S) -> T) -> T {
        f(&mut lock(&self.store))
    }

    fn run<T>(
        &self,
        partition: &PartitionKey,
        f: impl FnOnce(&ChainManager, &mut Session<'_, S>) -> Result<T, ChainError>,
    ) -> Result<T, ChainError> {
        let gate = self.gate(partition);
        let _held = lock(&gate);

        let manager: &ChainManager = &self.manager;
        let mut session = Session::new(&self.store);
        let result = f(manager, &mut session);
        if let Err(err) = &result {
            if !session.undo.is_empty() {
                tracing::warn!(%partition, writes = session.undo.len(), error = %err, "rolling back chain operation");
                session.rollback();
            }
        }
        result
    }

    fn partition_of(&self, id: RecordId) -> Result<PartitionKey, ChainError> {
        lock(&self.store)
            .find(id)?
            .map(|record| record.partition)
            .ok_or(ChainError::Store(StoreError::NotFound(id)))
    }

    fn gate(&self, partition: &PartitionKey) -> Arc<Mutex<()>> {
        let mut gates = lock(&self.gates);
        Arc::clone(gates.entry(partition.clone()).or_default())
    }
}

// A poisoned lock may guard a half-applied operation; audits report it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Undo {
    Write { id: RecordId, field: LinkField },
    Create(RecordId),
}

/// Store view for one operation: locks the store per call and logs what
/// it changed.
struct Session<'a, S> {
    store: &'a Mutex<S>,
    undo: Vec<Undo>,
}

impl<'a, S: RecordStore> Session<'a, S> {
    fn new(store: &'a Mutex<S>) -> Self {
        Self {
            store,
            undo: Vec::new(),
        }
    }

    /// Restore link values newest first. Revisions keep counting up.
    fn rollback(self) {
        let mut store = lock(self.store);
        for step in self.undo.into_iter().rev() {
            let restored = match step {
                Undo::Write { id, field } => match store.find(id) {
                    Ok(Some(record)) => store.update(&record, field).map(|_| ()),
                    Ok(None) => Err(StoreError::NotFound(id)),
                    Err(err) => Err(err),
                },
                Undo::Create(id) => store.destroy(id),
            };
            if let Err(err) = restored {
                tracing::warn!(error = %err, "rollback step failed");
            }
        }
    }
}

impl<S: RecordStore> RecordStore for Session<'_, S> {
    fn create(
        &mut self,
        partition: PartitionKey,
        attributes: serde_json::Value,
    ) -> Result<Record, StoreError> {
        let record = lock(self.store).create(partition, attributes)?;
        self.undo.push(Undo::Create(record.id));
        Ok(record)
    }

    fn find(&self, id: RecordId) -> Result<Option<Record>, StoreError> {
        lock(self.store).find(id)
    }

    fn query(
        &self,
        partition: &PartitionKey,
        predicate: Predicate,
    ) -> Result<Vec<Record>, StoreError> {
        lock(self.store).query(partition, predicate)
    }

    fn update(&mut self, record: &Record, field: LinkField) -> Result<Record, StoreError> {
        // The update only succeeds if `record` matches storage, so its
        // fields are the values to restore.
        let previous = match field {
            LinkField::Next(_) => LinkField::Next(record.next),
            LinkField::IsFirst(_) => LinkField::IsFirst(record.is_first),
            LinkField::Unlinked(_) => LinkField::Unlinked(record.unlinked),
        };
        let updated = lock(self.store).update(record, field)?;
        self.undo.push(Undo::Write {
            id: record.id,
            field: previous,
        });
        Ok(updated)
    }

    fn destroy(&mut self, id: RecordId) -> Result<(), StoreError> {
        lock(self.store).destroy(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invariants::audit;
    use crate::record::InMemoryRecordStore;
    use std::sync::mpsc::{self, RecvTimeoutError};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn concurrent_appends_keep_chains_sound() {
        let chains = SharedChains::new(InMemoryRecordStore::new(), ChainConfig::verified());

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let chains = chains.clone();
                thread::spawn(move || {
                    let partition = PartitionKey::from(if worker % 2 == 0 { "even" } else { "odd" });
                    for _ in 0..25 {
                        chains
                            .create(partition.clone(), serde_json::json!({ "worker": worker }))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for partition in ["even", "odd"] {
            let key = PartitionKey::from(partition);
            assert_eq!(chains.ordered(&key).unwrap().len(), 50);
            assert!(chains.with_store(|s| audit(s, &key)).unwrap().is_empty());
        }
    }

    #[test]
    fn concurrent_relocations_on_one_partition() {
        let chains = SharedChains::new(InMemoryRecordStore::new(), ChainConfig::default_config());
        let key = PartitionKey::from("p");
        let ids: Vec<RecordId> = (0..8)
            .map(|_| chains.create(key.clone(), serde_json::Value::Null).unwrap().id)
            .collect();

        let handles: Vec<_> = ids
            .iter()
            .copied()
            .enumerate()
            .map(|(i, id)| {
                let chains = chains.clone();
                thread::spawn(move || {
                    for _ in 0..10 {
                        if i % 2 == 0 {
                            chains.insert_first(id).unwrap();
                        } else {
                            chains.insert_last(id).unwrap();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let order = chains.ordered(&key).unwrap();
        assert_eq!(order.len(), ids.len());
        assert!(chains.with_store(|s| audit(s, &key)).unwrap().is_empty());
    }

    #[test]
    fn busy_partition_blocks_only_itself() {
        let chains = SharedChains::new(InMemoryRecordStore::new(), ChainConfig::default_config());
        let busy = PartitionKey::from("busy");
        let gate = chains.gate(&busy);
        let held = lock(&gate);

        let spawn_create = |partition: &str| {
            let chains = chains.clone();
            let partition = PartitionKey::from(partition);
            let (tx, rx) = mpsc::channel();
            let handle = thread::spawn(move || {
                let created = chains.create(partition, serde_json::Value::Null);
                tx.send(created.map(|r| r.id)).ok();
            });
            (handle, rx)
        };

        let (idle_worker, idle) = spawn_create("idle");
        let idle_id = idle
            .recv_timeout(Duration::from_secs(5))
            .expect("idle partition was blocked")
            .unwrap();

        let (busy_worker, waiting) = spawn_create("busy");
        assert_eq!(
            waiting.recv_timeout(Duration::from_millis(100)).unwrap_err(),
            RecvTimeoutError::Timeout
        );

        drop(held);
        let busy_id = waiting
            .recv_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap();
        idle_worker.join().unwrap();
        busy_worker.join().unwrap();

        assert!(chains.state(idle_id).unwrap().is_head());
        assert!(chains.state(busy_id).unwrap().is_head());
    }

    #[test]
    fn failed_operation_is_rolled_back() {
        let chains = SharedChains::new(InMemoryRecordStore::new(), ChainConfig::default_config());
        let key = PartitionKey::from("p");
        let a = chains.create(key.clone(), serde_json::Value::Null).unwrap();
        let b = chains.create(key.clone(), serde_json::Value::Null).unwrap();
        chains.with_store_mut(|s| s.fail_writes_after(1));

        assert!(chains.insert_first(b.id).is_err());

        let order: Vec<_> = chains.ordered(&key).unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(order, vec![a.id, b.id]);
        assert!(chains.with_store(|s| audit(s, &key)).unwrap().is_empty());
    }

    #[test]
    fn failed_create_leaves_no_record_behind() {
        let chains = SharedChains::new(InMemoryRecordStore::new(), ChainConfig::default_config());
        let key = PartitionKey::from("p");
        let a = chains.create(key.clone(), serde_json::Value::Null).unwrap();
        chains.with_store_mut(|s| s.fail_writes_after(0));

        assert!(chains.create(key.clone(), serde_json::Value::Null).is_err());

        assert_eq!(chains.with_store(|s| s.count(&key)).unwrap(), 1);
        let order: Vec<_> = chains.ordered(&key).unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(order, vec![a.id]);
    }
}
