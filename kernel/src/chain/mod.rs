// Chain Manager
//
// Order maintenance over the embedded linked list. The manager holds no
// chain state: every step loads the records it decides on from the store
// and writes one link field at a time back through it, against the
// revision it read.
//
// Multi-step operations are not atomic on their own. Callers must run
// each one inside the store's unit of work (`RecordStore::atomically`,
// or `SharedChains`) or accept that a failed write can leave the
// partition half relinked.

use crate::invariants::{InvariantEngine, InvariantViolation, PartitionSnapshot};
use crate::record::{
    LinkField, PartitionKey, Predicate, Record, RecordId, RecordStore, StoreError,
};
use crate::traverse::{self, ChainDefect, TraverseError};

pub mod config;
pub mod position;

pub use config::{ChainConfig, VerifyMode};
pub use position::{LinkState, Position, StateError, Transition};

/// Errors surfaced by chain operations.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("cannot link {record} (partition {record_partition}) after {target} (partition {target_partition})")]
    CrossPartitionLink {
        record: RecordId,
        record_partition: PartitionKey,
        target: RecordId,
        target_partition: PartitionKey,
    },

    #[error("cannot link after {0}: it is not in a chain")]
    UnlinkedTarget(RecordId),

    #[error("malformed chain in partition {partition}: {defect:?}")]
    MalformedChain {
        partition: PartitionKey,
        defect: ChainDefect,
    },

    #[error("{0}")]
    Invariant(#[from] InvariantViolation),

    #[error("{0}")]
    State(#[from] StateError),
}

impl From<TraverseError> for ChainError {
    fn from(value: TraverseError) -> Self {
        match value {
            TraverseError::Store(err) => ChainError::Store(err),
            TraverseError::Malformed { partition, defect } => {
                ChainError::MalformedChain { partition, defect }
            }
        }
    }
}

/// Stateless order-maintenance logic.
pub struct ChainManager {
    config: ChainConfig,
    invariants: InvariantEngine,
}

impl Default for ChainManager {
    fn default() -> Self {
        Self::new(ChainConfig::default_config())
    }
}

impl ChainManager {
    pub fn new(config: ChainConfig) -> Self {
        Self {
            config,
            invariants: InvariantEngine::standard(),
        }
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// Per-record view over this manager and a store.
    pub fn at<'a, S: RecordStore>(&'a self, store: &'a mut S, id: RecordId) -> RecordRef<'a, S> {
        RecordRef {
            manager: self,
            store,
            id,
        }
    }

    // ---------------------------------------------------------------
    // Lookups
    // ---------------------------------------------------------------

    pub fn predecessor<S: RecordStore>(
        &self,
        store: &S,
        id: RecordId,
    ) -> Result<Option<Record>, ChainError> {
        let record = load(store, id)?;
        Ok(predecessor_of(store, &record)?)
    }

    pub fn successor<S: RecordStore>(
        &self,
        store: &S,
        id: RecordId,
    ) -> Result<Option<Record>, ChainError> {
        match load(store, id)?.next {
            Some(next) => Ok(Some(load(store, next)?)),
            None => Ok(None),
        }
    }

    pub fn state<S: RecordStore>(&self, store: &S, id: RecordId) -> Result<LinkState, ChainError> {
        Ok(state_of(&load(store, id)?))
    }

    pub fn is_head<S: RecordStore>(&self, store: &S, id: RecordId) -> Result<bool, ChainError> {
        Ok(self.state(store, id)?.is_head())
    }

    pub fn is_tail<S: RecordStore>(&self, store: &S, id: RecordId) -> Result<bool, ChainError> {
        Ok(self.state(store, id)?.is_tail())
    }

    pub fn head<S: RecordStore>(
        &self,
        store: &S,
        partition: &PartitionKey,
    ) -> Result<Option<Record>, ChainError> {
        Ok(find_head(store, partition, None)?)
    }

    pub fn tail<S: RecordStore>(
        &self,
        store: &S,
        partition: &PartitionKey,
    ) -> Result<Option<Record>, ChainError> {
        Ok(find_tail(store, partition, None)?)
    }

    /// The partition's records in chain order.
    pub fn ordered<S: RecordStore>(
        &self,
        store: &S,
        partition: &PartitionKey,
    ) -> Result<Vec<Record>, ChainError> {
        Ok(traverse::ordered(store, partition)?)
    }

    // ---------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------

    /// Create a record and append it to its partition.
    pub fn create<S: RecordStore>(
        &self,
        store: &mut S,
        partition: PartitionKey,
        attributes: serde_json::Value,
    ) -> Result<Record, ChainError> {
        let record = store.create(partition, attributes)?;
        self.include_in_list(store, record.id)?;
        load(store, record.id)
    }

    /// Link a freshly created record: head of an empty partition,
    /// otherwise the new tail.
    pub fn include_in_list<S: RecordStore>(
        &self,
        store: &mut S,
        id: RecordId,
    ) -> Result<(), ChainError> {
        let record = load(store, id)?;
        let before = state_of(&record);
        if before.is_linked() {
            return Err(StateError::IllegalTransition(format!(
                "record {id} is already linked as {before:?}"
            ))
            .into());
        }

        let others = store.query(&record.partition, Predicate::Except(id))?;
        tracing::debug!(record = %id, partition = %record.partition, peers = others.len(), "include in list");
        if others.is_empty() {
            let head = write(store, &record, LinkField::IsFirst(true))?;
            mark_linked(store, head)?;
        } else {
            self.append(store, record.clone())?;
        }

        self.settle(store, &record, before, Transition::Include)
    }

    /// Unlink a record and delete it from the store.
    pub fn destroy<S: RecordStore>(&self, store: &mut S, id: RecordId) -> Result<(), ChainError> {
        if self.config.detach_on_destroy {
            self.remove(store, id)?;
        }
        tracing::debug!(record = %id, "destroy");
        store.destroy(id)?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Ordering operations
    // ---------------------------------------------------------------

    /// Make `id` the head of its partition.
    pub fn insert_first<S: RecordStore>(
        &self,
        store: &mut S,
        id: RecordId,
    ) -> Result<(), ChainError> {
        let record = load(store, id)?;
        let before = state_of(&record);
        if record.is_first {
            tracing::debug!(record = %id, "insert_first: already head");
            return Ok(());
        }

        tracing::debug!(record = %id, partition = %record.partition, "insert_first");
        let mut current = if before.is_linked() {
            self.detach(store, record.clone())?
        } else {
            record.clone()
        };

        if let Some(head) = find_head(store, &record.partition, Some(id))? {
            // The old head keeps its successor and moves in behind `id`.
            write(store, &head, LinkField::IsFirst(false))?;
            current = write(store, &current, LinkField::Next(Some(head.id)))?;
        }
        let current = write(store, &current, LinkField::IsFirst(true))?;
        mark_linked(store, current)?;

        self.settle(store, &record, before, Transition::Relocate)
    }

    /// Move `id` to the end of its partition.
    pub fn insert_last<S: RecordStore>(
        &self,
        store: &mut S,
        id: RecordId,
    ) -> Result<(), ChainError> {
        let record = load(store, id)?;
        let before = state_of(&record);
        if before.is_tail() {
            tracing::debug!(record = %id, "insert_last: already tail");
            return Ok(());
        }

        tracing::debug!(record = %id, partition = %record.partition, "insert_last");
        self.append(store, record.clone())?;
        self.settle(store, &record, before, Transition::Relocate)
    }

    /// Place `id` directly after `target`.
    pub fn insert_after<S: RecordStore>(
        &self,
        store: &mut S,
        id: RecordId,
        target: RecordId,
    ) -> Result<(), ChainError> {
        let record = load(store, id)?;
        if id == target {
            tracing::debug!(record = %id, "insert_after: record is its own target");
            return Ok(());
        }
        let before = state_of(&record);

        tracing::debug!(record = %id, target = %target, "insert_after");
        self.splice_after(store, record.clone(), target)?;
        self.settle(store, &record, before, Transition::Relocate)
    }

    /// Take `id` out of its chain, relinking its neighbours.
    pub fn remove<S: RecordStore>(&self, store: &mut S, id: RecordId) -> Result<(), ChainError> {
        let record = load(store, id)?;
        let before = state_of(&record);

        tracing::debug!(record = %id, partition = %record.partition, state = ?before, "remove");
        let detached = self.detach(store, record.clone())?;
        if !detached.unlinked {
            write(store, &detached, LinkField::Unlinked(true))?;
        }
        self.settle(store, &record, before, Transition::Remove)
    }

    // ---------------------------------------------------------------
    // Primitives
    //
    // Each takes the record version its decision is based on and writes
    // against that revision.
    // ---------------------------------------------------------------

    fn append<S: RecordStore>(&self, store: &mut S, record: Record) -> Result<(), ChainError> {
        match find_tail(store, &record.partition, Some(record.id))? {
            Some(tail) => self.splice_after(store, record, tail.id),
            None => {
                // Nothing else is linked: the record starts the chain.
                let record = if record.is_first {
                    record
                } else {
                    write(store, &record, LinkField::IsFirst(true))?
                };
                mark_linked(store, record)?;
                Ok(())
            }
        }
    }

    fn splice_after<S: RecordStore>(
        &self,
        store: &mut S,
        record: Record,
        target_id: RecordId,
    ) -> Result<(), ChainError> {
        let id = record.id;
        let target = load(store, target_id)?;
        if !record.same_partition(&target) {
            return Err(ChainError::CrossPartitionLink {
                record: id,
                record_partition: record.partition,
                target: target_id,
                target_partition: target.partition,
            });
        }
        if !state_of(&target).is_linked() {
            return Err(ChainError::UnlinkedTarget(target_id));
        }
        if target.next == Some(id) {
            tracing::debug!(record = %id, target = %target_id, "insert_after: already in place");
            return Ok(());
        }

        let record = if state_of(&record).is_linked() {
            self.detach(store, record)?
        } else {
            record
        };

        // Detaching may have rewritten the target.
        let target = load(store, target_id)?;
        let record = write(store, &record, LinkField::Next(target.next))?;
        write(store, &target, LinkField::Next(Some(id)))?;
        mark_linked(store, record)?;
        Ok(())
    }

    /// Close the gap around `record`. Returns its latest version.
    fn detach<S: RecordStore>(&self, store: &mut S, record: Record) -> Result<Record, ChainError> {
        if record.is_first {
            let record = write(store, &record, LinkField::IsFirst(false))?;
            if let Some(successor) = record.next {
                let successor = load(store, successor)?;
                write(store, &successor, LinkField::IsFirst(true))?;
                return write(store, &record, LinkField::Next(None));
            }
            return Ok(record);
        }

        match predecessor_of(store, &record)? {
            Some(previous) => {
                write(store, &previous, LinkField::Next(record.next))?;
                if record.next.is_some() {
                    return write(store, &record, LinkField::Next(None));
                }
                Ok(record)
            }
            None if record.next.is_some() => Err(ChainError::MalformedChain {
                partition: record.partition,
                defect: ChainDefect::Orphaned(record.id),
            }),
            None => {
                tracing::debug!(record = %record.id, "remove: already unlinked");
                Ok(record)
            }
        }
    }

    /// Check the record's state change and, if configured, the partition.
    fn settle<S: RecordStore>(
        &self,
        store: &S,
        original: &Record,
        before: LinkState,
        op: Transition,
    ) -> Result<(), ChainError> {
        let after = self.state(store, original.id)?;
        before.transition(op, after)?;

        if self.config.verify == VerifyMode::AfterWrite {
            let snapshot = PartitionSnapshot::capture(store, &original.partition)?;
            self.invariants.evaluate(&snapshot)?;
        }
        Ok(())
    }
}

/// A record bound to a manager and a store.
pub struct RecordRef<'a, S> {
    manager: &'a ChainManager,
    store: &'a mut S,
    id: RecordId,
}

impl<S: RecordStore> RecordRef<'_, S> {
    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn insert_first(&mut self) -> Result<(), ChainError> {
        self.manager.insert_first(&mut *self.store, self.id)
    }

    pub fn insert_last(&mut self) -> Result<(), ChainError> {
        self.manager.insert_last(&mut *self.store, self.id)
    }

    pub fn insert_after(&mut self, target: RecordId) -> Result<(), ChainError> {
        self.manager.insert_after(&mut *self.store, self.id, target)
    }

    pub fn remove(&mut self) -> Result<(), ChainError> {
        self.manager.remove(&mut *self.store, self.id)
    }

    pub fn is_head(&self) -> Result<bool, ChainError> {
        self.manager.is_head(&*self.store, self.id)
    }

    pub fn is_tail(&self) -> Result<bool, ChainError> {
        self.manager.is_tail(&*self.store, self.id)
    }
}

fn load<S: RecordStore>(store: &S, id: RecordId) -> Result<Record, ChainError> {
    store
        .find(id)?
        .ok_or(ChainError::Store(StoreError::NotFound(id)))
}

/// Write against the revision in `record`. A change made since it was
/// read fails with `StaleRecord`.
fn write<S: RecordStore>(
    store: &mut S,
    record: &Record,
    field: LinkField,
) -> Result<Record, ChainError> {
    tracing::trace!(record = %record.id, revision = record.revision, ?field, "link write");
    Ok(store.update(record, field)?)
}

fn mark_linked<S: RecordStore>(store: &mut S, record: Record) -> Result<Record, ChainError> {
    if record.unlinked {
        write(store, &record, LinkField::Unlinked(false))
    } else {
        Ok(record)
    }
}

fn predecessor_of<S: RecordStore>(store: &S, record: &Record) -> Result<Option<Record>, StoreError> {
    Ok(store
        .query(&record.partition, Predicate::PointsTo(record.id))?
        .into_iter()
        .next())
}

fn state_of(record: &Record) -> LinkState {
    LinkState::classify(record.unlinked, record.is_first, record.next.is_some())
}

fn find_head<S: RecordStore>(
    store: &S,
    partition: &PartitionKey,
    excluding: Option<RecordId>,
) -> Result<Option<Record>, StoreError> {
    Ok(store
        .query(partition, Predicate::Head { excluding })?
        .into_iter()
        .next())
}

fn find_tail<S: RecordStore>(
    store: &S,
    partition: &PartitionKey,
    excluding: Option<RecordId>,
) -> Result<Option<Record>, StoreError> {
    Ok(store
        .query(partition, Predicate::Tail { excluding })?
        .into_iter()
        .next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invariants::{audit, InvariantEngine};
    use crate::record::InMemoryRecordStore;
    use crate::traverse::ids;
    use std::cell::Cell;

    /// In-memory store that counts queries and can let a second writer
    /// touch one record right before the next update goes through.
    #[derive(Default)]
    struct Contended {
        inner: InMemoryRecordStore,
        queries: Cell<usize>,
        interfere_with: Option<RecordId>,
    }

    impl RecordStore for Contended {
        fn create(
            &mut self,
            partition: PartitionKey,
            attributes: serde_json::Value,
        ) -> Result<Record, StoreError> {
            self.inner.create(partition, attributes)
        }

        fn find(&self, id: RecordId) -> Result<Option<Record>, StoreError> {
            self.inner.find(id)
        }

        fn query(
            &self,
            partition: &PartitionKey,
            predicate: Predicate,
        ) -> Result<Vec<Record>, StoreError> {
            self.queries.set(self.queries.get() + 1);
            self.inner.query(partition, predicate)
        }

        fn update(&mut self, record: &Record, field: LinkField) -> Result<Record, StoreError> {
            if let Some(victim) = self.interfere_with.take() {
                let current = self.inner.find(victim)?.ok_or(StoreError::NotFound(victim))?;
                self.inner
                    .update(&current, LinkField::Unlinked(current.unlinked))?;
            }
            self.inner.update(record, field)
        }

        fn destroy(&mut self, id: RecordId) -> Result<(), StoreError> {
            self.inner.destroy(id)
        }
    }

    fn setup(n: usize) -> (ChainManager, InMemoryRecordStore, Vec<RecordId>) {
        let manager = ChainManager::new(ChainConfig::verified());
        let mut store = InMemoryRecordStore::new();
        let ids = (0..n)
            .map(|_| {
                manager
                    .create(&mut store, "p".into(), serde_json::Value::Null)
                    .unwrap()
                    .id
            })
            .collect();
        (manager, store, ids)
    }

    fn order(manager: &ChainManager, store: &InMemoryRecordStore) -> Vec<RecordId> {
        ids(&manager.ordered(store, &"p".into()).unwrap())
    }

    fn assert_sound(store: &InMemoryRecordStore) {
        let snapshot = PartitionSnapshot::capture(store, &"p".into()).unwrap();
        InvariantEngine::standard().evaluate(&snapshot).unwrap();
    }

    #[test]
    fn scenario_a_first_record_is_head_and_tail() {
        let (manager, store, r) = setup(1);

        assert_eq!(order(&manager, &store), vec![r[0]]);
        assert!(manager.is_head(&store, r[0]).unwrap());
        assert!(manager.is_tail(&store, r[0]).unwrap());
    }

    #[test]
    fn scenario_b_second_record_is_appended() {
        let (manager, store, r) = setup(2);
        assert_eq!(order(&manager, &store), vec![r[0], r[1]]);
    }

    #[test]
    fn scenario_c_insert_first_moves_tail_to_front() {
        let (manager, mut store, r) = setup(3);

        manager.at(&mut store, r[2]).insert_first().unwrap();

        assert_eq!(order(&manager, &store), vec![r[2], r[0], r[1]]);
        assert_sound(&store);
    }

    #[test]
    fn scenario_d_remove_middle() {
        let (manager, mut store, r) = setup(3);

        manager.at(&mut store, r[1]).remove().unwrap();

        assert_eq!(order(&manager, &store), vec![r[0], r[2]]);
        assert_eq!(manager.state(&store, r[1]).unwrap(), LinkState::Unlinked);
        assert_sound(&store);
    }

    #[test]
    fn scenario_e_head_after_tail_swaps() {
        let (manager, mut store, r) = setup(2);

        manager.at(&mut store, r[0]).insert_after(r[1]).unwrap();

        assert_eq!(order(&manager, &store), vec![r[1], r[0]]);
        assert_sound(&store);
    }

    #[test]
    fn insert_first_from_middle() {
        let (manager, mut store, r) = setup(4);

        manager.insert_first(&mut store, r[2]).unwrap();

        assert_eq!(order(&manager, &store), vec![r[2], r[0], r[1], r[3]]);
    }

    #[test]
    fn insert_last_from_head() {
        let (manager, mut store, r) = setup(3);

        manager.insert_last(&mut store, r[0]).unwrap();

        assert_eq!(order(&manager, &store), vec![r[1], r[2], r[0]]);
        assert!(manager.is_head(&store, r[1]).unwrap());
    }

    #[test]
    fn insert_after_moves_tail_backwards() {
        let (manager, mut store, r) = setup(4);

        manager.insert_after(&mut store, r[3], r[0]).unwrap();

        assert_eq!(order(&manager, &store), vec![r[0], r[3], r[1], r[2]]);
        assert!(manager.is_tail(&store, r[2]).unwrap());
    }

    #[test]
    fn insert_after_moves_middle_forwards() {
        let (manager, mut store, r) = setup(5);

        manager.insert_after(&mut store, r[1], r[3]).unwrap();

        assert_eq!(order(&manager, &store), vec![r[0], r[2], r[3], r[1], r[4]]);
    }

    #[test]
    fn operations_already_in_place_are_noops() {
        let (manager, mut store, r) = setup(3);
        let before: Vec<_> = store
            .query(&"p".into(), Predicate::All)
            .unwrap()
            .into_iter()
            .map(|rec| rec.revision)
            .collect();

        manager.insert_first(&mut store, r[0]).unwrap();
        manager.insert_last(&mut store, r[2]).unwrap();
        manager.insert_after(&mut store, r[1], r[0]).unwrap();
        manager.insert_after(&mut store, r[1], r[1]).unwrap();

        let after: Vec<_> = store
            .query(&"p".into(), Predicate::All)
            .unwrap()
            .into_iter()
            .map(|rec| rec.revision)
            .collect();
        assert_eq!(before, after);
        assert_eq!(order(&manager, &store), r);
    }

    #[test]
    fn removing_head_promotes_successor() {
        let (manager, mut store, r) = setup(3);

        manager.remove(&mut store, r[0]).unwrap();

        assert!(manager.is_head(&store, r[1]).unwrap());
        assert!(manager.predecessor(&store, r[1]).unwrap().is_none());
        assert_eq!(order(&manager, &store), vec![r[1], r[2]]);
    }

    #[test]
    fn removing_tail_leaves_predecessor_as_tail() {
        let (manager, mut store, r) = setup(3);

        manager.remove(&mut store, r[2]).unwrap();

        assert!(manager.is_tail(&store, r[1]).unwrap());
        assert!(manager.successor(&store, r[1]).unwrap().is_none());
        assert_eq!(order(&manager, &store), vec![r[0], r[1]]);
    }

    #[test]
    fn removing_sole_record_empties_partition() {
        let (manager, mut store, r) = setup(1);

        manager.remove(&mut store, r[0]).unwrap();
        manager.remove(&mut store, r[0]).unwrap();

        assert!(order(&manager, &store).is_empty());
        assert!(manager.head(&store, &"p".into()).unwrap().is_none());
    }

    #[test]
    fn removed_record_can_be_relinked() {
        let (manager, mut store, r) = setup(3);

        manager.remove(&mut store, r[0]).unwrap();
        manager.insert_last(&mut store, r[0]).unwrap();
        assert_eq!(order(&manager, &store), vec![r[1], r[2], r[0]]);

        manager.remove(&mut store, r[2]).unwrap();
        manager.insert_after(&mut store, r[2], r[1]).unwrap();
        assert_eq!(order(&manager, &store), vec![r[1], r[2], r[0]]);
    }

    #[test]
    fn unlinked_target_is_rejected() {
        let (manager, mut store, r) = setup(3);
        manager.remove(&mut store, r[1]).unwrap();

        let err = manager.insert_after(&mut store, r[0], r[1]).unwrap_err();
        assert!(matches!(err, ChainError::UnlinkedTarget(id) if id == r[1]));
    }

    #[test]
    fn cross_partition_link_is_rejected_before_writes() {
        let (manager, mut store, r) = setup(2);
        let other = manager
            .create(&mut store, "q".into(), serde_json::Value::Null)
            .unwrap();
        let snapshot = store.clone();

        let err = manager.insert_after(&mut store, r[0], other.id).unwrap_err();

        assert!(matches!(err, ChainError::CrossPartitionLink { .. }));
        for id in &r {
            assert_eq!(store.find(*id).unwrap(), snapshot.find(*id).unwrap());
        }
    }

    #[test]
    fn partitions_are_independent() {
        let (manager, mut store, r) = setup(2);
        let q1 = manager
            .create(&mut store, "q".into(), serde_json::Value::Null)
            .unwrap();

        assert!(manager.is_head(&store, q1.id).unwrap());
        assert_eq!(order(&manager, &store), r);
    }

    #[test]
    fn destroy_unlinks_before_delete() {
        let (manager, mut store, r) = setup(3);

        manager.destroy(&mut store, r[1]).unwrap();

        assert!(store.find(r[1]).unwrap().is_none());
        assert_eq!(order(&manager, &store), vec![r[0], r[2]]);
    }

    #[test]
    fn include_twice_is_illegal() {
        let (manager, mut store, r) = setup(2);

        let err = manager.include_in_list(&mut store, r[1]).unwrap_err();
        assert!(matches!(err, ChainError::State(_)));
    }

    #[test]
    fn failed_write_aborts_and_rolls_back_in_transaction() {
        let (manager, mut store, r) = setup(3);
        store.fail_writes_after(1);

        let err = store
            .atomically(|s| manager.insert_first(s, r[2]))
            .unwrap_err();
        store.clear_failure();

        assert!(matches!(err, ChainError::Store(StoreError::WriteFailed(_))));
        assert_eq!(order(&manager, &store), r);
    }

    #[test]
    fn failed_write_without_transaction_leaves_partial_relink() {
        let (manager, mut store, r) = setup(3);
        store.fail_writes_after(2);

        assert!(manager.insert_first(&mut store, r[2]).is_err());
        store.clear_failure();

        assert!(matches!(
            manager.ordered(&store, &"p".into()),
            Err(ChainError::MalformedChain { .. })
        ));
    }

    #[test]
    fn partial_relink_is_reported_not_hidden() {
        let (manager, mut store, r) = setup(3);
        store.fail_writes_after(1);

        assert!(manager.insert_first(&mut store, r[2]).is_err());

        // r[2] lost its inbound link but is still a chain member.
        let err = manager.ordered(&store, &"p".into()).unwrap_err();
        assert!(matches!(
            err,
            ChainError::MalformedChain {
                defect: ChainDefect::Unreachable {
                    expected: 3,
                    reached: 2
                },
                ..
            }
        ));
        assert!(!audit(&store, &"p".into()).unwrap().is_empty());
    }

    #[test]
    fn broken_head_link_is_reported() {
        let (manager, mut store, r) = setup(2);
        let head = store.find(r[0]).unwrap().unwrap();
        store.update(&head, LinkField::Next(None)).unwrap();

        let err = manager.ordered(&store, &"p".into()).unwrap_err();
        assert!(matches!(
            err,
            ChainError::MalformedChain {
                defect: ChainDefect::Unreachable {
                    expected: 2,
                    reached: 1
                },
                ..
            }
        ));
    }

    #[test]
    fn self_target_on_removed_record_is_noop() {
        let (manager, mut store, r) = setup(2);
        manager.remove(&mut store, r[1]).unwrap();
        let before = store.find(r[1]).unwrap();

        manager.insert_after(&mut store, r[1], r[1]).unwrap();

        assert_eq!(store.find(r[1]).unwrap(), before);
        assert_eq!(manager.state(&store, r[1]).unwrap(), LinkState::Unlinked);
        assert_eq!(order(&manager, &store), vec![r[0]]);
    }

    #[test]
    fn concurrent_change_surfaces_as_stale_record() {
        let manager = ChainManager::default();
        let mut store = Contended::default();
        let key = PartitionKey::from("p");
        let r: Vec<RecordId> = (0..4)
            .map(|_| {
                manager
                    .create(&mut store, key.clone(), serde_json::Value::Null)
                    .unwrap()
                    .id
            })
            .collect();

        // The first write unlinks r[2] from r[3]; another writer touches
        // r[3] before the manager writes it.
        store.interfere_with = Some(r[3]);
        let err = manager.insert_after(&mut store, r[3], r[0]).unwrap_err();

        assert!(matches!(
            err,
            ChainError::Store(StoreError::StaleRecord { id, .. }) if id == r[3]
        ));
    }

    #[test]
    fn tail_lookup_does_not_scan_per_record() {
        let manager = ChainManager::default();
        let mut store = Contended::default();
        let key = PartitionKey::from("p");
        let r: Vec<RecordId> = (0..32)
            .map(|_| {
                manager
                    .create(&mut store, key.clone(), serde_json::Value::Null)
                    .unwrap()
                    .id
            })
            .collect();
        for id in &r[1..31] {
            manager.remove(&mut store, *id).unwrap();
        }

        store.queries.set(0);
        manager.insert_last(&mut store, r[1]).unwrap();

        assert!(store.queries.get() <= 2, "{} queries", store.queries.get());
        assert_eq!(
            ids(&manager.ordered(&store, &key).unwrap()),
            vec![r[0], r[31], r[1]]
        );
    }

    #[test]
    fn verification_catches_corrupted_partition() {
        let (manager, mut store, r) = setup(3);
        let tail = store.find(r[2]).unwrap().unwrap();
        store.update(&tail, LinkField::IsFirst(true)).unwrap();

        let err = manager.insert_last(&mut store, r[0]).unwrap_err();
        assert!(matches!(err, ChainError::Invariant(_)));
    }
}
