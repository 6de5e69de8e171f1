// Record Store Abstraction
//
// Defines the persistence contract the chain manager relies on, plus an
// id-indexed in-memory arena used by the CLI and the tests.

use std::collections::BTreeMap;

use super::{LinkField, PartitionKey, Predicate, Record, RecordId, StoreError};

/// Storage backend for ordered records.
///
/// Properties required from implementations:
/// - Atomic single-record writes
/// - Revision check on every update
/// - Stable query order within a partition
///
/// Implementations MUST NOT:
/// - Touch link fields other than the one named in an update
/// - Return records from another partition for a partition query
pub trait RecordStore {
    /// Persist a new, not yet linked record.
    fn create(
        &mut self,
        partition: PartitionKey,
        attributes: serde_json::Value,
    ) -> Result<Record, StoreError>;

    fn find(&self, id: RecordId) -> Result<Option<Record>, StoreError>;

    /// Records of one partition matching `predicate`, in creation order.
    fn query(&self, partition: &PartitionKey, predicate: Predicate)
        -> Result<Vec<Record>, StoreError>;

    /// Write one link field.
    ///
    /// Fails with `StaleRecord` if `record.revision` is behind storage.
    fn update(&mut self, record: &Record, field: LinkField) -> Result<Record, StoreError>;

    /// Physically delete a record. Unlinking is the caller's job.
    fn destroy(&mut self, id: RecordId) -> Result<(), StoreError>;

    fn count(&self, partition: &PartitionKey) -> Result<usize, StoreError> {
        Ok(self.query(partition, Predicate::All)?.len())
    }

    /// Run `f` as one unit of work.
    ///
    /// The default offers no rollback: a failure part way through leaves
    /// whatever writes already happened. Stores with transactions should
    /// override this.
    fn atomically<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce(&mut Self) -> Result<T, E>,
    {
        f(self)
    }
}

#[derive(Debug, Clone)]
struct Slot {
    seq: u64,
    record: Record,
}

/// Arena of records keyed by id.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRecordStore {
    records: BTreeMap<RecordId, Slot>,
    next_seq: u64,
    writes_until_failure: Option<usize>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the update that follows the next `n` successful ones.
    ///
    /// The failure fires once; later updates succeed again.
    pub fn fail_writes_after(&mut self, n: usize) {
        self.writes_until_failure = Some(n);
    }

    pub fn clear_failure(&mut self) {
        self.writes_until_failure = None;
    }

    pub fn partitions(&self) -> Vec<PartitionKey> {
        let mut keys: Vec<PartitionKey> = self
            .records
            .values()
            .map(|slot| slot.record.partition.clone())
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn check_write(&mut self, id: RecordId) -> Result<(), StoreError> {
        let Some(remaining) = self.writes_until_failure else {
            return Ok(());
        };
        if remaining == 0 {
            self.writes_until_failure = None;
            return Err(StoreError::WriteFailed(id));
        }
        self.writes_until_failure = Some(remaining - 1);
        Ok(())
    }
}

impl RecordStore for InMemoryRecordStore {
    fn create(
        &mut self,
        partition: PartitionKey,
        attributes: serde_json::Value,
    ) -> Result<Record, StoreError> {
        let record = Record {
            id: RecordId::new(),
            partition,
            next: None,
            is_first: false,
            unlinked: true,
            attributes,
            revision: 0,
        };

        if self.records.contains_key(&record.id) {
            return Err(StoreError::Constraint(format!(
                "duplicate record id {}",
                record.id
            )));
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.records.insert(
            record.id,
            Slot {
                seq,
                record: record.clone(),
            },
        );
        Ok(record)
    }

    fn find(&self, id: RecordId) -> Result<Option<Record>, StoreError> {
        Ok(self.records.get(&id).map(|slot| slot.record.clone()))
    }

    fn query(
        &self,
        partition: &PartitionKey,
        predicate: Predicate,
    ) -> Result<Vec<Record>, StoreError> {
        let mut hits: Vec<&Slot> = self
            .records
            .values()
            .filter(|slot| &slot.record.partition == partition && predicate.matches(&slot.record))
            .collect();
        hits.sort_by_key(|slot| slot.seq);
        Ok(hits.into_iter().map(|slot| slot.record.clone()).collect())
    }

    fn update(&mut self, record: &Record, field: LinkField) -> Result<Record, StoreError> {
        let current = self
            .records
            .get(&record.id)
            .map(|slot| slot.record.revision)
            .ok_or(StoreError::NotFound(record.id))?;

        if current != record.revision {
            return Err(StoreError::StaleRecord {
                id: record.id,
                expected: current,
                actual: record.revision,
            });
        }

        if let LinkField::Next(Some(next)) = field {
            if next == record.id {
                return Err(StoreError::Constraint(format!(
                    "record {} cannot follow itself",
                    record.id
                )));
            }
        }

        self.check_write(record.id)?;

        let slot = self
            .records
            .get_mut(&record.id)
            .ok_or(StoreError::NotFound(record.id))?;
        match field {
            LinkField::Next(next) => slot.record.next = next,
            LinkField::IsFirst(flag) => slot.record.is_first = flag,
            LinkField::Unlinked(flag) => slot.record.unlinked = flag,
        }
        slot.record.revision += 1;
        Ok(slot.record.clone())
    }

    fn destroy(&mut self, id: RecordId) -> Result<(), StoreError> {
        self.records
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(id))
    }

    fn atomically<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce(&mut Self) -> Result<T, E>,
    {
        let records = self.records.clone();
        let next_seq = self.next_seq;

        let result = f(self);
        if result.is_err() {
            tracing::warn!(records = records.len(), "rolling back in-memory transaction");
            self.records = records;
            self.next_seq = next_seq;
        }
        result
    }
}
