// Invariant Framework
//
// Invariants are pure rules over a snapshot of one partition. They are
// evaluated after chain writes (when enabled) and by audits, so a broken
// chain is reported before anything reads a wrong order out of it.

use std::collections::HashMap;

use serde::Serialize;

use crate::record::{PartitionKey, Predicate, Record, RecordId, RecordStore, StoreError};

pub mod rules;

pub use rules::{Acyclic, PartitionClosure, Reachability, SingleInbound, UniqueHead};

/// Result of invariant evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantResult {
    Pass,
    Fail(String),
}

/// Point-in-time copy of one partition plus whatever its links touch
/// outside of it.
#[derive(Debug, Clone)]
pub struct PartitionSnapshot {
    pub partition: PartitionKey,
    /// Every record of the partition, in store order.
    pub records: Vec<Record>,
    /// Link targets not in this partition, with their partition if they
    /// exist at all.
    pub outside: HashMap<RecordId, Option<PartitionKey>>,
    index: HashMap<RecordId, usize>,
    inbound: HashMap<RecordId, usize>,
}

impl PartitionSnapshot {
    pub fn capture<S: RecordStore>(
        store: &S,
        partition: &PartitionKey,
    ) -> Result<Self, StoreError> {
        let records = store.query(partition, Predicate::All)?;
        let mut snapshot = Self::from_records(partition.clone(), records);

        let missing: Vec<RecordId> = snapshot
            .records
            .iter()
            .filter_map(|r| r.next)
            .filter(|next| !snapshot.index.contains_key(next))
            .collect();
        for id in missing {
            let found = store.find(id)?.map(|r| r.partition);
            snapshot.outside.insert(id, found);
        }

        Ok(snapshot)
    }

    /// Build a snapshot from records already in hand.
    ///
    /// Targets outside `records` are recorded as missing.
    pub fn from_records(partition: PartitionKey, records: Vec<Record>) -> Self {
        let index = records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id, i))
            .collect::<HashMap<_, _>>();

        let mut inbound = HashMap::new();
        let mut outside = HashMap::new();
        for next in records.iter().filter_map(|r| r.next) {
            *inbound.entry(next).or_insert(0) += 1;
            if !index.contains_key(&next) {
                outside.insert(next, None);
            }
        }

        Self {
            partition,
            records,
            outside,
            index,
            inbound,
        }
    }

    pub fn get(&self, id: RecordId) -> Option<&Record> {
        self.index.get(&id).map(|&i| &self.records[i])
    }

    pub fn inbound(&self, id: RecordId) -> usize {
        self.inbound.get(&id).copied().unwrap_or(0)
    }

    /// A record takes part in the chain unless it carries the unlinked
    /// marker. Stray links override the marker.
    pub fn is_linked(&self, record: &Record) -> bool {
        !record.unlinked
            || record.is_first
            || record.next.is_some()
            || self.inbound(record.id) > 0
    }

    pub fn linked(&self) -> impl Iterator<Item = &Record> {
        self.records.iter().filter(move |r| self.is_linked(r))
    }

    pub fn heads(&self) -> impl Iterator<Item = &Record> {
        self.records.iter().filter(|r| r.is_first)
    }
}

/// Trait implemented by all chain invariants.
///
/// Invariants must be:
/// - Pure
/// - Deterministic
/// - Side-effect free
pub trait ChainInvariant: Send + Sync {
    fn name(&self) -> &'static str;

    fn validate(&self, snapshot: &PartitionSnapshot) -> InvariantResult;
}

/// Invariant engine that evaluates a set of invariants.
#[derive(Default)]
pub struct InvariantEngine {
    invariants: Vec<Box<dyn ChainInvariant>>,
}

impl InvariantEngine {
    /// Create an engine with no invariants registered.
    pub fn new() -> Self {
        Self {
            invariants: Vec::new(),
        }
    }

    /// Engine with the five chain rules, cheapest first.
    pub fn standard() -> Self {
        let mut engine = Self::new();
        engine.register(UniqueHead);
        engine.register(SingleInbound);
        engine.register(PartitionClosure);
        engine.register(Acyclic);
        engine.register(Reachability);
        engine
    }

    /// Register an invariant.
    pub fn register<I: ChainInvariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    pub fn len(&self) -> usize {
        self.invariants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.invariants.is_empty()
    }

    /// Evaluate all invariants.
    ///
    /// Stops at the first failure.
    pub fn evaluate(&self, snapshot: &PartitionSnapshot) -> Result<(), InvariantViolation> {
        for invariant in &self.invariants {
            match invariant.validate(snapshot) {
                InvariantResult::Pass => continue,
                InvariantResult::Fail(reason) => {
                    return Err(InvariantViolation {
                        invariant: invariant.name(),
                        partition: snapshot.partition.clone(),
                        reason,
                    })
                }
            }
        }
        Ok(())
    }

    /// Evaluate every invariant and collect all failures.
    pub fn audit(&self, snapshot: &PartitionSnapshot) -> Vec<InvariantViolation> {
        self.invariants
            .iter()
            .filter_map(|invariant| match invariant.validate(snapshot) {
                InvariantResult::Pass => None,
                InvariantResult::Fail(reason) => Some(InvariantViolation {
                    invariant: invariant.name(),
                    partition: snapshot.partition.clone(),
                    reason,
                }),
            })
            .collect()
    }
}

/// Returned when an invariant is violated.
#[derive(Debug, Clone, thiserror::Error, Serialize)]
#[error("invariant `{invariant}` violated in partition {partition}: {reason}")]
pub struct InvariantViolation {
    pub invariant: &'static str,
    pub partition: PartitionKey,
    pub reason: String,
}

/// Snapshot a partition from the store and run the standard rules on it.
pub fn audit<S: RecordStore>(
    store: &S,
    partition: &PartitionKey,
) -> Result<Vec<InvariantViolation>, StoreError> {
    let snapshot = PartitionSnapshot::capture(store, partition)?;
    Ok(InvariantEngine::standard().audit(&snapshot))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::record::{PartitionKey, Record, RecordId};

    /// Records linked in the given order, head flagged.
    pub fn chain(partition: &str, n: usize) -> Vec<Record> {
        let ids: Vec<RecordId> = (0..n).map(|_| RecordId::new()).collect();
        ids.iter()
            .enumerate()
            .map(|(i, &id)| Record {
                id,
                partition: PartitionKey::from(partition),
                next: ids.get(i + 1).copied(),
                is_first: i == 0,
                unlinked: false,
                attributes: serde_json::Value::Null,
                revision: 0,
            })
            .collect()
    }
}
