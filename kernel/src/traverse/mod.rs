// Chain Reconstruction
//
// Rebuilds the total order of a partition from the scattered `next`
// links. One partition fetch, then pointer chasing in memory.

use std::collections::HashSet;

use serde::Serialize;

use crate::invariants::PartitionSnapshot;
use crate::record::{PartitionKey, Record, RecordId, RecordStore, StoreError};

/// What made a chain impossible to reconstruct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ChainDefect {
    MissingHead,
    MultipleHeads(usize),
    /// A link points at a record that is not in the partition.
    DanglingLink { from: RecordId, to: RecordId },
    Cycle { at: RecordId },
    /// Has a successor but neither a predecessor nor the head flag.
    Orphaned(RecordId),
    /// The walk from the head ended early.
    Unreachable { expected: usize, reached: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum TraverseError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("malformed chain in partition {partition}: {defect:?}")]
    Malformed {
        partition: PartitionKey,
        defect: ChainDefect,
    },
}

/// Reconstruct the ordered chain of `partition`.
///
/// Records carrying the unlinked marker are skipped. Every other record
/// must be reached by the walk from the head, or the whole chain is
/// malformed.
pub fn ordered<S: RecordStore>(
    store: &S,
    partition: &PartitionKey,
) -> Result<Vec<Record>, TraverseError> {
    let snapshot = PartitionSnapshot::capture(store, partition)?;
    walk(&snapshot).map_err(|defect| {
        tracing::warn!(%partition, ?defect, "chain reconstruction failed");
        TraverseError::Malformed {
            partition: partition.clone(),
            defect,
        }
    })
}

/// Walk a snapshot from its head.
pub fn walk(snapshot: &PartitionSnapshot) -> Result<Vec<Record>, ChainDefect> {
    let expected = snapshot.linked().count();
    if expected == 0 {
        return Ok(Vec::new());
    }

    let mut heads = snapshot.heads();
    let head = heads.next().ok_or(ChainDefect::MissingHead)?;
    let extra = heads.count();
    if extra > 0 {
        return Err(ChainDefect::MultipleHeads(extra + 1));
    }

    let mut out = Vec::with_capacity(expected);
    let mut seen = HashSet::with_capacity(expected);
    let mut current = head;
    loop {
        if !seen.insert(current.id) {
            return Err(ChainDefect::Cycle { at: current.id });
        }
        out.push(current.clone());

        let Some(next) = current.next else { break };
        current = snapshot.get(next).ok_or(ChainDefect::DanglingLink {
            from: current.id,
            to: next,
        })?;
    }

    if out.len() != expected {
        return Err(ChainDefect::Unreachable {
            expected,
            reached: out.len(),
        });
    }
    Ok(out)
}

/// One record's link fields as implied by its place in a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTriple {
    pub id: RecordId,
    pub next: Option<RecordId>,
    pub is_first: bool,
}

/// Derive link fields from consecutive pairs of an ordered sequence.
pub fn relink(order: &[RecordId]) -> Vec<LinkTriple> {
    order
        .iter()
        .enumerate()
        .map(|(i, &id)| LinkTriple {
            id,
            next: order.get(i + 1).copied(),
            is_first: i == 0,
        })
        .collect()
}

pub fn ids(records: &[Record]) -> Vec<RecordId> {
    records.iter().map(|r| r.id).collect()
}
