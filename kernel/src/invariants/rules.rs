// Chain Invariants
//
// The five structural rules every non-empty partition chain satisfies
// between operations.

use std::collections::HashSet;

use super::{ChainInvariant, InvariantResult, PartitionSnapshot};

/// Exactly one head in a non-empty chain.
pub struct UniqueHead;

impl ChainInvariant for UniqueHead {
    fn name(&self) -> &'static str {
        "unique-head"
    }

    fn validate(&self, snapshot: &PartitionSnapshot) -> InvariantResult {
        let heads = snapshot.heads().count();
        let linked = snapshot.linked().count();

        match (linked, heads) {
            (0, 0) | (_, 1) => InvariantResult::Pass,
            (_, 0) => InvariantResult::Fail(format!("{linked} linked records but no head")),
            (_, n) => InvariantResult::Fail(format!("{n} records flagged as head")),
        }
    }
}

/// No record is the successor of two records.
pub struct SingleInbound;

impl ChainInvariant for SingleInbound {
    fn name(&self) -> &'static str {
        "single-inbound"
    }

    fn validate(&self, snapshot: &PartitionSnapshot) -> InvariantResult {
        match snapshot
            .records
            .iter()
            .find(|r| snapshot.inbound(r.id) > 1)
        {
            Some(r) => InvariantResult::Fail(format!(
                "record {} is linked from {} records",
                r.id,
                snapshot.inbound(r.id)
            )),
            None => InvariantResult::Pass,
        }
    }
}

/// Following `next` never revisits a record.
pub struct Acyclic;

impl ChainInvariant for Acyclic {
    fn name(&self) -> &'static str {
        "acyclic"
    }

    fn validate(&self, snapshot: &PartitionSnapshot) -> InvariantResult {
        for start in snapshot.linked() {
            let mut seen = HashSet::from([start.id]);
            let mut cursor = start.next;

            while let Some(id) = cursor {
                if !seen.insert(id) {
                    return InvariantResult::Fail(format!("cycle through record {id}"));
                }
                cursor = snapshot.get(id).and_then(|r| r.next);
            }
        }
        InvariantResult::Pass
    }
}

/// `next` stays inside the partition.
pub struct PartitionClosure;

impl ChainInvariant for PartitionClosure {
    fn name(&self) -> &'static str {
        "partition-closure"
    }

    fn validate(&self, snapshot: &PartitionSnapshot) -> InvariantResult {
        for record in &snapshot.records {
            let Some(next) = record.next else { continue };
            match snapshot.outside.get(&next) {
                None => {}
                Some(Some(other)) => {
                    return InvariantResult::Fail(format!(
                        "record {} links to {next} in partition {other}",
                        record.id
                    ))
                }
                Some(None) => {
                    return InvariantResult::Fail(format!(
                        "record {} links to missing record {next}",
                        record.id
                    ))
                }
            }
        }
        InvariantResult::Pass
    }
}

/// Every linked record is reachable from the head.
pub struct Reachability;

impl ChainInvariant for Reachability {
    fn name(&self) -> &'static str {
        "reachability"
    }

    fn validate(&self, snapshot: &PartitionSnapshot) -> InvariantResult {
        let linked = snapshot.linked().count();
        let Some(head) = snapshot.heads().next() else {
            return if linked == 0 {
                InvariantResult::Pass
            } else {
                InvariantResult::Fail("no head to walk from".into())
            };
        };

        let mut seen = HashSet::new();
        let mut cursor = Some(head.id);
        while let Some(id) = cursor {
            if !seen.insert(id) {
                break;
            }
            cursor = snapshot.get(id).and_then(|r| r.next);
        }
        let reached = seen.iter().filter(|id| snapshot.get(**id).is_some()).count();

        if reached == linked {
            InvariantResult::Pass
        } else {
            InvariantResult::Fail(format!(
                "reached {reached} of {linked} linked records from head {}",
                head.id
            ))
        }
    }
}
