// Record Data Model
//
// A record carries its own link into the partition chain: the id of the
// record that follows it and a flag marking the head. Links are ids into
// the store, never live references.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub mod store;

pub use store::{InMemoryRecordStore, RecordStore};

/// Store-local revision of a record, bumped on every write.
pub type Revision = u64;

/// Stable identifier for a record, assigned by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub Uuid);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque key naming the independent list a record belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey(pub String);

impl From<&str> for PartitionKey {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for PartitionKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub partition: PartitionKey,
    /// The record that comes immediately after this one.
    pub next: Option<RecordId>,
    pub is_first: bool,
    /// Set while the record is outside its partition chain: freshly
    /// created, or explicitly removed.
    #[serde(default)]
    pub unlinked: bool,
    pub attributes: serde_json::Value,
    pub revision: Revision,
}

impl Record {
    pub fn same_partition(&self, other: &Record) -> bool {
        self.partition == other.partition
    }
}

/// A single link field write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkField {
    Next(Option<RecordId>),
    IsFirst(bool),
    Unlinked(bool),
}

/// Partition-scoped query predicates understood by every store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predicate {
    All,
    /// Records flagged as head, optionally skipping one record.
    Head { excluding: Option<RecordId> },
    /// Chain members without a successor, optionally skipping one record.
    Tail { excluding: Option<RecordId> },
    /// Records whose `next` is the given id.
    PointsTo(RecordId),
    /// Everything except the given record.
    Except(RecordId),
}

impl Predicate {
    pub fn matches(&self, record: &Record) -> bool {
        match *self {
            Predicate::All => true,
            Predicate::Head { excluding } => {
                record.is_first && excluding != Some(record.id)
            }
            Predicate::Tail { excluding } => {
                record.next.is_none() && !record.unlinked && excluding != Some(record.id)
            }
            Predicate::PointsTo(id) => record.next == Some(id),
            Predicate::Except(id) => record.id != id,
        }
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("record {0} not found")]
    NotFound(RecordId),

    #[error("stale record {id}: expected revision {expected}, got {actual}")]
    StaleRecord {
        id: RecordId,
        expected: Revision,
        actual: Revision,
    },

    #[error("write to record {0} failed")]
    WriteFailed(RecordId),

    #[error("constraint violation: {0}")]
    Constraint(String),
}
