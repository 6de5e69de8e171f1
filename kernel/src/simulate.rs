// Chain Script Simulation
//
// Applies a script of chain operations to a fresh in-memory store:
// script → chain operations → per-partition order + invariant audit.
//
// Records are named by caller-chosen labels so scripts stay readable and
// results are comparable between runs even though ids are random.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::chain::{ChainConfig, ChainError, ChainManager};
use crate::invariants::{InvariantEngine, InvariantViolation, PartitionSnapshot};
use crate::record::{InMemoryRecordStore, PartitionKey, Record, RecordId, RecordStore};

/// One scripted chain operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ScriptOp {
    Create { label: String, partition: String },
    InsertFirst { label: String },
    InsertLast { label: String },
    InsertAfter { label: String, target: String },
    Remove { label: String },
    Destroy { label: String },
}

/// Final order of one partition, by label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionOrder {
    pub partition: PartitionKey,
    pub order: Vec<String>,
}

/// Result of a full simulation run.
#[derive(Debug, Serialize)]
pub struct SimulationResult {
    pub partitions: Vec<PartitionOrder>,
    pub violations: Vec<InvariantViolation>,
    pub steps_applied: usize,
}

impl SimulationResult {
    pub fn is_sound(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn order_of(&self, partition: &str) -> Option<&[String]> {
        self.partitions
            .iter()
            .find(|p| p.partition.0 == partition)
            .map(|p| p.order.as_slice())
    }
}

/// Errors that can occur during simulation.
#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error("step {step}: unknown label `{label}`")]
    UnknownLabel { step: usize, label: String },

    #[error("step {step}: label `{label}` already in use")]
    DuplicateLabel { step: usize, label: String },

    #[error("step {step}: {source}")]
    Chain {
        step: usize,
        #[source]
        source: ChainError,
    },
}

struct Labels {
    ids: HashMap<String, RecordId>,
}

impl Labels {
    fn resolve(&self, step: usize, label: &str) -> Result<RecordId, SimulationError> {
        self.ids
            .get(label)
            .copied()
            .ok_or_else(|| SimulationError::UnknownLabel {
                step,
                label: label.to_owned(),
            })
    }
}

/// Run a script end to end.
///
/// This function is:
/// - deterministic in its output (labels, not ids)
/// - side-effect free outside the store it creates
/// - transactional per step
pub fn simulate(
    script: &[ScriptOp],
    config: &ChainConfig,
) -> Result<SimulationResult, SimulationError> {
    let manager = ChainManager::new(config.clone());
    let mut store = InMemoryRecordStore::new();
    let mut labels = Labels {
        ids: HashMap::new(),
    };

    // 1. Apply every step as one unit of work
    for (step, op) in script.iter().enumerate() {
        apply(&manager, &mut store, &mut labels, step, op)?;
    }

    // 2. Reconstruct each partition
    let names: HashMap<RecordId, &str> = labels
        .ids
        .iter()
        .map(|(label, id)| (*id, label.as_str()))
        .collect();
    let mut partitions = Vec::new();
    let mut violations = Vec::new();
    let engine = InvariantEngine::standard();

    for partition in store.partitions() {
        let snapshot = PartitionSnapshot::capture(&store, &partition)
            .map_err(|err| chain_error(script.len(), err.into()))?;

        // 3. Audit before trusting the order
        let found = engine.audit(&snapshot);
        if found.is_empty() {
            let records = manager
                .ordered(&store, &partition)
                .map_err(|err| chain_error(script.len(), err))?;
            partitions.push(PartitionOrder {
                partition,
                order: label_all(&records, &names),
            });
        } else {
            violations.extend(found);
        }
    }

    Ok(SimulationResult {
        partitions,
        violations,
        steps_applied: script.len(),
    })
}

fn apply(
    manager: &ChainManager,
    store: &mut InMemoryRecordStore,
    labels: &mut Labels,
    step: usize,
    op: &ScriptOp,
) -> Result<(), SimulationError> {
    tracing::debug!(step, ?op, "apply script step");

    let result = match op {
        ScriptOp::Create { label, partition } => {
            if labels.ids.contains_key(label) {
                return Err(SimulationError::DuplicateLabel {
                    step,
                    label: label.clone(),
                });
            }
            let attributes = serde_json::json!({ "label": label });
            let partition = PartitionKey::from(partition.as_str());
            store
                .atomically(|s| manager.create(s, partition, attributes))
                .map(|record| {
                    labels.ids.insert(label.clone(), record.id);
                })
        }
        ScriptOp::InsertFirst { label } => {
            let id = labels.resolve(step, label)?;
            store.atomically(|s| manager.insert_first(s, id))
        }
        ScriptOp::InsertLast { label } => {
            let id = labels.resolve(step, label)?;
            store.atomically(|s| manager.insert_last(s, id))
        }
        ScriptOp::InsertAfter { label, target } => {
            let id = labels.resolve(step, label)?;
            let target = labels.resolve(step, target)?;
            store.atomically(|s| manager.insert_after(s, id, target))
        }
        ScriptOp::Remove { label } => {
            let id = labels.resolve(step, label)?;
            store.atomically(|s| manager.remove(s, id))
        }
        ScriptOp::Destroy { label } => {
            let id = labels.resolve(step, label)?;
            store.atomically(|s| manager.destroy(s, id)).map(|()| {
                labels.ids.remove(label);
            })
        }
    };

    result.map_err(|source| chain_error(step, source))
}

fn chain_error(step: usize, source: ChainError) -> SimulationError {
    SimulationError::Chain { step, source }
}

fn label_all(records: &[Record], names: &HashMap<RecordId, &str>) -> Vec<String> {
    records
        .iter()
        .map(|r| match names.get(&r.id) {
            Some(label) => (*label).to_owned(),
            None => r.id.to_string(),
        })
        .collect()
}

/// Group a script's creates by partition, for reporting.
pub fn declared_partitions(script: &[ScriptOp]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for op in script {
        if let ScriptOp::Create { partition, .. } = op {
            *counts.entry(partition.clone()).or_insert(0) += 1;
        }
    }
    counts
}
