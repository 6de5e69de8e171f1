// Linkorder Kernel
//
// Order maintenance for persisted records kept as an embedded singly
// linked list per partition.

pub mod chain;
pub mod invariants;
pub mod record;
pub mod shared;
pub mod simulate;
pub mod traverse;
