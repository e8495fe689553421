//! Execution records and their state machine.

pub mod ledger;
pub mod reconcile;
pub mod types;

#[cfg(test)]
mod tests;

pub use ledger::{ExecutionLedger, LedgerError};
pub use reconcile::{QueueProbe, ReconciliationJob};
pub use types::{Execution, ExecutionId, ExecutionStatus};
