use crate::graph::NodeId;
use crate::ledger::types::*;
use crate::registry::DeviceId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Execution {0} not found")]
    NotFound(ExecutionId),
    #[error("Invalid transition from {from:?} to {to:?} for execution {id}")]
    InvalidTransition {
        id: ExecutionId,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },
}

/// Append-mostly record of every attempted operation.
///
/// Executions are mutated only through the transition methods below and
/// are never deleted individually; `purge_terminal_older_than` is the only
/// removal path.
#[derive(Default)]
pub struct ExecutionLedger {
    executions: DashMap<ExecutionId, Execution>,
}

impl ExecutionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a Pending execution for a node.
    pub fn create(&self, node_id: NodeId, device_id: DeviceId) -> Execution {
        let execution = Execution::new(node_id, device_id);
        debug!(
            "Created execution {} for node {} on device {}",
            execution.id, node_id, device_id
        );
        self.executions.insert(execution.id, execution.clone());
        execution
    }

    pub fn get(&self, id: ExecutionId) -> Option<Execution> {
        self.executions.get(&id).map(|e| e.clone())
    }

    /// Pending -> Running; stamps started_at and the owning worker.
    pub fn mark_running(&self, id: ExecutionId, worker_id: &str) -> Result<Execution, LedgerError> {
        self.transition(id, ExecutionStatus::Running, |execution| {
            execution.started_at = Some(Utc::now());
            execution.worker_id = Some(worker_id.to_string());
        })
    }

    /// Running -> Success; stamps finished_at/duration and the result.
    pub fn mark_success(
        &self,
        id: ExecutionId,
        result_summary: serde_json::Value,
    ) -> Result<Execution, LedgerError> {
        self.transition(id, ExecutionStatus::Success, |execution| {
            let finished = Utc::now();
            execution.finished_at = Some(finished);
            execution.duration_ms = execution
                .started_at
                .map(|started| (finished - started).num_milliseconds().max(0) as u64);
            execution.result_summary = Some(result_summary);
        })
    }

    /// Pending|Running -> Failed; records the device error verbatim.
    pub fn mark_failed(&self, id: ExecutionId, error: &str) -> Result<Execution, LedgerError> {
        self.transition(id, ExecutionStatus::Failed, |execution| {
            let finished = Utc::now();
            execution.finished_at = Some(finished);
            execution.duration_ms = execution
                .started_at
                .map(|started| (finished - started).num_milliseconds().max(0) as u64);
            execution.error_message = Some(error.to_string());
        })
    }

    /// Pending|Running -> Interrupted. Interruption is terminal but does
    /// not run the completion path, so it never counts toward quota.
    pub fn interrupt(&self, id: ExecutionId, reason: &str) -> Result<Execution, LedgerError> {
        self.transition(id, ExecutionStatus::Interrupted, |execution| {
            execution.finished_at = Some(Utc::now());
            execution.error_message = Some(reason.to_string());
        })
    }

    /// Force every Pending/Running execution to Interrupted in one pass.
    /// Used on mode transitions and device disablement.
    pub fn interrupt_all_active(&self, reason: &str) -> Vec<Execution> {
        let active: Vec<ExecutionId> = self
            .executions
            .iter()
            .filter(|entry| entry.value().status.is_active())
            .map(|entry| *entry.key())
            .collect();

        let mut interrupted = Vec::new();
        for id in active {
            match self.interrupt(id, reason) {
                Ok(execution) => interrupted.push(execution),
                // A worker may have finished in the meantime; terminal
                // states win.
                Err(LedgerError::InvalidTransition { .. }) => {}
                Err(err) => warn!("Failed to interrupt execution {}: {}", id, err),
            }
        }

        if !interrupted.is_empty() {
            info!("Interrupted {} active executions: {}", interrupted.len(), reason);
        }
        interrupted
    }

    /// Interrupt the active executions of a single device, e.g. when it
    /// is disabled mid-flight.
    pub fn interrupt_for_device(&self, device_id: DeviceId, reason: &str) -> Vec<Execution> {
        let active: Vec<ExecutionId> = self
            .executions
            .iter()
            .filter(|entry| {
                entry.value().device_id == device_id && entry.value().status.is_active()
            })
            .map(|entry| *entry.key())
            .collect();

        let mut interrupted = Vec::new();
        for id in active {
            if let Ok(execution) = self.interrupt(id, reason) {
                interrupted.push(execution);
            }
        }
        interrupted
    }

    fn transition(
        &self,
        id: ExecutionId,
        to: ExecutionStatus,
        apply: impl FnOnce(&mut Execution),
    ) -> Result<Execution, LedgerError> {
        let mut entry = self
            .executions
            .get_mut(&id)
            .ok_or(LedgerError::NotFound(id))?;

        let from = entry.status;
        let allowed = match to {
            ExecutionStatus::Running => from == ExecutionStatus::Pending,
            ExecutionStatus::Success => from == ExecutionStatus::Running,
            ExecutionStatus::Failed | ExecutionStatus::Interrupted => from.is_active(),
            ExecutionStatus::Pending => false,
        };
        if !allowed {
            return Err(LedgerError::InvalidTransition { id, from, to });
        }

        entry.status = to;
        apply(&mut entry);
        Ok(entry.clone())
    }

    pub fn count_by_status(&self, status: ExecutionStatus) -> usize {
        self.executions
            .iter()
            .filter(|entry| entry.value().status == status)
            .count()
    }

    pub fn count_for_device(&self, device_id: DeviceId, status: ExecutionStatus) -> usize {
        self.executions
            .iter()
            .filter(|entry| {
                entry.value().device_id == device_id && entry.value().status == status
            })
            .count()
    }

    /// Pending executions created before the cutoff, for reconciliation.
    pub fn pending_created_before(&self, cutoff: DateTime<Utc>) -> Vec<Execution> {
        self.executions
            .iter()
            .filter(|entry| {
                entry.value().status == ExecutionStatus::Pending
                    && entry.value().created_at < cutoff
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn executions_for_node(&self, node_id: NodeId) -> Vec<Execution> {
        self.executions
            .iter()
            .filter(|entry| entry.value().node_id == node_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }

    /// Bulk retention cleanup. Removes terminal executions finished before
    /// the cutoff and returns how many were dropped.
    pub fn purge_terminal_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.executions.len();
        self.executions.retain(|_, execution| {
            !(execution.status.is_terminal()
                && execution.finished_at.map(|t| t < cutoff).unwrap_or(false))
        });
        let purged = before - self.executions.len();
        if purged > 0 {
            info!("Purged {} terminal executions older than {}", purged, cutoff);
        }
        purged
    }
}
