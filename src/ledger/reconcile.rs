use crate::events::{EventLevel, EventLog, EventType};
use crate::ledger::ledger::ExecutionLedger;
use crate::ledger::types::{Execution, ExecutionId};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::warn;

/// Answers whether a dispatched execution is still in flight somewhere in
/// the queue/worker infrastructure.
pub trait QueueProbe: Send + Sync {
    fn is_in_flight(&self, execution_id: ExecutionId) -> bool;
}

/// Detects executions whose queued task crashed or vanished without ever
/// transitioning the record, and force-fails them so stuck Pending rows
/// cannot accumulate.
pub struct ReconciliationJob {
    ledger: Arc<ExecutionLedger>,
    probe: Arc<dyn QueueProbe>,
    events: Arc<EventLog>,
    grace: Duration,
}

impl ReconciliationJob {
    pub fn new(
        ledger: Arc<ExecutionLedger>,
        probe: Arc<dyn QueueProbe>,
        events: Arc<EventLog>,
        grace: Duration,
    ) -> Self {
        Self {
            ledger,
            probe,
            events,
            grace,
        }
    }

    /// One reconciliation pass. Returns the executions that were
    /// force-failed.
    pub fn run_once(&self) -> Vec<Execution> {
        let cutoff = Utc::now() - self.grace;
        let stale = self.ledger.pending_created_before(cutoff);
        let mut reconciled = Vec::new();

        for execution in stale {
            if self.probe.is_in_flight(execution.id) {
                // Still queued behind a busy worker pool; leave it alone.
                continue;
            }

            let message = format!(
                "Queued task for execution {} terminated out-of-band after {}s",
                execution.id,
                execution.age_secs(Utc::now())
            );
            match self.ledger.mark_failed(execution.id, &message) {
                Ok(failed) => {
                    warn!("Reconciled stuck execution {}", failed.id);
                    self.events.record(
                        EventType::ExecutionReconciled,
                        EventLevel::Warning,
                        Some(failed.device_id),
                        message,
                        serde_json::json!({
                            "execution_id": failed.id,
                            "node_id": failed.node_id,
                        }),
                    );
                    reconciled.push(failed);
                }
                // Finished between the scan and the transition; nothing to do.
                Err(_) => continue,
            }
        }

        reconciled
    }
}
