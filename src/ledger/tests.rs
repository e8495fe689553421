use crate::events::EventLog;
use crate::ledger::ledger::{ExecutionLedger, LedgerError};
use crate::ledger::reconcile::{QueueProbe, ReconciliationJob};
use crate::ledger::types::*;
use chrono::{Duration, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[test]
fn happy_path_transitions() {
    let ledger = ExecutionLedger::new();
    let execution = ledger.create(Uuid::new_v4(), Uuid::new_v4());
    assert_eq!(execution.status, ExecutionStatus::Pending);

    let running = ledger.mark_running(execution.id, "worker-1").unwrap();
    assert_eq!(running.status, ExecutionStatus::Running);
    assert!(running.started_at.is_some());
    assert_eq!(running.worker_id.as_deref(), Some("worker-1"));

    let done = ledger
        .mark_success(execution.id, serde_json::json!({"rows": 42}))
        .unwrap();
    assert_eq!(done.status, ExecutionStatus::Success);
    assert!(done.finished_at.is_some());
    assert!(done.duration_ms.is_some());
}

#[test]
fn terminal_states_are_sticky() {
    let ledger = ExecutionLedger::new();
    let execution = ledger.create(Uuid::new_v4(), Uuid::new_v4());
    ledger.mark_running(execution.id, "worker-1").unwrap();
    ledger.mark_failed(execution.id, "timeout").unwrap();

    assert!(matches!(
        ledger.mark_running(execution.id, "worker-2"),
        Err(LedgerError::InvalidTransition { .. })
    ));
    assert!(matches!(
        ledger.mark_success(execution.id, serde_json::Value::Null),
        Err(LedgerError::InvalidTransition { .. })
    ));
    assert!(matches!(
        ledger.interrupt(execution.id, "mode change"),
        Err(LedgerError::InvalidTransition { .. })
    ));
}

#[test]
fn success_requires_running() {
    let ledger = ExecutionLedger::new();
    let execution = ledger.create(Uuid::new_v4(), Uuid::new_v4());

    // Pending straight to Success is not a legal transition.
    assert!(matches!(
        ledger.mark_success(execution.id, serde_json::Value::Null),
        Err(LedgerError::InvalidTransition { .. })
    ));
}

#[test]
fn interrupt_records_reason_without_duration() {
    let ledger = ExecutionLedger::new();
    let execution = ledger.create(Uuid::new_v4(), Uuid::new_v4());

    let interrupted = ledger.interrupt(execution.id, "device disabled").unwrap();
    assert_eq!(interrupted.status, ExecutionStatus::Interrupted);
    assert_eq!(interrupted.error_message.as_deref(), Some("device disabled"));
    assert!(interrupted.finished_at.is_some());
    assert!(interrupted.duration_ms.is_none());
}

#[test]
fn interrupt_all_active_spares_terminal_rows() {
    let ledger = ExecutionLedger::new();
    let pending = ledger.create(Uuid::new_v4(), Uuid::new_v4());
    let running = ledger.create(Uuid::new_v4(), Uuid::new_v4());
    ledger.mark_running(running.id, "worker-1").unwrap();
    let finished = ledger.create(Uuid::new_v4(), Uuid::new_v4());
    ledger.mark_running(finished.id, "worker-2").unwrap();
    ledger
        .mark_success(finished.id, serde_json::Value::Null)
        .unwrap();

    let interrupted = ledger.interrupt_all_active("switching to live mode");
    assert_eq!(interrupted.len(), 2);

    assert_eq!(
        ledger.get(pending.id).unwrap().status,
        ExecutionStatus::Interrupted
    );
    assert_eq!(
        ledger.get(running.id).unwrap().status,
        ExecutionStatus::Interrupted
    );
    assert_eq!(
        ledger.get(finished.id).unwrap().status,
        ExecutionStatus::Success
    );
}

#[test]
fn purge_removes_only_old_terminal_rows() {
    let ledger = ExecutionLedger::new();
    let old = ledger.create(Uuid::new_v4(), Uuid::new_v4());
    ledger.mark_running(old.id, "w").unwrap();
    ledger.mark_failed(old.id, "boom").unwrap();
    let live = ledger.create(Uuid::new_v4(), Uuid::new_v4());

    // Cutoff in the future: the failed row qualifies, the pending row never does.
    let purged = ledger.purge_terminal_older_than(Utc::now() + Duration::seconds(60));
    assert_eq!(purged, 1);
    assert!(ledger.get(old.id).is_none());
    assert!(ledger.get(live.id).is_some());
}

struct FixedProbe {
    in_flight: Mutex<HashSet<ExecutionId>>,
}

impl QueueProbe for FixedProbe {
    fn is_in_flight(&self, execution_id: ExecutionId) -> bool {
        self.in_flight.lock().unwrap().contains(&execution_id)
    }
}

#[test]
fn reconciliation_fails_vanished_pending_rows() {
    let ledger = Arc::new(ExecutionLedger::new());
    let events = Arc::new(EventLog::new(16));

    let vanished = ledger.create(Uuid::new_v4(), Uuid::new_v4());
    let still_queued = ledger.create(Uuid::new_v4(), Uuid::new_v4());

    let probe = Arc::new(FixedProbe {
        in_flight: Mutex::new(HashSet::from([still_queued.id])),
    });
    // Zero grace so freshly created rows are already eligible.
    let job = ReconciliationJob::new(
        ledger.clone(),
        probe,
        events.clone(),
        Duration::seconds(-1),
    );

    let reconciled = job.run_once();
    assert_eq!(reconciled.len(), 1);
    assert_eq!(reconciled[0].id, vanished.id);
    assert_eq!(
        ledger.get(vanished.id).unwrap().status,
        ExecutionStatus::Failed
    );
    assert_eq!(
        ledger.get(still_queued.id).unwrap().status,
        ExecutionStatus::Pending
    );
    assert_eq!(events.len(), 1);
}

#[test]
fn reconciliation_respects_grace_period() {
    let ledger = Arc::new(ExecutionLedger::new());
    let events = Arc::new(EventLog::new(16));
    ledger.create(Uuid::new_v4(), Uuid::new_v4());

    let probe = Arc::new(FixedProbe {
        in_flight: Mutex::new(HashSet::new()),
    });
    let job = ReconciliationJob::new(ledger.clone(), probe, events, Duration::seconds(300));

    // The execution is seconds old; a 300s grace leaves it untouched.
    assert!(job.run_once().is_empty());
    assert_eq!(ledger.count_by_status(ExecutionStatus::Pending), 1);
}
