use crate::config::QuotaConfig;
use crate::events::EventLog;
use crate::graph::TaskClass;
use crate::quota::audit::*;
use crate::quota::tracker::*;
use chrono::{Duration, TimeZone, Utc};
use std::sync::Arc;
use uuid::Uuid;

fn book() -> QuotaBook {
    QuotaBook::new(QuotaConfig::default())
}

#[test]
fn period_start_buckets_by_hour() {
    let at = Utc.with_ymd_and_hms(2026, 8, 6, 14, 37, 12).unwrap();
    let start = period_start(at, 3600);
    assert_eq!(start, Utc.with_ymd_and_hms(2026, 8, 6, 14, 0, 0).unwrap());
}

#[test]
fn completion_is_recorded_per_period() {
    let book = book();
    let device = Uuid::new_v4();
    let now = Utc::now();

    book.record_completion(device, TaskClass::ValueRead, Uuid::new_v4(), true, 5000, 4, now);
    book.record_completion(device, TaskClass::ValueRead, Uuid::new_v4(), false, 2000, 4, now);

    let tracker = book.tracker(device, TaskClass::ValueRead, now).unwrap();
    assert_eq!(tracker.quota_required, 4);
    assert_eq!(tracker.quota_completed, 1);
    assert_eq!(tracker.quota_failed, 1);
    assert_eq!(tracker.total_duration_ms, 7000);
    assert_eq!(tracker.quota_pending(), 2);
}

#[test]
fn replayed_callback_does_not_double_count() {
    let book = book();
    let device = Uuid::new_v4();
    let execution = Uuid::new_v4();
    let now = Utc::now();

    book.record_completion(device, TaskClass::ValueRead, execution, true, 5000, 4, now);
    book.record_completion(device, TaskClass::ValueRead, execution, true, 5000, 4, now);

    let tracker = book.tracker(device, TaskClass::ValueRead, now).unwrap();
    assert_eq!(tracker.quota_completed, 1);
    assert_eq!(tracker.total_duration_ms, 5000);
}

#[test]
fn zero_required_reports_full_completion() {
    let book = book();
    let device = Uuid::new_v4();
    let now = Utc::now();

    book.record_completion(device, TaskClass::Discovery, Uuid::new_v4(), true, 100, 0, now);
    let tracker = book.tracker(device, TaskClass::Discovery, now).unwrap();
    assert_eq!(tracker.completion_percentage(), 100.0);
    assert!(!tracker.is_at_risk(now, 3600, 20.0));
}

#[test]
fn at_risk_when_progress_outruns_completion() {
    let book = book();
    let device = Uuid::new_v4();
    // Pin the clock at 80% of the period: 1 of 4 done = 25% vs 80% elapsed.
    let start = period_start(Utc::now(), 3600);
    let at = start + Duration::seconds(2880);

    book.record_completion(device, TaskClass::ValueRead, Uuid::new_v4(), true, 1000, 4, at);
    let tracker = book.tracker(device, TaskClass::ValueRead, at).unwrap();

    assert!(tracker.is_at_risk(at, 3600, 20.0));
    assert_eq!(tracker.status, QuotaStatus::AtRisk);
}

#[test]
fn interruption_counts_skipped_not_failed() {
    let book = book();
    let device = Uuid::new_v4();
    let now = Utc::now();

    book.record_interrupted(device, TaskClass::ValueRead, Uuid::new_v4(), 4, now);
    let tracker = book.tracker(device, TaskClass::ValueRead, now).unwrap();
    assert_eq!(tracker.quota_skipped, 1);
    assert_eq!(tracker.quota_failed, 0);
    assert_eq!(tracker.quota_completed, 0);
}

fn auditor(book: Arc<QuotaBook>) -> (QuotaAuditor, Arc<ViolationStore>, Arc<EventLog>) {
    let violations = Arc::new(ViolationStore::new());
    let events = Arc::new(EventLog::new(64));
    (
        QuotaAuditor::new(book, violations.clone(), events.clone()),
        violations,
        events,
    )
}

#[test]
fn audit_ignores_open_and_idle_periods() {
    let book = Arc::new(book());
    let device = Uuid::new_v4();
    let now = Utc::now();

    // Activity in the current (still open) period.
    book.record_completion(device, TaskClass::ValueRead, Uuid::new_v4(), true, 100, 4, now);

    let (auditor, violations, _) = auditor(book.clone());
    assert!(auditor.audit_closed_periods(now).is_empty());
    assert!(violations.is_empty());

    // Closed period with zero observed executions: finalized, no alarm.
    book.record_interrupted(
        device,
        TaskClass::Discovery,
        Uuid::new_v4(),
        4,
        now - Duration::seconds(7200),
    );
    let raised = auditor.audit_closed_periods(now);
    assert!(raised.is_empty());
}

#[test]
fn audit_raises_graded_violation_below_threshold() {
    let book = Arc::new(book());
    let device = Uuid::new_v4();
    let past = Utc::now() - Duration::seconds(7200);

    // 1 of 10 completed = 10% -> High severity.
    book.record_completion(device, TaskClass::ValueRead, Uuid::new_v4(), true, 900, 10, past);

    let (auditor, violations, events) = auditor(book.clone());
    let raised = auditor.audit_closed_periods(Utc::now());
    assert_eq!(raised.len(), 1);
    assert_eq!(raised[0].severity, ViolationSeverity::High);
    assert!(!raised[0].notified);
    assert_eq!(violations.unnotified().len(), 1);
    assert_eq!(events.len(), 1);

    let tracker = book.tracker(device, TaskClass::ValueRead, past).unwrap();
    assert_eq!(tracker.status, QuotaStatus::QuotaNotMet);
    assert!(tracker.finalized);

    // A second audit pass must not re-raise.
    assert!(auditor.audit_closed_periods(Utc::now()).is_empty());
}

#[test]
fn audit_marks_partial_without_violation() {
    let book = Arc::new(book());
    let device = Uuid::new_v4();
    let past = Utc::now() - Duration::seconds(7200);

    // 3 of 4 completed = 75%: above the 50% threshold, below 100%.
    for _ in 0..3 {
        book.record_completion(device, TaskClass::ValueRead, Uuid::new_v4(), true, 500, 4, past);
    }

    let (auditor, violations, _) = auditor(book.clone());
    assert!(auditor.audit_closed_periods(Utc::now()).is_empty());
    assert!(violations.is_empty());

    let tracker = book.tracker(device, TaskClass::ValueRead, past).unwrap();
    assert_eq!(tracker.status, QuotaStatus::Partial);
}

#[test]
fn straggler_after_audit_marks_adjusted() {
    let book = Arc::new(book());
    let device = Uuid::new_v4();
    let past = Utc::now() - Duration::seconds(7200);

    book.record_completion(device, TaskClass::ValueRead, Uuid::new_v4(), true, 500, 4, past);
    let (auditor, _, _) = auditor(book.clone());
    auditor.audit_closed_periods(Utc::now());

    // A late callback for the closed period flips the tracker to Adjusted.
    book.record_completion(device, TaskClass::ValueRead, Uuid::new_v4(), true, 500, 4, past);
    let tracker = book.tracker(device, TaskClass::ValueRead, past).unwrap();
    assert_eq!(tracker.status, QuotaStatus::Adjusted);
}

#[test]
fn purge_drops_old_periods() {
    let book = book();
    let device = Uuid::new_v4();
    let old = Utc::now() - Duration::days(30);
    let fresh = Utc::now();

    book.record_completion(device, TaskClass::ValueRead, Uuid::new_v4(), true, 100, 4, old);
    book.record_completion(device, TaskClass::ValueRead, Uuid::new_v4(), true, 100, 4, fresh);

    let purged = book.purge_periods_before(Utc::now() - Duration::days(14));
    assert_eq!(purged, 1);
    assert_eq!(book.len(), 1);
}
