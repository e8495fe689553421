use crate::events::{EventLevel, EventLog, EventType};
use crate::graph::TaskClass;
use crate::quota::tracker::{QuotaBook, QuotaStatus, QuotaTracker};
use crate::registry::DeviceId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ViolationSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Immutable snapshot produced when a closed period fell below the
/// completion threshold.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct QuotaViolation {
    pub id: Uuid,
    pub device_id: DeviceId,
    pub task_class: TaskClass,
    pub period_start: DateTime<Utc>,
    pub severity: ViolationSeverity,
    pub report: serde_json::Value,
    pub notified: bool,
    pub created_at: DateTime<Utc>,
}

/// Violations raised by the audit, pending notification.
#[derive(Default)]
pub struct ViolationStore {
    violations: DashMap<Uuid, QuotaViolation>,
}

impl ViolationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, violation: QuotaViolation) {
        self.violations.insert(violation.id, violation);
    }

    pub fn get(&self, id: Uuid) -> Option<QuotaViolation> {
        self.violations.get(&id).map(|v| v.clone())
    }

    pub fn unnotified(&self) -> Vec<QuotaViolation> {
        self.violations
            .iter()
            .filter(|entry| !entry.value().notified)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn mark_notified(&self, id: Uuid) {
        if let Some(mut violation) = self.violations.get_mut(&id) {
            violation.notified = true;
        }
    }

    pub fn for_device(&self, device_id: DeviceId) -> Vec<QuotaViolation> {
        self.violations
            .iter()
            .filter(|entry| entry.value().device_id == device_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.violations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }
}

/// End-of-period audit. Judges every closed, unjudged tracker that
/// observed at least one completed or failed execution; task classes
/// enabled mid-period with no activity are left alone to avoid false
/// alarms.
pub struct QuotaAuditor {
    book: Arc<QuotaBook>,
    violations: Arc<ViolationStore>,
    events: Arc<EventLog>,
}

impl QuotaAuditor {
    pub fn new(
        book: Arc<QuotaBook>,
        violations: Arc<ViolationStore>,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            book,
            violations,
            events,
        }
    }

    /// Audit every closed period. Returns the violations raised.
    pub fn audit_closed_periods(&self, now: DateTime<Utc>) -> Vec<QuotaViolation> {
        let threshold = self.book.config().completion_threshold_pct;
        let mut raised = Vec::new();

        for tracker in self.book.unfinalized_closed(now) {
            if !tracker.observed_any() {
                // Nothing ran all period; finalize quietly.
                self.book.finalize(
                    tracker.device_id,
                    tracker.task_class,
                    tracker.period_start,
                    tracker.status,
                );
                continue;
            }

            let pct = tracker.completion_percentage();
            let verdict = if pct >= 100.0 {
                QuotaStatus::Completed
            } else if pct >= threshold {
                QuotaStatus::Partial
            } else {
                QuotaStatus::QuotaNotMet
            };

            if verdict == QuotaStatus::QuotaNotMet {
                let violation = self.build_violation(&tracker, pct);
                warn!(
                    "Quota violation for device {} class {} period {}: {:.1}% of {} required",
                    tracker.device_id,
                    tracker.task_class.as_str(),
                    tracker.period_start,
                    pct,
                    tracker.quota_required
                );
                self.events.record(
                    EventType::QuotaViolation,
                    EventLevel::Warning,
                    Some(tracker.device_id),
                    format!(
                        "Quota not met for {}: {:.1}% completed",
                        tracker.task_class.as_str(),
                        pct
                    ),
                    violation.report.clone(),
                );
                self.violations.insert(violation.clone());
                raised.push(violation);
            } else {
                info!(
                    "Quota audit for device {} class {}: {:?} at {:.1}%",
                    tracker.device_id,
                    tracker.task_class.as_str(),
                    verdict,
                    pct
                );
            }

            self.book.finalize(
                tracker.device_id,
                tracker.task_class,
                tracker.period_start,
                verdict,
            );
        }

        raised
    }

    fn build_violation(&self, tracker: &QuotaTracker, pct: f64) -> QuotaViolation {
        QuotaViolation {
            id: Uuid::new_v4(),
            device_id: tracker.device_id,
            task_class: tracker.task_class,
            period_start: tracker.period_start,
            severity: severity_for(pct),
            report: serde_json::json!({
                "device_id": tracker.device_id,
                "task_class": tracker.task_class.as_str(),
                "period_start": tracker.period_start,
                "quota_required": tracker.quota_required,
                "quota_completed": tracker.quota_completed,
                "quota_failed": tracker.quota_failed,
                "quota_skipped": tracker.quota_skipped,
                "completion_percentage": pct,
                "total_duration_ms": tracker.total_duration_ms,
            }),
            notified: false,
            created_at: Utc::now(),
        }
    }
}

/// Severity scales with how far below threshold the tracker fell.
fn severity_for(completion_pct: f64) -> ViolationSeverity {
    if completion_pct >= 40.0 {
        ViolationSeverity::Low
    } else if completion_pct >= 25.0 {
        ViolationSeverity::Medium
    } else if completion_pct >= 10.0 {
        ViolationSeverity::High
    } else {
        ViolationSeverity::Critical
    }
}
