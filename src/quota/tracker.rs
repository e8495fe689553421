use crate::config::QuotaConfig;
use crate::graph::TaskClass;
use crate::ledger::ExecutionId;
use crate::registry::DeviceId;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// Start of the fixed-size period containing `at`.
pub fn period_start(at: DateTime<Utc>, period_secs: i64) -> DateTime<Utc> {
    let ts = at.timestamp();
    let start = ts - ts.rem_euclid(period_secs);
    Utc.timestamp_opt(start, 0).single().unwrap_or(at)
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuotaStatus {
    InProgress,
    Completed,
    Partial,
    QuotaNotMet,
    Interrupted,
    Adjusted,
    AtRisk,
}

/// Expected-vs-completed bookkeeping for one `(device, task class,
/// period)` window.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct QuotaTracker {
    pub device_id: DeviceId,
    pub task_class: TaskClass,
    pub period_start: DateTime<Utc>,
    pub quota_required: u32,
    pub quota_completed: u32,
    pub quota_failed: u32,
    pub quota_skipped: u32,
    pub total_duration_ms: u64,
    pub status: QuotaStatus,
    /// Set once the end-of-period audit has judged this tracker.
    pub finalized: bool,
    /// Executions already counted, so replayed callbacks cannot
    /// double-increment.
    #[serde(skip)]
    recorded: HashSet<ExecutionId>,
}

impl QuotaTracker {
    fn new(
        device_id: DeviceId,
        task_class: TaskClass,
        period_start: DateTime<Utc>,
        quota_required: u32,
    ) -> Self {
        Self {
            device_id,
            task_class,
            period_start,
            quota_required,
            quota_completed: 0,
            quota_failed: 0,
            quota_skipped: 0,
            total_duration_ms: 0,
            status: QuotaStatus::InProgress,
            finalized: false,
            recorded: HashSet::new(),
        }
    }

    pub fn quota_pending(&self) -> u32 {
        self.quota_required
            .saturating_sub(self.quota_completed + self.quota_failed + self.quota_skipped)
    }

    /// Completion percentage; a tracker with nothing required reports 100
    /// so idle devices are never flagged.
    pub fn completion_percentage(&self) -> f64 {
        if self.quota_required == 0 {
            return 100.0;
        }
        self.quota_completed as f64 / self.quota_required as f64 * 100.0
    }

    /// Leading at-risk indicator, independent of the end-of-period audit:
    /// flags when period progress has outrun completion progress by more
    /// than the margin.
    pub fn is_at_risk(&self, now: DateTime<Utc>, period_secs: i64, margin_pct: f64) -> bool {
        if self.quota_required == 0 {
            return false;
        }
        let elapsed = (now - self.period_start).num_seconds().max(0) as f64;
        let elapsed_pct = (elapsed / period_secs as f64 * 100.0).min(100.0);
        elapsed_pct - self.completion_percentage() > margin_pct
    }

    pub fn observed_any(&self) -> bool {
        self.quota_completed + self.quota_failed > 0
    }
}

/// All live quota trackers, keyed by `(device, task class, period)`.
///
/// Trackers are created lazily on the first observed completion within a
/// period and mutated only through the record methods below, each of which
/// runs under the per-key map entry lock.
pub struct QuotaBook {
    trackers: DashMap<(DeviceId, TaskClass, i64), QuotaTracker>,
    config: QuotaConfig,
}

impl QuotaBook {
    pub fn new(config: QuotaConfig) -> Self {
        Self {
            trackers: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    /// Count a finished execution. `expected` sizes the tracker when the
    /// period's tracker does not exist yet. Idempotent per execution id.
    pub fn record_completion(
        &self,
        device_id: DeviceId,
        task_class: TaskClass,
        execution_id: ExecutionId,
        success: bool,
        duration_ms: u64,
        expected: u32,
        at: DateTime<Utc>,
    ) {
        let start = period_start(at, self.config.period_secs);
        let key = (device_id, task_class, start.timestamp());

        let mut tracker = self
            .trackers
            .entry(key)
            .or_insert_with(|| QuotaTracker::new(device_id, task_class, start, expected));

        if !tracker.recorded.insert(execution_id) {
            debug!(
                "Ignoring replayed completion callback for execution {}",
                execution_id
            );
            return;
        }

        if success {
            tracker.quota_completed += 1;
        } else {
            tracker.quota_failed += 1;
        }
        tracker.total_duration_ms += duration_ms;

        if tracker.finalized {
            // A straggler landed after the audit closed the period.
            tracker.status = QuotaStatus::Adjusted;
        } else if tracker.completion_percentage() >= 100.0 {
            tracker.status = QuotaStatus::Completed;
        } else if tracker.is_at_risk(at, self.config.period_secs, self.config.at_risk_margin_pct) {
            tracker.status = QuotaStatus::AtRisk;
        } else {
            tracker.status = QuotaStatus::InProgress;
        }
    }

    /// Count an interrupted execution as skipped. Interruptions never feed
    /// completed/failed counters. Idempotent per execution id.
    pub fn record_interrupted(
        &self,
        device_id: DeviceId,
        task_class: TaskClass,
        execution_id: ExecutionId,
        expected: u32,
        at: DateTime<Utc>,
    ) {
        let start = period_start(at, self.config.period_secs);
        let key = (device_id, task_class, start.timestamp());

        let mut tracker = self
            .trackers
            .entry(key)
            .or_insert_with(|| QuotaTracker::new(device_id, task_class, start, expected));

        if !tracker.recorded.insert(execution_id) {
            return;
        }
        tracker.quota_skipped += 1;
        if !tracker.finalized {
            tracker.status = QuotaStatus::Interrupted;
        }
    }

    pub fn tracker(
        &self,
        device_id: DeviceId,
        task_class: TaskClass,
        period: DateTime<Utc>,
    ) -> Option<QuotaTracker> {
        let start = period_start(period, self.config.period_secs);
        self.trackers
            .get(&(device_id, task_class, start.timestamp()))
            .map(|t| t.clone())
    }

    pub fn trackers_for_device(&self, device_id: DeviceId) -> Vec<QuotaTracker> {
        self.trackers
            .iter()
            .filter(|entry| entry.value().device_id == device_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Trackers whose period closed before `now` and that the audit has
    /// not judged yet.
    pub fn unfinalized_closed(&self, now: DateTime<Utc>) -> Vec<QuotaTracker> {
        let period = chrono::Duration::seconds(self.config.period_secs);
        self.trackers
            .iter()
            .filter(|entry| {
                let tracker = entry.value();
                !tracker.finalized && tracker.period_start + period <= now
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Apply the audit verdict. Runs under the row's entry lock.
    pub(crate) fn finalize(
        &self,
        device_id: DeviceId,
        task_class: TaskClass,
        period: DateTime<Utc>,
        status: QuotaStatus,
    ) {
        let key = (device_id, task_class, period.timestamp());
        if let Some(mut tracker) = self.trackers.get_mut(&key) {
            tracker.status = status;
            tracker.finalized = true;
        }
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    /// Bulk retention cleanup of long-closed periods.
    pub fn purge_periods_before(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.trackers.len();
        self.trackers
            .retain(|_, tracker| tracker.period_start >= cutoff);
        before - self.trackers.len()
    }
}
