use crate::coordinator::mode::ModeState;
use crate::coordinator::scheduler::DynamicScheduler;
use crate::events::{EventLevel, EventLog, EventType};
use crate::graph::{GraphStore, PollGraph};
use crate::ledger::ExecutionLedger;
use crate::quota::QuotaBook;
use crate::registry::{DeviceId, DeviceRegistry};
use chrono::{DateTime, Timelike, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::{debug, info};

/// Per-device state persisted between ticks for drift and change
/// detection.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StateSnapshot {
    pub device_id: DeviceId,
    pub fingerprint: String,
    pub captured_at: DateTime<Utc>,
}

/// The outer control loop.
///
/// Each tick: correct scheduling drift, detect structural changes in the
/// task set, and invoke the scheduler, independently per enabled device.
/// Mode transitions interrupt all active work and reschedule master nodes
/// in one pass before the next scheduling pass.
pub struct ExecutionCoordinator {
    registry: Arc<dyn DeviceRegistry>,
    graphs: Arc<GraphStore>,
    scheduler: DynamicScheduler,
    ledger: Arc<ExecutionLedger>,
    quotas: Arc<QuotaBook>,
    events: Arc<EventLog>,
    snapshots: DashMap<DeviceId, StateSnapshot>,
    mode_rx: watch::Receiver<ModeState>,
    applied_mode_version: AtomicU64,
    reschedule_min_interval_secs: u32,
}

impl ExecutionCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        graphs: Arc<GraphStore>,
        scheduler: DynamicScheduler,
        ledger: Arc<ExecutionLedger>,
        quotas: Arc<QuotaBook>,
        events: Arc<EventLog>,
        mode_rx: watch::Receiver<ModeState>,
        reschedule_min_interval_secs: u32,
    ) -> Self {
        let applied_mode_version = AtomicU64::new(mode_rx.borrow().version);
        Self {
            registry,
            graphs,
            scheduler,
            ledger,
            quotas,
            events,
            snapshots: DashMap::new(),
            mode_rx,
            applied_mode_version,
            reschedule_min_interval_secs,
        }
    }

    /// One coordinator pass over every enabled device.
    pub async fn tick(&self, now: DateTime<Utc>) -> usize {
        self.handle_mode_if_changed();

        let devices = self.registry.get_enabled_devices().await;
        let mut dispatched = 0;

        for device in devices {
            self.graphs.ensure(device.id);
            let previous = self
                .snapshots
                .get(&device.id)
                .map(|snapshot| snapshot.fingerprint.clone());

            let result = self.graphs.with_graph_mut(device.id, |graph| {
                let corrected = correct_drift(graph, now);
                if corrected > 0 {
                    self.events.record(
                        EventType::DriftCorrected,
                        EventLevel::Debug,
                        Some(device.id),
                        format!("Snapped {corrected} nodes back to their second-offset"),
                        serde_json::json!({"corrected": corrected}),
                    );
                }

                let fingerprint = graph.fingerprint();
                (fingerprint, self.scheduler.process_ready_nodes(graph, now))
            });

            let Some((fingerprint, count)) = result else {
                continue;
            };
            dispatched += count;

            match previous {
                Some(previous) if previous != fingerprint => {
                    info!("Task set changed for device {}", device.id);
                    self.events.record(
                        EventType::StructuralChange,
                        EventLevel::Info,
                        Some(device.id),
                        "Enabled node set changed since last tick",
                        serde_json::json!({
                            "previous": previous,
                            "current": fingerprint,
                        }),
                    );
                }
                _ => {}
            }

            self.snapshots.insert(
                device.id,
                StateSnapshot {
                    device_id: device.id,
                    fingerprint,
                    captured_at: now,
                },
            );
        }

        dispatched
    }

    /// React to a mode flip exactly once per version, regardless of which
    /// caller notices it first.
    pub fn handle_mode_if_changed(&self) {
        let state = *self.mode_rx.borrow();
        let applied = self.applied_mode_version.load(Ordering::Acquire);
        if state.version <= applied {
            return;
        }
        if self
            .applied_mode_version
            .compare_exchange(applied, state.version, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.apply_mode_change(&state);
    }

    /// Mass interruption plus rescheduling, applied as one operation.
    fn apply_mode_change(&self, state: &ModeState) {
        let reason = format!("Execution mode changed to {}", state.mode.as_str());
        let interrupted = self.ledger.interrupt_all_active(&reason);

        // Interrupted runs count as skipped, never as failures.
        for execution in &interrupted {
            let class_and_expected = self.graphs.with_graph(execution.device_id, |graph| {
                graph.node(execution.node_id).ok().map(|node| {
                    (
                        node.task_class,
                        graph.expected_per_period(
                            node.task_class,
                            self.quotas.config().period_secs,
                        ),
                    )
                })
            });
            if let Some(Some((task_class, expected))) = class_and_expected {
                self.quotas.record_interrupted(
                    execution.device_id,
                    task_class,
                    execution.id,
                    expected,
                    state.changed_at,
                );
            }
            self.events.record(
                EventType::ExecutionInterrupted,
                EventLevel::Warning,
                Some(execution.device_id),
                reason.clone(),
                serde_json::json!({"execution_id": execution.id}),
            );
        }

        // Master nodes at or above the threshold restart their clock from
        // the flip: nothing fires immediately, nothing inherits stale
        // timing.
        let min_interval = self.reschedule_min_interval_secs;
        let mut rescheduled = 0;
        for device_id in self.graphs.device_ids() {
            self.graphs.with_graph_mut(device_id, |graph| {
                for node in graph.nodes_mut() {
                    if !node.is_chain_node && node.interval_seconds >= min_interval {
                        node.next_run_at = state.changed_at + node.interval();
                        node.last_run_at = None;
                        rescheduled += 1;
                    }
                }
            });
        }

        info!(
            "Mode change applied: {} executions interrupted, {} nodes rescheduled",
            interrupted.len(),
            rescheduled
        );
        self.events.record(
            EventType::ModeChanged,
            EventLevel::Warning,
            None,
            reason,
            serde_json::json!({
                "mode": state.mode.as_str(),
                "version": state.version,
                "interrupted": interrupted.len(),
                "rescheduled": rescheduled,
            }),
        );
    }

    pub fn snapshot(&self, device_id: DeviceId) -> Option<StateSnapshot> {
        self.snapshots.get(&device_id).map(|s| s.clone())
    }

    /// Drive ticks until shutdown. Reacts to mode flips as they happen
    /// instead of waiting for the next tick boundary.
    pub async fn run(
        self: Arc<Self>,
        tick_period: std::time::Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(tick_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut mode_rx = self.mode_rx.clone();

        info!("Coordinator loop started ({}s tick)", tick_period.as_secs());
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(Utc::now()).await;
                }
                changed = mode_rx.changed() => {
                    if changed.is_ok() {
                        self.handle_mode_if_changed();
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("Coordinator loop stopping");
                    break;
                }
            }
        }
    }
}

/// Snap nodes whose class expects a fixed second-offset back onto it,
/// without changing the minute, so discovery and read traffic keep their
/// lanes within each minute.
pub fn correct_drift(graph: &mut PollGraph, _now: DateTime<Utc>) -> usize {
    let mut corrected = 0;

    for node in graph.nodes_mut() {
        if !node.enabled || node.is_chain_node {
            continue;
        }
        let Some(offset) = node.task_class.expected_second_offset() else {
            continue;
        };
        if node.next_run_at.second() == offset && node.next_run_at.nanosecond() == 0 {
            continue;
        }
        if let Some(snapped) = node
            .next_run_at
            .with_second(offset)
            .and_then(|t| t.with_nanosecond(0))
        {
            debug!(
                "Correcting drift on node {}: {} -> {}",
                node.key, node.next_run_at, snapped
            );
            node.next_run_at = snapped;
            corrected += 1;
        }
    }

    corrected
}
