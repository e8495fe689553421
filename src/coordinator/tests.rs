use crate::config::QuotaConfig;
use crate::coordinator::coordinator::*;
use crate::coordinator::mode::*;
use crate::coordinator::scheduler::DynamicScheduler;
use crate::dispatch::{QueueReceivers, TaskQueues};
use crate::events::{EventLog, EventType};
use crate::graph::{GraphStore, NodePriority, NodeSpec, PollGraph, TaskClass};
use crate::ledger::{ExecutionLedger, ExecutionStatus};
use crate::lock::DeviceLockRegistry;
use crate::quota::QuotaBook;
use crate::registry::{DeviceRef, StaticDeviceRegistry};
use chrono::{Duration, TimeZone, Timelike, Utc};
use std::sync::Arc;
use uuid::Uuid;

struct Harness {
    registry: Arc<StaticDeviceRegistry>,
    graphs: Arc<GraphStore>,
    ledger: Arc<ExecutionLedger>,
    locks: Arc<DeviceLockRegistry>,
    queues: Arc<TaskQueues>,
    events: Arc<EventLog>,
    quotas: Arc<QuotaBook>,
    mode: ModeController,
    // Receivers must stay alive or every enqueue fails as closed.
    _receivers: QueueReceivers,
}

impl Harness {
    fn new() -> Self {
        let (queues, receivers) = TaskQueues::new(64);
        Self {
            registry: Arc::new(StaticDeviceRegistry::empty()),
            graphs: Arc::new(GraphStore::new()),
            ledger: Arc::new(ExecutionLedger::new()),
            locks: Arc::new(DeviceLockRegistry::new(Duration::seconds(60))),
            queues: Arc::new(queues),
            events: Arc::new(EventLog::new(256)),
            quotas: Arc::new(QuotaBook::new(QuotaConfig::default())),
            mode: ModeController::new(ExecutionMode::Live),
            _receivers: receivers,
        }
    }

    fn scheduler(&self) -> DynamicScheduler {
        DynamicScheduler::new(
            self.ledger.clone(),
            self.locks.clone(),
            self.queues.clone(),
            self.events.clone(),
            Duration::seconds(60),
        )
    }

    fn coordinator(&self) -> ExecutionCoordinator {
        ExecutionCoordinator::new(
            self.registry.clone(),
            self.graphs.clone(),
            self.scheduler(),
            self.ledger.clone(),
            self.quotas.clone(),
            self.events.clone(),
            self.mode.subscribe(),
            300,
        )
    }

    async fn add_device(&self) -> Uuid {
        let device = DeviceRef {
            id: Uuid::new_v4(),
            name: "olt-test".to_string(),
            enabled: true,
        };
        self.registry.add_device(device.clone()).await;
        self.graphs.insert(PollGraph::new(device.id));
        device.id
    }
}

#[test]
fn drift_snaps_offset_without_changing_minute() {
    let device = Uuid::new_v4();
    let mut graph = PollGraph::new(device);
    let discovery = graph
        .add_node(NodeSpec::new("discover", TaskClass::Discovery, 900))
        .unwrap();
    let read = graph
        .add_node(NodeSpec::new("optics", TaskClass::ValueRead, 300))
        .unwrap();
    let manual = graph
        .add_node(NodeSpec::new("oneoff", TaskClass::Manual, 300))
        .unwrap();

    let drifted = Utc.with_ymd_and_hms(2026, 8, 6, 14, 23, 37).unwrap();
    for id in [discovery, read, manual] {
        graph.node_mut(id).unwrap().next_run_at = drifted;
    }

    let corrected = correct_drift(&mut graph, Utc::now());
    assert_eq!(corrected, 2);

    let discovery_at = graph.node(discovery).unwrap().next_run_at;
    assert_eq!(discovery_at.second(), 0);
    assert_eq!(discovery_at.minute(), 23);
    assert_eq!(discovery_at.hour(), 14);

    let read_at = graph.node(read).unwrap().next_run_at;
    assert_eq!(read_at.second(), 10);
    assert_eq!(read_at.minute(), 23);

    // Manual class has no expected offset.
    assert_eq!(graph.node(manual).unwrap().next_run_at, drifted);

    // A second pass converges to zero corrections.
    assert_eq!(correct_drift(&mut graph, Utc::now()), 0);
}

#[test]
fn scheduler_serializes_per_device() {
    let harness = Harness::new();
    let scheduler = harness.scheduler();

    let device = Uuid::new_v4();
    let mut graph = PollGraph::new(device);
    let first = graph
        .add_node(
            NodeSpec::new("first", TaskClass::ValueRead, 300).with_priority(NodePriority::High),
        )
        .unwrap();
    let second = graph
        .add_node(NodeSpec::new("second", TaskClass::ValueRead, 300))
        .unwrap();

    // Both nodes are due, but only one execution may exist while the
    // device lock is held.
    let dispatched = scheduler.process_ready_nodes(&mut graph, Utc::now() + Duration::seconds(1));
    assert_eq!(dispatched, 1);
    assert_eq!(harness.ledger.len(), 1);
    assert!(harness.locks.is_held(device));

    let execution = harness.ledger.executions_for_node(first).pop().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Pending);
    assert!(harness.ledger.executions_for_node(second).is_empty());

    // next_run_at is untouched for both until callbacks run.
    assert!(graph.node(first).unwrap().next_run_at <= Utc::now());
    assert!(graph.node(second).unwrap().next_run_at <= Utc::now());

    // Next tick with the lock still held dispatches nothing.
    let dispatched = scheduler.process_ready_nodes(&mut graph, Utc::now() + Duration::seconds(6));
    assert_eq!(dispatched, 0);
}

#[test]
fn scheduler_contention_is_not_an_error() {
    let harness = Harness::new();
    let scheduler = harness.scheduler();

    let device = Uuid::new_v4();
    let mut graph = PollGraph::new(device);
    graph
        .add_node(NodeSpec::new("optics", TaskClass::ValueRead, 300))
        .unwrap();

    // Someone else holds the device.
    let _token = harness.locks.try_acquire(device, None).unwrap();

    let dispatched = scheduler.process_ready_nodes(&mut graph, Utc::now() + Duration::seconds(1));
    assert_eq!(dispatched, 0);
    assert!(harness.ledger.is_empty());
    assert!(harness.events.is_empty());
}

#[tokio::test]
async fn tick_detects_structural_changes() {
    let harness = Harness::new();
    let coordinator = harness.coordinator();
    let device = harness.add_device().await;

    coordinator.tick(Utc::now()).await;
    assert!(coordinator.snapshot(device).is_some());

    // Add a node between ticks.
    harness.graphs.with_graph_mut(device, |graph| {
        graph
            .add_node(NodeSpec::new("optics", TaskClass::ValueRead, 300))
            .unwrap();
    });

    coordinator.tick(Utc::now()).await;
    let changes: Vec<_> = harness
        .events
        .recent(64)
        .into_iter()
        .filter(|e| e.event_type == EventType::StructuralChange)
        .collect();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].device_id, Some(device));

    // No further change, no further event.
    coordinator.tick(Utc::now()).await;
    let changes = harness
        .events
        .recent(64)
        .into_iter()
        .filter(|e| e.event_type == EventType::StructuralChange)
        .count();
    assert_eq!(changes, 1);
}

#[tokio::test]
async fn mode_flip_interrupts_and_reschedules() {
    let harness = Harness::new();
    let coordinator = harness.coordinator();
    let device = harness.add_device().await;

    let (master, chain, short) = harness
        .graphs
        .with_graph_mut(device, |graph| {
            let master = graph
                .add_node(NodeSpec::new("master", TaskClass::ValueRead, 600))
                .unwrap();
            let chain = graph
                .add_node(NodeSpec::new("chained", TaskClass::ValueRead, 600).chained_to("master"))
                .unwrap();
            let short = graph
                .add_node(NodeSpec::new("short", TaskClass::ValueRead, 60))
                .unwrap();
            (master, chain, short)
        })
        .unwrap();

    // Leave one execution active.
    let execution = harness.ledger.create(master, device);
    harness.ledger.mark_running(execution.id, "worker-0").unwrap();

    let state = harness.mode.set_mode(ExecutionMode::Simulation).unwrap();
    coordinator.handle_mode_if_changed();

    // Active execution interrupted, reason recorded.
    let interrupted = harness.ledger.get(execution.id).unwrap();
    assert_eq!(interrupted.status, ExecutionStatus::Interrupted);
    assert!(
        interrupted
            .error_message
            .as_deref()
            .unwrap()
            .contains("simulation")
    );

    harness.graphs.with_graph(device, |graph| {
        // Master at/above the 300s threshold restarts from the flip.
        let master_node = graph.node(master).unwrap();
        assert_eq!(
            master_node.next_run_at,
            state.changed_at + Duration::seconds(600)
        );
        assert!(master_node.next_run_at > state.changed_at);
        assert!(master_node.last_run_at.is_none());

        // Chain nodes and short-interval masters keep their timing.
        assert!(graph.node(chain).unwrap().next_run_at <= state.changed_at);
        assert!(graph.node(short).unwrap().next_run_at <= state.changed_at);
    });

    // The same version is never applied twice.
    harness.graphs.with_graph_mut(device, |graph| {
        graph.node_mut(master).unwrap().next_run_at = Utc::now() - Duration::seconds(30);
    });
    coordinator.handle_mode_if_changed();
    harness.graphs.with_graph(device, |graph| {
        assert!(graph.node(master).unwrap().next_run_at < Utc::now());
    });
}

#[tokio::test]
async fn mode_flip_counts_interruptions_as_skipped() {
    let harness = Harness::new();
    let coordinator = harness.coordinator();
    let device = harness.add_device().await;

    let master = harness
        .graphs
        .with_graph_mut(device, |graph| {
            graph
                .add_node(NodeSpec::new("master", TaskClass::ValueRead, 600))
                .unwrap()
        })
        .unwrap();
    let _execution = harness.ledger.create(master, device);

    harness.mode.set_mode(ExecutionMode::Simulation).unwrap();
    coordinator.handle_mode_if_changed();

    assert_eq!(harness.ledger.count_by_status(ExecutionStatus::Pending), 0);
    let tracker = harness
        .quotas
        .tracker(device, TaskClass::ValueRead, Utc::now())
        .unwrap();
    assert_eq!(tracker.quota_skipped, 1);
    assert_eq!(tracker.quota_failed, 0);
}

#[test]
fn mode_controller_is_versioned_and_idempotent() {
    let mode = ModeController::new(ExecutionMode::Simulation);
    assert_eq!(mode.current().version, 0);

    // Setting the same mode is a no-op.
    assert!(mode.set_mode(ExecutionMode::Simulation).is_none());
    assert_eq!(mode.current().version, 0);

    let flipped = mode.set_mode(ExecutionMode::Live).unwrap();
    assert_eq!(flipped.version, 1);
    assert_eq!(mode.current().mode, ExecutionMode::Live);
}
