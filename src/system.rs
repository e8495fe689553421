//! High-level wiring of the coordination engine.
//!
//! `PollerSystem` owns every subsystem, implements the completion sink the
//! workers report through, and exposes the operator-facing surface:
//! template management, manual triggers, mode switching, and the
//! read-only dashboard.

use crate::config::{PollerConfig, SharedConfig, TimeoutCache};
use crate::coordinator::{DynamicScheduler, ExecutionCoordinator, ExecutionMode, ModeController};
use crate::dispatch::{
    CompletionSink, PollingClient, QueueName, QueueReceivers, TaskHandlerRegistry, TaskQueues,
    WorkerDeps, WorkerPool,
};
use crate::events::{EventEntry, EventLevel, EventLog, EventType};
use crate::graph::{
    GraphStore, NodeId, TaskTemplate, TemplateId, TemplateNode, TemplateStore, apply_template,
    sync_graph_from_template,
};
use crate::ledger::{ExecutionId, ExecutionLedger, ExecutionStatus, ReconciliationJob};
use crate::lock::DeviceLockRegistry;
use crate::quota::{QuotaAuditor, QuotaBook, QuotaTracker, ViolationNotifier, ViolationStore};
use crate::registry::{DeviceId, DeviceRegistry, SharedIndexResolver};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Read-only per-device view for operators
#[derive(Serialize, Clone, Debug)]
pub struct DeviceDashboard {
    pub device_id: DeviceId,
    pub node_count: usize,
    pub pending_executions: usize,
    pub running_executions: usize,
    pub quota_summary: Vec<QuotaTracker>,
    pub recent_events: Vec<EventEntry>,
}

/// System-wide health snapshot
#[derive(Serialize, Clone, Debug)]
pub struct SystemStatus {
    pub mode: String,
    pub devices: usize,
    pub pending_executions: usize,
    pub running_executions: usize,
    pub held_locks: usize,
    pub open_violations: usize,
    pub uptime_secs: i64,
}

/// The assembled coordination engine.
pub struct PollerSystem {
    config: Arc<SharedConfig>,
    registry: Arc<dyn DeviceRegistry>,
    graphs: Arc<GraphStore>,
    templates: Arc<TemplateStore>,
    ledger: Arc<ExecutionLedger>,
    quotas: Arc<QuotaBook>,
    violations: Arc<ViolationStore>,
    locks: Arc<DeviceLockRegistry>,
    events: Arc<EventLog>,
    queues: Arc<TaskQueues>,
    mode: ModeController,
    scheduler: DynamicScheduler,
    coordinator: Arc<ExecutionCoordinator>,
    auditor: QuotaAuditor,
    reconciler: ReconciliationJob,
    notifier: Option<ViolationNotifier>,
    client: Arc<dyn PollingClient>,
    resolver: SharedIndexResolver,
    pending_receivers: std::sync::Mutex<Option<QueueReceivers>>,
    worker_pool: tokio::sync::Mutex<Option<WorkerPool>>,
    shutdown_tx: watch::Sender<bool>,
    started_at: DateTime<Utc>,
}

impl PollerSystem {
    pub fn new(
        config: PollerConfig,
        registry: Arc<dyn DeviceRegistry>,
        client: Arc<dyn PollingClient>,
        resolver: SharedIndexResolver,
        initial_mode: ExecutionMode,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let shared_config = Arc::new(SharedConfig::new(config.clone()));
        let graphs = Arc::new(GraphStore::new());
        let templates = Arc::new(TemplateStore::new());
        let ledger = Arc::new(ExecutionLedger::new());
        let quotas = Arc::new(QuotaBook::new(config.quota.clone()));
        let violations = Arc::new(ViolationStore::new());
        let locks = Arc::new(DeviceLockRegistry::new(config.lock_ttl()));
        let events = Arc::new(EventLog::new(config.event_log_capacity));
        let (queues, receivers) = TaskQueues::new(config.dispatch.queue_capacity);
        let queues = Arc::new(queues);
        let mode = ModeController::new(initial_mode);

        let scheduler = DynamicScheduler::new(
            ledger.clone(),
            locks.clone(),
            queues.clone(),
            events.clone(),
            config.lock_ttl(),
        );
        // The coordinator gets its own scheduler over the same shared state.
        let tick_scheduler = DynamicScheduler::new(
            ledger.clone(),
            locks.clone(),
            queues.clone(),
            events.clone(),
            config.lock_ttl(),
        );
        let coordinator = Arc::new(ExecutionCoordinator::new(
            registry.clone(),
            graphs.clone(),
            tick_scheduler,
            ledger.clone(),
            quotas.clone(),
            events.clone(),
            mode.subscribe(),
            config.mode_reschedule_min_interval_secs,
        ));

        let auditor = QuotaAuditor::new(quotas.clone(), violations.clone(), events.clone());
        let reconciler = ReconciliationJob::new(
            ledger.clone(),
            queues.clone(),
            events.clone(),
            Duration::seconds(config.reconcile_grace_secs),
        );
        let notifier = match &config.violation_webhook {
            Some(endpoint) => Some(ViolationNotifier::new(endpoint, violations.clone())?),
            None => None,
        };
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config: shared_config,
            registry,
            graphs,
            templates,
            ledger,
            quotas,
            violations,
            locks,
            events,
            queues,
            mode,
            scheduler,
            coordinator,
            auditor,
            reconciler,
            notifier,
            client,
            resolver,
            pending_receivers: std::sync::Mutex::new(Some(receivers)),
            worker_pool: tokio::sync::Mutex::new(None),
            shutdown_tx,
            started_at: Utc::now(),
        }))
    }

    /// Spawn the worker pools. Must run before `run` so queued work has
    /// consumers.
    pub async fn start_workers(self: &Arc<Self>) -> Result<()> {
        let receivers = self
            .pending_receivers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| anyhow!("Worker pools already started"))?;

        let config = self.config.get();
        let handlers = TaskHandlerRegistry::standard(
            self.client.clone(),
            self.resolver.clone(),
            self.ledger.clone(),
            self.quotas.clone(),
            config.retention.clone(),
        );
        let deps = Arc::new(WorkerDeps {
            ledger: self.ledger.clone(),
            locks: self.locks.clone(),
            graphs: self.graphs.clone(),
            queues: self.queues.clone(),
            handlers,
            timeouts: Arc::new(TimeoutCache::new(self.config.clone(), Duration::seconds(60))),
            sink: self.clone() as Arc<dyn CompletionSink>,
            lock_ttl: config.lock_ttl(),
            chain_lock_retries: config.dispatch.chain_lock_retries,
            chain_lock_retry_delay_ms: config.dispatch.chain_lock_retry_delay_ms,
        });

        let pool = WorkerPool::spawn(receivers, deps, config.dispatch.workers_per_queue);
        *self.worker_pool.lock().await = Some(pool);
        Ok(())
    }

    /// Run the coordinator tick loop and the periodic maintenance jobs
    /// until `shutdown` is called.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        self.start_workers().await?;
        let config = self.config.get();

        let coordinator = self.coordinator.clone();
        let coordinator_handle = tokio::spawn(coordinator.run(
            config.tick_period(),
            self.shutdown_tx.subscribe(),
        ));

        let maintenance = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let maintenance_handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        maintenance.reconciler.run_once();
                        maintenance.auditor.audit_closed_periods(Utc::now());
                        if let Some(notifier) = &maintenance.notifier {
                            notifier.notify_pending().await;
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        info!("Polling coordinator running in {} mode", self.mode.current().mode.as_str());
        let _ = coordinator_handle.await;
        let _ = maintenance_handle.await;
        Ok(())
    }

    pub async fn shutdown(&self) {
        info!("Shutting down polling coordinator");
        let _ = self.shutdown_tx.send(true);
        if let Some(pool) = self.worker_pool.lock().await.take() {
            pool.shutdown().await;
        }
    }

    // ------------------------------------------------------------------
    // Operator surface
    // ------------------------------------------------------------------

    /// Switch the execution mode. The coordinator reacts immediately:
    /// active work is interrupted and eligible masters are rescheduled.
    pub fn set_mode(&self, mode: ExecutionMode) -> bool {
        let changed = self.mode.set_mode(mode).is_some();
        if changed {
            self.coordinator.handle_mode_if_changed();
        }
        changed
    }

    pub fn current_mode(&self) -> ExecutionMode {
        self.mode.current().mode
    }

    /// Register a template and apply it to a device graph.
    pub fn apply_template_to_device(
        &self,
        template: &TaskTemplate,
        device_id: DeviceId,
    ) -> Result<Vec<NodeId>> {
        if self.templates.get(template.id).is_none() {
            self.templates.insert(template.clone());
        }
        self.graphs.ensure(device_id);
        let created = self
            .graphs
            .with_graph_mut(device_id, |graph| apply_template(template, graph))
            .ok_or_else(|| anyhow!("No graph for device {device_id}"))?
            .with_context(|| format!("Failed to apply template {} to {}", template.name, device_id))?;
        self.templates.link(template.id, device_id);
        Ok(created)
    }

    /// Update a template node and resynchronize every auto-sync graph.
    pub fn update_template_node(&self, template_id: TemplateId, node: TemplateNode) -> usize {
        let devices = self.templates.update_node(template_id, node);
        let Some(template) = self.templates.get(template_id) else {
            return 0;
        };

        let mut synced = 0;
        for device_id in devices {
            synced += self
                .graphs
                .with_graph_mut(device_id, |graph| {
                    sync_graph_from_template(&template, graph)
                })
                .unwrap_or(0);
        }
        synced
    }

    /// Dispatch a node right now through the manual queue, bypassing the
    /// time-based query. The worker acquires the device lock itself.
    pub fn trigger_node_now(&self, device_id: DeviceId, node_key: &str) -> Result<ExecutionId> {
        let node_id = self
            .graphs
            .with_graph(device_id, |graph| graph.node_id_by_key(node_key))
            .flatten()
            .ok_or_else(|| anyhow!("Node '{node_key}' not found on device {device_id}"))?;

        let execution = self
            .graphs
            .with_graph(device_id, |graph| {
                self.scheduler_dispatch(graph, node_id, QueueName::Manual)
            })
            .flatten()
            .ok_or_else(|| anyhow!("Failed to enqueue manual run for '{node_key}'"))?;

        self.events.record(
            EventType::ExecutionDispatched,
            EventLevel::Info,
            Some(device_id),
            format!("Manual trigger for node {node_key}"),
            serde_json::json!({"execution_id": execution, "node_key": node_key}),
        );
        Ok(execution)
    }

    fn scheduler_dispatch(
        &self,
        graph: &crate::graph::PollGraph,
        node_id: NodeId,
        queue: QueueName,
    ) -> Option<ExecutionId> {
        self.scheduler
            .dispatch_unlocked(graph, node_id, queue)
            .map(|e| e.id)
    }

    /// Interrupt all active work for a device that was disabled
    /// mid-flight. Bookkeeping only: in-progress device I/O times out on
    /// its own.
    pub fn handle_device_disabled(&self, device_id: DeviceId) -> usize {
        let reason = format!("Device {device_id} disabled");
        let mut interrupted = 0;

        let active = self.ledger.interrupt_for_device(device_id, &reason);
        for execution in &active {
            self.record_interruption_skip(execution.device_id, execution.node_id, execution.id);
            self.events.record(
                EventType::ExecutionInterrupted,
                EventLevel::Warning,
                Some(device_id),
                reason.clone(),
                serde_json::json!({"execution_id": execution.id}),
            );
            interrupted += 1;
        }
        interrupted
    }

    fn record_interruption_skip(
        &self,
        device_id: DeviceId,
        node_id: NodeId,
        execution_id: ExecutionId,
    ) {
        let class_and_expected = self.graphs.with_graph(device_id, |graph| {
            graph.node(node_id).ok().map(|node| {
                (
                    node.task_class,
                    graph.expected_per_period(node.task_class, self.quotas.config().period_secs),
                )
            })
        });
        if let Some(Some((task_class, expected))) = class_and_expected {
            self.quotas
                .record_interrupted(device_id, task_class, execution_id, expected, Utc::now());
        }
    }

    /// Aggregated per-device view: pending/running counts, quota
    /// summaries, recent audit entries.
    pub fn device_dashboard(&self, device_id: DeviceId) -> DeviceDashboard {
        DeviceDashboard {
            device_id,
            node_count: self
                .graphs
                .with_graph(device_id, |graph| graph.node_count())
                .unwrap_or(0),
            pending_executions: self
                .ledger
                .count_for_device(device_id, ExecutionStatus::Pending),
            running_executions: self
                .ledger
                .count_for_device(device_id, ExecutionStatus::Running),
            quota_summary: self.quotas.trackers_for_device(device_id),
            recent_events: self.events.recent_for_device(device_id, 20),
        }
    }

    pub async fn system_status(&self) -> SystemStatus {
        SystemStatus {
            mode: self.mode.current().mode.as_str().to_string(),
            devices: self.registry.get_enabled_devices().await.len(),
            pending_executions: self.ledger.count_by_status(ExecutionStatus::Pending),
            running_executions: self.ledger.count_by_status(ExecutionStatus::Running),
            held_locks: self.locks.held_count(),
            open_violations: self.violations.unnotified().len(),
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
        }
    }

    // Accessors used by the CLI and integration tests.
    pub fn graphs(&self) -> &Arc<GraphStore> {
        &self.graphs
    }
    pub fn ledger(&self) -> &Arc<ExecutionLedger> {
        &self.ledger
    }
    pub fn quotas(&self) -> &Arc<QuotaBook> {
        &self.quotas
    }
    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }
    pub fn violations(&self) -> &Arc<ViolationStore> {
        &self.violations
    }
    pub fn coordinator(&self) -> &Arc<ExecutionCoordinator> {
        &self.coordinator
    }
    pub fn auditor(&self) -> &QuotaAuditor {
        &self.auditor
    }
    pub fn reconciler(&self) -> &ReconciliationJob {
        &self.reconciler
    }

    /// Shared completion path for success and failure callbacks: node
    /// bookkeeping, quota update, then chain dispatch on success.
    async fn finish_node(
        &self,
        device_id: DeviceId,
        node_id: NodeId,
        execution_id: ExecutionId,
        success: bool,
        duration_ms: u64,
    ) {
        let now = Utc::now();
        let period_secs = self.quotas.config().period_secs;

        // Node bookkeeping and chain evaluation under the graph entry lock.
        let outcome = self.graphs.with_graph_mut(device_id, |graph| {
            let Ok(node) = graph.node_mut(node_id) else {
                return None;
            };
            if success {
                node.record_success(now);
            } else {
                node.record_failure(now);
            }
            let task_class = node.task_class;
            let expected = graph.expected_per_period(task_class, period_secs);

            let chain_targets: Vec<NodeId> = if success {
                graph
                    .chain_children(node_id)
                    .into_iter()
                    .filter(|(child_id, condition)| {
                        graph
                            .node(*child_id)
                            .map(|child| condition.satisfied(duration_ms, child))
                            .unwrap_or(false)
                    })
                    .map(|(child_id, _)| child_id)
                    .collect()
            } else {
                Vec::new()
            };

            Some((task_class, expected, chain_targets))
        });

        let Some(Some((task_class, expected, chain_targets))) = outcome else {
            warn!(
                "Completion callback for unknown node {} on device {}",
                node_id, device_id
            );
            return;
        };

        // Quota row mutation happens only here, inside the completion
        // callback, under the tracker's entry lock.
        self.quotas.record_completion(
            device_id,
            task_class,
            execution_id,
            success,
            duration_ms,
            expected,
            now,
        );

        // Chain nodes are driven by completion, not by clock: dispatch
        // through the same queue path, bypassing the time-based check.
        for child_id in chain_targets {
            let dispatched = self
                .graphs
                .with_graph(device_id, |graph| {
                    let queue = graph
                        .node(child_id)
                        .map(|child| QueueName::for_class(child.task_class))
                        .unwrap_or(QueueName::ValueRead);
                    self.scheduler_dispatch(graph, child_id, queue)
                })
                .flatten();

            if let Some(chain_execution) = dispatched {
                debug!(
                    "Chain node {} triggered by master {} (execution {})",
                    child_id, node_id, chain_execution
                );
                self.events.record(
                    EventType::ChainTriggered,
                    EventLevel::Info,
                    Some(device_id),
                    "Chain node triggered by master completion",
                    serde_json::json!({
                        "master_node": node_id,
                        "chain_node": child_id,
                        "execution_id": chain_execution,
                    }),
                );
            }
        }
    }
}

#[async_trait]
impl CompletionSink for PollerSystem {
    async fn on_node_completed(
        &self,
        device_id: DeviceId,
        node_id: NodeId,
        execution_id: ExecutionId,
        duration_ms: u64,
        result_summary: serde_json::Value,
    ) {
        // The ledger transition gates the callback: a replay or a race
        // against an interruption finds a terminal row and stops here, so
        // node and quota bookkeeping run exactly once per execution.
        let execution = match self.ledger.mark_success(execution_id, result_summary) {
            Ok(execution) => execution,
            Err(err) => {
                debug!("Ignoring completion callback: {}", err);
                return;
            }
        };

        self.events.record(
            EventType::ExecutionFinished,
            EventLevel::Info,
            Some(device_id),
            format!("Execution {} succeeded in {}ms", execution.id, duration_ms),
            serde_json::json!({
                "execution_id": execution.id,
                "node_id": node_id,
                "duration_ms": duration_ms,
            }),
        );

        self.finish_node(device_id, node_id, execution_id, true, duration_ms)
            .await;
    }

    async fn on_node_failed(
        &self,
        device_id: DeviceId,
        node_id: NodeId,
        execution_id: ExecutionId,
        error_message: &str,
    ) {
        let execution = match self.ledger.mark_failed(execution_id, error_message) {
            Ok(execution) => execution,
            Err(err) => {
                debug!("Ignoring failure callback: {}", err);
                return;
            }
        };

        self.events.record(
            EventType::ExecutionFinished,
            EventLevel::Warning,
            Some(device_id),
            format!("Execution {} failed: {}", execution.id, error_message),
            serde_json::json!({
                "execution_id": execution.id,
                "node_id": node_id,
                "error": error_message,
            }),
        );

        let duration_ms = execution.duration_ms.unwrap_or(0);
        self.finish_node(device_id, node_id, execution_id, false, duration_ms)
            .await;
    }
}
