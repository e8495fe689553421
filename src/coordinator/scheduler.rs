use crate::events::{EventLevel, EventLog, EventType};
use crate::dispatch::{DispatchMessage, QueueName, TaskQueues};
use crate::graph::PollGraph;
use crate::ledger::ExecutionLedger;
use crate::lock::DeviceLockRegistry;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, error};

/// Time-based dispatcher for one tick.
///
/// Selects due nodes, serializes per device through the lock registry, and
/// hands work to the typed queues. A node whose lock is busy is simply left
/// for the next tick; contention is expected, not a fault.
pub struct DynamicScheduler {
    ledger: Arc<ExecutionLedger>,
    locks: Arc<DeviceLockRegistry>,
    queues: Arc<TaskQueues>,
    events: Arc<EventLog>,
    lock_ttl: Duration,
}

impl DynamicScheduler {
    pub fn new(
        ledger: Arc<ExecutionLedger>,
        locks: Arc<DeviceLockRegistry>,
        queues: Arc<TaskQueues>,
        events: Arc<EventLog>,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            ledger,
            locks,
            queues,
            events,
            lock_ttl,
        }
    }

    /// Dispatch every due node of one device graph. Returns how many
    /// executions were created.
    pub fn process_ready_nodes(&self, graph: &mut PollGraph, now: DateTime<Utc>) -> usize {
        let due = graph.due_nodes(now);
        if due.is_empty() {
            return 0;
        }

        let device_id = graph.device_id;
        let mut dispatched = 0;

        for node_id in due {
            let Some(token) = self.locks.try_acquire(device_id, Some(self.lock_ttl)) else {
                // Expected contention; the node stays due and is retried
                // next tick. Never logged as an error.
                debug!("Device {} busy, leaving node {} for next tick", device_id, node_id);
                continue;
            };

            let Ok(node) = graph.node(node_id) else {
                self.locks.release(&token);
                continue;
            };
            let queue = QueueName::for_class(node.task_class);
            let execution = self.ledger.create(node_id, device_id);

            let message = DispatchMessage {
                execution_id: execution.id,
                node_id,
                device_id,
                queue,
                lock_token: Some(token.clone()),
            };

            match self.queues.enqueue(message) {
                Ok(()) => {
                    // next_run_at stays untouched until the completion
                    // callback recomputes it.
                    self.events.record(
                        EventType::ExecutionDispatched,
                        EventLevel::Debug,
                        Some(device_id),
                        format!("Dispatched node {} to {} queue", node.key, queue.as_str()),
                        serde_json::json!({
                            "execution_id": execution.id,
                            "node_key": node.key,
                            "queue": queue.as_str(),
                        }),
                    );
                    dispatched += 1;
                }
                Err(err) => {
                    error!(
                        "Failed to enqueue node {} on device {}: {}",
                        node_id, device_id, err
                    );
                    self.locks.release(&token);
                    if let Err(ledger_err) = self
                        .ledger
                        .mark_failed(execution.id, &format!("Dispatch failed: {err}"))
                    {
                        error!("Could not fail execution {}: {}", execution.id, ledger_err);
                    }
                }
            }
        }

        dispatched
    }

    /// Dispatch a node outside the time-based query (chain triggers and
    /// manual runs). No lock is pre-acquired; the worker takes the lock
    /// itself before device I/O.
    pub fn dispatch_unlocked(
        &self,
        graph: &PollGraph,
        node_id: crate::graph::NodeId,
        queue: QueueName,
    ) -> Option<crate::ledger::Execution> {
        let device_id = graph.device_id;
        let execution = self.ledger.create(node_id, device_id);

        let message = DispatchMessage {
            execution_id: execution.id,
            node_id,
            device_id,
            queue,
            lock_token: None,
        };

        match self.queues.enqueue(message) {
            Ok(()) => Some(execution),
            Err(err) => {
                error!(
                    "Failed to enqueue node {} on device {}: {}",
                    node_id, device_id, err
                );
                let _ = self
                    .ledger
                    .mark_failed(execution.id, &format!("Dispatch failed: {err}"));
                None
            }
        }
    }
}
