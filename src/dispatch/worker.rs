use crate::config::TimeoutCache;
use crate::dispatch::handler::{PollContext, PollError, TaskHandlerRegistry};
use crate::dispatch::queue::{DispatchMessage, QueueReceivers, TaskQueues};
use crate::graph::{GraphStore, NodeId};
use crate::ledger::{ExecutionId, ExecutionLedger};
use crate::lock::{DeviceLockRegistry, LockToken};
use crate::registry::DeviceId;
use async_trait::async_trait;
use chrono::Duration;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The two entry points workers use to report back into the core.
#[async_trait]
pub trait CompletionSink: Send + Sync {
    async fn on_node_completed(
        &self,
        device_id: DeviceId,
        node_id: NodeId,
        execution_id: ExecutionId,
        duration_ms: u64,
        result_summary: serde_json::Value,
    );

    async fn on_node_failed(
        &self,
        device_id: DeviceId,
        node_id: NodeId,
        execution_id: ExecutionId,
        error_message: &str,
    );
}

/// Everything a worker needs to process one dispatch message
pub struct WorkerDeps {
    pub ledger: Arc<ExecutionLedger>,
    pub locks: Arc<DeviceLockRegistry>,
    pub graphs: Arc<GraphStore>,
    pub queues: Arc<TaskQueues>,
    pub handlers: TaskHandlerRegistry,
    pub timeouts: Arc<TimeoutCache>,
    pub sink: Arc<dyn CompletionSink>,
    pub lock_ttl: Duration,
    pub chain_lock_retries: u32,
    pub chain_lock_retry_delay_ms: u64,
}

/// Worker pools draining the typed queues, decoupled from the
/// coordinator's clock.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl WorkerPool {
    pub fn spawn(receivers: QueueReceivers, deps: Arc<WorkerDeps>, workers_per_queue: usize) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let mut handles = Vec::new();

        for (queue, receiver) in receivers.receivers {
            let receiver = Arc::new(Mutex::new(receiver));
            for index in 0..workers_per_queue.max(1) {
                let worker_id = format!("{}-worker-{}", queue.as_str(), index);
                let receiver = receiver.clone();
                let deps = deps.clone();
                let mut shutdown_rx = shutdown_tx.subscribe();

                handles.push(tokio::spawn(async move {
                    loop {
                        let message = tokio::select! {
                            _ = shutdown_rx.changed() => break,
                            message = async { receiver.lock().await.recv().await } => message,
                        };
                        match message {
                            Some(message) => process_message(&deps, &worker_id, message).await,
                            None => break,
                        }
                    }
                    debug!("Worker {} stopped", worker_id);
                }));
            }
        }

        info!("Spawned {} queue workers", handles.len());
        Self {
            handles,
            shutdown_tx,
        }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn process_message(deps: &WorkerDeps, worker_id: &str, message: DispatchMessage) {
    deps.queues.mark_taken(message.execution_id);

    if deps
        .ledger
        .mark_running(message.execution_id, worker_id)
        .is_err()
    {
        // Interrupted (or reconciled) while queued; drop without I/O.
        debug!(
            "Skipping execution {}: no longer pending",
            message.execution_id
        );
        if let Some(token) = message.lock_token {
            deps.locks.release(&token);
        }
        return;
    }

    let node = deps
        .graphs
        .with_graph(message.device_id, |graph| {
            graph.node(message.node_id).ok().cloned()
        })
        .flatten();
    let Some(node) = node else {
        if let Some(token) = message.lock_token {
            deps.locks.release(&token);
        }
        deps.sink
            .on_node_failed(
                message.device_id,
                message.node_id,
                message.execution_id,
                "Node no longer exists in the device graph",
            )
            .await;
        return;
    };

    // Scheduler-dispatched work carries a token we re-affirm; chain and
    // manual work acquires the lock here, with bounded retries.
    let token = match message.lock_token {
        Some(token) => {
            if deps.locks.is_valid(&token) {
                token
            } else {
                deps.sink
                    .on_node_failed(
                        message.device_id,
                        message.node_id,
                        message.execution_id,
                        "Device lock expired before I/O",
                    )
                    .await;
                return;
            }
        }
        None => match acquire_with_retries(deps, message.device_id).await {
            Some(token) => token,
            None => {
                let error = PollError::LockUnavailable(format!(
                    "device {} busy after {} attempts",
                    message.device_id, deps.chain_lock_retries
                ));
                deps.sink
                    .on_node_failed(
                        message.device_id,
                        message.node_id,
                        message.execution_id,
                        &error.to_string(),
                    )
                    .await;
                return;
            }
        },
    };

    let timeouts = deps.timeouts.get();
    let read_timeout = std::time::Duration::from_secs(timeouts.read_timeout_secs);
    let context = PollContext {
        device_id: message.device_id,
        node: node.clone(),
        timeouts: timeouts.clone(),
    };

    let started = std::time::Instant::now();
    let outcome = match deps.handlers.get(node.task_class) {
        Some(handler) => match tokio::time::timeout(read_timeout, handler.run(&context)).await {
            Ok(result) => result,
            Err(_) => Err(PollError::Timeout(timeouts.read_timeout_secs)),
        },
        None => Err(PollError::Protocol(format!(
            "no handler for task class {}",
            node.task_class.as_str()
        ))),
    };

    // Release right after device I/O so a chained node can take the lock
    // without waiting for bookkeeping.
    deps.locks.release(&token);
    let duration_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(summary) => {
            deps.sink
                .on_node_completed(
                    message.device_id,
                    message.node_id,
                    message.execution_id,
                    duration_ms,
                    summary,
                )
                .await;
        }
        Err(error) => {
            warn!(
                "Execution {} on device {} failed: {}",
                message.execution_id, message.device_id, error
            );
            deps.sink
                .on_node_failed(
                    message.device_id,
                    message.node_id,
                    message.execution_id,
                    &error.to_string(),
                )
                .await;
        }
    }
}

async fn acquire_with_retries(deps: &WorkerDeps, device_id: DeviceId) -> Option<LockToken> {
    for attempt in 0..deps.chain_lock_retries.max(1) {
        if let Some(token) = deps.locks.try_acquire(device_id, Some(deps.lock_ttl)) {
            return Some(token);
        }
        debug!(
            "Device {} busy, retrying lock (attempt {})",
            device_id,
            attempt + 1
        );
        tokio::time::sleep(std::time::Duration::from_millis(
            deps.chain_lock_retry_delay_ms,
        ))
        .await;
    }
    None
}
