use crate::graph::{NodeId, TaskClass};
use crate::ledger::{ExecutionId, QueueProbe};
use crate::lock::LockToken;
use crate::registry::DeviceId;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;

/// Queue identity; selects the worker pool and priority class.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueName {
    Discovery,
    ValueRead,
    Manual,
    Cleanup,
}

impl QueueName {
    pub const ALL: [QueueName; 4] = [
        QueueName::Discovery,
        QueueName::ValueRead,
        QueueName::Manual,
        QueueName::Cleanup,
    ];

    pub fn for_class(task_class: TaskClass) -> Self {
        match task_class {
            TaskClass::Discovery => QueueName::Discovery,
            TaskClass::ValueRead => QueueName::ValueRead,
            TaskClass::Manual => QueueName::Manual,
            TaskClass::Cleanup => QueueName::Cleanup,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Discovery => "discovery",
            QueueName::ValueRead => "value_read",
            QueueName::Manual => "manual",
            QueueName::Cleanup => "cleanup",
        }
    }
}

/// Handoff from the scheduler (or a chain trigger) to a worker.
///
/// Scheduler-dispatched work carries the lock token acquired just before
/// the Execution was created; chain-triggered and manual work carries none
/// and the worker acquires the lock itself.
#[derive(Clone, Debug)]
pub struct DispatchMessage {
    pub execution_id: ExecutionId,
    pub node_id: NodeId,
    pub device_id: DeviceId,
    pub queue: QueueName,
    pub lock_token: Option<LockToken>,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Queue {0:?} is full")]
    QueueFull(QueueName),
    #[error("Queue {0:?} is closed")]
    QueueClosed(QueueName),
    #[error("No handler registered for task class {0:?}")]
    HandlerMissing(TaskClass),
}

/// Sender side of the typed queues, plus the in-flight set the
/// reconciliation probe consults.
pub struct TaskQueues {
    senders: HashMap<QueueName, mpsc::Sender<DispatchMessage>>,
    in_flight: DashMap<ExecutionId, QueueName>,
}

/// Receiver side, consumed once by the worker pool.
pub struct QueueReceivers {
    pub receivers: HashMap<QueueName, mpsc::Receiver<DispatchMessage>>,
}

impl TaskQueues {
    pub fn new(capacity: usize) -> (Self, QueueReceivers) {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for queue in QueueName::ALL {
            let (tx, rx) = mpsc::channel(capacity);
            senders.insert(queue, tx);
            receivers.insert(queue, rx);
        }
        (
            Self {
                senders,
                in_flight: DashMap::new(),
            },
            QueueReceivers { receivers },
        )
    }

    /// Enqueue without blocking the coordinator. The execution enters the
    /// in-flight set only if the message actually lands in the queue.
    pub fn enqueue(&self, message: DispatchMessage) -> Result<(), DispatchError> {
        let queue = message.queue;
        let sender = self
            .senders
            .get(&queue)
            .ok_or(DispatchError::QueueClosed(queue))?;

        self.in_flight.insert(message.execution_id, queue);
        match sender.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(message)) => {
                self.in_flight.remove(&message.execution_id);
                Err(DispatchError::QueueFull(queue))
            }
            Err(mpsc::error::TrySendError::Closed(message)) => {
                self.in_flight.remove(&message.execution_id);
                Err(DispatchError::QueueClosed(queue))
            }
        }
    }

    /// Called by a worker the moment it picks a message up; from then on
    /// the execution is the worker's responsibility, not the queue's.
    pub fn mark_taken(&self, execution_id: ExecutionId) {
        self.in_flight.remove(&execution_id);
    }

    pub fn depth(&self, queue: QueueName) -> usize {
        self.in_flight
            .iter()
            .filter(|entry| *entry.value() == queue)
            .count()
    }
}

impl QueueProbe for TaskQueues {
    fn is_in_flight(&self, execution_id: ExecutionId) -> bool {
        self.in_flight.contains_key(&execution_id)
    }
}
