use crate::config::{DeviceTimeouts, QuotaConfig, RetentionConfig};
use crate::dispatch::handler::*;
use crate::dispatch::queue::*;
use crate::graph::{NodeSpec, PollGraph, TaskClass};
use crate::ledger::{ExecutionLedger, QueueProbe};
use crate::quota::QuotaBook;
use crate::registry::LinearIndexResolver;
use std::sync::Arc;
use uuid::Uuid;

fn message(queue: QueueName) -> DispatchMessage {
    DispatchMessage {
        execution_id: Uuid::new_v4(),
        node_id: Uuid::new_v4(),
        device_id: Uuid::new_v4(),
        queue,
        lock_token: None,
    }
}

#[test]
fn queue_selection_follows_task_class() {
    assert_eq!(QueueName::for_class(TaskClass::Discovery), QueueName::Discovery);
    assert_eq!(QueueName::for_class(TaskClass::ValueRead), QueueName::ValueRead);
    assert_eq!(QueueName::for_class(TaskClass::Manual), QueueName::Manual);
    assert_eq!(QueueName::for_class(TaskClass::Cleanup), QueueName::Cleanup);
}

#[tokio::test]
async fn enqueue_tracks_in_flight_until_taken() {
    let (queues, mut receivers) = TaskQueues::new(4);
    let message = message(QueueName::ValueRead);
    let execution_id = message.execution_id;

    queues.enqueue(message).unwrap();
    assert!(queues.is_in_flight(execution_id));
    assert_eq!(queues.depth(QueueName::ValueRead), 1);

    let received = receivers
        .receivers
        .get_mut(&QueueName::ValueRead)
        .unwrap()
        .recv()
        .await
        .unwrap();
    assert_eq!(received.execution_id, execution_id);

    queues.mark_taken(execution_id);
    assert!(!queues.is_in_flight(execution_id));
    assert_eq!(queues.depth(QueueName::ValueRead), 0);
}

#[tokio::test]
async fn full_queue_rejects_without_leaking_in_flight() {
    let (queues, _receivers) = TaskQueues::new(1);

    queues.enqueue(message(QueueName::Manual)).unwrap();
    let overflow = message(QueueName::Manual);
    let overflow_id = overflow.execution_id;

    let err = queues.enqueue(overflow).unwrap_err();
    assert!(matches!(err, DispatchError::QueueFull(QueueName::Manual)));
    assert!(!queues.is_in_flight(overflow_id));
}

#[tokio::test]
async fn read_handler_resolves_native_indexes() {
    let client = Arc::new(MockPollingClient::new());
    let resolver = Arc::new(LinearIndexResolver::default());
    let ledger = Arc::new(ExecutionLedger::new());
    let quotas = Arc::new(QuotaBook::new(QuotaConfig::default()));
    let registry = TaskHandlerRegistry::standard(
        client,
        resolver.clone(),
        ledger,
        quotas,
        RetentionConfig::default(),
    );

    let mut graph = PollGraph::new(Uuid::new_v4());
    let node_id = graph
        .add_node(NodeSpec::new("optics", TaskClass::ValueRead, 300))
        .unwrap();
    let context = PollContext {
        device_id: graph.device_id,
        node: graph.node(node_id).unwrap().clone(),
        timeouts: DeviceTimeouts::default(),
    };

    let handler = registry.get(TaskClass::ValueRead).unwrap();
    let summary = handler.run(&context).await.unwrap();

    assert_eq!(summary["record_count"], 2);
    // The mock returns index 2181 = slot 1, port 1, unit 5 for the default
    // linear layout (16 ports x 128 units).
    assert_eq!(summary["records"][0]["slot"], 1);
    assert_eq!(summary["records"][0]["port"], 1);
    assert_eq!(summary["records"][0]["unit"], 5);
}

#[tokio::test]
async fn failing_client_surfaces_device_error() {
    let client = Arc::new(MockPollingClient::new().failing_on("optics"));
    let resolver = Arc::new(LinearIndexResolver::default());
    let handler = TaskHandlerRegistry::standard(
        client,
        resolver,
        Arc::new(ExecutionLedger::new()),
        Arc::new(QuotaBook::new(QuotaConfig::default())),
        RetentionConfig::default(),
    )
    .get(TaskClass::ValueRead)
    .unwrap();

    let mut graph = PollGraph::new(Uuid::new_v4());
    let node_id = graph
        .add_node(NodeSpec::new("optics", TaskClass::ValueRead, 300))
        .unwrap();
    let context = PollContext {
        device_id: graph.device_id,
        node: graph.node(node_id).unwrap().clone(),
        timeouts: DeviceTimeouts::default(),
    };

    let err = handler.run(&context).await.unwrap_err();
    assert!(matches!(err, PollError::DeviceUnreachable(_)));
}

#[test]
fn empty_registry_has_no_handlers() {
    let registry = TaskHandlerRegistry::new();
    assert!(registry.get(TaskClass::Discovery).is_none());
}
