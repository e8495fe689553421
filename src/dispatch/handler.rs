use crate::config::{DeviceTimeouts, RetentionConfig};
use crate::graph::{PollNode, TaskClass};
use crate::ledger::ExecutionLedger;
use crate::quota::QuotaBook;
use crate::registry::{DeviceId, SharedIndexResolver};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Errors surfaced by device-facing operations
#[derive(Debug, Clone, Error)]
pub enum PollError {
    #[error("Device operation timed out after {0}s")]
    Timeout(u64),
    #[error("Device unreachable: {0}")]
    DeviceUnreachable(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Could not acquire device lock: {0}")]
    LockUnavailable(String),
}

/// Request handed to the polling client for one device operation
#[derive(Clone, Debug)]
pub struct PollRequest {
    pub device_id: DeviceId,
    pub node_key: String,
    pub task_class: TaskClass,
    pub parameters: serde_json::Value,
    pub timeouts: DeviceTimeouts,
}

/// Raw protocol I/O against the device.
///
/// Implemented outside this crate per brand; retries happen inside the
/// client, so one call equals one externally observed attempt.
#[async_trait]
pub trait PollingClient: Send + Sync {
    async fn poll(&self, request: PollRequest) -> Result<serde_json::Value, PollError>;
}

/// Polling client stand-in for tests and simulation runs.
pub struct MockPollingClient {
    pub delay_ms: u64,
    /// Node keys whose polls should fail
    pub failing_keys: Vec<String>,
}

impl MockPollingClient {
    pub fn new() -> Self {
        Self {
            delay_ms: 10,
            failing_keys: Vec::new(),
        }
    }

    pub fn failing_on(mut self, key: &str) -> Self {
        self.failing_keys.push(key.to_string());
        self
    }
}

impl Default for MockPollingClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PollingClient for MockPollingClient {
    async fn poll(&self, request: PollRequest) -> Result<serde_json::Value, PollError> {
        tokio::time::sleep(tokio::time::Duration::from_millis(self.delay_ms)).await;
        if self.failing_keys.contains(&request.node_key) {
            return Err(PollError::DeviceUnreachable(format!(
                "simulated failure for {}",
                request.node_key
            )));
        }
        Ok(serde_json::json!({
            "records": [
                {"index": 2181, "value": -21.4},
                {"index": 2182, "value": -19.8},
            ],
        }))
    }
}

/// Execution context a handler runs with
#[derive(Clone, Debug)]
pub struct PollContext {
    pub device_id: DeviceId,
    pub node: PollNode,
    pub timeouts: DeviceTimeouts,
}

/// One device-facing operation kind.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, ctx: &PollContext) -> Result<serde_json::Value, PollError>;
}

/// Compile-time-known handler set keyed by task class.
pub struct TaskHandlerRegistry {
    handlers: HashMap<TaskClass, Arc<dyn TaskHandler>>,
}

impl TaskHandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, task_class: TaskClass, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(task_class, handler);
    }

    pub fn get(&self, task_class: TaskClass) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&task_class).cloned()
    }

    /// Standard handler set over one polling client.
    pub fn standard(
        client: Arc<dyn PollingClient>,
        resolver: SharedIndexResolver,
        ledger: Arc<ExecutionLedger>,
        quotas: Arc<QuotaBook>,
        retention: RetentionConfig,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(
            TaskClass::Discovery,
            Arc::new(DeviceReadHandler {
                client: client.clone(),
                resolver: resolver.clone(),
            }),
        );
        registry.register(
            TaskClass::ValueRead,
            Arc::new(DeviceReadHandler {
                client: client.clone(),
                resolver: resolver.clone(),
            }),
        );
        registry.register(
            TaskClass::Manual,
            Arc::new(DeviceReadHandler { client, resolver }),
        );
        registry.register(
            TaskClass::Cleanup,
            Arc::new(RetentionHandler {
                ledger,
                quotas,
                retention,
            }),
        );
        registry
    }
}

impl Default for TaskHandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads a record table from the device and maps native indexes to
/// logical slot/port/unit positions.
pub struct DeviceReadHandler {
    client: Arc<dyn PollingClient>,
    resolver: SharedIndexResolver,
}

#[async_trait]
impl TaskHandler for DeviceReadHandler {
    async fn run(&self, ctx: &PollContext) -> Result<serde_json::Value, PollError> {
        let request = PollRequest {
            device_id: ctx.device_id,
            node_key: ctx.node.key.clone(),
            task_class: ctx.node.task_class,
            parameters: ctx.node.parameters.clone(),
            timeouts: ctx.timeouts.clone(),
        };

        let raw = self.client.poll(request).await?;
        Ok(self.resolve_records(raw))
    }
}

impl DeviceReadHandler {
    fn resolve_records(&self, raw: serde_json::Value) -> serde_json::Value {
        let records = raw
            .get("records")
            .and_then(|r| r.as_array())
            .cloned()
            .unwrap_or_default();

        let resolved: Vec<serde_json::Value> = records
            .into_iter()
            .map(|record| {
                let location = record
                    .get("index")
                    .and_then(|i| i.as_u64())
                    .map(|raw_index| self.resolver.resolve(raw_index));
                match location {
                    Some(loc) => serde_json::json!({
                        "slot": loc.slot,
                        "port": loc.port,
                        "unit": loc.unit,
                        "record": record,
                    }),
                    None => record,
                }
            })
            .collect();

        serde_json::json!({
            "record_count": resolved.len(),
            "records": resolved,
        })
    }
}

/// Bulk retention cleanup, run off the cleanup queue so it never competes
/// with device-facing work.
pub struct RetentionHandler {
    ledger: Arc<ExecutionLedger>,
    quotas: Arc<QuotaBook>,
    retention: RetentionConfig,
}

#[async_trait]
impl TaskHandler for RetentionHandler {
    async fn run(&self, _ctx: &PollContext) -> Result<serde_json::Value, PollError> {
        let now = Utc::now();
        let purged_executions = self
            .ledger
            .purge_terminal_older_than(now - Duration::hours(self.retention.execution_max_age_hours));
        let purged_periods = self
            .quotas
            .purge_periods_before(now - Duration::hours(self.retention.quota_max_age_hours));

        debug!(
            "Retention pass purged {} executions and {} quota periods",
            purged_executions, purged_periods
        );
        Ok(serde_json::json!({
            "purged_executions": purged_executions,
            "purged_quota_periods": purged_periods,
        }))
    }
}
