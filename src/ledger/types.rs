use crate::graph::NodeId;
use crate::registry::DeviceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for executions
pub type ExecutionId = Uuid;

/// Lifecycle of one attempted run of a node.
///
/// `Success`, `Failed` and `Interrupted` are terminal; no transition ever
/// leaves them.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Interrupted,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Success | ExecutionStatus::Failed | ExecutionStatus::Interrupted
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }
}

/// One record per externally observed attempt against a device.
///
/// Retries inside the polling client do not create additional rows; the
/// `attempt` field stays 0 for primary dispatches.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Execution {
    pub id: ExecutionId,
    pub node_id: NodeId,
    pub device_id: DeviceId,
    pub status: ExecutionStatus,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub error_message: Option<String>,
    pub result_summary: Option<serde_json::Value>,
    pub worker_id: Option<String>,
}

impl Execution {
    pub fn new(node_id: NodeId, device_id: DeviceId) -> Self {
        Self {
            id: Uuid::new_v4(),
            node_id,
            device_id,
            status: ExecutionStatus::Pending,
            attempt: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            duration_ms: None,
            error_message: None,
            result_summary: None,
            worker_id: None,
        }
    }

    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_seconds()
    }
}
