use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for graph nodes
pub type NodeId = Uuid;

/// Category of polling operation. Doubles as the quota-tracking dimension
/// and the queue-selection key.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskClass {
    /// Subscriber discovery sweeps
    Discovery,
    /// Periodic value reads (optics, counters)
    ValueRead,
    /// Operator-triggered one-off runs
    Manual,
    /// Retention and housekeeping work
    Cleanup,
}

impl TaskClass {
    /// Fixed second-offset within the minute this class is expected to land
    /// on, so that discovery and read traffic never collide on a device.
    pub fn expected_second_offset(&self) -> Option<u32> {
        match self {
            TaskClass::Discovery => Some(0),
            TaskClass::ValueRead => Some(10),
            TaskClass::Manual | TaskClass::Cleanup => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskClass::Discovery => "discovery",
            TaskClass::ValueRead => "value_read",
            TaskClass::Manual => "manual",
            TaskClass::Cleanup => "cleanup",
        }
    }
}

/// Node priority levels with numeric values for ordering
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodePriority {
    Critical = 10,
    High = 8,
    Normal = 5,
    Low = 3,
    Background = 1,
}

impl NodePriority {
    pub fn value(&self) -> u8 {
        *self as u8
    }
}

/// Per-field protection flags. A set flag pins the field against template
/// resynchronization.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FieldOverrides {
    pub interval: bool,
    pub priority: bool,
    pub enabled: bool,
    pub parameters: bool,
}

/// A schedulable unit of work within a device's task graph.
///
/// Master nodes run on their own clock; chain nodes carry a master
/// reference and are scheduled only by their master's completion, never by
/// the time-based due query.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PollNode {
    pub id: NodeId,
    pub key: String,
    pub name: String,
    pub task_class: TaskClass,
    pub interval_seconds: u32,
    pub priority: NodePriority,
    pub enabled: bool,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub is_chain_node: bool,
    pub master_node: Option<NodeId>,
    pub template_id: Option<Uuid>,
    pub overrides: FieldOverrides,
    pub parameters: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Specification for creating a node
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct NodeSpec {
    pub key: String,
    pub name: String,
    pub task_class: TaskClass,
    pub interval_seconds: u32,
    pub priority: NodePriority,
    pub enabled: bool,
    /// Key of the master node when this is a chain node
    pub master_key: Option<String>,
    pub parameters: serde_json::Value,
}

impl NodeSpec {
    pub fn new(key: &str, task_class: TaskClass, interval_seconds: u32) -> Self {
        Self {
            key: key.to_string(),
            name: key.to_string(),
            task_class,
            interval_seconds,
            priority: NodePriority::Normal,
            enabled: true,
            master_key: None,
            parameters: serde_json::Value::Null,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_priority(mut self, priority: NodePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn chained_to(mut self, master_key: &str) -> Self {
        self.master_key = Some(master_key.to_string());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }
}

impl PollNode {
    pub fn interval(&self) -> Duration {
        Duration::seconds(self.interval_seconds as i64)
    }

    /// Eligible for the scheduler's time-based query.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && !self.is_chain_node && self.next_run_at <= now
    }

    /// Bookkeeping after a successful run. The next run is computed from
    /// the callback time, not the originally scheduled time, so a delayed
    /// run never causes a burst of catch-up runs.
    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.last_run_at = Some(at);
        self.last_success_at = Some(at);
        self.consecutive_failures = 0;
        self.next_run_at = at + self.interval();
        self.updated_at = at;
    }

    /// Bookkeeping after a failed run.
    pub fn record_failure(&mut self, at: DateTime<Utc>) {
        self.last_run_at = Some(at);
        self.last_failure_at = Some(at);
        self.consecutive_failures += 1;
        self.next_run_at = at + self.interval();
        self.updated_at = at;
    }
}

/// Edge kinds in the execution-precedence graph
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeType {
    /// Downstream is dispatched on upstream's successful completion
    Chain,
    /// Documents precedence without driving dispatch
    Precedence,
}

/// Trigger condition carried by an edge; chain edges default to `Always`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub enum EdgeCondition {
    Always,
    /// Fire only when the upstream run finished under the given duration
    MasterDurationUnderMs(u64),
    /// Fire only while the downstream's failure streak is below the limit
    MaxConsecutiveFailures(u32),
}

impl EdgeCondition {
    pub fn satisfied(&self, master_duration_ms: u64, downstream: &PollNode) -> bool {
        match self {
            EdgeCondition::Always => true,
            EdgeCondition::MasterDurationUnderMs(limit) => master_duration_ms < *limit,
            EdgeCondition::MaxConsecutiveFailures(limit) => {
                downstream.consecutive_failures < *limit
            }
        }
    }
}

/// Ordered execution-precedence edge between two nodes of one graph
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct GraphEdge {
    pub upstream: NodeId,
    pub downstream: NodeId,
    pub edge_type: EdgeType,
    pub condition: EdgeCondition,
}
