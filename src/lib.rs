//! # oltpoll
//!
//! Coordinates periodic polling tasks against a fleet of network access
//! devices (OLTs): work is serialized per device, hourly completion quotas
//! are tracked per task class, and dependent tasks chain off their
//! master's completion within device-scoped execution graphs.
//!
//! ## Architecture Overview
//!
//! - **[`graph`]**: per-device task graphs built from reusable templates,
//!   with chain edges and acyclicity enforced at edge creation
//! - **[`ledger`]**: the execution record and its state machine, plus the
//!   reconciliation job that catches vanished queue tasks
//! - **[`quota`]**: hourly-bucketed quota trackers, the end-of-period
//!   audit, and violation notification
//! - **[`lock`]**: per-device mutual exclusion with TTL safety release
//! - **[`dispatch`]**: typed task queues and the worker pools that drain
//!   them, decoupled from the coordinator's clock
//! - **[`coordinator`]**: the tick loop: drift correction, change
//!   detection, scheduling, and mode-change handling
//! - **[`system`]**: wiring of all subsystems plus the operator surface
//!
//! Control flow: coordinator tick, then per enabled device: drift
//! correction, change detection, scheduler pass. The scheduler acquires
//! the device lock, creates a Pending execution, and enqueues it; a worker
//! runs the device I/O and reports back through the completion sink, which
//! finalizes the ledger row, updates the quota tracker, reschedules the
//! node, and dispatches any chain nodes.

/// Per-device task graphs, chain edges, and templates.
pub mod graph;

/// Execution records, the state machine, and reconciliation.
pub mod ledger;

/// Hourly quota bookkeeping, auditing, and violation notification.
pub mod quota;

/// Per-device mutual exclusion with TTL safety release.
pub mod lock;

/// Typed task queues, handler registry, and worker pools.
pub mod dispatch;

/// The outer control loop: ticks, drift, change detection, mode handling.
pub mod coordinator;

/// Structured, queryable audit trail.
pub mod events;

/// External collaborator seams: device inventory and index resolution.
pub mod registry;

/// Configuration loading and the TTL-bounded timeout cache.
pub mod config;

/// High-level system wiring and the operator surface.
pub mod system;

/// Command line interface.
pub mod cli;

// Re-export the main types
pub use config::{PollerConfig, SharedConfig};
pub use coordinator::{ExecutionCoordinator, ExecutionMode, ModeController};
pub use dispatch::{MockPollingClient, PollingClient, QueueName};
pub use events::{EventLevel, EventLog, EventType};
pub use graph::{NodePriority, NodeSpec, PollGraph, PollNode, TaskClass, TaskTemplate};
pub use ledger::{Execution, ExecutionLedger, ExecutionStatus};
pub use lock::{DeviceLockRegistry, LockToken};
pub use quota::{QuotaBook, QuotaStatus, QuotaTracker};
pub use registry::{DeviceRef, DeviceRegistry, IndexResolver, StaticDeviceRegistry};
pub use system::{PollerSystem, SystemStatus};
