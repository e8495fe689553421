use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::warn;

/// Process-wide execution mode.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Dry runs against the mock client; nothing touches real devices
    Simulation,
    /// Real device I/O
    Live,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Simulation => "simulation",
            ExecutionMode::Live => "live",
        }
    }
}

/// Versioned mode value published to subscribers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModeState {
    pub mode: ExecutionMode,
    pub version: u64,
    pub changed_at: DateTime<Utc>,
}

/// Owner of the execution mode.
///
/// Consumers subscribe to the watch channel instead of polling a shared
/// global; every transition bumps the version so a consumer can tell
/// exactly which flips it has already reacted to.
pub struct ModeController {
    tx: watch::Sender<ModeState>,
}

impl ModeController {
    pub fn new(initial: ExecutionMode) -> Self {
        let (tx, _) = watch::channel(ModeState {
            mode: initial,
            version: 0,
            changed_at: Utc::now(),
        });
        Self { tx }
    }

    pub fn current(&self) -> ModeState {
        *self.tx.borrow()
    }

    /// Switch modes. Returns the new state, or `None` when the requested
    /// mode is already active (no version bump, no notification).
    pub fn set_mode(&self, mode: ExecutionMode) -> Option<ModeState> {
        let current = self.current();
        if current.mode == mode {
            return None;
        }

        let next = ModeState {
            mode,
            version: current.version + 1,
            changed_at: Utc::now(),
        };
        warn!(
            "Execution mode changing: {} -> {} (version {})",
            current.mode.as_str(),
            mode.as_str(),
            next.version
        );
        let _ = self.tx.send(next);
        Some(next)
    }

    pub fn subscribe(&self) -> watch::Receiver<ModeState> {
        self.tx.subscribe()
    }
}
