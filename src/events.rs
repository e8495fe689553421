use crate::registry::DeviceId;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::RwLock;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Categories of audit trail entries
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    ExecutionDispatched,
    ExecutionFinished,
    ExecutionInterrupted,
    ExecutionReconciled,
    ChainTriggered,
    StructuralChange,
    DriftCorrected,
    ModeChanged,
    QuotaViolation,
    RetentionCleanup,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// Immutable audit trail entry
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct EventEntry {
    pub id: Uuid,
    pub event_type: EventType,
    pub level: EventLevel,
    pub device_id: Option<DeviceId>,
    pub message: String,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Bounded in-memory audit trail of scheduling decisions and execution
/// outcomes, with JSONL export for offline inspection.
pub struct EventLog {
    entries: RwLock<VecDeque<EventEntry>>,
    capacity: usize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    pub fn record(
        &self,
        event_type: EventType,
        level: EventLevel,
        device_id: Option<DeviceId>,
        message: impl Into<String>,
        details: serde_json::Value,
    ) {
        let entry = EventEntry {
            id: Uuid::new_v4(),
            event_type,
            level,
            device_id,
            message: message.into(),
            details,
            timestamp: Utc::now(),
        };

        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            // A poisoned log must never take the coordinator down.
            Err(poisoned) => poisoned.into_inner(),
        };
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Most recent entries, newest first.
    pub fn recent(&self, limit: usize) -> Vec<EventEntry> {
        let entries = match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.iter().rev().take(limit).cloned().collect()
    }

    /// Most recent entries for one device, newest first.
    pub fn recent_for_device(&self, device_id: DeviceId, limit: usize) -> Vec<EventEntry> {
        let entries = match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries
            .iter()
            .rev()
            .filter(|e| e.device_id == Some(device_id))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        match self.entries.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append the current contents to a JSONL file, oldest first.
    pub async fn flush_to(&self, path: &Path) -> Result<usize> {
        let snapshot: Vec<EventEntry> = {
            let entries = match self.entries.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            entries.iter().cloned().collect()
        };

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("Failed to open event log file {}", path.display()))?;

        for entry in &snapshot {
            let line = serde_json::to_string(entry).context("Failed to serialize event entry")?;
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
        }
        file.flush().await?;

        Ok(snapshot.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_query() {
        let log = EventLog::new(16);
        let device = Uuid::new_v4();

        log.record(
            EventType::StructuralChange,
            EventLevel::Info,
            Some(device),
            "node set changed",
            serde_json::json!({"nodes": 3}),
        );
        log.record(
            EventType::ExecutionDispatched,
            EventLevel::Debug,
            None,
            "dispatched",
            serde_json::Value::Null,
        );

        assert_eq!(log.len(), 2);
        let recent = log.recent(10);
        assert_eq!(recent[0].event_type, EventType::ExecutionDispatched);

        let for_device = log.recent_for_device(device, 10);
        assert_eq!(for_device.len(), 1);
        assert_eq!(for_device[0].event_type, EventType::StructuralChange);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let log = EventLog::new(2);
        for i in 0..3 {
            log.record(
                EventType::DriftCorrected,
                EventLevel::Debug,
                None,
                format!("entry {i}"),
                serde_json::Value::Null,
            );
        }
        assert_eq!(log.len(), 2);
        let recent = log.recent(2);
        assert_eq!(recent[0].message, "entry 2");
        assert_eq!(recent[1].message, "entry 1");
    }

    #[tokio::test]
    async fn flush_writes_jsonl() {
        let log = EventLog::new(8);
        log.record(
            EventType::ModeChanged,
            EventLevel::Warning,
            None,
            "mode flip",
            serde_json::json!({"from": "Simulation", "to": "Live"}),
        );

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let written = log.flush_to(&path).await.unwrap();
        assert_eq!(written, 1);

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: EventEntry = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(parsed.event_type, EventType::ModeChanged);
    }
}
