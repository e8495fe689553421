use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;

/// Top-level configuration for the polling coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Coordinator tick period in seconds
    pub tick_interval_secs: u64,
    /// Safety TTL for device locks in seconds
    pub lock_ttl_secs: i64,
    /// Age after which a Pending execution is eligible for reconciliation
    pub reconcile_grace_secs: i64,
    /// Minimum interval for a master node to be rescheduled on a mode flip
    pub mode_reschedule_min_interval_secs: u32,
    /// In-memory audit trail capacity
    pub event_log_capacity: usize,
    /// Webhook endpoint for quota violation notifications
    pub violation_webhook: Option<String>,
    pub quota: QuotaConfig,
    pub dispatch: DispatchConfig,
    pub retention: RetentionConfig,
    pub device_timeouts: DeviceTimeouts,
}

/// Quota bookkeeping parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Length of a quota period in seconds
    pub period_secs: i64,
    /// Gap between elapsed-fraction and completion-fraction, in percentage
    /// points, above which a tracker is flagged at risk
    pub at_risk_margin_pct: f64,
    /// Completion percentage below which the audit raises a violation
    pub completion_threshold_pct: f64,
}

/// Worker pool and queue sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub queue_capacity: usize,
    pub workers_per_queue: usize,
    /// Lock acquisition attempts for chain-triggered work
    pub chain_lock_retries: u32,
    pub chain_lock_retry_delay_ms: u64,
}

/// Age-based bulk cleanup thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub execution_max_age_hours: i64,
    pub quota_max_age_hours: i64,
}

/// Device I/O parameters consumed by workers through the timeout cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceTimeouts {
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    /// Retries inside the polling client; one Execution regardless
    pub client_retries: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 5,
            lock_ttl_secs: 120,
            reconcile_grace_secs: 300,
            mode_reschedule_min_interval_secs: 300,
            event_log_capacity: 4096,
            violation_webhook: None,
            quota: QuotaConfig::default(),
            dispatch: DispatchConfig::default(),
            retention: RetentionConfig::default(),
            device_timeouts: DeviceTimeouts::default(),
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            period_secs: 3600,
            at_risk_margin_pct: 20.0,
            completion_threshold_pct: 50.0,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            workers_per_queue: 2,
            chain_lock_retries: 5,
            chain_lock_retry_delay_ms: 200,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            execution_max_age_hours: 72,
            quota_max_age_hours: 24 * 14,
        }
    }
}

impl Default for DeviceTimeouts {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            read_timeout_secs: 30,
            client_retries: 2,
        }
    }
}

impl PollerConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: PollerConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_secs == 0 {
            anyhow::bail!("tick_interval_secs must be positive");
        }
        if self.quota.period_secs <= 0 {
            anyhow::bail!("quota.period_secs must be positive");
        }
        if !(0.0..=100.0).contains(&self.quota.completion_threshold_pct) {
            anyhow::bail!("quota.completion_threshold_pct must be between 0 and 100");
        }
        if let Some(ref webhook) = self.violation_webhook {
            url::Url::parse(webhook)
                .with_context(|| format!("Invalid violation_webhook URL: {webhook}"))?;
        }
        Ok(())
    }

    pub fn tick_period(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.tick_interval_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::seconds(self.lock_ttl_secs)
    }
}

/// Live configuration handle with change notification.
///
/// Updates bump a version published on a watch channel so cached readers
/// can invalidate without polling the full config on every access.
pub struct SharedConfig {
    inner: RwLock<PollerConfig>,
    version_tx: watch::Sender<u64>,
}

impl SharedConfig {
    pub fn new(config: PollerConfig) -> Self {
        let (version_tx, _) = watch::channel(0);
        Self {
            inner: RwLock::new(config),
            version_tx,
        }
    }

    pub fn get(&self) -> PollerConfig {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn update(&self, mutate: impl FnOnce(&mut PollerConfig)) {
        {
            let mut guard = match self.inner.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            mutate(&mut guard);
        }
        self.version_tx.send_modify(|v| *v += 1);
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    pub fn version(&self) -> u64 {
        *self.version_tx.borrow()
    }
}

#[derive(Clone)]
struct CachedTimeouts {
    value: DeviceTimeouts,
    loaded_at: DateTime<Utc>,
    version: u64,
}

/// TTL-bounded cache over the device-timeout block.
///
/// Workers read timeouts on every operation; the cache avoids taking the
/// full config lock each time while the watch version guarantees an update
/// is observed no later than the next read.
pub struct TimeoutCache {
    config: Arc<SharedConfig>,
    ttl: Duration,
    cached: Mutex<Option<CachedTimeouts>>,
}

impl TimeoutCache {
    pub fn new(config: Arc<SharedConfig>, ttl: Duration) -> Self {
        Self {
            config,
            ttl,
            cached: Mutex::new(None),
        }
    }

    pub fn get(&self) -> DeviceTimeouts {
        let now = Utc::now();
        let current_version = self.config.version();

        let mut cached = match self.cached.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(ref entry) = *cached {
            if entry.version == current_version && now - entry.loaded_at < self.ttl {
                return entry.value.clone();
            }
        }

        let value = self.config.get().device_timeouts;
        *cached = Some(CachedTimeouts {
            value: value.clone(),
            loaded_at: now,
            version: current_version,
        });
        value
    }
}
