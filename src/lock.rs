use crate::registry::DeviceId;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, warn};
use uuid::Uuid;

/// Proof of lock ownership handed to whoever acquired the device.
///
/// Releasing or re-affirming a lock requires the token, so a lock that
/// expired and was re-acquired by someone else cannot be released by the
/// original holder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockToken {
    pub device_id: DeviceId,
    pub token: Uuid,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
struct HeldLock {
    token: Uuid,
    expires_at: DateTime<Utc>,
}

/// Per-device mutual exclusion with a timeout-based safety release.
///
/// Acquisition is non-blocking: a busy device simply reports contention and
/// the caller tries again on its next pass. The TTL is a safety net so a
/// crashed holder cannot keep a device stuck forever.
pub struct DeviceLockRegistry {
    locks: DashMap<DeviceId, HeldLock>,
    default_ttl: Duration,
}

impl DeviceLockRegistry {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            default_ttl,
        }
    }

    /// Try to acquire the lock for a device. Returns `None` when the device
    /// is held by a live (non-expired) owner.
    pub fn try_acquire(&self, device_id: DeviceId, ttl: Option<Duration>) -> Option<LockToken> {
        let now = Utc::now();
        let ttl = ttl.unwrap_or(self.default_ttl);
        let token = Uuid::new_v4();

        match self.locks.entry(device_id) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at > now {
                    return None;
                }
                // Previous holder's TTL lapsed; evict and take over.
                warn!(
                    "Lock for device {} expired while held, reclaiming",
                    device_id
                );
                occupied.insert(HeldLock {
                    token,
                    expires_at: now + ttl,
                });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(HeldLock {
                    token,
                    expires_at: now + ttl,
                });
            }
        }

        debug!("Acquired lock for device {}", device_id);
        Some(LockToken {
            device_id,
            token,
            acquired_at: now,
        })
    }

    /// Release a lock. Returns false when the token no longer owns the lock
    /// (expired and reclaimed, or already released).
    pub fn release(&self, token: &LockToken) -> bool {
        let removed = self
            .locks
            .remove_if(&token.device_id, |_, held| held.token == token.token)
            .is_some();
        if removed {
            debug!("Released lock for device {}", token.device_id);
        }
        removed
    }

    /// Check whether the token still owns a live lock. Workers call this
    /// right before device I/O to re-affirm ownership.
    pub fn is_valid(&self, token: &LockToken) -> bool {
        self.locks
            .get(&token.device_id)
            .map(|held| held.token == token.token && held.expires_at > Utc::now())
            .unwrap_or(false)
    }

    /// Whether any live lock is held for the device.
    pub fn is_held(&self, device_id: DeviceId) -> bool {
        self.locks
            .get(&device_id)
            .map(|held| held.expires_at > Utc::now())
            .unwrap_or(false)
    }

    /// Number of live locks, used by status reporting.
    pub fn held_count(&self) -> usize {
        let now = Utc::now();
        self.locks
            .iter()
            .filter(|entry| entry.value().expires_at > now)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> DeviceLockRegistry {
        DeviceLockRegistry::new(Duration::seconds(60))
    }

    #[test]
    fn second_acquire_is_contention() {
        let locks = registry();
        let device = Uuid::new_v4();

        let token = locks.try_acquire(device, None).unwrap();
        assert!(locks.try_acquire(device, None).is_none());
        assert!(locks.is_valid(&token));
        assert!(locks.is_held(device));
    }

    #[test]
    fn release_frees_the_device() {
        let locks = registry();
        let device = Uuid::new_v4();

        let token = locks.try_acquire(device, None).unwrap();
        assert!(locks.release(&token));
        assert!(!locks.is_valid(&token));
        assert!(locks.try_acquire(device, None).is_some());
    }

    #[test]
    fn double_release_is_a_noop() {
        let locks = registry();
        let device = Uuid::new_v4();

        let token = locks.try_acquire(device, None).unwrap();
        assert!(locks.release(&token));
        assert!(!locks.release(&token));
    }

    #[test]
    fn expired_lock_is_reclaimed() {
        let locks = registry();
        let device = Uuid::new_v4();

        let stale = locks
            .try_acquire(device, Some(Duration::seconds(-1)))
            .unwrap();
        // TTL already lapsed, so a new acquire takes over.
        let fresh = locks.try_acquire(device, None).unwrap();

        assert!(!locks.is_valid(&stale));
        assert!(locks.is_valid(&fresh));
        // The stale token must not be able to release the new holder.
        assert!(!locks.release(&stale));
        assert!(locks.is_valid(&fresh));
    }

    #[test]
    fn locks_are_independent_per_device() {
        let locks = registry();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let _token_a = locks.try_acquire(a, None).unwrap();
        assert!(locks.try_acquire(b, None).is_some());
        assert_eq!(locks.held_count(), 2);
    }
}
