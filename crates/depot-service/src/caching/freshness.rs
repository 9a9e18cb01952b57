use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::{CacheKey, CacheName};

/// A confirmation that an artifact was fresh.
#[derive(Debug, Clone, Copy)]
struct Confirmation {
    confirmed: SystemTime,
    /// The modification time of the artifact at the time it was confirmed.
    modified: SystemTime,
}

/// Remembers when artifacts were last confirmed to be fresh.
///
/// This is purely an optimization that saves file system and origin checks. Records that are
/// missing or were evicted make the next check fall through to the file system.
///
/// A record is only trusted for the configured `ttl`. With a `ttl` of zero nothing is recorded.
#[derive(Debug, Clone)]
pub struct FreshnessRecord {
    ttl: Duration,
    confirmations: Option<moka::sync::Cache<CacheKey, Confirmation>>,
}

impl FreshnessRecord {
    pub fn new(name: CacheName, ttl: Duration, capacity: u64) -> Self {
        let confirmations = (!ttl.is_zero()).then(|| {
            moka::sync::Cache::builder()
                .name(name.as_ref())
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build()
        });
        Self { ttl, confirmations }
    }

    /// Returns the recorded modification time of `key` if it was confirmed fresh within the
    /// last `ttl`.
    ///
    /// This does not touch the file system, the artifact may have been removed since.
    pub fn fresh_modified(&self, key: &CacheKey) -> Option<SystemTime> {
        let confirmation = self.confirmations.as_ref()?.get(key)?;
        within_ttl(confirmation.confirmed, self.ttl, SystemTime::now())
            .then_some(confirmation.modified)
    }

    /// Records that `key`, last modified at `modified`, was known to be fresh at `confirmed`.
    pub fn confirm(&self, key: &CacheKey, confirmed: SystemTime, modified: SystemTime) {
        if let Some(confirmations) = &self.confirmations {
            confirmations.insert(
                key.clone(),
                Confirmation {
                    confirmed,
                    modified,
                },
            );
        }
    }

    /// Drops the record of `key`, so the next check goes to the file system.
    pub fn forget(&self, key: &CacheKey) {
        if let Some(confirmations) = &self.confirmations {
            confirmations.invalidate(key);
        }
    }
}

/// Whether `timestamp` lies within `ttl` before `now`.
///
/// Timestamps are compared with whole seconds, matching the resolution file systems are
/// guaranteed to have. A `ttl` of zero is never satisfied.
pub fn within_ttl(timestamp: SystemTime, ttl: Duration, now: SystemTime) -> bool {
    unix_secs(timestamp) > unix_secs(now).saturating_sub(ttl.as_secs())
}

/// Seconds since the unix epoch, saturating at zero for earlier times.
pub fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}
