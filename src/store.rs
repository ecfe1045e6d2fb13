//! Aggregated spot storage with incremental statistics and age-based eviction.
//!
//! Every raw spot folds into the record keyed by its spotted callsign and
//! rounded frequency. All access goes through one lock, so readers only ever
//! see fully applied updates, and they get copies rather than references.
//!
//! Display filters (`min_snr`, `max_age`) are applied at read time. The
//! retention ceiling bounds memory no matter how the display is filtered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use crate::spot::{AggregatedSpot, RawSpot};

/// Default retention ceiling. Longer than any display age filter.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60 * 60);

/// Result of folding one spot into the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upsert {
    /// Key of the record that was created or updated.
    pub key: String,
    /// Spot count of that record after the update.
    pub spot_count: u32,
    /// Whether the record is new.
    pub created: bool,
}

/// Thread-safe store of aggregated spots.
#[derive(Debug)]
pub struct SpotStore {
    spots: RwLock<HashMap<String, AggregatedSpot>>,

    /// Maximum age before a record is evicted.
    retention: Duration,

    /// Count of records removed by eviction sweeps.
    pub evicted_total: AtomicU64,
}

impl SpotStore {
    /// Create a store with the default retention ceiling.
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            spots: RwLock::new(HashMap::new()),
            retention,
            evicted_total: AtomicU64::new(0),
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, AggregatedSpot>> {
        self.spots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, AggregatedSpot>> {
        self.spots.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fold a spot into its record, creating the record if needed.
    pub fn upsert(&self, spot: RawSpot) -> Upsert {
        let key = spot.key();
        let mut spots = self.write();

        if let Some(existing) = spots.get_mut(&key) {
            existing.update(&spot);
            let spot_count = existing.spot_count;
            return Upsert {
                key,
                spot_count,
                created: false,
            };
        }

        spots.insert(key.clone(), AggregatedSpot::from_raw(&spot));
        Upsert {
            key,
            spot_count: 1,
            created: true,
        }
    }

    /// Remove every record older than the retention ceiling.
    ///
    /// Returns the number of records removed.
    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Instant::now())
    }

    /// [`evict_expired`](Self::evict_expired) measured against `now`.
    pub fn evict_expired_at(&self, now: Instant) -> usize {
        let retention = self.retention;
        let mut spots = self.write();
        let before = spots.len();
        spots.retain(|_, spot| spot.age_at(now) <= retention);
        let removed = before - spots.len();
        if removed > 0 {
            self.evicted_total.fetch_add(removed as u64, Relaxed);
        }
        removed
    }

    /// Copies of the records passing the display filter, lowest frequency first.
    ///
    /// `max_age` larger than the retention ceiling is treated as the ceiling.
    pub fn query(&self, min_snr: i32, max_age: Duration) -> Vec<AggregatedSpot> {
        self.query_at(min_snr, max_age, Instant::now())
    }

    /// [`query`](Self::query) measured against `now`.
    pub fn query_at(&self, min_snr: i32, max_age: Duration, now: Instant) -> Vec<AggregatedSpot> {
        let max_age = max_age.min(self.retention);
        let mut result: Vec<AggregatedSpot> = self
            .read()
            .values()
            .filter(|spot| spot.highest_snr >= min_snr && spot.age_at(now) <= max_age)
            .cloned()
            .collect();
        result.sort_by(|a, b| a.frequency_khz.total_cmp(&b.frequency_khz));
        result
    }

    /// Copy out one record.
    pub fn get(&self, key: &str) -> Option<AggregatedSpot> {
        self.read().get(key).cloned()
    }

    /// Remove all records.
    pub fn clear(&self) {
        self.write().clear();
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl Default for SpotStore {
    fn default() -> Self {
        Self::new()
    }
}
