use coldchain_core::AlertLevel;
use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;

pub const DEFAULT_MAX_TRACKED_ALERTS: usize = 100_000;

/// Last emitted alert level per instrument, used only for edge detection.
///
/// Keys are `(organization_id, instrument_id)` so that one tenant's agent can
/// never disturb another tenant's state. Each observation is an atomic
/// read-modify-write on its key's shard; distinct instruments do not contend.
///
/// Only instruments currently in warning or critical hold an entry: a return
/// to normal removes the key, since an absent key already reads as normal.
/// Instrument ids come from agents, so the number of alerting entries is
/// capped. Once the cap is reached, new alerting instruments are neither
/// tracked nor notified until others recover. Concurrent inserts on
/// different shards may overshoot the cap slightly.
pub struct AlertStateStore {
    levels: DashMap<(String, String), AlertLevel>,
    tracked: AtomicUsize,
    max_tracked: usize,
}

impl Default for AlertStateStore {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_TRACKED_ALERTS)
    }
}

impl AlertStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_tracked: usize) -> Self {
        Self {
            levels: DashMap::new(),
            tracked: AtomicUsize::new(0),
            max_tracked: max_tracked.max(1),
        }
    }

    pub fn level(&self, organization_id: &str, instrument_id: &str) -> AlertLevel {
        self.levels
            .get(&(organization_id.to_string(), instrument_id.to_string()))
            .map(|entry| *entry.value())
            .unwrap_or_default()
    }

    /// Records `level` and returns the previous level when it changed.
    /// Returns `None` when the level is unchanged, or when the store is full
    /// and the instrument was not already tracked. Absent entries count as
    /// normal.
    pub fn observe(
        &self,
        organization_id: &str,
        instrument_id: &str,
        level: AlertLevel,
    ) -> Option<AlertLevel> {
        let key = (organization_id.to_string(), instrument_id.to_string());
        match self.levels.entry(key) {
            Entry::Occupied(mut entry) => {
                let previous = *entry.get();
                if previous == level {
                    return None;
                }
                if level == AlertLevel::Normal {
                    entry.remove();
                    self.tracked.fetch_sub(1, Ordering::SeqCst);
                } else {
                    entry.insert(level);
                }
                Some(previous)
            }
            Entry::Vacant(entry) => {
                if level == AlertLevel::Normal {
                    return None;
                }
                // the entry guard holds a shard lock, so the map itself must
                // not be counted here
                if self.tracked.load(Ordering::SeqCst) >= self.max_tracked {
                    warn!(
                        event = "alert_state_full",
                        organization_id,
                        instrument_id,
                        max_tracked = self.max_tracked
                    );
                    return None;
                }
                entry.insert(level);
                self.tracked.fetch_add(1, Ordering::SeqCst);
                Some(AlertLevel::Normal)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}
