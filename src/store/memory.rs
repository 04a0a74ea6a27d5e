//! Process-local counter store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use super::CounterStore;
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;

/// Expired entries are swept out after this many writes.
const PURGE_INTERVAL: u64 = 1024;

/// How [`MemoryStore::increment`] treats its keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IncrementMode {
    /// Create missing keys with a value of 1.
    #[default]
    Upsert,
    /// Fail with `KeyMissing` on absent keys, like memcached's `incr`.
    ExistingOnly,
    /// Do not offer increment at all.
    Unsupported,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    value: i64,
    expires_at: u64,
}

impl Slot {
    fn new(value: i64, now: u64, ttl_secs: u64) -> Self {
        Self {
            value,
            expires_at: now.saturating_add(ttl_secs),
        }
    }

    fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

/// A counter store held in process memory.
///
/// Each shard of the underlying map is locked for the duration of a single
/// operation, so `increment` in [`IncrementMode::Upsert`] never loses an
/// update. Counts are not shared with other processes; running one store per
/// instance trades cross-instance accuracy for having no external service.
pub struct MemoryStore {
    entries: DashMap<String, Slot>,
    clock: Arc<dyn Clock>,
    mode: IncrementMode,
    writes: AtomicU64,
}

impl MemoryStore {
    /// Create a store on the system clock with atomic upserting increments.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store that reads time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            mode: IncrementMode::default(),
            writes: AtomicU64::new(0),
        }
    }

    /// Change how `increment` behaves.
    pub fn with_increment_mode(mut self, mode: IncrementMode) -> Self {
        self.mode = mode;
        self
    }

    /// Number of entries held, expired ones included until the next sweep.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry whose TTL has run out.
    pub fn purge_expired(&self) {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, slot| !slot.is_expired(now));
        trace!(
            removed = before.saturating_sub(self.entries.len()),
            "Purged expired counters"
        );
    }

    // Must not be called while holding a reference into the map.
    fn note_write(&self) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % PURGE_INTERVAL == 0 {
            self.purge_expired();
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str, ttl_secs: u64) -> Result<i64, StoreError> {
        let now = self.clock.now();

        let value = match self.mode {
            IncrementMode::Unsupported => return Err(StoreError::Unsupported),
            IncrementMode::ExistingOnly => {
                let mut slot = match self.entries.get_mut(key) {
                    Some(slot) if !slot.is_expired(now) => slot,
                    _ => return Err(StoreError::KeyMissing),
                };
                slot.value += 1;
                slot.value
            }
            IncrementMode::Upsert => {
                let mut slot = self
                    .entries
                    .entry(key.to_string())
                    .or_insert_with(|| Slot::new(0, now, ttl_secs));
                if slot.is_expired(now) {
                    *slot = Slot::new(0, now, ttl_secs);
                }
                slot.value += 1;
                slot.value
            }
        };

        self.note_write();
        Ok(value)
    }

    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let now = self.clock.now();
        Ok(self
            .entries
            .get(key)
            .and_then(|slot| (!slot.is_expired(now)).then_some(slot.value)))
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: i64,
        ttl_secs: u64,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();

        let created = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(Slot::new(value, now, ttl_secs));
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::new(value, now, ttl_secs));
                true
            }
        };

        if created {
            self.note_write();
        }
        Ok(created)
    }

    async fn set(&self, key: &str, value: i64, ttl_secs: u64) -> Result<(), StoreError> {
        let now = self.clock.now();
        self.entries
            .insert(key.to_string(), Slot::new(value, now, ttl_secs));
        self.note_write();
        Ok(())
    }
}
