use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use log::debug;

use crate::config::DEFAULT_PRESENCE_TIMEOUT_MS;

/// Identifies a posted notification so it can be cancelled later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotificationHandle(pub u32);

/// Hands out notification handles in a fixed order: 1, 2, 3, ...
///
/// Zero is never returned.
#[derive(Debug)]
pub struct HandleAllocator {
    next: AtomicU32,
}

impl HandleAllocator {
    pub fn new() -> Self {
        HandleAllocator {
            next: AtomicU32::new(1),
        }
    }

    pub fn allocate(&self) -> NotificationHandle {
        loop {
            let handle = self.next.fetch_add(1, Ordering::Relaxed);
            if handle != 0 {
                return NotificationHandle(handle);
            }
        }
    }
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// One entity reported by a scan cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection<K> {
    pub id: K,
    pub seen_at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceRecord {
    pub last_seen_ms: u64,
    pub handle: NotificationHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEvent<K> {
    pub id: K,
    pub handle: NotificationHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceUpdate<K> {
    pub entered: Vec<PresenceEvent<K>>,
    pub expired: Vec<PresenceEvent<K>>,
}

impl<K> PresenceUpdate<K> {
    pub fn is_empty(&self) -> bool {
        self.entered.is_empty() && self.expired.is_empty()
    }
}

/// TTL map of entities seen by recent scan cycles.
///
/// An entity enters the first time a cycle reports it and expires once no
/// cycle has reported it for `timeout_ms`. All access goes through one
/// mutex, so `update` may run on the scan callback while `reset` is called
/// from whoever owns the scan lifecycle.
#[derive(Debug)]
pub struct PresenceTracker<K> {
    records: Mutex<HashMap<K, PresenceRecord>>,
    handles: HandleAllocator,
    timeout_ms: u64,
}

impl<K> PresenceTracker<K>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    pub fn new(timeout_ms: u64) -> Self {
        PresenceTracker {
            records: Mutex::new(HashMap::new()),
            handles: HandleAllocator::new(),
            timeout_ms,
        }
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    fn records(&self) -> MutexGuard<'_, HashMap<K, PresenceRecord>> {
        // The map is consistent after every statement, so a panic elsewhere
        // can't leave it half-updated.
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Whether a timestamp is too old to count as a current sighting.
    pub fn is_stale(&self, timestamp_ms: u64, now_ms: u64) -> bool {
        now_ms.saturating_sub(timestamp_ms) >= self.timeout_ms
    }

    /// Folds one scan cycle into the map.
    pub fn update(&self, detections: &[Detection<K>], now_ms: u64) -> PresenceUpdate<K> {
        let current: HashSet<&K> = detections
            .iter()
            .filter(|d| !self.is_stale(d.seen_at_ms, now_ms))
            .map(|d| &d.id)
            .collect();

        let mut records = self.records();
        let mut entered = Vec::new();

        for detection in detections {
            if !current.contains(&detection.id) {
                continue;
            }
            match records.get_mut(&detection.id) {
                Some(record) => record.last_seen_ms = now_ms,
                None => {
                    let handle = self.handles.allocate();
                    records.insert(
                        detection.id.clone(),
                        PresenceRecord {
                            last_seen_ms: now_ms,
                            handle,
                        },
                    );
                    entered.push(PresenceEvent {
                        id: detection.id.clone(),
                        handle,
                    });
                }
            }
        }

        let mut expired = Vec::new();
        records.retain(|id, record| {
            if current.contains(id) || !self.is_stale(record.last_seen_ms, now_ms) {
                return true;
            }
            debug!(
                "{:?} unseen for {} ms",
                id,
                now_ms.saturating_sub(record.last_seen_ms)
            );
            expired.push(PresenceEvent {
                id: id.clone(),
                handle: record.handle,
            });
            false
        });

        PresenceUpdate { entered, expired }
    }

    /// Drops every record, returning them so their notifications can be
    /// cancelled.
    pub fn reset(&self) -> Vec<PresenceEvent<K>> {
        self.records()
            .drain()
            .map(|(id, record)| PresenceEvent {
                id,
                handle: record.handle,
            })
            .collect()
    }

    pub fn get(&self, id: &K) -> Option<PresenceRecord> {
        self.records().get(id).copied()
    }

    pub fn contains(&self, id: &K) -> bool {
        self.records().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }
}

impl<K> Default for PresenceTracker<K>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    fn default() -> Self {
        Self::new(DEFAULT_PRESENCE_TIMEOUT_MS)
    }
}
