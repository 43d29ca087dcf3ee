use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;
use ulid::Ulid;

use super::Engine;
use crate::interval::Weekday;
use crate::model::{RoomId, TimetableEntry};
use crate::observability::CACHE_REFRESHES_TOTAL;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedEntry {
    pub class_group_id: Ulid,
    pub class_group_name: String,
    pub entry: TimetableEntry,
}

/// Room → class entries, as of one point in time.
#[derive(Debug, Default)]
pub struct TimetableSnapshot {
    by_room: HashMap<RoomId, Vec<CachedEntry>>,
    refreshed_at: Option<Instant>,
    generation: u64,
}

impl TimetableSnapshot {
    pub fn room(&self, room_id: &str) -> &[CachedEntry] {
        self.by_room.get(room_id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.by_room.len()
    }

    pub fn refreshed_at(&self) -> Option<Instant> {
        self.refreshed_at
    }
}

/// Time-bounded projection of every class group's entries, keyed by resolved room.
///
/// Rebuilt wholesale and swapped in atomically; readers always see a complete map.
pub struct TimetableCache {
    current: ArcSwap<TimetableSnapshot>,
    timeout: Duration,
    generation: AtomicU64,
    rebuilding: Mutex<()>,
}

impl TimetableCache {
    pub fn new(timeout: Duration) -> Self {
        Self {
            current: ArcSwap::from_pointee(TimetableSnapshot::default()),
            timeout,
            generation: AtomicU64::new(0),
            rebuilding: Mutex::new(()),
        }
    }

    /// Mark the current snapshot stale. The next read rebuilds.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        let snapshot = self.current.load();
        match snapshot.refreshed_at {
            None => true,
            Some(at) => {
                snapshot.generation != self.generation.load(Ordering::Acquire)
                    || now.saturating_duration_since(at) >= self.timeout
            }
        }
    }

    /// Current snapshot, rebuilding it first if stale. While another caller is
    /// rebuilding, the previous snapshot is returned.
    pub fn get_or_refresh_at(
        &self,
        now: Instant,
        rebuild: impl FnOnce() -> HashMap<RoomId, Vec<CachedEntry>>,
    ) -> Arc<TimetableSnapshot> {
        if !self.is_stale(now) {
            return self.current.load_full();
        }
        let Ok(_guard) = self.rebuilding.try_lock() else {
            return self.current.load_full();
        };
        // Read before scanning so an invalidation during the rebuild leaves it stale.
        let generation = self.generation.load(Ordering::Acquire);
        let snapshot = Arc::new(TimetableSnapshot {
            by_room: rebuild(),
            refreshed_at: Some(now),
            generation,
        });
        metrics::counter!(CACHE_REFRESHES_TOTAL).increment(1);
        debug!(rooms = snapshot.by_room.len(), generation, "timetable cache rebuilt");
        self.current.store(snapshot.clone());
        snapshot
    }
}

impl Engine {
    fn build_room_projection(&self) -> HashMap<RoomId, Vec<CachedEntry>> {
        let rooms = self.room_index();
        let mut by_room: HashMap<RoomId, Vec<CachedEntry>> = HashMap::new();
        for group in self.class_groups.iter() {
            for entry in &group.entries {
                let Some(room) = rooms.resolve(&entry.location) else { continue };
                by_room.entry(room.to_string()).or_default().push(CachedEntry {
                    class_group_id: group.id,
                    class_group_name: group.name.clone(),
                    entry: entry.clone(),
                });
            }
        }
        for entries in by_room.values_mut() {
            entries.sort_by_key(|c| (c.entry.day, c.entry.span.start(), c.class_group_id));
        }
        by_room
    }

    pub fn timetable_snapshot(&self) -> Arc<TimetableSnapshot> {
        self.cache.get_or_refresh_at(Instant::now(), || self.build_room_projection())
    }

    /// Weekly class schedule of a room, from the cache. Display only.
    pub fn room_timetable(&self, room_id: &str) -> Vec<CachedEntry> {
        self.timetable_snapshot().room(room_id).to_vec()
    }

    /// The room's cached entries on one weekday.
    pub fn cached_room_schedule(&self, room_id: &str, day: Weekday) -> Vec<CachedEntry> {
        self.timetable_snapshot()
            .room(room_id)
            .iter()
            .filter(|c| c.entry.day == day)
            .cloned()
            .collect()
    }
}
