use std::collections::{HashMap, HashSet};

use super::Engine;
use crate::model::{Room, RoomId};

/// Lookup table from the strings timetable entries use as locations to canonical room ids.
///
/// Precedence: exact id, then exact label, then case-insensitive label. Labels
/// shared by several rooms resolve to the smallest id.
#[derive(Debug, Default)]
pub struct RoomIndex {
    ids: HashSet<RoomId>,
    by_label: HashMap<String, RoomId>,
    by_folded_label: HashMap<String, RoomId>,
}

impl RoomIndex {
    pub fn build<'a>(rooms: impl IntoIterator<Item = &'a Room>) -> Self {
        let mut index = RoomIndex::default();
        for room in rooms {
            index.insert(&room.id, &room.label);
        }
        index
    }

    fn insert(&mut self, id: &str, label: &str) {
        self.ids.insert(id.to_string());
        let label = label.trim();
        if label.is_empty() {
            return;
        }
        keep_smallest(&mut self.by_label, label.to_string(), id);
        keep_smallest(&mut self.by_folded_label, label.to_lowercase(), id);
    }

    pub fn resolve(&self, raw: &str) -> Option<&str> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if let Some(id) = self.ids.get(raw) {
            return Some(id.as_str());
        }
        self.by_label
            .get(raw)
            .or_else(|| self.by_folded_label.get(&raw.to_lowercase()))
            .map(String::as_str)
    }
}

fn keep_smallest(map: &mut HashMap<String, RoomId>, key: String, id: &str) {
    match map.get_mut(&key) {
        Some(existing) if existing.as_str() <= id => {}
        Some(existing) => *existing = id.to_string(),
        None => {
            map.insert(key, id.to_string());
        }
    }
}

impl Engine {
    pub(super) fn room_index(&self) -> RoomIndex {
        let mut index = RoomIndex::default();
        for room in self.rooms.iter() {
            index.insert(&room.id, &room.label);
        }
        index
    }

    /// Map a location string (canonical id or legacy label) to a canonical room id.
    pub fn resolve_room_identity(&self, raw: &str) -> Option<RoomId> {
        self.room_index().resolve(raw).map(str::to_string)
    }
}
