use std::collections::HashSet;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

fn by_slot(a: &TimetableEntry, b: &TimetableEntry) -> std::cmp::Ordering {
    (a.day, a.span.start(), a.span.end()).cmp(&(b.day, b.span.start(), b.span.end()))
}

fn sort_reservations(list: &mut [Reservation]) {
    list.sort_by(|a, b| (a.date, a.span.start(), a.id).cmp(&(b.date, b.span.start(), b.id)));
}

impl Engine {
    pub fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.require_reservation(id)
    }

    pub fn get_room(&self, id: &str) -> Result<Room, EngineError> {
        self.require_room(id)
    }

    pub fn get_user(&self, id: Ulid) -> Result<User, EngineError> {
        self.require_user(id)
    }

    pub fn class_group(&self, id: Ulid) -> Result<ClassGroup, EngineError> {
        self.require_class_group(id)
    }

    /// All rooms ordered by label.
    pub fn list_rooms(&self) -> Vec<Room> {
        let mut rooms: Vec<Room> = self.rooms.iter().map(|r| r.clone()).collect();
        rooms.sort_by(|a, b| a.label.cmp(&b.label).then_with(|| a.id.cmp(&b.id)));
        rooms
    }

    /// Reservations of one room on one date in any of `statuses` (all statuses when empty).
    pub fn reservations_for_room_on(
        &self,
        room_id: &str,
        date: NaiveDate,
        statuses: &[ReservationStatus],
    ) -> Vec<Reservation> {
        let key = (room_id.to_string(), date);
        let Some(ids) = self.room_day_index.get(&key).map(|ids| ids.clone()) else {
            return Vec::new();
        };
        let mut list: Vec<Reservation> = ids
            .iter()
            .filter_map(|id| self.reservations.get(id).map(|r| r.clone()))
            .filter(|r| statuses.is_empty() || statuses.contains(&r.status))
            .collect();
        sort_reservations(&mut list);
        list
    }

    pub fn reservations_by_user(&self, user_id: Ulid) -> Vec<Reservation> {
        let mut list: Vec<Reservation> = self
            .reservations
            .iter()
            .filter(|r| r.user_id == user_id)
            .map(|r| r.clone())
            .collect();
        sort_reservations(&mut list);
        list
    }

    pub fn reservations_by_status(&self, status: ReservationStatus) -> Vec<Reservation> {
        let mut list: Vec<Reservation> = self
            .reservations
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.clone())
            .collect();
        sort_reservations(&mut list);
        list
    }

    /// The approval queue.
    pub fn pending_reservations(&self) -> Vec<Reservation> {
        self.reservations_by_status(ReservationStatus::Pending)
    }

    pub fn class_groups_by_instructor(&self, instructor_id: Ulid) -> Vec<ClassGroup> {
        self.class_groups_where(|g| g.instructor_id == Some(instructor_id))
    }

    pub fn class_groups_by_branch(&self, branch_id: Ulid) -> Vec<ClassGroup> {
        self.class_groups_where(|g| g.branch_id == Some(branch_id))
    }

    fn class_groups_where(&self, keep: impl Fn(&ClassGroup) -> bool) -> Vec<ClassGroup> {
        let mut groups: Vec<ClassGroup> = self
            .class_groups
            .iter()
            .filter(|g| keep(g.value()))
            .map(|g| g.clone())
            .collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        groups
    }

    /// Entries of every class group in the branches the student belongs to.
    pub fn student_timetable(&self, student_id: Ulid) -> Vec<TimetableEntry> {
        let branches: HashSet<Ulid> = self
            .branches
            .iter()
            .filter(|b| b.student_ids.contains(&student_id))
            .map(|b| b.id)
            .collect();
        let mut entries: Vec<TimetableEntry> = self
            .class_groups
            .iter()
            .filter(|g| g.branch_id.is_some_and(|b| branches.contains(&b)))
            .flat_map(|g| g.entries.clone())
            .collect();
        entries.sort_by(by_slot);
        entries
    }

    /// The user's personal entries, including synchronized class copies.
    pub fn instructor_timetable(&self, user_id: Ulid) -> Result<Vec<TimetableEntry>, EngineError> {
        let mut entries = self.require_user(user_id)?.timetable;
        entries.sort_by(by_slot);
        Ok(entries)
    }
}
