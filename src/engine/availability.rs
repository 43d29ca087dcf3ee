use std::ops::ControlFlow;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, warn};
use ulid::Ulid;

use super::resolve::RoomIndex;
use super::{Engine, EngineError, EntityKind};
use crate::interval::{Span, Weekday, format_minutes};
use crate::model::{ClassGroup, Reservation, Room, TimetableEntry};
use crate::observability::AVAILABILITY_CHECKS_TOTAL;

/// Human-readable explanation of why a room is busy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConflictInfo {
    pub reservation_conflicts: Vec<String>,
    pub class_conflicts: Vec<String>,
}

impl ConflictInfo {
    pub fn has_conflicts(&self) -> bool {
        !self.reservation_conflicts.is_empty() || !self.class_conflicts.is_empty()
    }

    pub fn detailed_message(&self) -> String {
        if !self.has_conflicts() {
            return "No conflicts found".into();
        }
        let mut message = String::from("Conflicts detected:\n");
        if !self.class_conflicts.is_empty() {
            message.push_str("Class schedule conflicts:\n");
            for line in &self.class_conflicts {
                message.push_str(&format!("  - {line}\n"));
            }
        }
        if !self.reservation_conflicts.is_empty() {
            message.push_str("Reservation conflicts:\n");
            for line in &self.reservation_conflicts {
                message.push_str(&format!("  - {line}\n"));
            }
        }
        message
    }

    pub fn short_message(&self) -> String {
        if !self.has_conflicts() {
            return "Available".into();
        }
        let mut issues = Vec::new();
        if !self.class_conflicts.is_empty() {
            issues.push(format!("{} class schedule conflict(s)", self.class_conflicts.len()));
        }
        if !self.reservation_conflicts.is_empty() {
            issues.push(format!("{} reservation conflict(s)", self.reservation_conflicts.len()));
        }
        issues.join(" and ")
    }
}

impl Engine {
    /// String-level availability check. Anything unparseable is "not available".
    pub fn check_availability(
        &self,
        room_id: &str,
        date: NaiveDate,
        start: &str,
        end: &str,
    ) -> bool {
        match Span::parse(start, end) {
            Ok(span) => self.is_room_available(room_id, date, span),
            Err(e) => {
                warn!(room_id, %date, start, end, "availability check rejected input: {e}");
                metrics::counter!(AVAILABILITY_CHECKS_TOTAL, "result" => "error").increment(1);
                false
            }
        }
    }

    /// No blocking reservation and no class entry in the room overlaps `span` on `date`.
    pub fn is_room_available(&self, room_id: &str, date: NaiveDate, span: Span) -> bool {
        self.availability_verdict(&self.room_index(), room_id, date, span, None, None)
    }

    /// Same as `is_room_available`, ignoring the entries of `exclude_group`.
    pub fn is_room_available_for_class_group(
        &self,
        room_id: &str,
        date: NaiveDate,
        span: Span,
        exclude_group: Ulid,
    ) -> bool {
        let rooms = self.room_index();
        self.availability_verdict(&rooms, room_id, date, span, Some(exclude_group), None)
    }

    /// Fail-closed: lookup failures count as "not available".
    pub(super) fn availability_verdict(
        &self,
        rooms: &RoomIndex,
        room_id: &str,
        date: NaiveDate,
        span: Span,
        exclude_group: Option<Ulid>,
        exclude_reservation: Option<Ulid>,
    ) -> bool {
        let blocker =
            self.find_blocker(rooms, room_id, date, span, exclude_group, exclude_reservation);
        let result = match blocker {
            Ok(None) => "available",
            Ok(Some(blocker)) => {
                debug!(room_id, %date, %span, "room busy: {blocker}");
                "unavailable"
            }
            Err(e) => {
                warn!(
                    room_id, %date, %span,
                    "availability check failed, reporting unavailable: {e}"
                );
                "error"
            }
        };
        metrics::counter!(AVAILABILITY_CHECKS_TOTAL, "result" => result).increment(1);
        result == "available"
    }

    fn find_blocker(
        &self,
        rooms: &RoomIndex,
        room_id: &str,
        date: NaiveDate,
        span: Span,
        exclude_group: Option<Ulid>,
        exclude_reservation: Option<Ulid>,
    ) -> Result<Option<String>, EngineError> {
        if !self.rooms.contains_key(room_id) {
            return Err(EngineError::not_found(EntityKind::Room, room_id));
        }
        let mut blocker = None;
        self.scan_reservations(room_id, date, span, exclude_reservation, |r| {
            blocker = Some(format!("{} reservation {}", r.status, r.id));
            ControlFlow::Break(())
        })?;
        if blocker.is_none() {
            self.scan_class_entries(rooms, room_id, date, span, exclude_group, |group, entry| {
                blocker = Some(format!("class group {} on {}", group.name, entry.slot_key()));
                ControlFlow::Break(())
            });
        }
        Ok(blocker)
    }

    /// Visit pending/approved reservations of the room on `date` overlapping `span`.
    fn scan_reservations(
        &self,
        room_id: &str,
        date: NaiveDate,
        span: Span,
        exclude: Option<Ulid>,
        mut visit: impl FnMut(&Reservation) -> ControlFlow<()>,
    ) -> Result<(), EngineError> {
        let key = (room_id.to_string(), date);
        let Some(ids) = self.room_day_index.get(&key).map(|ids| ids.clone()) else {
            return Ok(());
        };
        for id in ids.into_iter().filter(|id| Some(*id) != exclude) {
            let reservation = self
                .reservations
                .get(&id)
                .ok_or_else(|| EngineError::not_found(EntityKind::Reservation, id))?;
            if reservation.status.blocks_room()
                && reservation.span.overlaps(&span)
                && visit(reservation.value()).is_break()
            {
                break;
            }
        }
        Ok(())
    }

    /// Visit class entries held in the room on the weekday of `date` overlapping `span`.
    /// Entries whose location resolves to no room are skipped.
    fn scan_class_entries(
        &self,
        rooms: &RoomIndex,
        room_id: &str,
        date: NaiveDate,
        span: Span,
        exclude_group: Option<Ulid>,
        mut visit: impl FnMut(&ClassGroup, &TimetableEntry) -> ControlFlow<()>,
    ) {
        let Some(day) = Weekday::from_date(date) else { return };
        for group in self.class_groups.iter() {
            if Some(group.id) == exclude_group {
                continue;
            }
            for entry in &group.entries {
                if entry.day == day
                    && entry.span.overlaps(&span)
                    && rooms.resolve(&entry.location) == Some(room_id)
                    && visit(group.value(), entry).is_break()
                {
                    return;
                }
            }
        }
    }

    /// Every reservation and class entry that would block the request.
    pub fn conflict_info(
        &self,
        room_id: &str,
        date: NaiveDate,
        start: &str,
        end: &str,
    ) -> Result<ConflictInfo, EngineError> {
        let span = Span::parse(start, end)?;
        if !self.rooms.contains_key(room_id) {
            return Err(EngineError::not_found(EntityKind::Room, room_id));
        }
        self.describe_conflicts(&self.room_index(), room_id, date, span, None)
    }

    pub(super) fn describe_conflicts(
        &self,
        rooms: &RoomIndex,
        room_id: &str,
        date: NaiveDate,
        span: Span,
        exclude_reservation: Option<Ulid>,
    ) -> Result<ConflictInfo, EngineError> {
        let mut info = ConflictInfo::default();
        self.scan_reservations(room_id, date, span, exclude_reservation, |r| {
            info.reservation_conflicts.push(format!(
                "Reservation by {} from {} to {} ({})",
                self.user_name(r.user_id),
                format_minutes(r.span.start()),
                format_minutes(r.span.end()),
                r.status
            ));
            ControlFlow::Continue(())
        })?;
        self.scan_class_entries(rooms, room_id, date, span, None, |group, entry| {
            info.class_conflicts.push(format!(
                "Class '{}' ({}) from {} to {}",
                entry.name,
                group.name,
                format_minutes(entry.span.start()),
                format_minutes(entry.span.end())
            ));
            ControlFlow::Continue(())
        });
        Ok(info)
    }

    /// Rooms of `category` (any when `None`) seating at least `min_capacity` that are free.
    pub fn find_available_rooms(
        &self,
        date: NaiveDate,
        span: Span,
        category: Option<&str>,
        min_capacity: u32,
    ) -> Vec<Room> {
        let index = self.room_index();
        let mut candidates: Vec<Room> = self
            .rooms
            .iter()
            .filter(|room| room.capacity >= min_capacity)
            .filter(|room| category.is_none_or(|c| room.category.eq_ignore_ascii_case(c.trim())))
            .map(|room| room.clone())
            .collect();
        candidates
            .retain(|room| self.availability_verdict(&index, &room.id, date, span, None, None));
        candidates.sort_by(|a, b| a.label.cmp(&b.label).then_with(|| a.id.cmp(&b.id)));
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_without_conflicts() {
        let info = ConflictInfo::default();
        assert!(!info.has_conflicts());
        assert_eq!(info.short_message(), "Available");
        assert_eq!(info.detailed_message(), "No conflicts found");
    }

    #[test]
    fn messages_list_both_sources() {
        let info = ConflictInfo {
            reservation_conflicts: vec![
                "Reservation by Ada L from 10:00 to 11:00 (APPROVED)".into(),
            ],
            class_conflicts: vec![
                "Class 'Algebra' (G1) from 09:00 to 11:00".into(),
                "Class 'Physics' (G2) from 10:00 to 12:00".into(),
            ],
        };
        assert_eq!(
            info.short_message(),
            "2 class schedule conflict(s) and 1 reservation conflict(s)"
        );
        let detailed = info.detailed_message();
        assert!(detailed.starts_with("Conflicts detected:\n"));
        assert!(detailed.contains("  - Class 'Physics' (G2) from 10:00 to 12:00\n"));
        assert!(detailed.contains("Reservation conflicts:\n  - Reservation by Ada L"));
    }
}
