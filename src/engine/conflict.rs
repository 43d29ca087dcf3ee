use std::fmt;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};
use ulid::Ulid;

use super::resolve::RoomIndex;
use super::{Engine, EngineError, EntityKind, ValidationError};
use crate::interval::{Span, Weekday, format_minutes};
use crate::model::{ClassGroup, EntryDraft, RoomId, TimetableEntry};
use crate::observability::{CONFLICT_CHECK_DURATION_SECONDS, CONFLICT_CHECKS_TOTAL};

const FIRST_TEACHING_HOUR: u16 = 8;
const LAST_TEACHING_HOUR: u16 = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PartyKind {
    Instructor,
    Student,
    Room,
}

impl PartyKind {
    pub fn label(&self) -> &'static str {
        match self {
            PartyKind::Instructor => "INSTRUCTOR",
            PartyKind::Student => "STUDENT",
            PartyKind::Room => "ROOM",
        }
    }
}

impl fmt::Display for PartyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Rooms are parties too, but never users.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum PartyId {
    User(Ulid),
    Room(RoomId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Party {
    pub id: PartyId,
    pub kind: PartyKind,
    pub name: String,
}

/// Every party double-booked in one proposed slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictSlot {
    pub day: Weekday,
    pub span: Span,
    pub parties: Vec<Party>,
}

impl ConflictSlot {
    pub fn key(&self) -> String {
        format!("{} ({})", self.day, self.span)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alternative {
    pub day: Weekday,
    pub span: Span,
    pub label: String,
}

/// Outcome of a timetable conflict check. Slots keep the order in which they were found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConflictResult {
    slots: Vec<ConflictSlot>,
    alternatives: Vec<Alternative>,
}

impl ConflictResult {
    pub fn add(&mut self, entry: &TimetableEntry, party: Party) {
        let found = self
            .slots
            .iter()
            .position(|s| s.day == entry.day && s.span == entry.span);
        let slot = match found {
            Some(i) => &mut self.slots[i],
            None => {
                self.slots.push(ConflictSlot {
                    day: entry.day,
                    span: entry.span,
                    parties: Vec::new(),
                });
                let last = self.slots.len() - 1;
                &mut self.slots[last]
            }
        };
        if !slot.parties.iter().any(|p| p.id == party.id) {
            slot.parties.push(party);
        }
    }

    pub fn has_conflicts(&self) -> bool {
        !self.slots.is_empty()
    }

    pub fn slots(&self) -> &[ConflictSlot] {
        &self.slots
    }

    pub fn parties(&self, key: &str) -> Option<&[Party]> {
        self.slots.iter().find(|s| s.key() == key).map(|s| s.parties.as_slice())
    }

    pub fn has_kind(&self, kind: PartyKind) -> bool {
        self.slots.iter().flat_map(|s| &s.parties).any(|p| p.kind == kind)
    }

    /// Distinct kinds present, in instructor, student, room order.
    pub fn kinds(&self) -> Vec<PartyKind> {
        [PartyKind::Instructor, PartyKind::Student, PartyKind::Room]
            .into_iter()
            .filter(|k| self.has_kind(*k))
            .collect()
    }

    /// Distinct affected parties across all slots.
    pub fn affected_parties(&self) -> Vec<&Party> {
        let mut seen: Vec<&Party> = Vec::new();
        for party in self.slots.iter().flat_map(|s| &s.parties) {
            if !seen.iter().any(|p| p.id == party.id) {
                seen.push(party);
            }
        }
        seen
    }

    pub fn alternatives(&self) -> &[Alternative] {
        &self.alternatives
    }

    pub fn message(&self) -> String {
        if !self.has_conflicts() {
            return "No conflicts detected.".into();
        }
        let mut message = String::new();
        if self.has_kind(PartyKind::Room) {
            message.push_str(
                "ROOM CONFLICT: The requested room is already booked during this time.\n",
            );
        }
        if self.has_kind(PartyKind::Instructor) {
            message.push_str(
                "INSTRUCTOR CONFLICT: The assigned instructor has a schedule conflict during this time.\n",
            );
        }
        if self.has_kind(PartyKind::Student) {
            message.push_str(
                "STUDENT CONFLICT: One or more students have schedule conflicts during this time.\n",
            );
        }
        message.push_str("The following time slots have conflicts:\n");
        for slot in &self.slots {
            let names = |kind: PartyKind| -> Vec<&str> {
                slot.parties
                    .iter()
                    .filter(|p| p.kind == kind)
                    .map(|p| p.name.as_str())
                    .collect()
            };
            let mut parts = Vec::new();
            let rooms = names(PartyKind::Room);
            if !rooms.is_empty() {
                let rooms: Vec<String> = rooms
                    .iter()
                    .map(|r| format!("Room {r} is already booked"))
                    .collect();
                parts.push(format!("Rooms: {}", rooms.join(", ")));
            }
            let instructors = names(PartyKind::Instructor);
            if !instructors.is_empty() {
                let instructors: Vec<String> =
                    instructors.iter().map(|n| format!("Instructor {n}")).collect();
                parts.push(format!("Instructors: {}", instructors.join(", ")));
            }
            let students = names(PartyKind::Student);
            if students.len() > 3 {
                parts.push(format!("Students: {} students", students.len()));
            } else if !students.is_empty() {
                parts.push(format!("Students: {}", students.join(", ")));
            }
            message.push_str(&format!("- {}: {}\n", slot.key(), parts.join("; ")));
        }
        message
    }
}

impl fmt::Display for ConflictResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

/// +30 min, +60 min (if still within the day) and the same time on the next teaching day.
pub(super) fn suggest_alternatives(entry: &TimetableEntry) -> Vec<Alternative> {
    let later = [30, 60]
        .into_iter()
        .filter_map(|offset| entry.span.shifted(offset))
        .map(|span| (entry.day, span));
    later
        .chain(std::iter::once((entry.day.next(), entry.span)))
        .map(|(day, span)| Alternative {
            day,
            span,
            label: format!("{day} at {}", format_minutes(span.start())),
        })
        .collect()
}

/// Teaching-hours policy: whole hours, 08:00-18:00, one or two hours long.
pub fn validate_time_policy(entries: &[TimetableEntry]) -> Result<(), ValidationError> {
    for entry in entries {
        let (start, end) = (entry.span.start(), entry.span.end());
        if start % 60 != 0 {
            return Err(ValidationError::NotOnTheHour {
                which: "start",
                time: format_minutes(start),
            });
        }
        if end % 60 != 0 {
            return Err(ValidationError::NotOnTheHour {
                which: "end",
                time: format_minutes(end),
            });
        }
        if !(FIRST_TEACHING_HOUR..LAST_TEACHING_HOUR).contains(&(start / 60)) {
            return Err(ValidationError::StartOutsideTeachingHours(format_minutes(start)));
        }
        if !(FIRST_TEACHING_HOUR + 1..=LAST_TEACHING_HOUR).contains(&(end / 60)) {
            return Err(ValidationError::EndOutsideTeachingHours(format_minutes(end)));
        }
        let duration = entry.span.duration();
        if duration != 60 && duration != 120 {
            return Err(ValidationError::Duration(duration));
        }
    }
    Ok(())
}

impl Engine {
    /// Check proposed entries for a class group against its instructor, its
    /// branch's students and the rooms they use.
    pub fn check_conflicts(
        &self,
        class_group_id: Ulid,
        proposed: &[TimetableEntry],
    ) -> Result<ConflictResult, EngineError> {
        let group = self.require_class_group(class_group_id)?;
        self.conflicts_for(&group, proposed, &self.room_index())
    }

    /// Interactive variant for one entry while a timetable is being edited.
    pub fn check_single_entry_conflicts(
        &self,
        class_group_id: Ulid,
        draft: &EntryDraft,
    ) -> Result<ConflictResult, EngineError> {
        let entry = draft.parse()?;
        self.check_conflicts(class_group_id, std::slice::from_ref(&entry))
    }

    /// `group` may be a not-yet-committed version of a stored group.
    pub(super) fn conflicts_for(
        &self,
        group: &ClassGroup,
        proposed: &[TimetableEntry],
        rooms: &RoomIndex,
    ) -> Result<ConflictResult, EngineError> {
        let mut result = ConflictResult::default();
        if proposed.is_empty() {
            return Ok(result);
        }
        let started = Instant::now();

        self.check_instructor(group, proposed, &mut result);
        self.check_cohort(group, proposed, &mut result)?;
        self.check_rooms(group, proposed, rooms, &mut result);

        if let Some(first) = proposed
            .iter()
            .find(|e| result.slots.iter().any(|s| s.day == e.day && s.span == e.span))
        {
            result.alternatives = suggest_alternatives(first);
        }

        metrics::histogram!(CONFLICT_CHECK_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        let outcome = if result.has_conflicts() { "conflict" } else { "clear" };
        metrics::counter!(CONFLICT_CHECKS_TOTAL, "outcome" => outcome).increment(1);
        if result.has_conflicts() {
            info!(
                class_group = %group.id,
                slots = result.slots.len(),
                kinds = ?result.kinds(),
                "timetable conflicts found"
            );
        } else {
            debug!(class_group = %group.id, entries = proposed.len(), "no timetable conflicts");
        }
        Ok(result)
    }

    fn check_instructor(
        &self,
        group: &ClassGroup,
        proposed: &[TimetableEntry],
        result: &mut ConflictResult,
    ) {
        let Some(instructor_id) = group.instructor_id else { return };
        let own_prefix = group.sync_prefix();
        let mut busy: Vec<TimetableEntry> = self
            .class_groups
            .iter()
            .filter(|g| g.id != group.id && g.instructor_id == Some(instructor_id))
            .flat_map(|g| g.entries.clone())
            .collect();
        if let Some(user) = self.users.get(&instructor_id) {
            busy.extend(
                user.timetable
                    .iter()
                    .filter(|e| !e.name.starts_with(&own_prefix))
                    .cloned(),
            );
        }
        let name = self.user_name(instructor_id);
        for entry in proposed {
            if busy.iter().any(|b| b.collides_with(entry)) {
                result.add(
                    entry,
                    Party {
                        id: PartyId::User(instructor_id),
                        kind: PartyKind::Instructor,
                        name: name.clone(),
                    },
                );
            }
        }
    }

    fn check_cohort(
        &self,
        group: &ClassGroup,
        proposed: &[TimetableEntry],
        result: &mut ConflictResult,
    ) -> Result<(), EngineError> {
        let Some(branch_id) = group.branch_id else { return Ok(()) };
        let students = self
            .branches
            .get(&branch_id)
            .map(|b| b.student_ids.clone())
            .ok_or_else(|| EngineError::not_found(EntityKind::Branch, branch_id))?;
        if students.is_empty() {
            return Ok(());
        }
        let busy: Vec<TimetableEntry> = self
            .class_groups
            .iter()
            .filter(|g| g.id != group.id && g.branch_id == Some(branch_id))
            .flat_map(|g| g.entries.clone())
            .collect();
        let mut parties: Option<Vec<Party>> = None;
        for entry in proposed {
            if !busy.iter().any(|b| b.collides_with(entry)) {
                continue;
            }
            let parties = parties.get_or_insert_with(|| {
                students
                    .iter()
                    .map(|&id| Party {
                        id: PartyId::User(id),
                        kind: PartyKind::Student,
                        name: self.user_name(id),
                    })
                    .collect()
            });
            for party in parties.iter() {
                result.add(entry, party.clone());
            }
        }
        Ok(())
    }

    fn check_rooms(
        &self,
        group: &ClassGroup,
        proposed: &[TimetableEntry],
        rooms: &RoomIndex,
        result: &mut ConflictResult,
    ) {
        let wanted: Vec<(&TimetableEntry, &str)> = proposed
            .iter()
            .filter_map(|e| rooms.resolve(&e.location).map(|room| (e, room)))
            .collect();
        if wanted.is_empty() {
            return;
        }
        let mut busy: Vec<(String, TimetableEntry)> = Vec::new();
        for other in self.class_groups.iter().filter(|g| g.id != group.id) {
            for entry in &other.entries {
                if let Some(room) = rooms.resolve(&entry.location)
                    && wanted.iter().any(|(_, w)| *w == room)
                {
                    busy.push((room.to_string(), entry.clone()));
                }
            }
        }
        for (entry, room) in wanted {
            if busy.iter().any(|(r, b)| r == room && b.collides_with(entry)) {
                let label = self
                    .rooms
                    .get(room)
                    .map(|r| r.label.clone())
                    .unwrap_or_else(|| room.to_string());
                result.add(
                    entry,
                    Party {
                        id: PartyId::Room(room.to_string()),
                        kind: PartyKind::Room,
                        name: label,
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(day: Weekday, start: &str, end: &str) -> TimetableEntry {
        TimetableEntry {
            day,
            span: Span::parse(start, end).unwrap(),
            name: "Lecture".into(),
            location: String::new(),
            instructor: None,
            color: None,
            kind: None,
        }
    }

    fn student(name: &str) -> Party {
        Party {
            id: PartyId::User(Ulid::new()),
            kind: PartyKind::Student,
            name: name.into(),
        }
    }

    #[test]
    fn policy_accepts_whole_hour_classes() {
        let ok = [
            entry(Weekday::Monday, "08:00", "09:00"),
            entry(Weekday::Friday, "16:00", "18:00"),
            entry(Weekday::Tuesday, "17:00", "18:00"),
        ];
        assert_eq!(validate_time_policy(&ok), Ok(()));
    }

    #[test]
    fn policy_rejects_quarter_hours_and_odd_lengths() {
        let cases = [
            (entry(Weekday::Monday, "09:15", "10:15"), "start"),
            (entry(Weekday::Monday, "09:00", "10:30"), "end"),
        ];
        for (e, which) in cases {
            assert!(matches!(
                validate_time_policy(&[e]),
                Err(ValidationError::NotOnTheHour { which: w, .. }) if w == which
            ));
        }
        assert_eq!(
            validate_time_policy(&[entry(Weekday::Monday, "07:00", "08:00")]),
            Err(ValidationError::StartOutsideTeachingHours("07:00".into()))
        );
        assert_eq!(
            validate_time_policy(&[entry(Weekday::Monday, "17:00", "19:00")]),
            Err(ValidationError::EndOutsideTeachingHours("19:00".into()))
        );
        assert_eq!(
            validate_time_policy(&[entry(Weekday::Monday, "09:00", "12:00")]),
            Err(ValidationError::Duration(180))
        );
    }

    #[test]
    fn alternatives_shift_then_move_day() {
        let alts = suggest_alternatives(&entry(Weekday::Friday, "09:00", "10:00"));
        let labels: Vec<&str> = alts.iter().map(|a| a.label.as_str()).collect();
        assert_eq!(labels, ["Friday at 09:30", "Friday at 10:00", "Monday at 09:00"]);
        assert_eq!(alts[0].span, Span::parse("09:30", "10:30").unwrap());
    }

    #[test]
    fn alternatives_drop_shifts_past_midnight() {
        let alts = suggest_alternatives(&entry(Weekday::Monday, "22:45", "23:45"));
        assert_eq!(alts.len(), 1);
        assert_eq!(alts[0].day, Weekday::Tuesday);
    }

    #[test]
    fn parties_are_deduplicated_per_slot() {
        let e = entry(Weekday::Monday, "09:00", "10:00");
        let ada = student("Ada Lovelace");
        let mut result = ConflictResult::default();
        result.add(&e, ada.clone());
        result.add(&e, ada.clone());
        result.add(&entry(Weekday::Tuesday, "09:00", "10:00"), ada);
        assert_eq!(result.slots().len(), 2);
        assert_eq!(result.parties("Monday (09:00 - 10:00)").map(|p| p.len()), Some(1));
        assert_eq!(result.affected_parties().len(), 1);
        assert_eq!(result.kinds(), vec![PartyKind::Student]);
    }

    #[test]
    fn message_summarizes_large_cohorts() {
        let e = entry(Weekday::Wednesday, "10:00", "12:00");
        let mut result = ConflictResult::default();
        result.add(
            &e,
            Party {
                id: PartyId::Room("r-101".into()),
                kind: PartyKind::Room,
                name: "101".into(),
            },
        );
        result.add(
            &e,
            Party {
                id: PartyId::User(Ulid::new()),
                kind: PartyKind::Instructor,
                name: "Grace Hopper".into(),
            },
        );
        for name in ["A B", "C D", "E F", "G H"] {
            result.add(&e, student(name));
        }
        let message = result.message();
        assert!(message.starts_with("ROOM CONFLICT"));
        assert!(message.contains("INSTRUCTOR CONFLICT"));
        assert!(message.contains("STUDENT CONFLICT"));
        assert!(message.contains(
            "- Wednesday (10:00 - 12:00): Rooms: Room 101 is already booked; Instructors: Instructor Grace Hopper; Students: 4 students\n"
        ));
        assert_eq!(
            result.kinds(),
            vec![PartyKind::Instructor, PartyKind::Student, PartyKind::Room]
        );
    }

    #[test]
    fn message_lists_few_students_by_name() {
        let e = entry(Weekday::Monday, "09:00", "10:00");
        let mut result = ConflictResult::default();
        result.add(&e, student("Ada Lovelace"));
        result.add(&e, student("Alan Turing"));
        assert!(
            result
                .message()
                .contains("- Monday (09:00 - 10:00): Students: Ada Lovelace, Alan Turing\n")
        );
        assert!(!result.message().contains("ROOM CONFLICT"));
    }
}
