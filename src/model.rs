use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::interval::{Span, TimeError, Weekday};

/// Unix milliseconds, used for creation timestamps.
pub type Ms = i64;

/// Canonical room identity. Opaque string owned by the administrative side.
pub type RoomId = String;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomKind {
    Classroom,
    StudyRoom,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    /// Human label ("room number"). Legacy timetable data refers to rooms by this.
    pub label: String,
    pub kind: RoomKind,
    pub category: String,
    pub capacity: u32,
    pub features: Vec<String>,
}

/// A recurring weekly slot owned by a class group (or copied into an
/// instructor's personal timetable).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimetableEntry {
    pub day: Weekday,
    pub span: Span,
    pub name: String,
    /// Canonical room id or a legacy room label.
    pub location: String,
    pub instructor: Option<String>,
    pub color: Option<String>,
    pub kind: Option<String>,
}

impl TimetableEntry {
    /// Same weekday and overlapping time.
    pub fn collides_with(&self, other: &TimetableEntry) -> bool {
        self.day == other.day && self.span.overlaps(&other.span)
    }

    /// `"<day> (<start> - <end>)"`, the key conflicts are reported under.
    pub fn slot_key(&self) -> String {
        format!("{} ({})", self.day, self.span)
    }

    pub fn has_location(&self) -> bool {
        !self.location.trim().is_empty()
    }
}

/// Timetable entry as submitted by a caller, before any parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryDraft {
    pub day: String,
    pub start: String,
    pub end: String,
    pub name: String,
    pub location: String,
    pub instructor: Option<String>,
    pub color: Option<String>,
    pub kind: Option<String>,
}

impl EntryDraft {
    pub fn new(day: &str, start: &str, end: &str, name: &str, location: &str) -> Self {
        Self {
            day: day.to_string(),
            start: start.to_string(),
            end: end.to_string(),
            name: name.to_string(),
            location: location.to_string(),
            ..Self::default()
        }
    }

    pub fn parse(&self) -> Result<TimetableEntry, TimeError> {
        Ok(TimetableEntry {
            day: self.day.parse()?,
            span: Span::parse(self.start.trim(), self.end.trim())?,
            name: self.name.trim().to_string(),
            location: self.location.trim().to_string(),
            instructor: self.instructor.clone(),
            color: self.color.clone(),
            kind: self.kind.clone(),
        })
    }
}

/// A course section. Owns its timetable entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassGroup {
    pub id: Ulid,
    pub name: String,
    pub course_code: String,
    pub instructor_id: Option<Ulid>,
    pub branch_id: Option<Ulid>,
    pub entries: Vec<TimetableEntry>,
}

impl ClassGroup {
    /// Name prefix of the copies this group places in its instructor's timetable.
    pub fn sync_prefix(&self) -> String {
        sync_prefix(&self.course_code)
    }
}

pub(crate) fn sync_prefix(course_code: &str) -> String {
    format!("{course_code}: ")
}

/// A cohort of students sharing enrollment in a set of class groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub id: Ulid,
    pub name: String,
    pub student_ids: Vec<Ulid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Admin,
    Professor,
    Student,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub role: Role,
    /// Personal entries. For instructors these are synchronized copies of
    /// their class groups' entries, named `"<course code>: <entry name>"`.
    pub timetable: Vec<TimetableEntry>,
}

impl User {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Approved,
    Rejected,
    Used,
    Canceled,
}

impl ReservationStatus {
    /// Pending and approved reservations both hold the room.
    pub fn blocks_room(&self) -> bool {
        matches!(self, ReservationStatus::Pending | ReservationStatus::Approved)
    }

    /// Lifecycle edges. There is no way back to `Pending`.
    pub fn can_transition_to(&self, next: ReservationStatus) -> bool {
        use ReservationStatus::*;
        matches!(
            (self, next),
            (Pending, Approved)
                | (Pending, Rejected)
                | (Pending, Canceled)
                | (Approved, Used)
                | (Approved, Canceled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "PENDING",
            ReservationStatus::Approved => "APPROVED",
            ReservationStatus::Rejected => "REJECTED",
            ReservationStatus::Used => "USED",
            ReservationStatus::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One-off, date-specific room booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub user_id: Ulid,
    pub room_id: RoomId,
    pub date: NaiveDate,
    pub span: Span,
    pub purpose: String,
    pub notes: Option<String>,
    pub status: ReservationStatus,
    pub created_at: Ms,
}

/// Append `note` to existing notes with a `" | "` separator.
pub(crate) fn append_note(existing: Option<&str>, note: &str) -> String {
    match existing.map(str::trim) {
        Some(prev) if !prev.is_empty() => format!("{prev} | {note}"),
        _ => note.to_string(),
    }
}

/// Journal record format. Every mutation of authoritative state is exactly one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomUpserted {
        room: Room,
    },
    RoomDeleted {
        id: RoomId,
    },
    UserUpserted {
        user: User,
    },
    /// Cascades to the user's reservations, instructor assignments and branch memberships.
    UserDeleted {
        id: Ulid,
    },
    BranchUpserted {
        branch: Branch,
    },
    /// Class group metadata. Entries are kept; they change only via `TimetableReplaced`.
    ClassGroupUpserted {
        id: Ulid,
        name: String,
        course_code: String,
        instructor_id: Option<Ulid>,
        branch_id: Option<Ulid>,
    },
    ClassGroupDeleted {
        id: Ulid,
    },
    TimetableReplaced {
        class_group_id: Ulid,
        entries: Vec<TimetableEntry>,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationEdited {
        id: Ulid,
        room_id: RoomId,
        date: NaiveDate,
        span: Span,
        purpose: String,
        notes: Option<String>,
    },
    ReservationStatusChanged {
        id: Ulid,
        status: ReservationStatus,
        notes: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(day: Weekday, start: &str, end: &str) -> TimetableEntry {
        TimetableEntry {
            day,
            span: Span::parse(start, end).unwrap(),
            name: "Lecture".into(),
            location: "R1".into(),
            instructor: None,
            color: None,
            kind: None,
        }
    }

    #[test]
    fn entries_collide_only_on_same_day() {
        let a = entry(Weekday::Monday, "09:00", "10:00");
        let b = entry(Weekday::Monday, "09:30", "10:30");
        let c = entry(Weekday::Tuesday, "09:30", "10:30");
        let d = entry(Weekday::Monday, "10:00", "11:00");
        assert!(a.collides_with(&b));
        assert!(!a.collides_with(&c));
        assert!(!a.collides_with(&d));
    }

    #[test]
    fn slot_key_format() {
        let e = entry(Weekday::Wednesday, "14:00", "16:00");
        assert_eq!(e.slot_key(), "Wednesday (14:00 - 16:00)");
    }

    #[test]
    fn draft_parse_trims_and_validates() {
        let mut draft = EntryDraft::new("tuesday", "08:00", "09:00", " Algebra ", " B12 ");
        let parsed = draft.parse().unwrap();
        assert_eq!(parsed.day, Weekday::Tuesday);
        assert_eq!(parsed.name, "Algebra");
        assert_eq!(parsed.location, "B12");

        draft.start = "8:00".into();
        assert!(matches!(draft.parse(), Err(TimeError::InvalidFormat(_))));

        draft.start = "10:00".into();
        assert!(matches!(draft.parse(), Err(TimeError::InvertedInterval { .. })));

        draft.start = "08:00".into();
        draft.day = "Sunday".into();
        assert!(matches!(draft.parse(), Err(TimeError::UnknownWeekday(_))));
    }

    #[test]
    fn status_edges_are_one_way() {
        use ReservationStatus::*;
        assert!(Pending.can_transition_to(Approved));
        assert!(Pending.can_transition_to(Rejected));
        assert!(Approved.can_transition_to(Used));
        assert!(Approved.can_transition_to(Canceled));
        assert!(!Approved.can_transition_to(Pending));
        assert!(!Rejected.can_transition_to(Approved));
        assert!(!Used.can_transition_to(Canceled));
        assert!(!Canceled.can_transition_to(Pending));
    }

    #[test]
    fn only_pending_and_approved_block() {
        use ReservationStatus::*;
        assert!(Pending.blocks_room());
        assert!(Approved.blocks_room());
        assert!(!Rejected.blocks_room());
        assert!(!Used.blocks_room());
        assert!(!Canceled.blocks_room());
    }

    #[test]
    fn append_note_uses_separator() {
        assert_eq!(append_note(None, "x"), "x");
        assert_eq!(append_note(Some("  "), "x"), "x");
        assert_eq!(append_note(Some("bring keys"), "x"), "bring keys | x");
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ReservationCreated {
            reservation: Reservation {
                id: Ulid::new(),
                user_id: Ulid::new(),
                room_id: "room-1".into(),
                date: NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(),
                span: Span::parse("10:00", "11:00").unwrap(),
                purpose: "Study group".into(),
                notes: None,
                status: ReservationStatus::Pending,
                created_at: 1,
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
