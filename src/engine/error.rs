use std::fmt;

use chrono::NaiveDate;
use thiserror::Error;
use ulid::Ulid;

use super::availability::ConflictInfo;
use super::conflict::ConflictResult;
use crate::interval::{Minute, Span, TimeError, Weekday};
use crate::model::ReservationStatus;

/// Input rejected before any state was read for conflicts or mutated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error(transparent)]
    Time(#[from] TimeError),
    #[error("{which} time must be on the hour (got {time})")]
    NotOnTheHour { which: &'static str, time: String },
    #[error("start time must be between 08:00 and 17:00 (got {0})")]
    StartOutsideTeachingHours(String),
    #[error("end time must be between 09:00 and 18:00 (got {0})")]
    EndOutsideTeachingHours(String),
    #[error("class duration must be exactly 1 or 2 hours (got {0} minutes)")]
    Duration(Minute),
    #[error("entries overlap each other on {day}: {first} and {second}")]
    SelfOverlap { day: Weekday, first: Span, second: Span },
    #[error("cannot reserve a date in the past ({0})")]
    PastDate(NaiveDate),
    #[error("the requested start time has already passed")]
    StartElapsed,
    #[error("reservations can be made at most {0} days in advance")]
    TooFarInAdvance(u32),
    #[error("reservations must be made at least {0} hours before they start")]
    TooSoon(u32),
    #[error("reservations are limited to {0} hours")]
    TooLong(u32),
    #[error("weekly reservation limit of {0} reached")]
    WeeklyQuota(u32),
    #[error("cannot cancel a reservation dated in the past")]
    AlreadyPast,
    #[error("{0} is required")]
    Required(&'static str),
    #[error("{field} is longer than {max} bytes")]
    FieldTooLong { field: &'static str, max: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Room,
    User,
    Branch,
    ClassGroup,
    Reservation,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::Room => "room",
            EntityKind::User => "user",
            EntityKind::Branch => "branch",
            EntityKind::ClassGroup => "class group",
            EntityKind::Reservation => "reservation",
        })
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{0}")]
    Conflict(Box<ConflictResult>),
    #[error("room is not available: {}", .0.short_message())]
    Unavailable(ConflictInfo),
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },
    #[error("reservation {id} cannot go from {from} to {to}")]
    InvalidTransition {
        id: Ulid,
        from: ReservationStatus,
        to: ReservationStatus,
    },
    #[error("user {user_id} does not own reservation {reservation_id}")]
    Forbidden { user_id: Ulid, reservation_id: Ulid },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    Wal(String),
}

impl EngineError {
    pub(crate) fn not_found(kind: EntityKind, id: impl ToString) -> Self {
        EngineError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

impl From<TimeError> for EngineError {
    fn from(e: TimeError) -> Self {
        EngineError::Validation(e.into())
    }
}
