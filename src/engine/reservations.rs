use chrono::{Datelike, Days, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use serde::Deserialize;
use tracing::info;
use ulid::Ulid;

use super::{Engine, EngineError, ValidationError};
use crate::config::ReservationPolicy;
use crate::interval::{Minute, Span};
use crate::limits::{MAX_NOTES_LEN, MAX_PURPOSE_LEN};
use crate::model::{Event, Reservation, ReservationStatus, User, append_note, now_ms};
use crate::notify::Notification;
use crate::observability::RESERVATION_TRANSITIONS_TOTAL;

/// A booking request as submitted by a user. Times are `HH:mm` strings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReservationRequest {
    pub user_id: Ulid,
    pub room_id: String,
    pub date: NaiveDate,
    pub start: String,
    pub end: String,
    pub purpose: String,
    pub notes: Option<String>,
}

pub(super) fn time_of(minute: Minute) -> NaiveTime {
    NaiveTime::from_num_seconds_from_midnight_opt(u32::from(minute) * 60, 0).unwrap_or_default()
}

/// Minutes since midnight of a timestamp.
pub(super) fn minute_of(now: NaiveDateTime) -> Minute {
    use chrono::Timelike;
    (now.hour() * 60 + now.minute()) as Minute
}

fn week_start(date: NaiveDate) -> NaiveDate {
    date - Days::new(u64::from(date.weekday().num_days_from_monday()))
}

fn check_text(request: &ReservationRequest) -> Result<(), ValidationError> {
    if request.purpose.trim().is_empty() {
        return Err(ValidationError::Required("purpose"));
    }
    if request.purpose.len() > MAX_PURPOSE_LEN {
        return Err(ValidationError::FieldTooLong {
            field: "purpose",
            max: MAX_PURPOSE_LEN,
        });
    }
    if request.notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN) {
        return Err(ValidationError::FieldTooLong {
            field: "notes",
            max: MAX_NOTES_LEN,
        });
    }
    Ok(())
}

/// Date and time rules that do not depend on other reservations.
pub(super) fn check_policy(
    policy: &ReservationPolicy,
    date: NaiveDate,
    span: Span,
    now: NaiveDateTime,
) -> Result<(), ValidationError> {
    let today = now.date();
    if date < today {
        return Err(ValidationError::PastDate(date));
    }
    // A horizon past the calendar's end places no limit.
    let horizon = today.checked_add_days(Days::new(u64::from(policy.max_days_in_advance)));
    if horizon.is_some_and(|last| date > last) {
        return Err(ValidationError::TooFarInAdvance(policy.max_days_in_advance));
    }
    let max_minutes = policy.max_hours_per_reservation.checked_mul(60);
    if max_minutes.is_some_and(|max| u32::from(span.duration()) > max) {
        return Err(ValidationError::TooLong(policy.max_hours_per_reservation));
    }
    let starts_at = date.and_time(time_of(span.start()));
    if starts_at <= now {
        return Err(ValidationError::StartElapsed);
    }
    if policy.min_hours_before > 0 {
        let earliest = now.checked_add_signed(TimeDelta::hours(i64::from(policy.min_hours_before)));
        if earliest.is_none_or(|earliest| starts_at < earliest) {
            return Err(ValidationError::TooSoon(policy.min_hours_before));
        }
    }
    Ok(())
}

impl Engine {
    /// Book a room. The reservation starts pending unless the requester's role
    /// is exempt from approval.
    pub async fn create_reservation(
        &self,
        request: ReservationRequest,
        now: NaiveDateTime,
    ) -> Result<Reservation, EngineError> {
        let span = Span::parse(request.start.trim(), request.end.trim())?;
        check_text(&request)?;
        check_policy(&self.policy, request.date, span, now)?;

        let _guard = self.commit_lock.lock().await;
        let user = self.require_user(request.user_id)?;
        let room = self.require_room(request.room_id.trim())?;
        self.check_weekly_quota(&user, request.date, None)?;
        let rooms = self.room_index();
        if !self.availability_verdict(&rooms, &room.id, request.date, span, None, None) {
            let info = self.describe_conflicts(&rooms, &room.id, request.date, span, None)?;
            return Err(EngineError::Unavailable(info));
        }

        let status = if self.policy.requires_approval(user.role) {
            ReservationStatus::Pending
        } else {
            ReservationStatus::Approved
        };
        let reservation = Reservation {
            id: Ulid::new(),
            user_id: user.id,
            room_id: room.id.clone(),
            date: request.date,
            span,
            purpose: request.purpose.trim().to_string(),
            notes: request.notes.filter(|n| !n.trim().is_empty()),
            status,
            created_at: now_ms(),
        };
        self.persist(Event::ReservationCreated {
            reservation: reservation.clone(),
        })
        .await?;
        info!(
            reservation = %reservation.id,
            room = %room.id,
            date = %reservation.date,
            span = %span,
            status = %status,
            "reservation created"
        );
        if status == ReservationStatus::Pending {
            self.notify.send(Notification::request_submitted(
                &reservation,
                &user.full_name(),
                &room.label,
            ));
        }
        Ok(reservation)
    }

    /// Owner-only change of a pending request. Availability is re-checked
    /// without the reservation itself.
    pub async fn edit_reservation(
        &self,
        id: Ulid,
        request: ReservationRequest,
        now: NaiveDateTime,
    ) -> Result<Reservation, EngineError> {
        let span = Span::parse(request.start.trim(), request.end.trim())?;
        check_text(&request)?;
        check_policy(&self.policy, request.date, span, now)?;

        let _guard = self.commit_lock.lock().await;
        let room = self.require_room(request.room_id.trim())?;
        let current = self.require_reservation(id)?;
        if current.user_id != request.user_id {
            return Err(EngineError::Forbidden {
                user_id: request.user_id,
                reservation_id: id,
            });
        }
        if current.status != ReservationStatus::Pending {
            return Err(EngineError::InvalidTransition {
                id,
                from: current.status,
                to: ReservationStatus::Pending,
            });
        }
        let user = self.require_user(current.user_id)?;
        self.check_weekly_quota(&user, request.date, Some(id))?;
        let rooms = self.room_index();
        if !self.availability_verdict(&rooms, &room.id, request.date, span, None, Some(id)) {
            let info = self.describe_conflicts(&rooms, &room.id, request.date, span, Some(id))?;
            return Err(EngineError::Unavailable(info));
        }

        self.persist(Event::ReservationEdited {
            id,
            room_id: room.id.clone(),
            date: request.date,
            span,
            purpose: request.purpose.trim().to_string(),
            notes: request.notes.filter(|n| !n.trim().is_empty()),
        })
        .await?;
        let updated = self.require_reservation(id)?;
        info!(
            reservation = %id,
            room = %room.id,
            date = %updated.date,
            span = %span,
            "reservation edited"
        );
        self.notify
            .send(Notification::request_updated(&updated, &user.full_name(), &room.label));
        Ok(updated)
    }

    pub async fn approve(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let _guard = self.commit_lock.lock().await;
        let current = self.require_reservation(id)?;
        self.require_status(&current, &[ReservationStatus::Pending], ReservationStatus::Approved)?;
        self.commit_status(&current, ReservationStatus::Approved, None, "manual").await
    }

    /// The reason is appended to the reservation's notes and sent to the owner.
    pub async fn reject(&self, id: Ulid, reason: Option<&str>) -> Result<Reservation, EngineError> {
        let _guard = self.commit_lock.lock().await;
        let current = self.require_reservation(id)?;
        self.require_status(&current, &[ReservationStatus::Pending], ReservationStatus::Rejected)?;
        let reason = reason.map(str::trim).filter(|r| !r.is_empty());
        self.commit_status(&current, ReservationStatus::Rejected, reason, "manual").await
    }

    /// Owner cancels a pending or approved reservation that is not in the past.
    pub async fn cancel(
        &self,
        id: Ulid,
        user_id: Ulid,
        today: NaiveDate,
    ) -> Result<Reservation, EngineError> {
        let _guard = self.commit_lock.lock().await;
        let current = self.require_reservation(id)?;
        if current.user_id != user_id {
            return Err(EngineError::Forbidden {
                user_id,
                reservation_id: id,
            });
        }
        self.require_status(
            &current,
            &[ReservationStatus::Pending, ReservationStatus::Approved],
            ReservationStatus::Canceled,
        )?;
        if current.date < today {
            return Err(ValidationError::AlreadyPast.into());
        }
        let canceled = self
            .commit_status(&current, ReservationStatus::Canceled, None, "manual")
            .await?;
        let room_label = self.room_label(&canceled.room_id);
        self.notify.send(Notification::canceled_by_owner(
            &canceled,
            &self.user_name(user_id),
            &room_label,
        ));
        Ok(canceled)
    }

    fn require_status(
        &self,
        current: &Reservation,
        allowed: &[ReservationStatus],
        to: ReservationStatus,
    ) -> Result<(), EngineError> {
        if allowed.contains(&current.status) && current.status.can_transition_to(to) {
            return Ok(());
        }
        Err(EngineError::InvalidTransition {
            id: current.id,
            from: current.status,
            to,
        })
    }

    /// Journal a status change, notify the owner, return the updated record.
    /// Caller holds the commit lock and has validated the edge.
    pub(super) async fn commit_status(
        &self,
        current: &Reservation,
        to: ReservationStatus,
        note: Option<&str>,
        trigger: &'static str,
    ) -> Result<Reservation, EngineError> {
        let notes = match note {
            Some(note) => Some(append_note(current.notes.as_deref(), note)),
            None => current.notes.clone(),
        };
        self.persist(Event::ReservationStatusChanged {
            id: current.id,
            status: to,
            notes: notes.clone(),
        })
        .await?;
        metrics::counter!(
            RESERVATION_TRANSITIONS_TOTAL,
            "from" => current.status.as_str(),
            "to" => to.as_str(),
            "trigger" => trigger
        )
        .increment(1);
        info!(
            reservation = %current.id,
            from = %current.status,
            to = %to,
            trigger,
            "reservation status changed"
        );

        let updated = Reservation {
            status: to,
            notes,
            ..current.clone()
        };
        let room_label = self.room_label(&updated.room_id);
        self.notify
            .send(Notification::status_changed(&updated, &room_label, current.status, note));
        Ok(updated)
    }

    fn check_weekly_quota(
        &self,
        user: &User,
        date: NaiveDate,
        exclude: Option<Ulid>,
    ) -> Result<(), ValidationError> {
        let max = self.policy.max_reservations_per_week;
        let from = week_start(date);
        let until = from + Days::new(7);
        let active = self
            .reservations
            .iter()
            .filter(|r| r.user_id == user.id && Some(r.id) != exclude)
            .filter(|r| r.status.blocks_room() && r.date >= from && r.date < until)
            .count();
        if active >= max as usize {
            return Err(ValidationError::WeeklyQuota(max));
        }
        Ok(())
    }

    pub(super) fn room_label(&self, room_id: &str) -> String {
        self.rooms.get(room_id).map(|r| r.label.clone()).unwrap_or_else(|| room_id.to_string())
    }
}
