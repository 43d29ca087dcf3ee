use std::time::Instant;

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use tracing::{debug, error, info};
use ulid::Ulid;

use super::reservations::minute_of;
use super::{Engine, EngineError};
use crate::model::{Reservation, ReservationStatus};
use crate::notify::Notification;
use crate::observability::{SWEEP_DURATION_SECONDS, SWEEP_ERRORS_TOTAL};

pub const AUTO_REJECT_NOTE: &str = "Auto-rejected: Reservation date arrived without approval.";
pub const EXPIRED_PENDING_NOTE: &str =
    "Automatically rejected - reservation time has passed without approval";

/// Outcome of the daily auto-rejection sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub rejected_count: usize,
    pub error_count: usize,
    pub total_found: usize,
}

/// Outcome of the periodic status refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusRefreshReport {
    pub marked_used: usize,
    pub rejected: usize,
    pub error_count: usize,
}

/// Approved and its end has passed.
fn is_finished(r: &Reservation, today: NaiveDate, minute: u16) -> bool {
    r.status == ReservationStatus::Approved
        && (r.date < today || (r.date == today && r.span.end() <= minute))
}

/// Still pending when it should have started.
fn is_overdue(r: &Reservation, today: NaiveDate, minute: u16) -> bool {
    r.status == ReservationStatus::Pending
        && (r.date < today || (r.date == today && r.span.start() <= minute))
}

impl Engine {
    /// Pending reservations dated today or earlier, oldest first.
    pub fn collect_expired_pending(&self, today: NaiveDate) -> Vec<Ulid> {
        let mut found: Vec<(NaiveDate, Ulid)> = self
            .reservations
            .iter()
            .filter(|r| r.status == ReservationStatus::Pending && r.date <= today)
            .map(|r| (r.date, r.id))
            .collect();
        found.sort();
        found.into_iter().map(|(_, id)| id).collect()
    }

    /// Daily sweep: reject every pending reservation whose date has arrived.
    pub async fn auto_reject_expired(&self, now: NaiveDateTime) -> SweepReport {
        let started = Instant::now();
        let candidates = self.collect_expired_pending(now.date());
        let mut report = SweepReport {
            total_found: candidates.len(),
            ..SweepReport::default()
        };
        for id in candidates {
            match self
                .sweep_transition(
                    id,
                    ReservationStatus::Pending,
                    ReservationStatus::Rejected,
                    AUTO_REJECT_NOTE,
                    "auto_reject",
                )
                .await
            {
                Ok(true) => report.rejected_count += 1,
                Ok(false) => debug!(reservation = %id, "auto-reject skipped, already transitioned"),
                Err(e) => {
                    report.error_count += 1;
                    error!(reservation = %id, "auto-reject failed: {e}");
                }
            }
        }
        self.finish_sweep("auto_reject", started, report.error_count);
        if report.error_count > 0 {
            self.notify.send(Notification::sweep_errors(
                "auto-rejection",
                report.error_count,
                report.rejected_count,
            ));
        }
        info!(
            found = report.total_found,
            rejected = report.rejected_count,
            errors = report.error_count,
            "auto-rejection sweep finished"
        );
        report
    }

    /// On-demand trigger of the daily sweep at the current local time.
    pub async fn run_lifecycle_sweep(&self) -> SweepReport {
        self.auto_reject_expired(chrono::Local::now().naive_local()).await
    }

    /// Fine-grained sweep: approved reservations that ended become used,
    /// pending ones whose start passed are rejected.
    pub async fn refresh_statuses(&self, now: NaiveDateTime) -> StatusRefreshReport {
        let started = Instant::now();
        let (today, minute) = (now.date(), minute_of(now));
        let (mut finished, mut overdue) = (Vec::new(), Vec::new());
        for r in self.reservations.iter() {
            if is_finished(&r, today, minute) {
                finished.push(r.id);
            } else if is_overdue(&r, today, minute) {
                overdue.push(r.id);
            }
        }
        finished.sort();
        overdue.sort();

        let mut report = StatusRefreshReport::default();
        for id in finished {
            match self
                .sweep_transition_with(
                    id,
                    ReservationStatus::Approved,
                    ReservationStatus::Used,
                    None,
                    "status_refresh",
                )
                .await
            {
                Ok(true) => report.marked_used += 1,
                Ok(false) => {}
                Err(e) => {
                    report.error_count += 1;
                    error!(reservation = %id, "marking reservation used failed: {e}");
                }
            }
        }
        for id in overdue {
            match self
                .sweep_transition(
                    id,
                    ReservationStatus::Pending,
                    ReservationStatus::Rejected,
                    EXPIRED_PENDING_NOTE,
                    "status_refresh",
                )
                .await
            {
                Ok(true) => report.rejected += 1,
                Ok(false) => {}
                Err(e) => {
                    report.error_count += 1;
                    error!(reservation = %id, "rejecting overdue reservation failed: {e}");
                }
            }
        }
        self.finish_sweep("status_refresh", started, report.error_count);
        if report.error_count > 0 {
            self.notify.send(Notification::sweep_errors(
                "status refresh",
                report.error_count,
                report.marked_used + report.rejected,
            ));
        }
        if report.marked_used + report.rejected + report.error_count > 0 {
            info!(
                used = report.marked_used,
                rejected = report.rejected,
                errors = report.error_count,
                "status refresh finished"
            );
        }
        report
    }

    async fn sweep_transition(
        &self,
        id: Ulid,
        expected: ReservationStatus,
        to: ReservationStatus,
        note: &str,
        sweep: &'static str,
    ) -> Result<bool, EngineError> {
        self.sweep_transition_with(id, expected, to, Some(note), sweep).await
    }

    /// Re-check the status under the commit lock. `Ok(false)` when someone else got there first.
    async fn sweep_transition_with(
        &self,
        id: Ulid,
        expected: ReservationStatus,
        to: ReservationStatus,
        note: Option<&str>,
        sweep: &'static str,
    ) -> Result<bool, EngineError> {
        let _guard = self.commit_lock.lock().await;
        let Some(current) = self.reservations.get(&id).map(|r| r.clone()) else {
            return Ok(false);
        };
        if current.status != expected {
            return Ok(false);
        }
        self.commit_status(&current, to, note, sweep).await?;
        Ok(true)
    }

    fn finish_sweep(&self, sweep: &'static str, started: Instant, errors: usize) {
        metrics::histogram!(SWEEP_DURATION_SECONDS, "sweep" => sweep)
            .record(started.elapsed().as_secs_f64());
        if errors > 0 {
            metrics::counter!(SWEEP_ERRORS_TOTAL, "sweep" => sweep).increment(errors as u64);
        }
    }
}
