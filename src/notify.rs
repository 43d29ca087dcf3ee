use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::interval::format_minutes;
use crate::model::{Reservation, ReservationStatus};
use crate::observability::NOTIFICATION_FAILURES_TOTAL;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Recipient {
    User(Ulid),
    /// Every administrator.
    Admins,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum NotificationKind {
    StatusChanged {
        reservation_id: Ulid,
        from: ReservationStatus,
        to: ReservationStatus,
        reason: Option<String>,
    },
    ReservationRequested {
        reservation_id: Ulid,
    },
    ReservationUpdated {
        reservation_id: Ulid,
    },
    ReservationCanceled {
        reservation_id: Ulid,
    },
    SweepErrors {
        sweep: String,
        error_count: usize,
        success_count: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub recipient: Recipient,
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
}

fn describe(reservation: &Reservation, room_label: &str) -> String {
    format!(
        "room {room_label} on {} from {} to {}",
        reservation.date.format("%Y-%m-%d"),
        format_minutes(reservation.span.start()),
        format_minutes(reservation.span.end())
    )
}

impl Notification {
    /// Sent to the owner on every status change, whoever triggered it.
    pub fn status_changed(
        reservation: &Reservation,
        room_label: &str,
        from: ReservationStatus,
        reason: Option<&str>,
    ) -> Self {
        let to = reservation.status;
        let (title, verb) = match to {
            ReservationStatus::Approved => ("Reservation Approved", "approved"),
            ReservationStatus::Rejected => ("Reservation Rejected", "rejected"),
            ReservationStatus::Used => ("Reservation Completed", "marked as used"),
            ReservationStatus::Canceled => ("Reservation Canceled", "canceled"),
            ReservationStatus::Pending => ("Reservation Pending", "set to pending"),
        };
        let mut message = format!(
            "Your reservation of {} has been {verb}.",
            describe(reservation, room_label)
        );
        if let Some(reason) = reason {
            message.push_str(&format!(" Reason: {reason}"));
        }
        Self {
            recipient: Recipient::User(reservation.user_id),
            title: title.into(),
            message,
            kind: NotificationKind::StatusChanged {
                reservation_id: reservation.id,
                from,
                to,
                reason: reason.map(str::to_string),
            },
        }
    }

    pub fn request_submitted(reservation: &Reservation, requester: &str, room_label: &str) -> Self {
        Self {
            recipient: Recipient::Admins,
            title: "New Reservation Request".into(),
            message: format!(
                "{requester} requested {} for: {}",
                describe(reservation, room_label),
                reservation.purpose
            ),
            kind: NotificationKind::ReservationRequested {
                reservation_id: reservation.id,
            },
        }
    }

    pub fn request_updated(reservation: &Reservation, requester: &str, room_label: &str) -> Self {
        Self {
            recipient: Recipient::Admins,
            title: "Reservation Request Updated".into(),
            message: format!(
                "{requester} updated their request to {}",
                describe(reservation, room_label)
            ),
            kind: NotificationKind::ReservationUpdated {
                reservation_id: reservation.id,
            },
        }
    }

    pub fn canceled_by_owner(reservation: &Reservation, requester: &str, room_label: &str) -> Self {
        Self {
            recipient: Recipient::Admins,
            title: "Reservation Canceled".into(),
            message: format!(
                "{requester} canceled their reservation of {}",
                describe(reservation, room_label)
            ),
            kind: NotificationKind::ReservationCanceled {
                reservation_id: reservation.id,
            },
        }
    }

    pub fn sweep_errors(sweep: &str, error_count: usize, success_count: usize) -> Self {
        Self {
            recipient: Recipient::Admins,
            title: "Reservation Sweep Errors".into(),
            message: format!(
                "The {sweep} sweep completed with {error_count} errors and \
                 {success_count} successful transitions. Check the service logs for details."
            ),
            kind: NotificationKind::SweepErrors {
                sweep: sweep.to_string(),
                error_count,
                success_count,
            },
        }
    }
}

#[derive(Debug, Error)]
#[error("notification delivery failed: {0}")]
pub struct DeliveryError(pub String);

/// Outbound delivery (email and the like). Failures never affect the caller.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError>;
}

/// Writes every notification to the log as JSON.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError> {
        let body = serde_json::to_string(notification).map_err(|e| DeliveryError(e.to_string()))?;
        info!(target: "roomwarden::mail", "{body}");
        Ok(())
    }
}

/// Broadcast hub, one channel per recipient.
pub struct NotifyHub {
    channels: DashMap<Recipient, broadcast::Sender<Notification>>,
    mailer: Option<Arc<dyn Mailer>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            mailer: None,
        }
    }

    pub fn with_mailer(mailer: Arc<dyn Mailer>) -> Self {
        Self {
            channels: DashMap::new(),
            mailer: Some(mailer),
        }
    }

    /// Subscribe to notifications for a recipient. Creates the channel if needed.
    pub fn subscribe(&self, recipient: Recipient) -> broadcast::Receiver<Notification> {
        self.channels
            .entry(recipient)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Fire-and-forget. Live subscribers get it immediately; the mailer, if any,
    /// gets it on a spawned task.
    pub fn send(&self, notification: Notification) {
        if let Some(sender) = self.channels.get(&notification.recipient) {
            let _ = sender.send(notification.clone());
        }
        let Some(mailer) = self.mailer.clone() else { return };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = mailer.deliver(&notification).await {
                        warn!(
                            recipient = ?notification.recipient,
                            title = %notification.title,
                            "{e}"
                        );
                        metrics::counter!(NOTIFICATION_FAILURES_TOTAL).increment(1);
                    }
                });
            }
            Err(_) => {
                debug!("no runtime, skipping delivery of {:?}", notification.title);
                metrics::counter!(NOTIFICATION_FAILURES_TOTAL).increment(1);
            }
        }
    }

    pub fn remove(&self, recipient: &Recipient) {
        self.channels.remove(recipient);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::Span;
    use chrono::NaiveDate;
    use std::sync::Mutex;

    fn reservation(status: ReservationStatus) -> Reservation {
        Reservation {
            id: Ulid::new(),
            user_id: Ulid::new(),
            room_id: "r1".into(),
            date: NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(),
            span: Span::parse("10:00", "11:00").unwrap(),
            purpose: "Study group".into(),
            notes: None,
            status,
            created_at: 0,
        }
    }

    #[derive(Default)]
    struct RecordingMailer {
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError> {
            self.seen.lock().unwrap().push(notification.title.clone());
            if self.fail {
                return Err(DeliveryError("smtp down".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn subscriber_receives_own_notifications_only() {
        let hub = NotifyHub::new();
        let r = reservation(ReservationStatus::Approved);
        let mut owner = hub.subscribe(Recipient::User(r.user_id));
        let mut admins = hub.subscribe(Recipient::Admins);

        hub.send(Notification::status_changed(&r, "101", ReservationStatus::Pending, None));

        let received = owner.recv().await.unwrap();
        assert_eq!(received.title, "Reservation Approved");
        assert_eq!(
            received.message,
            "Your reservation of room 101 on 2024-03-04 from 10:00 to 11:00 has been approved."
        );
        assert!(admins.try_recv().is_err());
    }

    #[test]
    fn send_without_subscribers_or_runtime_is_noop() {
        let hub = NotifyHub::new();
        hub.send(Notification::sweep_errors("auto-rejection", 2, 5));
        hub.remove(&Recipient::Admins);
    }

    #[tokio::test]
    async fn mailer_failures_do_not_reach_the_sender() {
        let mailer = Arc::new(RecordingMailer {
            fail: true,
            ..Default::default()
        });
        let hub = NotifyHub::with_mailer(mailer.clone());
        let r = reservation(ReservationStatus::Rejected);
        hub.send(Notification::status_changed(
            &r,
            "101",
            ReservationStatus::Pending,
            Some("room closed"),
        ));
        for _ in 0..50 {
            if !mailer.seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(*mailer.seen.lock().unwrap(), vec!["Reservation Rejected".to_string()]);
    }

    #[test]
    fn log_mailer_accepts_every_kind() {
        let r = reservation(ReservationStatus::Pending);
        for n in [
            Notification::request_submitted(&r, "Ada Lovelace", "101"),
            Notification::request_updated(&r, "Ada Lovelace", "101"),
            Notification::canceled_by_owner(&r, "Ada Lovelace", "101"),
            Notification::sweep_errors("status refresh", 1, 0),
        ] {
            tokio_test::assert_ok!(tokio_test::block_on(LogMailer.deliver(&n)));
        }
    }

    #[test]
    fn rejection_reason_is_included() {
        let r = reservation(ReservationStatus::Rejected);
        let n = Notification::status_changed(
            &r,
            "101",
            ReservationStatus::Pending,
            Some("room closed"),
        );
        assert!(n.message.ends_with("has been rejected. Reason: room closed"));
        assert_eq!(
            n.kind,
            NotificationKind::StatusChanged {
                reservation_id: r.id,
                from: ReservationStatus::Pending,
                to: ReservationStatus::Rejected,
                reason: Some("room closed".into()),
            }
        );
    }
}
