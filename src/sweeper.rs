use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime, NaiveTime, TimeDelta};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::engine::Engine;

pub fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Time until the next occurrence of `at`. An occurrence exactly at `now` is
/// tomorrow's, so a sweep that just ran does not fire twice.
pub fn until_next(at: NaiveTime, now: NaiveDateTime) -> Duration {
    let today = now.date().and_time(at);
    let next = if today > now { today } else { today + TimeDelta::days(1) };
    (next - now).to_std().unwrap_or_default()
}

/// Daily auto-rejection of pending reservations whose date has arrived.
pub async fn run_auto_rejection(engine: Arc<Engine>, at: NaiveTime) {
    loop {
        let wait = until_next(at, local_now());
        debug!("next auto-rejection sweep in {}s", wait.as_secs());
        tokio::time::sleep(wait).await;
        let report = engine.auto_reject_expired(local_now()).await;
        if report.error_count > 0 {
            warn!(
                errors = report.error_count,
                rejected = report.rejected_count,
                "auto-rejection sweep had failures"
            );
        }
    }
}

/// Periodic used/overdue status refresh.
pub async fn run_status_refresh(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        engine.refresh_statuses(local_now()).await;
    }
}

/// Compact the journal once enough appends have accumulated.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    interval.tick().await;
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!(appends, "journal compaction finished"),
            Err(e) => warn!("journal compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::AUTO_REJECT_NOTE;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use chrono::NaiveDate;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("roomwarden_test_sweeper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn at(date: &str, time: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M").unwrap()
    }

    #[test]
    fn next_run_is_later_today_or_tomorrow() {
        let one_am = NaiveTime::from_hms_opt(1, 0, 0).unwrap();
        assert_eq!(until_next(one_am, at("2024-03-04", "00:30")), Duration::from_secs(30 * 60));
        assert_eq!(until_next(one_am, at("2024-03-04", "01:00")), Duration::from_secs(24 * 3600));
        assert_eq!(until_next(one_am, at("2024-03-04", "23:00")), Duration::from_secs(2 * 3600));
    }

    #[tokio::test]
    async fn compactor_loop_shrinks_journal_when_due() {
        let path = test_wal_path("compactor.wal");
        let engine = Arc::new(Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap());
        for i in 0..5 {
            engine
                .upsert_room(Room {
                    id: "r1".into(),
                    label: format!("Room v{i}"),
                    kind: RoomKind::StudyRoom,
                    category: "study".into(),
                    capacity: 4,
                    features: Vec::new(),
                })
                .await
                .unwrap();
        }
        assert_eq!(engine.wal_appends_since_compact().await, 5);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert_eq!(crate::wal::Wal::<Event>::replay(&path).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn swept_reservation_carries_note() {
        let path = test_wal_path("sweep_note.wal");
        let engine = Arc::new(Engine::new(path, Arc::new(NotifyHub::new())).unwrap());
        let owner = Ulid::new();
        engine
            .upsert_room(Room {
                id: "r1".into(),
                label: "R1".into(),
                kind: RoomKind::StudyRoom,
                category: "study".into(),
                capacity: 4,
                features: Vec::new(),
            })
            .await
            .unwrap();
        engine
            .upsert_user(User {
                id: owner,
                first_name: "Ada".into(),
                last_name: "Lovelace".into(),
                email: "ada@example.edu".into(),
                role: Role::Student,
                timetable: Vec::new(),
            })
            .await
            .unwrap();
        let reservation = engine
            .create_reservation(
                crate::engine::ReservationRequest {
                    user_id: owner,
                    room_id: "r1".into(),
                    date: NaiveDate::from_ymd_opt(2024, 3, 3).unwrap(),
                    start: "10:00".into(),
                    end: "11:00".into(),
                    purpose: "review".into(),
                    notes: Some("bring laptop".into()),
                },
                at("2024-03-01", "12:00"),
            )
            .await
            .unwrap();

        let report = engine.auto_reject_expired(at("2024-03-04", "01:00")).await;
        assert_eq!(report.rejected_count, 1);
        let stored = engine.get_reservation(reservation.id).unwrap();
        assert_eq!(stored.status, ReservationStatus::Rejected);
        let expected = format!("bring laptop | {AUTO_REJECT_NOTE}");
        assert_eq!(stored.notes.as_deref(), Some(expected.as_str()));
    }
}
