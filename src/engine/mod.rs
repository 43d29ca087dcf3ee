mod availability;
mod cache;
mod conflict;
mod error;
mod queries;
mod reservations;
mod resolve;
mod sweep;
mod timetable;

pub use availability::ConflictInfo;
pub use cache::{CachedEntry, TimetableCache, TimetableSnapshot};
pub use conflict::{
    Alternative, ConflictResult, ConflictSlot, Party, PartyId, PartyKind, validate_time_policy,
};
pub use error::{EngineError, EntityKind, ValidationError};
pub use reservations::ReservationRequest;
pub use resolve::RoomIndex;
pub use sweep::{AUTO_REJECT_NOTE, EXPIRED_PENDING_NOTE, StatusRefreshReport, SweepReport};
pub use timetable::ClassGroupSpec;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info};
use ulid::Ulid;

use crate::config::ReservationPolicy;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::Wal;

// ── Group-commit journal writer ──────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the journal. Every append that is already queued when the writer wakes
/// up joins the same batch and shares a single fsync.
async fn wal_writer_loop(mut wal: Wal<Event>, mut rx: mpsc::Receiver<WalCommand>) {
    let mut batch: Vec<PendingAppend> = Vec::new();
    while let Some(first) = rx.recv().await {
        let mut control = None;
        match first {
            WalCommand::Append { event, response } => batch.push((event, response)),
            other => control = Some(other),
        }
        while control.is_none() {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => control = Some(other),
                Err(_) => break,
            }
        }
        if !batch.is_empty() {
            commit_batch(&mut wal, &mut batch);
        }
        if let Some(cmd) = control {
            handle_control(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal<Event>, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();
    let appended = batch.iter().try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so no half-written batch lingers in the buffer.
    let flushed = wal.flush_sync();
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    let outcome = appended.and(flushed);
    for (_, response) in batch.drain(..) {
        let reply = match &outcome {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = response.send(reply);
    }
}

fn handle_control(wal: &mut Wal<Event>, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut single = vec![(event, response)];
            commit_batch(wal, &mut single);
        }
    }
}

// ── Engine ───────────────────────────────────────────────

/// Tunables that are not part of the journaled state.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub policy: ReservationPolicy,
    pub cache_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            policy: ReservationPolicy::default(),
            cache_timeout: Duration::from_secs(300),
        }
    }
}

/// Authoritative room-allocation state.
///
/// Reads are synchronous over the concurrent maps. Every mutation is exactly one
/// journal event: appended through the group-commit writer, then applied.
pub struct Engine {
    pub(super) rooms: DashMap<RoomId, Room>,
    pub(super) users: DashMap<Ulid, User>,
    pub(super) branches: DashMap<Ulid, Branch>,
    pub(super) class_groups: DashMap<Ulid, ClassGroup>,
    pub(super) reservations: DashMap<Ulid, Reservation>,
    /// (room, date) → reservation ids in every status.
    pub(super) room_day_index: DashMap<(RoomId, NaiveDate), Vec<Ulid>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Held by every mutation from its checks through `persist`, and by compaction.
    pub(super) commit_lock: Mutex<()>,
    pub(super) cache: TimetableCache,
    pub(super) policy: ReservationPolicy,
    pub notify: Arc<NotifyHub>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        Self::with_options(wal_path, notify, EngineOptions::default())
    }

    pub fn with_options(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        options: EngineOptions,
    ) -> io::Result<Self> {
        let events = Wal::<Event>::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self::from_journal(&events, wal_tx, notify, options);
        info!(
            events = events.len(),
            rooms = engine.rooms.len(),
            class_groups = engine.class_groups.len(),
            reservations = engine.reservations.len(),
            "replayed journal {}",
            wal_path.display()
        );
        Ok(engine)
    }

    /// Rebuild state from already replayed events. New writes go to `wal_tx`.
    pub(super) fn from_journal(
        events: &[Event],
        wal_tx: mpsc::Sender<WalCommand>,
        notify: Arc<NotifyHub>,
        options: EngineOptions,
    ) -> Self {
        let engine = Self {
            rooms: DashMap::new(),
            users: DashMap::new(),
            branches: DashMap::new(),
            class_groups: DashMap::new(),
            reservations: DashMap::new(),
            room_day_index: DashMap::new(),
            wal_tx,
            commit_lock: Mutex::new(()),
            cache: TimetableCache::new(options.cache_timeout),
            policy: options.policy,
            notify,
        };
        for event in events {
            engine.apply(event);
        }
        engine
    }

    pub fn policy(&self) -> &ReservationPolicy {
        &self.policy
    }

    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Wal("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("journal writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))
    }

    /// Journal the event, then apply it. Nothing is applied if the append fails.
    /// Caller holds the commit lock.
    pub(super) async fn persist(&self, event: Event) -> Result<(), EngineError> {
        self.wal_append(&event).await?;
        self.apply(&event);
        Ok(())
    }

    /// Apply one event to memory. Used identically by live mutations and replay.
    fn apply(&self, event: &Event) {
        match event {
            Event::RoomUpserted { room } => {
                self.rooms.insert(room.id.clone(), room.clone());
                self.cache.invalidate();
            }
            Event::RoomDeleted { id } => {
                self.rooms.remove(id);
                self.cache.invalidate();
            }
            Event::UserUpserted { user } => {
                self.users.insert(user.id, user.clone());
            }
            Event::UserDeleted { id } => {
                self.users.remove(id);
                let owned: Vec<Ulid> = self
                    .reservations
                    .iter()
                    .filter(|r| r.user_id == *id)
                    .map(|r| r.id)
                    .collect();
                for reservation_id in owned {
                    self.remove_reservation(&reservation_id);
                }
                for mut group in self.class_groups.iter_mut() {
                    if group.instructor_id == Some(*id) {
                        group.instructor_id = None;
                    }
                }
                for mut branch in self.branches.iter_mut() {
                    branch.student_ids.retain(|s| s != id);
                }
            }
            Event::BranchUpserted { branch } => {
                self.branches.insert(branch.id, branch.clone());
            }
            Event::ClassGroupUpserted {
                id,
                name,
                course_code,
                instructor_id,
                branch_id,
            } => {
                let previous = self.class_groups.get(id).map(|g| g.clone());
                let group = ClassGroup {
                    id: *id,
                    name: name.clone(),
                    course_code: course_code.clone(),
                    instructor_id: *instructor_id,
                    branch_id: *branch_id,
                    entries: previous.as_ref().map(|g| g.entries.clone()).unwrap_or_default(),
                };
                self.class_groups.insert(*id, group);
                if let Some(prev) = &previous {
                    self.resync_instructor(prev.instructor_id, &prev.course_code);
                }
                self.resync_instructor(*instructor_id, course_code);
                self.cache.invalidate();
            }
            Event::ClassGroupDeleted { id } => {
                if let Some((_, group)) = self.class_groups.remove(id) {
                    self.resync_instructor(group.instructor_id, &group.course_code);
                }
                self.cache.invalidate();
            }
            Event::TimetableReplaced { class_group_id, entries } => {
                let owner = self.class_groups.get_mut(class_group_id).map(|mut group| {
                    group.entries = entries.clone();
                    (group.instructor_id, group.course_code.clone())
                });
                if let Some((instructor_id, course_code)) = owner {
                    self.resync_instructor(instructor_id, &course_code);
                }
                self.cache.invalidate();
            }
            Event::ReservationCreated { reservation } => {
                self.room_day_index
                    .entry((reservation.room_id.clone(), reservation.date))
                    .or_default()
                    .push(reservation.id);
                self.reservations.insert(reservation.id, reservation.clone());
            }
            Event::ReservationEdited {
                id,
                room_id,
                date,
                span,
                purpose,
                notes,
            } => {
                let old_key = self.reservations.get_mut(id).map(|mut r| {
                    let old_key = (r.room_id.clone(), r.date);
                    r.room_id = room_id.clone();
                    r.date = *date;
                    r.span = *span;
                    r.purpose = purpose.clone();
                    r.notes = notes.clone();
                    old_key
                });
                if let Some(old_key) = old_key
                    && old_key != (room_id.clone(), *date)
                {
                    self.unindex(&old_key, id);
                    self.room_day_index.entry((room_id.clone(), *date)).or_default().push(*id);
                }
            }
            Event::ReservationStatusChanged { id, status, notes } => {
                if let Some(mut r) = self.reservations.get_mut(id) {
                    r.status = *status;
                    r.notes = notes.clone();
                }
            }
        }
    }

    fn remove_reservation(&self, id: &Ulid) {
        if let Some((_, r)) = self.reservations.remove(id) {
            self.unindex(&(r.room_id, r.date), id);
        }
    }

    fn unindex(&self, key: &(RoomId, NaiveDate), id: &Ulid) {
        let emptied = match self.room_day_index.get_mut(key) {
            Some(mut ids) => {
                ids.retain(|x| x != id);
                ids.is_empty()
            }
            None => false,
        };
        if emptied {
            self.room_day_index.remove_if(key, |_, ids| ids.is_empty());
        }
    }

    /// Rebuild the instructor's personal copies for one course code from every
    /// group that instructor teaches under that code.
    fn resync_instructor(&self, instructor_id: Option<Ulid>, course_code: &str) {
        let Some(instructor_id) = instructor_id else { return };
        let prefix = sync_prefix(course_code);
        let mut copies: Vec<(Ulid, Vec<TimetableEntry>)> = self
            .class_groups
            .iter()
            .filter(|g| g.instructor_id == Some(instructor_id) && g.course_code == course_code)
            .map(|g| {
                let entries = g
                    .entries
                    .iter()
                    .map(|e| TimetableEntry {
                        name: format!("{prefix}{}", e.name),
                        ..e.clone()
                    })
                    .collect();
                (g.id, entries)
            })
            .collect();
        copies.sort_by_key(|(id, _)| *id);
        if let Some(mut user) = self.users.get_mut(&instructor_id) {
            user.timetable.retain(|e| !e.name.starts_with(&prefix));
            user.timetable.extend(copies.into_iter().flat_map(|(_, entries)| entries));
            debug!(
                %instructor_id,
                course_code,
                entries = user.timetable.len(),
                "instructor timetable synchronized"
            );
        }
    }

    // ── Lookups ──────────────────────────────────────────

    pub(super) fn require_room(&self, id: &str) -> Result<Room, EngineError> {
        self.rooms
            .get(id)
            .map(|r| r.clone())
            .ok_or_else(|| EngineError::not_found(EntityKind::Room, id))
    }

    pub(super) fn require_user(&self, id: Ulid) -> Result<User, EngineError> {
        self.users
            .get(&id)
            .map(|u| u.clone())
            .ok_or_else(|| EngineError::not_found(EntityKind::User, id))
    }

    pub(super) fn require_class_group(&self, id: Ulid) -> Result<ClassGroup, EngineError> {
        self.class_groups
            .get(&id)
            .map(|g| g.clone())
            .ok_or_else(|| EngineError::not_found(EntityKind::ClassGroup, id))
    }

    pub(super) fn require_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.reservations
            .get(&id)
            .map(|r| r.clone())
            .ok_or_else(|| EngineError::not_found(EntityKind::Reservation, id))
    }

    /// Display name for a user, falling back to the raw id for dangling references.
    pub(super) fn user_name(&self, id: Ulid) -> String {
        self.users.get(&id).map(|u| u.full_name()).unwrap_or_else(|| id.to_string())
    }

    // ── Journal maintenance ──────────────────────────────

    /// Replace the journal with the minimal event sequence that rebuilds the current state.
    ///
    /// The commit lock is held until the writer has swapped the file, so no
    /// append can land in the old journal after the snapshot was taken.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _guard = self.commit_lock.lock().await;
        let events = self.snapshot_events();
        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Wal("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("journal writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))?;
        info!(events = count, "journal compacted");
        Ok(())
    }

    fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::new();
        let mut rooms: Vec<Room> = self.rooms.iter().map(|r| r.clone()).collect();
        rooms.sort_by(|a, b| a.id.cmp(&b.id));
        events.extend(rooms.into_iter().map(|room| Event::RoomUpserted { room }));

        let mut users: Vec<User> = self.users.iter().map(|u| u.clone()).collect();
        users.sort_by_key(|u| u.id);
        events.extend(users.into_iter().map(|user| Event::UserUpserted { user }));

        let mut branches: Vec<Branch> = self.branches.iter().map(|b| b.clone()).collect();
        branches.sort_by_key(|b| b.id);
        events.extend(branches.into_iter().map(|branch| Event::BranchUpserted { branch }));

        let mut groups: Vec<ClassGroup> = self.class_groups.iter().map(|g| g.clone()).collect();
        groups.sort_by_key(|g| g.id);
        for group in groups {
            events.push(Event::ClassGroupUpserted {
                id: group.id,
                name: group.name,
                course_code: group.course_code,
                instructor_id: group.instructor_id,
                branch_id: group.branch_id,
            });
            events.push(Event::TimetableReplaced {
                class_group_id: group.id,
                entries: group.entries,
            });
        }

        let mut reservations: Vec<Reservation> =
            self.reservations.iter().map(|r| r.clone()).collect();
        reservations.sort_by_key(|r| r.id);
        events.extend(
            reservations
                .into_iter()
                .map(|reservation| Event::ReservationCreated { reservation }),
        );
        events
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
