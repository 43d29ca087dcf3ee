use serde::Deserialize;
use tracing::{info, warn};
use ulid::Ulid;

use super::conflict::validate_time_policy;
use super::{Engine, EngineError, EntityKind, ValidationError};
use crate::limits::{
    MAX_BRANCH_STUDENTS, MAX_CLASS_GROUPS, MAX_ENTRIES_PER_CLASS_GROUP, MAX_NAME_LEN, MAX_ROOMS,
    MAX_USERS,
};
use crate::model::{Branch, ClassGroup, EntryDraft, Event, Room, RoomId, TimetableEntry, User};
use crate::notify::Recipient;

/// Class group metadata as submitted by the administrative side.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClassGroupSpec {
    pub id: Ulid,
    pub name: String,
    pub course_code: String,
    pub instructor_id: Option<Ulid>,
    pub branch_id: Option<Ulid>,
}

fn check_name(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Required(field));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(ValidationError::FieldTooLong { field, max: MAX_NAME_LEN });
    }
    Ok(())
}

/// Pairwise overlap within one proposal.
fn check_self_overlap(entries: &[TimetableEntry]) -> Result<(), ValidationError> {
    for (i, a) in entries.iter().enumerate() {
        if let Some(b) = entries[i + 1..].iter().find(|b| a.collides_with(b)) {
            return Err(ValidationError::SelfOverlap {
                day: a.day,
                first: a.span,
                second: b.span,
            });
        }
    }
    Ok(())
}

impl Engine {
    /// Validate a class group's new timetable and, if nothing collides, replace
    /// its entries and resynchronize the instructor's copies in one journal record.
    ///
    /// Locations are stored as canonical room ids.
    pub async fn validate_and_save_timetable(
        &self,
        class_group_id: Ulid,
        drafts: &[EntryDraft],
    ) -> Result<Vec<TimetableEntry>, EngineError> {
        if drafts.len() > MAX_ENTRIES_PER_CLASS_GROUP {
            return Err(EngineError::LimitExceeded("too many timetable entries"));
        }
        let mut entries = drafts.iter().map(EntryDraft::parse).collect::<Result<Vec<_>, _>>()?;
        validate_time_policy(&entries)?;
        check_self_overlap(&entries)?;

        let _guard = self.commit_lock.lock().await;
        let group = self.require_class_group(class_group_id)?;
        let rooms = self.room_index();
        for entry in entries.iter_mut().filter(|e| e.has_location()) {
            let room = rooms
                .resolve(&entry.location)
                .ok_or_else(|| EngineError::not_found(EntityKind::Room, &entry.location))?;
            entry.location = room.to_string();
        }

        let result = self.conflicts_for(&group, &entries, &rooms)?;
        if result.has_conflicts() {
            warn!(
                class_group = %class_group_id,
                slots = result.slots().len(),
                kinds = ?result.kinds(),
                "timetable rejected"
            );
            return Err(EngineError::Conflict(Box::new(result)));
        }

        self.persist(Event::TimetableReplaced {
            class_group_id,
            entries: entries.clone(),
        })
        .await?;
        info!(class_group = %class_group_id, entries = entries.len(), "timetable saved");
        Ok(entries)
    }

    pub async fn upsert_room(&self, room: Room) -> Result<(), EngineError> {
        check_name("room id", &room.id)?;
        check_name("room label", &room.label)?;
        let _guard = self.commit_lock.lock().await;
        if !self.rooms.contains_key(&room.id) && self.rooms.len() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        self.persist(Event::RoomUpserted { room }).await
    }

    /// Reservations and timetable entries keep referring to the id; they stop resolving.
    pub async fn delete_room(&self, id: &str) -> Result<(), EngineError> {
        let _guard = self.commit_lock.lock().await;
        self.require_room(id)?;
        self.persist(Event::RoomDeleted { id: id.to_string() }).await
    }

    /// Profile fields are replaced; an existing user's personal timetable is kept.
    pub async fn upsert_user(&self, mut user: User) -> Result<(), EngineError> {
        check_name("first name", &user.first_name)?;
        check_name("last name", &user.last_name)?;
        let _guard = self.commit_lock.lock().await;
        match self.users.get(&user.id) {
            Some(existing) => user.timetable = existing.timetable.clone(),
            None if self.users.len() >= MAX_USERS => {
                return Err(EngineError::LimitExceeded("too many users"));
            }
            None => {}
        }
        self.persist(Event::UserUpserted { user }).await
    }

    /// Removes the user together with every reservation they own, and closes
    /// their notification channel.
    pub async fn delete_user(&self, id: Ulid) -> Result<(), EngineError> {
        let _guard = self.commit_lock.lock().await;
        self.require_user(id)?;
        let owned = self.reservations.iter().filter(|r| r.user_id == id).count();
        self.persist(Event::UserDeleted { id }).await?;
        self.notify.remove(&Recipient::User(id));
        info!(user = %id, reservations = owned, "user deleted");
        Ok(())
    }

    pub async fn upsert_branch(&self, branch: Branch) -> Result<(), EngineError> {
        check_name("branch name", &branch.name)?;
        if branch.student_ids.len() > MAX_BRANCH_STUDENTS {
            return Err(EngineError::LimitExceeded("too many students in branch"));
        }
        let _guard = self.commit_lock.lock().await;
        if let Some(missing) = branch.student_ids.iter().find(|id| !self.users.contains_key(*id)) {
            return Err(EngineError::not_found(EntityKind::User, missing));
        }
        self.persist(Event::BranchUpserted { branch }).await
    }

    /// Create or update class group metadata. The group's existing entries are
    /// re-checked against the new instructor and branch before anything is written.
    pub async fn upsert_class_group(&self, spec: ClassGroupSpec) -> Result<(), EngineError> {
        check_name("class group name", &spec.name)?;
        check_name("course code", &spec.course_code)?;
        let _guard = self.commit_lock.lock().await;
        if let Some(instructor_id) = spec.instructor_id {
            self.require_user(instructor_id)?;
        }
        if let Some(branch_id) = spec.branch_id
            && !self.branches.contains_key(&branch_id)
        {
            return Err(EngineError::not_found(EntityKind::Branch, branch_id));
        }
        let entries = match self.class_groups.get(&spec.id) {
            Some(existing) => existing.entries.clone(),
            None if self.class_groups.len() >= MAX_CLASS_GROUPS => {
                return Err(EngineError::LimitExceeded("too many class groups"));
            }
            None => Vec::new(),
        };
        let candidate = ClassGroup {
            id: spec.id,
            name: spec.name.clone(),
            course_code: spec.course_code.clone(),
            instructor_id: spec.instructor_id,
            branch_id: spec.branch_id,
            entries,
        };
        let result = self.conflicts_for(&candidate, &candidate.entries, &self.room_index())?;
        if result.has_conflicts() {
            return Err(EngineError::Conflict(Box::new(result)));
        }
        self.persist(Event::ClassGroupUpserted {
            id: spec.id,
            name: spec.name,
            course_code: spec.course_code,
            instructor_id: spec.instructor_id,
            branch_id: spec.branch_id,
        })
        .await
    }

    pub async fn delete_class_group(&self, id: Ulid) -> Result<(), EngineError> {
        let _guard = self.commit_lock.lock().await;
        self.require_class_group(id)?;
        self.persist(Event::ClassGroupDeleted { id }).await
    }

    /// Canonical ids of every room the class group's entries use.
    pub fn rooms_used_by(&self, class_group_id: Ulid) -> Result<Vec<RoomId>, EngineError> {
        let group = self.require_class_group(class_group_id)?;
        let rooms = self.room_index();
        let mut used: Vec<RoomId> = group
            .entries
            .iter()
            .filter_map(|e| rooms.resolve(&e.location).map(str::to_string))
            .collect();
        used.sort();
        used.dedup();
        Ok(used)
    }
}
