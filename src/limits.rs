//! Hard caps on input sizes. Every mutation checks these before journaling.

pub const MAX_ROOMS: usize = 10_000;
pub const MAX_USERS: usize = 200_000;
pub const MAX_CLASS_GROUPS: usize = 20_000;
pub const MAX_ENTRIES_PER_CLASS_GROUP: usize = 64;
pub const MAX_BRANCH_STUDENTS: usize = 5_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_PURPOSE_LEN: usize = 1_024;
pub const MAX_NOTES_LEN: usize = 4_096;
