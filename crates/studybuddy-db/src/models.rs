//! Typed adapters between SQLite rows and the shared models.
//!
//! Each `*_from_row` expects the column order of the matching `*_COLUMNS`
//! constant. Rows are validated once here; callers never see raw columns.

use rusqlite::Row;
use rusqlite::types::Type;

use studybuddy_types::api::MemberResponse;
use studybuddy_types::models::{Group, Membership, Message, Role, User};

pub(crate) const USER_COLUMNS: &str = "id, name, email, avatar_url, created_at";

pub(crate) const GROUP_COLUMNS: &str = "g.id, g.name, g.description, g.owner_id, g.is_private, g.created_at";

pub(crate) const MEMBERSHIP_COLUMNS: &str = "id, user_id, group_id, role, joined_at";

pub(crate) const MESSAGE_COLUMNS: &str = "m.id, m.group_id, m.author_id, u.name, u.avatar_url, m.message, m.attachment_url, m.created_at";

/// Which log a message query reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageScope {
    /// Messages posted to a group.
    Group(i64),
    /// Personal notes (no group) written by this author.
    Personal(i64),
}

/// Result of mapping an external auth subject to an internal user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    Existing(i64),
    Created(i64),
    /// The email already belongs to a user bound to another subject.
    EmailTaken,
}

impl ResolveOutcome {
    pub fn user_id(&self) -> Option<i64> {
        match self {
            Self::Existing(id) | Self::Created(id) => Some(*id),
            Self::EmailTaken => None,
        }
    }
}

pub(crate) fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        avatar_url: row.get(3)?,
        created_at: row.get(4)?,
    })
}

pub(crate) fn group_from_row(row: &Row<'_>) -> rusqlite::Result<Group> {
    Ok(Group {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        owner_id: row.get(3)?,
        is_private: row.get(4)?,
        created_at: row.get(5)?,
    })
}

pub(crate) fn membership_from_row(row: &Row<'_>) -> rusqlite::Result<Membership> {
    Ok(Membership {
        id: row.get(0)?,
        user_id: row.get(1)?,
        group_id: row.get(2)?,
        role: role_at(row, 3)?,
        joined_at: row.get(4)?,
    })
}

/// Columns: user_id, name, avatar_url, role, joined_at
pub(crate) fn member_from_row(row: &Row<'_>) -> rusqlite::Result<MemberResponse> {
    Ok(MemberResponse {
        user_id: row.get(0)?,
        name: row.get(1)?,
        avatar_url: row.get(2)?,
        role: role_at(row, 3)?,
        joined_at: row.get(4)?,
    })
}

pub(crate) fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        group_id: row.get(1)?,
        author_id: row.get(2)?,
        author_name: row.get(3)?,
        author_avatar_url: row.get(4)?,
        message: row.get(5)?,
        attachment_url: row.get(6)?,
        created_at: row.get(7)?,
    })
}

pub(crate) fn role_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Role> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

/// Partial update of a group. `description: Some(None)` clears it.
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupChanges<'a> {
    pub name: Option<&'a str>,
    pub description: Option<Option<&'a str>>,
    pub is_private: Option<bool>,
}
