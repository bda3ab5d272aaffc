use anyhow::{Result, anyhow, bail};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use studybuddy_types::api::MemberResponse;
use studybuddy_types::models::{Group, Membership, Message, Role, User};

use crate::Database;
use crate::models::{
    GROUP_COLUMNS, GroupChanges, MEMBERSHIP_COLUMNS, MESSAGE_COLUMNS, MessageScope, ResolveOutcome,
    USER_COLUMNS, group_from_row, member_from_row, membership_from_row, message_from_row,
    role_at, user_from_row,
};

impl Database {
    // -- Identities / users --

    /// Map an external auth subject to an internal user id, creating the user
    /// and the mapping on first sight.
    pub fn resolve_identity(
        &self,
        subject: &str,
        email: &str,
        now: DateTime<Utc>,
    ) -> Result<ResolveOutcome> {
        self.with_tx(|tx| {
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT user_id FROM identities WHERE subject = ?1",
                    [subject],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(user_id) = existing {
                return Ok(ResolveOutcome::Existing(user_id));
            }

            let email_owner: Option<i64> = tx
                .query_row("SELECT id FROM users WHERE email = ?1", [email], |row| row.get(0))
                .optional()?;
            if email_owner.is_some() {
                return Ok(ResolveOutcome::EmailTaken);
            }

            let name = email.split('@').next().filter(|s| !s.is_empty()).unwrap_or(email);
            tx.execute(
                "INSERT INTO users (name, email, created_at) VALUES (?1, ?2, ?3)",
                params![name, email, now],
            )?;
            let user_id = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO identities (subject, user_id, created_at) VALUES (?1, ?2, ?3)",
                params![subject, user_id, now],
            )?;
            Ok(ResolveOutcome::Created(user_id))
        })
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        self.with_conn(|conn| query_user(conn, id))
    }

    /// Apply profile edits; `None` fields are left unchanged.
    pub fn update_profile(
        &self,
        id: i64,
        name: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<Option<User>> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET name = COALESCE(?2, name), avatar_url = COALESCE(?3, avatar_url)
                 WHERE id = ?1",
                params![id, name, avatar_url],
            )?;
            query_user(conn, id)
        })
    }

    // -- Groups --

    /// All groups, newest first. `search` matches name or description,
    /// case-insensitively, as a substring.
    pub fn list_groups(&self, search: Option<&str>) -> Result<Vec<Group>> {
        let pattern = search
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{}%", escape_like(&s.to_lowercase())));

        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {GROUP_COLUMNS} FROM study_groups g
                 WHERE ?1 IS NULL
                    OR LOWER(g.name) LIKE ?1 ESCAPE '\\'
                    OR LOWER(COALESCE(g.description, '')) LIKE ?1 ESCAPE '\\'
                 ORDER BY g.created_at DESC, g.id DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([pattern], group_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Groups the user holds a membership in, newest first.
    pub fn list_user_groups(&self, user_id: i64) -> Result<Vec<Group>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {GROUP_COLUMNS} FROM study_groups g
                 JOIN memberships ms ON ms.group_id = g.id
                 WHERE ms.user_id = ?1
                 ORDER BY g.created_at DESC, g.id DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([user_id], group_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Public groups the user has not joined, newest first.
    pub fn discover_groups(&self, user_id: i64) -> Result<Vec<Group>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {GROUP_COLUMNS} FROM study_groups g
                 WHERE g.is_private = 0
                   AND g.id NOT IN (SELECT group_id FROM memberships WHERE user_id = ?1)
                 ORDER BY g.created_at DESC, g.id DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([user_id], group_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_group(&self, id: i64) -> Result<Option<Group>> {
        self.with_conn(|conn| query_group(conn, id))
    }

    /// Insert a group and its owner membership atomically.
    pub fn create_group(
        &self,
        owner_id: i64,
        name: &str,
        description: Option<&str>,
        is_private: bool,
        now: DateTime<Utc>,
    ) -> Result<Group> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO study_groups (name, description, owner_id, is_private, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![name, description, owner_id, is_private, now],
            )?;
            let group_id = tx.last_insert_rowid();

            tx.execute(
                "INSERT INTO memberships (user_id, group_id, role, joined_at)
                 VALUES (?1, ?2, 'owner', ?3)",
                params![owner_id, group_id, now],
            )?;

            query_group(tx, group_id)?.ok_or_else(|| anyhow!("group {} missing after insert", group_id))
        })
    }

    pub fn update_group(&self, id: i64, changes: GroupChanges<'_>) -> Result<Option<Group>> {
        let (set_description, description) = match changes.description {
            Some(value) => (true, value),
            None => (false, None),
        };

        self.with_conn(|conn| {
            conn.execute(
                "UPDATE study_groups SET
                    name = COALESCE(?2, name),
                    description = CASE WHEN ?3 THEN ?4 ELSE description END,
                    is_private = COALESCE(?5, is_private)
                 WHERE id = ?1",
                params![id, changes.name, set_description, description, changes.is_private],
            )?;
            query_group(conn, id)
        })
    }

    /// Delete a group with its messages and memberships. Returns false if absent.
    pub fn delete_group(&self, id: i64) -> Result<bool> {
        self.with_tx(|tx| {
            tx.execute("DELETE FROM messages WHERE group_id = ?1", [id])?;
            tx.execute("DELETE FROM memberships WHERE group_id = ?1", [id])?;
            let removed = tx.execute("DELETE FROM study_groups WHERE id = ?1", [id])?;
            Ok(removed > 0)
        })
    }

    // -- Memberships --

    pub fn membership_role(&self, user_id: i64, group_id: i64) -> Result<Option<Role>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT role FROM memberships WHERE user_id = ?1 AND group_id = ?2",
                [user_id, group_id],
                |row| role_at(row, 0),
            )
            .optional()
            .map_err(Into::into)
        })
    }

    pub fn add_member(&self, user_id: i64, group_id: i64, now: DateTime<Utc>) -> Result<Membership> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO memberships (user_id, group_id, role, joined_at)
                 VALUES (?1, ?2, 'member', ?3)",
                params![user_id, group_id, now],
            )?;
            let sql = format!("SELECT {MEMBERSHIP_COLUMNS} FROM memberships WHERE id = ?1");
            let membership = conn.query_row(&sql, [conn.last_insert_rowid()], membership_from_row)?;
            Ok(membership)
        })
    }

    /// Remove a non-owner membership. Returns false if no such row.
    pub fn remove_member(&self, user_id: i64, group_id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM memberships WHERE user_id = ?1 AND group_id = ?2 AND role = 'member'",
                [user_id, group_id],
            )?;
            Ok(removed > 0)
        })
    }

    /// Roster of a group, owner first, then by join time.
    pub fn list_members(&self, group_id: i64) -> Result<Vec<MemberResponse>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT ms.user_id, u.name, u.avatar_url, ms.role, ms.joined_at
                 FROM memberships ms
                 JOIN users u ON u.id = ms.user_id
                 WHERE ms.group_id = ?1
                 ORDER BY ms.role = 'owner' DESC, ms.joined_at ASC, ms.id ASC",
            )?;
            let rows = stmt
                .query_map([group_id], member_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Move ownership between two members of the same group.
    pub fn transfer_ownership(&self, group_id: i64, from_user: i64, to_user: i64) -> Result<Group> {
        self.with_tx(|tx| {
            // Demote first: the partial unique index allows one owner row.
            let demoted = tx.execute(
                "UPDATE memberships SET role = 'member'
                 WHERE group_id = ?1 AND user_id = ?2 AND role = 'owner'",
                [group_id, from_user],
            )?;
            if demoted != 1 {
                bail!("user {} does not own group {}", from_user, group_id);
            }

            let promoted = tx.execute(
                "UPDATE memberships SET role = 'owner'
                 WHERE group_id = ?1 AND user_id = ?2 AND role = 'member'",
                [group_id, to_user],
            )?;
            if promoted != 1 {
                bail!("user {} is not a member of group {}", to_user, group_id);
            }

            tx.execute(
                "UPDATE study_groups SET owner_id = ?2 WHERE id = ?1",
                [group_id, to_user],
            )?;

            query_group(tx, group_id)?.ok_or_else(|| anyhow!("group {} missing", group_id))
        })
    }

    // -- Messages --

    pub fn insert_message(
        &self,
        group_id: Option<i64>,
        author_id: i64,
        message: Option<&str>,
        attachment_url: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Message> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (group_id, author_id, message, attachment_url, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![group_id, author_id, message, attachment_url, now],
            )?;
            let id = conn.last_insert_rowid();
            query_message(conn, id)?.ok_or_else(|| anyhow!("message {} missing after insert", id))
        })
    }

    pub fn get_message(&self, id: i64) -> Result<Option<Message>> {
        self.with_conn(|conn| query_message(conn, id))
    }

    /// Most recent messages first, skipping `offset` and returning at most `limit`.
    pub fn list_messages_desc(
        &self,
        scope: MessageScope,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let (filter, key) = scope_filter(scope);
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages m
                 JOIN users u ON u.id = m.author_id
                 WHERE {filter}
                 ORDER BY m.created_at DESC, m.id DESC
                 LIMIT ?2 OFFSET ?3"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![key, limit, offset], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// The whole log, oldest first.
    pub fn list_messages_asc(&self, scope: MessageScope) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let (filter, key) = scope_filter(scope);
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages m
                 JOIN users u ON u.id = m.author_id
                 WHERE {filter}
                 ORDER BY m.created_at ASC, m.id ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([key], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn delete_message(&self, id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute("DELETE FROM messages WHERE id = ?1", [id])?;
            Ok(removed > 0)
        })
    }
}

fn scope_filter(scope: MessageScope) -> (&'static str, i64) {
    match scope {
        MessageScope::Group(group_id) => ("m.group_id = ?1", group_id),
        MessageScope::Personal(author_id) => ("m.group_id IS NULL AND m.author_id = ?1", author_id),
    }
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn query_user(conn: &Connection, id: i64) -> Result<Option<User>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1");
    Ok(conn.query_row(&sql, [id], user_from_row).optional()?)
}

fn query_group(conn: &Connection, id: i64) -> Result<Option<Group>> {
    let sql = format!("SELECT {GROUP_COLUMNS} FROM study_groups g WHERE g.id = ?1");
    Ok(conn.query_row(&sql, [id], group_from_row).optional()?)
}

fn query_message(conn: &Connection, id: i64) -> Result<Option<Message>> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages m
         JOIN users u ON u.id = m.author_id
         WHERE m.id = ?1"
    );
    Ok(conn.query_row(&sql, [id], message_from_row).optional()?)
}
