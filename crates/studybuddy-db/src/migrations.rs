use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                name        TEXT NOT NULL,
                email       TEXT NOT NULL UNIQUE,
                avatar_url  TEXT,
                created_at  TEXT NOT NULL
            );

            -- External auth subject -> internal user id, created at first login
            CREATE TABLE identities (
                subject     TEXT PRIMARY KEY,
                user_id     INTEGER NOT NULL UNIQUE REFERENCES users(id),
                created_at  TEXT NOT NULL
            );

            CREATE TABLE study_groups (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                name        TEXT NOT NULL,
                description TEXT,
                owner_id    INTEGER NOT NULL REFERENCES users(id),
                is_private  INTEGER NOT NULL DEFAULT 0,
                created_at  TEXT NOT NULL
            );

            CREATE INDEX idx_groups_created ON study_groups(created_at);

            CREATE TABLE memberships (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id     INTEGER NOT NULL REFERENCES users(id),
                group_id    INTEGER NOT NULL REFERENCES study_groups(id) ON DELETE CASCADE,
                role        TEXT NOT NULL CHECK (role IN ('owner', 'member')),
                joined_at   TEXT NOT NULL,
                UNIQUE(user_id, group_id)
            );

            -- At most one owner row per group
            CREATE UNIQUE INDEX idx_memberships_owner
                ON memberships(group_id) WHERE role = 'owner';

            CREATE INDEX idx_memberships_group ON memberships(group_id);

            CREATE TABLE messages (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                group_id        INTEGER REFERENCES study_groups(id) ON DELETE CASCADE,
                author_id       INTEGER NOT NULL REFERENCES users(id),
                message         TEXT,
                attachment_url  TEXT,
                created_at      TEXT NOT NULL,
                CHECK (message IS NOT NULL OR attachment_url IS NOT NULL)
            );

            CREATE INDEX idx_messages_group
                ON messages(group_id, created_at, id);

            CREATE INDEX idx_messages_personal
                ON messages(author_id, created_at, id) WHERE group_id IS NULL;

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
