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
        info!("Running migration v1 (users, knocks)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id          TEXT PRIMARY KEY,
                username    TEXT NOT NULL UNIQUE,
                password    TEXT NOT NULL,
                is_private  INTEGER NOT NULL DEFAULT 0,
                created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
            );

            -- One directed edge per (from_id, to_id)
            CREATE TABLE knocks (
                id          TEXT PRIMARY KEY,
                from_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                to_id       TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                status      TEXT NOT NULL CHECK (status IN ('pending', 'onesided', 'lockedIn')),
                created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now')),
                UNIQUE(from_id, to_id),
                CHECK (from_id != to_id)
            );

            CREATE INDEX idx_knocks_to ON knocks(to_id, status);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    if version < 2 {
        info!("Running migration v2 (chats, messages)");
        conn.execute_batch(
            "
            -- user_low/user_high hold the pair in sorted order so each pair has one chat
            CREATE TABLE chats (
                id           TEXT PRIMARY KEY,
                user_low     TEXT NOT NULL,
                user_high    TEXT NOT NULL,
                initiator    TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                counterpart  TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                gate         TEXT NOT NULL CHECK (gate IN ('open', 'restricted', 'locked_open')),
                opened_by    TEXT,
                created_at   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now')),
                UNIQUE(user_low, user_high)
            );

            CREATE TABLE messages (
                id          TEXT PRIMARY KEY,
                chat_id     TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
                sender_id   TEXT NOT NULL REFERENCES users(id),
                body        TEXT NOT NULL,
                created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
            );

            CREATE INDEX idx_messages_chat ON messages(chat_id, created_at);

            INSERT INTO schema_version (version) VALUES (2);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
