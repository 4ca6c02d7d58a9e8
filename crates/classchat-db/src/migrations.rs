use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id              TEXT PRIMARY KEY,
                username        TEXT NOT NULL UNIQUE,
                display_name    TEXT NOT NULL,
                avatar_url      TEXT,
                password        TEXT NOT NULL,
                created_at      TEXT NOT NULL DEFAULT (datetime('now'))
            );

            -- single_key is NULL for groups; for single threads it is
            -- '<classroom>:<low user>:<high user>' so a pair has at most one thread
            -- per classroom.
            CREATE TABLE conversations (
                id              TEXT PRIMARY KEY,
                kind            TEXT NOT NULL CHECK (kind IN ('single', 'group')),
                creator_id      TEXT NOT NULL REFERENCES users(id),
                classroom_id    TEXT,
                name            TEXT,
                single_key      TEXT UNIQUE,
                created_at      TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE conversation_participants (
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                user_id         TEXT NOT NULL REFERENCES users(id),
                joined_at       TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (conversation_id, user_id)
            );

            CREATE INDEX idx_participants_user
                ON conversation_participants(user_id);

            CREATE TABLE attachments (
                id              TEXT PRIMARY KEY,
                uploader_id     TEXT NOT NULL REFERENCES users(id),
                file_name       TEXT NOT NULL,
                mime_type       TEXT NOT NULL,
                size            INTEGER NOT NULL DEFAULT 0,
                url             TEXT NOT NULL,
                created_at      TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE messages (
                id              TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                sender_id       TEXT NOT NULL REFERENCES users(id),
                body            TEXT NOT NULL,
                attachment_id   TEXT REFERENCES attachments(id),
                can_reply       INTEGER NOT NULL DEFAULT 1,
                created_at      TEXT NOT NULL
            );

            CREATE INDEX idx_messages_conversation
                ON messages(conversation_id, created_at);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
