use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id              TEXT PRIMARY KEY,
            username        TEXT NOT NULL UNIQUE,
            email           TEXT UNIQUE,
            password_hash   TEXT,
            is_guest        INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS digital_humans (
            id              TEXT PRIMARY KEY,
            user_id         TEXT NOT NULL REFERENCES users(id),
            name            TEXT NOT NULL,
            prompt          TEXT NOT NULL,
            rules           TEXT NOT NULL,
            personality     TEXT NOT NULL,
            temperature     REAL NOT NULL DEFAULT 0.7,
            max_tokens      INTEGER NOT NULL DEFAULT 1000,
            is_public       INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_digital_humans_user
            ON digital_humans(user_id, updated_at);
        CREATE INDEX IF NOT EXISTS idx_digital_humans_public
            ON digital_humans(is_public, updated_at);

        CREATE TABLE IF NOT EXISTS chat_sessions (
            id                  TEXT PRIMARY KEY,
            user_id             TEXT NOT NULL REFERENCES users(id),
            digital_human_id    TEXT NOT NULL REFERENCES digital_humans(id),
            created_at          TEXT NOT NULL,
            updated_at          TEXT NOT NULL,
            UNIQUE(user_id, digital_human_id)
        );

        CREATE TABLE IF NOT EXISTS chat_messages (
            id                  TEXT PRIMARY KEY,
            chat_session_id     TEXT NOT NULL REFERENCES chat_sessions(id),
            role                TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
            content             TEXT NOT NULL,
            timestamp           TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_chat_messages_session
            ON chat_messages(chat_session_id, timestamp);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
