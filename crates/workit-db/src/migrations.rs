use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS conversations (
            id              TEXT PRIMARY KEY,
            title           TEXT,
            created_at      TEXT NOT NULL,
            last_activity   TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS conversation_participants (
            conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            user_id         TEXT NOT NULL,
            position        INTEGER NOT NULL,
            PRIMARY KEY (conversation_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_participants_user
            ON conversation_participants(user_id);

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            sender_id       TEXT NOT NULL,
            receiver_id     TEXT NOT NULL,
            content         TEXT NOT NULL DEFAULT '',
            is_read         INTEGER NOT NULL DEFAULT 0,
            timestamp       TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, timestamp);

        CREATE INDEX IF NOT EXISTS idx_messages_unread
            ON messages(receiver_id, is_read);

        CREATE TABLE IF NOT EXISTS attachments (
            message_id      TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            position        INTEGER NOT NULL,
            kind            TEXT NOT NULL,
            url             TEXT NOT NULL,
            name            TEXT,
            content_type    TEXT,
            size            INTEGER,
            PRIMARY KEY (message_id, position)
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
