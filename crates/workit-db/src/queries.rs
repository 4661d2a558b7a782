use std::collections::BTreeSet;

use crate::Database;
use crate::models::{AttachmentRow, ConversationRow, MessageRow};
use anyhow::{Result, anyhow};
use rusqlite::{Connection, TransactionBehavior};

impl Database {
    // -- Conversations --

    pub fn insert_conversation(
        &self,
        id: &str,
        participants: &[String],
        title: Option<&str>,
        now: &str,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            write_conversation(&tx, id, participants, title, now)?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| query_conversation(conn, id))
    }

    /// Conversations the user takes part in, most recently active first.
    pub fn list_conversations_for_user(&self, user_id: &str) -> Result<Vec<ConversationRow>> {
        self.with_conn(|conn| query_conversations_for_user(conn, user_id))
    }

    /// Finds a conversation whose participant set is exactly `participants`
    /// (order and duplicates ignored).
    pub fn find_conversation_by_participants(
        &self,
        participants: &[String],
    ) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| query_by_participants(conn, participants))
    }

    /// Returns the conversation with exactly these participants, creating it
    /// under `id` if there is none. The lookup and the insert share one
    /// transaction. The flag is true when a row was inserted.
    pub fn find_or_insert_conversation(
        &self,
        id: &str,
        participants: &[String],
        title: Option<&str>,
        now: &str,
    ) -> Result<(ConversationRow, bool)> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if let Some(existing) = query_by_participants(&tx, participants)? {
                return Ok((existing, false));
            }
            write_conversation(&tx, id, participants, title, now)?;
            let row = query_conversation(&tx, id)?
                .ok_or_else(|| anyhow!("conversation {} vanished after insert", id))?;
            tx.commit()?;
            Ok((row, true))
        })
    }

    // -- Messages --

    /// Inserts the message with its attachments and bumps the conversation's
    /// last activity, all in one transaction.
    pub fn insert_message(&self, msg: &MessageRow) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, receiver_id, content, is_read, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    msg.id,
                    msg.conversation_id,
                    msg.sender_id,
                    msg.receiver_id,
                    msg.content,
                    msg.is_read,
                    msg.timestamp
                ],
            )?;
            for (position, att) in msg.attachments.iter().enumerate() {
                tx.execute(
                    "INSERT INTO attachments (message_id, position, kind, url, name, content_type, size)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        msg.id,
                        position as i64,
                        att.kind,
                        att.url,
                        att.name,
                        att.content_type,
                        att.size
                    ],
                )?;
            }
            tx.execute(
                "UPDATE conversations SET last_activity = ?2 WHERE id = ?1",
                rusqlite::params![msg.conversation_id, msg.timestamp],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Messages of a conversation, oldest first.
    pub fn get_messages(&self, conversation_id: &str) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| query_messages(conn, conversation_id))
    }

    /// Marks every unread message addressed to `user_id` in the conversation
    /// as read. Returns the number of messages changed.
    pub fn mark_read(&self, conversation_id: &str, user_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET is_read = 1
                 WHERE conversation_id = ?1 AND receiver_id = ?2 AND is_read = 0",
                [conversation_id, user_id],
            )?;
            Ok(changed)
        })
    }

    pub fn unread_count(&self, user_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE receiver_id = ?1 AND is_read = 0",
                [user_id],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }
}

fn write_conversation(
    conn: &Connection,
    id: &str,
    participants: &[String],
    title: Option<&str>,
    now: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO conversations (id, title, created_at, last_activity) VALUES (?1, ?2, ?3, ?3)",
        rusqlite::params![id, title, now],
    )?;
    for (position, user_id) in participants.iter().enumerate() {
        conn.execute(
            "INSERT OR IGNORE INTO conversation_participants (conversation_id, user_id, position) VALUES (?1, ?2, ?3)",
            rusqlite::params![id, user_id, position as i64],
        )?;
    }
    Ok(())
}

fn query_conversations_for_user(conn: &Connection, user_id: &str) -> Result<Vec<ConversationRow>> {
    let ids: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT c.id
             FROM conversations c
             JOIN conversation_participants p ON p.conversation_id = c.id
             WHERE p.user_id = ?1
             ORDER BY c.last_activity DESC, c.rowid DESC",
        )?;
        stmt.query_map([user_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?
    };

    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(row) = query_conversation(conn, &id)? {
            out.push(row);
        }
    }
    Ok(out)
}

fn query_by_participants(
    conn: &Connection,
    participants: &[String],
) -> Result<Option<ConversationRow>> {
    let wanted: BTreeSet<&str> = participants.iter().map(String::as_str).collect();
    let Some(first) = wanted.iter().next().copied() else {
        return Ok(None);
    };

    for row in query_conversations_for_user(conn, first)? {
        let have: BTreeSet<&str> = row.participants.iter().map(String::as_str).collect();
        if have == wanted {
            return Ok(Some(row));
        }
    }
    Ok(None)
}

fn query_conversation(conn: &Connection, id: &str) -> Result<Option<ConversationRow>> {
    let row = conn
        .query_row(
            "SELECT id, title, created_at, last_activity FROM conversations WHERE id = ?1",
            [id],
            |row| {
                Ok(ConversationRow {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    created_at: row.get(2)?,
                    last_activity: row.get(3)?,
                    participants: Vec::new(),
                })
            },
        )
        .optional()?;

    let Some(mut row) = row else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT user_id FROM conversation_participants WHERE conversation_id = ?1 ORDER BY position",
    )?;
    row.participants = stmt
        .query_map([id], |r| r.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;

    Ok(Some(row))
}

fn query_messages(conn: &Connection, conversation_id: &str) -> Result<Vec<MessageRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, conversation_id, sender_id, receiver_id, content, is_read, timestamp
         FROM messages
         WHERE conversation_id = ?1
         ORDER BY timestamp ASC, rowid ASC",
    )?;

    let mut rows = stmt
        .query_map([conversation_id], |row| {
            Ok(MessageRow {
                id: row.get(0)?,
                conversation_id: row.get(1)?,
                sender_id: row.get(2)?,
                receiver_id: row.get(3)?,
                content: row.get(4)?,
                is_read: row.get(5)?,
                timestamp: row.get(6)?,
                attachments: Vec::new(),
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    // Batch-fetch attachments for the whole conversation (avoids N+1)
    let mut att_stmt = conn.prepare(
        "SELECT a.message_id, a.kind, a.url, a.name, a.content_type, a.size
         FROM attachments a
         JOIN messages m ON m.id = a.message_id
         WHERE m.conversation_id = ?1
         ORDER BY a.message_id, a.position",
    )?;
    let attachments = att_stmt
        .query_map([conversation_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                AttachmentRow {
                    kind: row.get(1)?,
                    url: row.get(2)?,
                    name: row.get(3)?,
                    content_type: row.get(4)?,
                    size: row.get(5)?,
                },
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for (message_id, att) in attachments {
        if let Some(msg) = rows.iter_mut().find(|m| m.id == message_id) {
            msg.attachments.push(att);
        }
    }

    Ok(rows)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
