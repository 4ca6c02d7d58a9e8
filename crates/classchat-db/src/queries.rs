use crate::Database;
use crate::models::{
    AttachmentRow, ConversationRow, MessageRow, ParticipantRow, UserRow, format_timestamp,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::Connection;

/// Uniqueness key of a single conversation. The pair is ordered so that
/// (a, b) and (b, a) map to the same key.
pub fn single_key(user_a: &str, user_b: &str, classroom_id: Option<&str>) -> String {
    let (low, high) = if user_a <= user_b { (user_a, user_b) } else { (user_b, user_a) };
    format!("{}:{}:{}", classroom_id.unwrap_or("-"), low, high)
}

impl Database {
    // -- Users --

    pub fn create_user(
        &self,
        id: &str,
        username: &str,
        display_name: &str,
        avatar_url: Option<&str>,
        password_hash: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, display_name, avatar_url, password) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id, username, display_name, avatar_url, password_hash],
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    // -- Conversations --

    pub fn get_conversation(&self, id: &str) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, kind, creator_id, classroom_id, name, created_at FROM conversations WHERE id = ?1",
                [id],
                map_conversation,
            )
            .optional()
        })
    }

    pub fn conversation_ids_for_user(&self, user_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT conversation_id FROM conversation_participants WHERE user_id = ?1",
            )?;
            let ids = stmt
                .query_map([user_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(ids)
        })
    }

    pub fn is_participant(&self, conversation_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM conversation_participants WHERE conversation_id = ?1 AND user_id = ?2)",
                [conversation_id, user_id],
                |row| row.get(0),
            )?;
            Ok(found)
        })
    }

    pub fn find_single_conversation(
        &self,
        user_a: &str,
        user_b: &str,
        classroom_id: Option<&str>,
    ) -> Result<Option<String>> {
        let key = single_key(user_a, user_b, classroom_id);
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id FROM conversations WHERE single_key = ?1",
                [&key],
                |row| row.get(0),
            )
            .optional()
        })
    }

    /// Create a single conversation between `creator_id` and `other_id`, or
    /// return the one that already holds the pair's key.
    /// Returns (conversation_id, created).
    pub fn insert_or_fetch_single_conversation(
        &self,
        id: &str,
        creator_id: &str,
        other_id: &str,
        classroom_id: Option<&str>,
    ) -> Result<(String, bool)> {
        let key = single_key(creator_id, other_id, classroom_id);
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let inserted = tx.execute(
                "INSERT INTO conversations (id, kind, creator_id, classroom_id, single_key)
                 VALUES (?1, 'single', ?2, ?3, ?4)
                 ON CONFLICT(single_key) DO NOTHING",
                rusqlite::params![id, creator_id, classroom_id, key],
            )?;

            if inserted == 0 {
                let existing: String = tx.query_row(
                    "SELECT id FROM conversations WHERE single_key = ?1",
                    [&key],
                    |row| row.get(0),
                )?;
                return Ok((existing, false));
            }

            tx.execute(
                "INSERT INTO conversation_participants (conversation_id, user_id) VALUES (?1, ?2), (?1, ?3)",
                [id, creator_id, other_id],
            )?;
            tx.commit()?;

            Ok((id.to_string(), true))
        })
    }

    /// Groups are never deduplicated: every call creates a new row.
    pub fn create_group_conversation(
        &self,
        id: &str,
        creator_id: &str,
        participant_ids: &[String],
        classroom_id: Option<&str>,
        name: &str,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            tx.execute(
                "INSERT INTO conversations (id, kind, creator_id, classroom_id, name) VALUES (?1, 'group', ?2, ?3, ?4)",
                rusqlite::params![id, creator_id, classroom_id, name],
            )?;

            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO conversation_participants (conversation_id, user_id) VALUES (?1, ?2)",
                )?;
                for user_id in participant_ids {
                    stmt.execute([id, user_id.as_str()])?;
                }
            }

            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_conversations_for_user(&self, user_id: &str) -> Result<Vec<ConversationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.kind, c.creator_id, c.classroom_id, c.name, c.created_at
                 FROM conversations c
                 JOIN conversation_participants p ON p.conversation_id = c.id
                 WHERE p.user_id = ?1
                 ORDER BY c.created_at DESC",
            )?;
            let rows = stmt
                .query_map([user_id], map_conversation)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Batch-fetch participants (with display names) for a set of conversations.
    pub fn get_participants(&self, conversation_ids: &[String]) -> Result<Vec<ParticipantRow>> {
        if conversation_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> =
                (1..=conversation_ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT p.conversation_id, p.user_id, u.display_name, u.avatar_url
                 FROM conversation_participants p
                 JOIN users u ON u.id = p.user_id
                 WHERE p.conversation_id IN ({})
                 ORDER BY p.joined_at, p.user_id",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn rusqlite::types::ToSql> = conversation_ids
                .iter()
                .map(|id| id as &dyn rusqlite::types::ToSql)
                .collect();

            let rows = stmt
                .query_map(params.as_slice(), |row| {
                    Ok(ParticipantRow {
                        conversation_id: row.get(0)?,
                        user_id: row.get(1)?,
                        display_name: row.get(2)?,
                        avatar_url: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Attachments --

    pub fn insert_attachment(
        &self,
        id: &str,
        uploader_id: &str,
        file_name: &str,
        mime_type: &str,
        size: i64,
        url: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO attachments (id, uploader_id, file_name, mime_type, size, url) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![id, uploader_id, file_name, mime_type, size, url],
            )?;
            Ok(())
        })
    }

    // -- Messages --

    #[allow(clippy::too_many_arguments)]
    pub fn insert_message(
        &self,
        id: &str,
        conversation_id: &str,
        sender_id: &str,
        body: &str,
        attachment_id: Option<&str>,
        can_reply: bool,
        created_at: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, body, attachment_id, can_reply, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![id, conversation_id, sender_id, body, attachment_id, can_reply, created_at],
            )?;
            Ok(())
        })
    }

    /// Newest first. `before` is the `createdAt` of the oldest message of the
    /// previous page, in whatever precision the client echoed it back.
    pub fn get_messages(
        &self,
        conversation_id: &str,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<MessageRow>> {
        let before = before.as_ref().map(format_timestamp);
        self.with_conn(|conn| query_messages(conn, conversation_id, limit, before.as_deref()))
    }
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    let sql = format!(
        "SELECT id, username, display_name, avatar_url, password, created_at FROM users WHERE {} = ?1",
        column
    );
    let mut stmt = conn.prepare(&sql)?;

    let row = stmt
        .query_row([value], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                display_name: row.get(2)?,
                avatar_url: row.get(3)?,
                password: row.get(4)?,
                created_at: row.get(5)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn map_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        kind: row.get(1)?,
        creator_id: row.get(2)?,
        classroom_id: row.get(3)?,
        name: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn query_messages(
    conn: &Connection,
    conversation_id: &str,
    limit: u32,
    before: Option<&str>,
) -> Result<Vec<MessageRow>> {
    // JOIN users and attachments so a page is one query
    let mut stmt = conn.prepare(
        "SELECT m.id, m.conversation_id, m.sender_id, u.display_name, u.avatar_url,
                m.body, m.can_reply, m.created_at,
                a.id, a.file_name, a.mime_type, a.size, a.url
         FROM messages m
         LEFT JOIN users u ON m.sender_id = u.id
         LEFT JOIN attachments a ON m.attachment_id = a.id
         WHERE m.conversation_id = ?1
           AND (?2 IS NULL OR m.created_at < ?2)
         ORDER BY m.created_at DESC
         LIMIT ?3",
    )?;

    let rows = stmt
        .query_map(rusqlite::params![conversation_id, before, limit], |row| {
            let attachment = match row.get::<_, Option<String>>(8)? {
                Some(id) => Some(AttachmentRow {
                    id,
                    file_name: row.get(9)?,
                    mime_type: row.get(10)?,
                    size: row.get(11)?,
                    url: row.get(12)?,
                }),
                None => None,
            };

            Ok(MessageRow {
                id: row.get(0)?,
                conversation_id: row.get(1)?,
                sender_id: row.get(2)?,
                sender_name: row
                    .get::<_, Option<String>>(3)?
                    .unwrap_or_else(|| "unknown".to_string()),
                sender_avatar_url: row.get(4)?,
                body: row.get(5)?,
                can_reply: row.get(6)?,
                created_at: row.get(7)?,
                attachment,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

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
