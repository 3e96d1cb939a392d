//! SQLite-backed chat store.
//!
//! One `rusqlite` connection behind an async mutex. Timestamps are stored as
//! fixed-width RFC 3339 strings (microseconds, `Z` suffix) so that text order
//! equals chronological order; ties are broken by row id.
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;
use tracing::{debug, info};

use kapi_core::{
    Chat, ChatId, ChatStore, ChatSummary, ChatUpdate, ChatWithMessages, ConversationTurn,
    Message, MessageId, NewMessage, Role, UserId,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS chats (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id     INTEGER NOT NULL,
        title       TEXT NOT NULL,
        is_active   INTEGER NOT NULL DEFAULT 1,
        created_at  TEXT NOT NULL,
        updated_at  TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_chats_user ON chats(user_id, updated_at);

    CREATE TABLE IF NOT EXISTS messages (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        chat_id     INTEGER NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
        role        TEXT NOT NULL,
        content     TEXT NOT NULL,
        tokens_used INTEGER NOT NULL DEFAULT 0,
        model       TEXT NOT NULL DEFAULT '',
        created_at  TEXT NOT NULL,
        updated_at  TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id, created_at);";

const CHAT_COLUMNS: &str = "id, user_id, title, is_active, created_at, updated_at";
const MESSAGE_COLUMNS: &str =
    "id, chat_id, role, content, tokens_used, model, created_at, updated_at";

pub struct SqliteChatStore {
    conn: Mutex<Connection>,
}

impl SqliteChatStore {
    /// Create or open a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).context("Failed to open SQLite database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to enable WAL mode")?;
        let store = Self::init(conn)?;
        info!(path = %path.as_ref().display(), "Chat store opened");
        Ok(store)
    }

    /// Open an in-memory database (for tests).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .context("Failed to enable foreign keys")?;
        conn.execute_batch(SCHEMA)
            .context("Failed to initialize chat schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl ChatStore for SqliteChatStore {
    async fn verify_ownership(&self, chat_id: ChatId, user_id: UserId) -> Result<bool> {
        let conn = self.conn.lock().await;
        let found = conn
            .query_row(
                "SELECT 1 FROM chats WHERE id = ?1 AND user_id = ?2",
                params![chat_id, user_id.0],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    async fn load_conversation(&self, chat_id: ChatId) -> Result<Vec<ConversationTurn>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT role, content FROM messages
             WHERE chat_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let turns = stmt
            .query_map(params![chat_id], |row| {
                Ok(ConversationTurn {
                    role: parse_role(row, 0)?,
                    content: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(turns)
    }

    async fn create_message(&self, chat_id: ChatId, message: NewMessage) -> Result<Message> {
        let conn = self.conn.lock().await;
        let now = Utc::now();
        conn.execute(
            "INSERT INTO messages (chat_id, role, content, tokens_used, model, created_at, updated_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?5, ?5)",
            params![
                chat_id,
                message.role.as_str(),
                message.content,
                message.model,
                format_ts(now),
            ],
        )
        .with_context(|| format!("Failed to insert message into chat {chat_id}"))?;
        let id = conn.last_insert_rowid();
        debug!(chat_id, message_id = id, role = %message.role, "Message stored");

        Ok(Message {
            id,
            chat_id,
            role: message.role,
            content: message.content,
            tokens_used: 0,
            model: message.model,
            created_at: now,
            updated_at: now,
        })
    }

    async fn update_chat_activity(&self, chat_id: ChatId, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE chats SET updated_at = ?1 WHERE id = ?2",
            params![format_ts(at), chat_id],
        )?;
        Ok(())
    }

    async fn create_chat(&self, user_id: UserId, title: &str) -> Result<Chat> {
        let conn = self.conn.lock().await;
        let now = Utc::now();
        conn.execute(
            "INSERT INTO chats (user_id, title, is_active, created_at, updated_at)
             VALUES (?1, ?2, 1, ?3, ?3)",
            params![user_id.0, title, format_ts(now)],
        )
        .context("Failed to insert chat")?;

        Ok(Chat {
            id: conn.last_insert_rowid(),
            user_id,
            title: title.to_string(),
            is_active: true,
            created_at: now,
            updated_at: now,
        })
    }

    async fn list_chats(
        &self,
        user_id: UserId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ChatSummary>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {CHAT_COLUMNS} FROM chats WHERE user_id = ?1
             ORDER BY updated_at DESC, id DESC LIMIT ?2 OFFSET ?3"
        );
        let mut stmt = conn.prepare(&sql)?;
        let chats = stmt
            .query_map(params![user_id.0, sql_limit(limit), offset], row_to_chat)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut summaries = Vec::with_capacity(chats.len());
        for chat in chats {
            let message_count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE chat_id = ?1",
                params![chat.id],
                |row| row.get(0),
            )?;
            let last_message = conn
                .query_row(
                    &format!(
                        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE chat_id = ?1
                         ORDER BY created_at DESC, id DESC LIMIT 1"
                    ),
                    params![chat.id],
                    row_to_message,
                )
                .optional()?;
            summaries.push(ChatSummary {
                chat,
                message_count,
                last_message,
            });
        }
        Ok(summaries)
    }

    async fn get_chat(&self, chat_id: ChatId, user_id: UserId) -> Result<Option<ChatWithMessages>> {
        let conn = self.conn.lock().await;
        let Some(chat) = select_owned_chat(&conn, chat_id, user_id)? else {
            return Ok(None);
        };
        let messages = select_messages(&conn, chat_id, 0, 0)?;

        Ok(Some(ChatWithMessages {
            summary: ChatSummary {
                chat,
                message_count: messages.len() as i64,
                last_message: messages.last().cloned(),
            },
            messages,
        }))
    }

    async fn update_chat(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        update: ChatUpdate,
    ) -> Result<Option<Chat>> {
        let conn = self.conn.lock().await;
        if select_owned_chat(&conn, chat_id, user_id)?.is_none() {
            return Ok(None);
        }

        let now = format_ts(Utc::now());
        if let Some(title) = &update.title {
            conn.execute(
                "UPDATE chats SET title = ?1, updated_at = ?2 WHERE id = ?3",
                params![title, now, chat_id],
            )?;
        }
        if let Some(is_active) = update.is_active {
            conn.execute(
                "UPDATE chats SET is_active = ?1, updated_at = ?2 WHERE id = ?3",
                params![is_active, now, chat_id],
            )?;
        }

        select_owned_chat(&conn, chat_id, user_id)
    }

    async fn delete_chat(&self, chat_id: ChatId, user_id: UserId) -> Result<bool> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM chats WHERE id = ?1 AND user_id = ?2",
            params![chat_id, user_id.0],
        )?;
        Ok(deleted > 0)
    }

    async fn list_messages(&self, chat_id: ChatId, limit: u32, offset: u32) -> Result<Vec<Message>> {
        let conn = self.conn.lock().await;
        select_messages(&conn, chat_id, limit, offset)
    }

    async fn update_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        content: &str,
    ) -> Result<Option<Message>> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE messages SET content = ?1, updated_at = ?2 WHERE id = ?3 AND chat_id = ?4",
            params![content, format_ts(Utc::now()), message_id, chat_id],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        let message = conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![message_id],
                row_to_message,
            )
            .optional()?;
        Ok(message)
    }

    async fn delete_message(&self, chat_id: ChatId, message_id: MessageId) -> Result<bool> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM messages WHERE id = ?1 AND chat_id = ?2",
            params![message_id, chat_id],
        )?;
        Ok(deleted > 0)
    }
}

// ---------------------------------------------------------------------------
// Query + row helpers
// ---------------------------------------------------------------------------

fn select_owned_chat(conn: &Connection, chat_id: ChatId, user_id: UserId) -> Result<Option<Chat>> {
    let chat = conn
        .query_row(
            &format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = ?1 AND user_id = ?2"),
            params![chat_id, user_id.0],
            row_to_chat,
        )
        .optional()?;
    Ok(chat)
}

fn select_messages(conn: &Connection, chat_id: ChatId, limit: u32, offset: u32) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE chat_id = ?1
         ORDER BY created_at ASC, id ASC LIMIT ?2 OFFSET ?3"
    ))?;
    let messages = stmt
        .query_map(params![chat_id, sql_limit(limit), offset], row_to_message)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(messages)
}

/// SQLite treats a negative LIMIT as "no limit".
fn sql_limit(limit: u32) -> i64 {
    if limit == 0 {
        -1
    } else {
        i64::from(limit)
    }
}

fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_role(row: &Row, idx: usize) -> rusqlite::Result<Role> {
    let raw: String = row.get(idx)?;
    raw.parse::<Role>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn row_to_chat(row: &Row) -> rusqlite::Result<Chat> {
    Ok(Chat {
        id: row.get(0)?,
        user_id: UserId(row.get(1)?),
        title: row.get(2)?,
        is_active: row.get(3)?,
        created_at: parse_ts(row, 4)?,
        updated_at: parse_ts(row, 5)?,
    })
}

fn row_to_message(row: &Row) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        role: parse_role(row, 2)?,
        content: row.get(3)?,
        tokens_used: row.get(4)?,
        model: row.get(5)?,
        created_at: parse_ts(row, 6)?,
        updated_at: parse_ts(row, 7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_message(content: &str) -> NewMessage {
        NewMessage {
            role: Role::User,
            content: content.to_string(),
            model: String::new(),
        }
    }

    #[tokio::test]
    async fn test_ownership_is_per_user() {
        let store = SqliteChatStore::in_memory().unwrap();
        let chat = store.create_chat(UserId(1), "mine").await.unwrap();

        assert!(store.verify_ownership(chat.id, UserId(1)).await.unwrap());
        assert!(!store.verify_ownership(chat.id, UserId(2)).await.unwrap());
        assert!(!store.verify_ownership(chat.id + 100, UserId(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_conversation_is_ascending() {
        let store = SqliteChatStore::in_memory().unwrap();
        let chat = store.create_chat(UserId(1), "t").await.unwrap();
        store.create_message(chat.id, user_message("first")).await.unwrap();
        store
            .create_message(
                chat.id,
                NewMessage {
                    role: Role::Assistant,
                    content: "second".into(),
                    model: "m".into(),
                },
            )
            .await
            .unwrap();
        store.create_message(chat.id, user_message("third")).await.unwrap();

        let turns = store.load_conversation(chat.id).await.unwrap();
        let contents: Vec<_> = turns.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, ["first", "second", "third"]);
        assert_eq!(turns[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_message_requires_existing_chat() {
        let store = SqliteChatStore::in_memory().unwrap();
        let result = store.create_message(999, user_message("orphan")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_list_chats_newest_activity_first() {
        let store = SqliteChatStore::in_memory().unwrap();
        let old = store.create_chat(UserId(1), "old").await.unwrap();
        let new = store.create_chat(UserId(1), "new").await.unwrap();
        store.create_chat(UserId(2), "someone else").await.unwrap();

        let msg = store.create_message(old.id, user_message("bump")).await.unwrap();
        store
            .update_chat_activity(old.id, msg.created_at + chrono::Duration::seconds(1))
            .await
            .unwrap();

        let chats = store.list_chats(UserId(1), 0, 0).await.unwrap();
        assert_eq!(chats.len(), 2);
        assert_eq!(chats[0].chat.id, old.id);
        assert_eq!(chats[0].message_count, 1);
        assert_eq!(chats[0].last_message.as_ref().unwrap().content, "bump");
        assert_eq!(chats[1].chat.id, new.id);
        assert!(chats[1].last_message.is_none());

        let page = store.list_chats(UserId(1), 1, 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].chat.id, new.id);
    }

    #[tokio::test]
    async fn test_get_chat_hides_foreign_chats() {
        let store = SqliteChatStore::in_memory().unwrap();
        let chat = store.create_chat(UserId(1), "t").await.unwrap();
        store.create_message(chat.id, user_message("hi")).await.unwrap();

        let full = store.get_chat(chat.id, UserId(1)).await.unwrap().unwrap();
        assert_eq!(full.messages.len(), 1);
        assert_eq!(full.summary.message_count, 1);
        assert!(store.get_chat(chat.id, UserId(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_chat() {
        let store = SqliteChatStore::in_memory().unwrap();
        let chat = store.create_chat(UserId(1), "before").await.unwrap();

        let updated = store
            .update_chat(
                chat.id,
                UserId(1),
                ChatUpdate {
                    title: Some("after".into()),
                    is_active: Some(false),
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.title, "after");
        assert!(!updated.is_active);

        let denied = store
            .update_chat(chat.id, UserId(2), ChatUpdate::default())
            .await
            .unwrap();
        assert!(denied.is_none());
    }

    #[tokio::test]
    async fn test_delete_chat_cascades() {
        let store = SqliteChatStore::in_memory().unwrap();
        let chat = store.create_chat(UserId(1), "t").await.unwrap();
        store.create_message(chat.id, user_message("hi")).await.unwrap();

        assert!(!store.delete_chat(chat.id, UserId(2)).await.unwrap());
        assert!(store.delete_chat(chat.id, UserId(1)).await.unwrap());
        assert!(store.list_messages(chat.id, 0, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_and_delete_message() {
        let store = SqliteChatStore::in_memory().unwrap();
        let chat = store.create_chat(UserId(1), "t").await.unwrap();
        let other = store.create_chat(UserId(1), "u").await.unwrap();
        let msg = store.create_message(chat.id, user_message("typo")).await.unwrap();

        let fixed = store
            .update_message(chat.id, msg.id, "fixed")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fixed.content, "fixed");
        assert!(store
            .update_message(other.id, msg.id, "nope")
            .await
            .unwrap()
            .is_none());

        assert!(!store.delete_message(other.id, msg.id).await.unwrap());
        assert!(store.delete_message(chat.id, msg.id).await.unwrap());
        assert!(!store.delete_message(chat.id, msg.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_messages_paginates() {
        let store = SqliteChatStore::in_memory().unwrap();
        let chat = store.create_chat(UserId(1), "t").await.unwrap();
        for i in 0..5 {
            store
                .create_message(chat.id, user_message(&format!("m{i}")))
                .await
                .unwrap();
        }

        let page = store.list_messages(chat.id, 2, 1).await.unwrap();
        let contents: Vec<_> = page.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["m1", "m2"]);
    }
}
