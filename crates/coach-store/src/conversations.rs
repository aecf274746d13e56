use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use tracing::instrument;

use coach_core::conversation::ConversationWindow;
use coach_core::ids::ConversationKey;
use coach_core::messages::{ChatMessage, Role};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{format_time, get, parse_enum, parse_time};
use crate::stores::ConversationStore;

/// Conversation windows and their unsummarized messages.
pub struct ConversationRepo {
    db: Database,
}

impl ConversationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn load_window(&self, key: &ConversationKey) -> Result<ConversationWindow, StoreError> {
        self.db.with_conn(|conn| read_window(conn, key))
    }

    #[instrument(skip(self, message), fields(user_id = %key.user_id, coach_id = %key.coach_id))]
    pub fn append_message(
        &self,
        key: &ConversationKey,
        message: &ChatMessage,
    ) -> Result<ConversationWindow, StoreError> {
        let now = format_time(&Utc::now());
        self.db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO conversation_windows (user_id, coach_id, summary, message_count, updated_at)
                 VALUES (?1, ?2, NULL, 1, ?3)
                 ON CONFLICT(user_id, coach_id)
                 DO UPDATE SET message_count = message_count + 1, updated_at = ?3",
                rusqlite::params![key.user_id.as_str(), key.coach_id.as_str(), now],
            )?;
            tx.execute(
                "INSERT INTO conversation_messages (user_id, coach_id, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    key.user_id.as_str(),
                    key.coach_id.as_str(),
                    message.role.to_string(),
                    message.content,
                    format_time(&message.created_at),
                ],
            )?;
            read_window(tx, key)
        })
    }

    /// Install `summary` and delete the `folded` oldest messages in one transaction.
    #[instrument(skip(self, summary), fields(user_id = %key.user_id, coach_id = %key.coach_id))]
    pub fn fold_messages(
        &self,
        key: &ConversationKey,
        summary: &str,
        folded: usize,
    ) -> Result<ConversationWindow, StoreError> {
        let now = format_time(&Utc::now());
        self.db.with_tx(|tx| {
            let updated = tx.execute(
                "UPDATE conversation_windows SET summary = ?3, updated_at = ?4
                 WHERE user_id = ?1 AND coach_id = ?2",
                rusqlite::params![key.user_id.as_str(), key.coach_id.as_str(), summary, now],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("conversation {key}")));
            }
            tx.execute(
                "DELETE FROM conversation_messages WHERE id IN (
                     SELECT id FROM conversation_messages
                     WHERE user_id = ?1 AND coach_id = ?2
                     ORDER BY id ASC LIMIT ?3
                 )",
                rusqlite::params![key.user_id.as_str(), key.coach_id.as_str(), folded as i64],
            )?;
            read_window(tx, key)
        })
    }

    #[instrument(skip(self), fields(user_id = %key.user_id, coach_id = %key.coach_id))]
    pub fn delete(&self, key: &ConversationKey) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM conversation_windows WHERE user_id = ?1 AND coach_id = ?2",
                rusqlite::params![key.user_id.as_str(), key.coach_id.as_str()],
            )?;
            Ok(())
        })
    }
}

fn read_window(conn: &Connection, key: &ConversationKey) -> Result<ConversationWindow, StoreError> {
    let header: Option<(Option<String>, i64)> = conn
        .query_row(
            "SELECT summary, message_count FROM conversation_windows
             WHERE user_id = ?1 AND coach_id = ?2",
            rusqlite::params![key.user_id.as_str(), key.coach_id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let Some((summary, message_count)) = header else {
        return Ok(ConversationWindow::empty());
    };

    let mut stmt = conn.prepare(
        "SELECT role, content, created_at FROM conversation_messages
         WHERE user_id = ?1 AND coach_id = ?2
         ORDER BY id ASC",
    )?;
    let mut rows = stmt.query(rusqlite::params![key.user_id.as_str(), key.coach_id.as_str()])?;
    let mut recent_messages = Vec::new();
    while let Some(row) = rows.next()? {
        let role: String = get(row, 0, "conversation_messages", "role")?;
        let created_at: String = get(row, 2, "conversation_messages", "created_at")?;
        recent_messages.push(ChatMessage {
            role: parse_enum::<Role>(&role, "conversation_messages", "role")?,
            content: get(row, 1, "conversation_messages", "content")?,
            created_at: parse_time(&created_at, "conversation_messages", "created_at")?,
        });
    }

    Ok(ConversationWindow {
        recent_messages,
        summary,
        message_count: message_count.max(0) as u64,
    })
}

#[async_trait]
impl ConversationStore for ConversationRepo {
    async fn load(&self, key: &ConversationKey) -> Result<ConversationWindow, StoreError> {
        self.load_window(key)
    }

    async fn append(
        &self,
        key: &ConversationKey,
        message: &ChatMessage,
    ) -> Result<ConversationWindow, StoreError> {
        self.append_message(key, message)
    }

    async fn fold(
        &self,
        key: &ConversationKey,
        summary: &str,
        folded: usize,
    ) -> Result<ConversationWindow, StoreError> {
        self.fold_messages(key, summary, folded)
    }

    async fn clear(&self, key: &ConversationKey) -> Result<(), StoreError> {
        self.delete(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coach_core::ids::{CoachId, UserId};

    fn setup() -> (ConversationRepo, ConversationKey) {
        let db = Database::in_memory().unwrap();
        let key = ConversationKey::new(&UserId::from_raw("user_a"), &CoachId::from_raw("coach_fit"));
        (ConversationRepo::new(db), key)
    }

    #[test]
    fn unknown_conversation_is_empty() {
        let (repo, key) = setup();
        assert!(repo.load_window(&key).unwrap().is_empty());
    }

    #[test]
    fn append_creates_and_counts() {
        let (repo, key) = setup();
        repo.append_message(&key, &ChatMessage::user("hi")).unwrap();
        let window = repo.append_message(&key, &ChatMessage::coach("hello")).unwrap();

        assert_eq!(window.message_count, 2);
        assert_eq!(window.recent_messages.len(), 2);
        assert_eq!(window.recent_messages[0].role, Role::User);
        assert_eq!(window.recent_messages[1].content, "hello");
        assert!(window.summary.is_none());
    }

    #[test]
    fn conversations_are_isolated_per_coach() {
        let (repo, key) = setup();
        let other = ConversationKey::new(&key.user_id, &CoachId::from_raw("coach_food"));
        repo.append_message(&key, &ChatMessage::user("training")).unwrap();
        repo.append_message(&other, &ChatMessage::user("meals")).unwrap();

        assert_eq!(repo.load_window(&key).unwrap().recent_messages[0].content, "training");
        assert_eq!(repo.load_window(&other).unwrap().recent_messages[0].content, "meals");
    }

    #[test]
    fn fold_drops_oldest_and_keeps_count() {
        let (repo, key) = setup();
        for i in 0..5 {
            repo.append_message(&key, &ChatMessage::user(format!("m{i}"))).unwrap();
        }
        let window = repo.fold_messages(&key, "talked about squats", 3).unwrap();

        assert_eq!(window.summary.as_deref(), Some("talked about squats"));
        assert_eq!(window.message_count, 5);
        let contents: Vec<_> = window.recent_messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);
    }

    #[test]
    fn fold_unknown_conversation_is_not_found() {
        let (repo, key) = setup();
        assert!(matches!(
            repo.fold_messages(&key, "s", 1),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn clear_removes_window_and_messages() {
        let (repo, key) = setup();
        repo.append_message(&key, &ChatMessage::user("hi")).unwrap();
        repo.delete(&key).unwrap();
        assert!(repo.load_window(&key).unwrap().is_empty());

        let window = repo.append_message(&key, &ChatMessage::user("again")).unwrap();
        assert_eq!(window.message_count, 1);
        assert_eq!(window.recent_messages.len(), 1);
    }

    #[tokio::test]
    async fn trait_object_dispatch() {
        let (repo, key) = setup();
        let store: &dyn ConversationStore = &repo;
        store.append(&key, &ChatMessage::user("hi")).await.unwrap();
        assert_eq!(store.load(&key).await.unwrap().message_count, 1);
        store.clear(&key).await.unwrap();
        assert!(store.load(&key).await.unwrap().is_empty());
    }
}
