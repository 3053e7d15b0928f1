//! CRUD operations for [`Chat`] and [`Participant`] records.

use chrono::{DateTime, Utc};
use rusqlite::params;

use courier_shared::{ChatId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Chat, Participant};

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a new chat.
    pub fn create_chat(&self, chat: &Chat) -> Result<()> {
        let metadata = serde_json::to_string(&chat.metadata)?;

        self.conn().execute(
            "INSERT INTO chats (id, name, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                chat.id.as_str(),
                chat.name,
                metadata,
                chat.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Add a user to a chat. Idempotent: returns `None` if the user was
    /// already a participant, otherwise the new membership edge.
    pub fn add_participant(
        &self,
        chat_id: &ChatId,
        user_id: &UserId,
    ) -> Result<Option<Participant>> {
        let joined_at = Utc::now();

        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO participants (chat_id, user_id, joined_at)
             VALUES (?1, ?2, ?3)",
            params![chat_id.as_str(), user_id.as_str(), joined_at.to_rfc3339()],
        )?;

        if affected == 0 {
            return Ok(None);
        }

        Ok(Some(Participant {
            chat_id: chat_id.clone(),
            user_id: user_id.clone(),
            joined_at,
        }))
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single chat by id.
    pub fn get_chat(&self, id: &ChatId) -> Result<Chat> {
        self.conn()
            .query_row(
                "SELECT id, name, metadata, created_at
                 FROM chats
                 WHERE id = ?1",
                params![id.as_str()],
                row_to_chat,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// List all participants of a chat, oldest membership first.
    pub fn participants_for_chat(&self, chat_id: &ChatId) -> Result<Vec<Participant>> {
        let mut stmt = self.conn().prepare(
            "SELECT chat_id, user_id, joined_at
             FROM participants
             WHERE chat_id = ?1
             ORDER BY joined_at ASC, user_id ASC",
        )?;

        let rows = stmt.query_map(params![chat_id.as_str()], row_to_participant)?;

        let mut participants = Vec::new();
        for row in rows {
            participants.push(row?);
        }
        Ok(participants)
    }

    /// All chat ids a user belongs to (index scan on user_id).
    pub fn chat_ids_for_user(&self, user_id: &UserId) -> Result<Vec<ChatId>> {
        let mut stmt = self.conn().prepare(
            "SELECT chat_id
             FROM participants
             WHERE user_id = ?1
             ORDER BY joined_at ASC, chat_id ASC",
        )?;

        let rows = stmt.query_map(params![user_id.as_str()], |row| {
            row.get::<_, String>(0).map(ChatId)
        })?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// All chats a user belongs to, hydrated.
    pub fn list_chats_for_user(&self, user_id: &UserId) -> Result<Vec<Chat>> {
        let mut stmt = self.conn().prepare(
            "SELECT c.id, c.name, c.metadata, c.created_at
             FROM chats c
             JOIN participants p ON p.chat_id = c.id
             WHERE p.user_id = ?1
             ORDER BY p.joined_at ASC, c.id ASC",
        )?;

        let rows = stmt.query_map(params![user_id.as_str()], row_to_chat)?;

        let mut chats = Vec::new();
        for row in rows {
            chats.push(row?);
        }
        Ok(chats)
    }

    /// Whether a user is a member of a chat.
    pub fn is_participant(&self, chat_id: &ChatId, user_id: &UserId) -> Result<bool> {
        let exists: i64 = self.conn().query_row(
            "SELECT EXISTS(
                 SELECT 1 FROM participants WHERE chat_id = ?1 AND user_id = ?2
             )",
            params![chat_id.as_str(), user_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(exists != 0)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Delete a chat. Participants and messages cascade. Returns `true`
    /// if a row was deleted.
    pub fn delete_chat(&self, id: &ChatId) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM chats WHERE id = ?1", params![id.as_str()])?;
        Ok(affected > 0)
    }

    /// Remove a user from a chat. Returns `true` if a row was deleted.
    pub fn remove_participant(&self, chat_id: &ChatId, user_id: &UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM participants WHERE chat_id = ?1 AND user_id = ?2",
            params![chat_id.as_str(), user_id.as_str()],
        )?;
        Ok(affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a `rusqlite::Row` to a [`Chat`].
fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chat> {
    let id: String = row.get(0)?;
    let name: String = row.get(1)?;
    let metadata_str: String = row.get(2)?;
    let created_str: String = row.get(3)?;

    let metadata = serde_json::from_str(&metadata_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&created_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Chat {
        id: ChatId(id),
        name,
        metadata,
        created_at,
    })
}

/// Map a `rusqlite::Row` to a [`Participant`].
fn row_to_participant(row: &rusqlite::Row<'_>) -> rusqlite::Result<Participant> {
    let chat_id: String = row.get(0)?;
    let user_id: String = row.get(1)?;
    let joined_str: String = row.get(2)?;

    let joined_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&joined_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Participant {
        chat_id: ChatId(chat_id),
        user_id: UserId(user_id),
        joined_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chat_with_metadata() -> Chat {
        let mut metadata = serde_json::Map::new();
        metadata.insert("description".into(), json!("General team discussion"));
        Chat::new("Team Chat".into(), metadata)
    }

    #[test]
    fn create_and_get_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let chat = chat_with_metadata();

        db.create_chat(&chat).unwrap();
        let fetched = db.get_chat(&chat.id).unwrap();

        assert_eq!(fetched.id, chat.id);
        assert_eq!(fetched.name, "Team Chat");
        assert_eq!(
            fetched.metadata.get("description"),
            Some(&json!("General team discussion"))
        );
    }

    #[test]
    fn get_missing_chat_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        let err = db.get_chat(&ChatId("chat-missing".into())).unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[test]
    fn add_participant_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let chat = chat_with_metadata();
        db.create_chat(&chat).unwrap();

        let alice = UserId("user-alice".into());
        assert!(db.add_participant(&chat.id, &alice).unwrap().is_some());
        assert!(db.add_participant(&chat.id, &alice).unwrap().is_none());

        assert!(db.is_participant(&chat.id, &alice).unwrap());
        assert_eq!(db.participants_for_chat(&chat.id).unwrap().len(), 1);
    }

    #[test]
    fn membership_lookups_cover_both_directions() {
        let db = Database::open_in_memory().unwrap();
        let chat_a = Chat::new("a".into(), serde_json::Map::new());
        let chat_b = Chat::new("b".into(), serde_json::Map::new());
        db.create_chat(&chat_a).unwrap();
        db.create_chat(&chat_b).unwrap();

        let alice = UserId("user-alice".into());
        let bob = UserId("user-bob".into());
        db.add_participant(&chat_a.id, &alice).unwrap();
        db.add_participant(&chat_b.id, &alice).unwrap();
        db.add_participant(&chat_a.id, &bob).unwrap();

        let alice_chats = db.chat_ids_for_user(&alice).unwrap();
        assert_eq!(alice_chats.len(), 2);
        assert!(alice_chats.contains(&chat_a.id));
        assert!(alice_chats.contains(&chat_b.id));

        let hydrated = db.list_chats_for_user(&bob).unwrap();
        assert_eq!(hydrated.len(), 1);
        assert_eq!(hydrated[0].name, "a");

        assert!(!db.is_participant(&chat_b.id, &bob).unwrap());
    }

    #[test]
    fn remove_participant_reports_whether_it_existed() {
        let db = Database::open_in_memory().unwrap();
        let chat = chat_with_metadata();
        db.create_chat(&chat).unwrap();

        let alice = UserId("user-alice".into());
        db.add_participant(&chat.id, &alice).unwrap();

        assert!(db.remove_participant(&chat.id, &alice).unwrap());
        assert!(!db.remove_participant(&chat.id, &alice).unwrap());
    }

    #[test]
    fn deleting_a_chat_cascades_participants() {
        let db = Database::open_in_memory().unwrap();
        let chat = chat_with_metadata();
        db.create_chat(&chat).unwrap();

        let alice = UserId("user-alice".into());
        db.add_participant(&chat.id, &alice).unwrap();

        assert!(db.delete_chat(&chat.id).unwrap());
        assert!(!db.delete_chat(&chat.id).unwrap());

        assert!(db.participants_for_chat(&chat.id).unwrap().is_empty());
        assert!(db.chat_ids_for_user(&alice).unwrap().is_empty());
    }
}
