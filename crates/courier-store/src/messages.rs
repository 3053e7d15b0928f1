//! CRUD operations for [`Message`] records, including the exactly-once
//! upload-status transition used by the mailbox reconciler.

use rusqlite::params;

use courier_shared::{ChatId, MessageId, UploadStatus, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Message;

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a new message. Fanout to recipient mailboxes is a separate
    /// step (see [`Database::fanout_to_mailboxes`]) so attachment messages
    /// can defer it until their upload completes.
    pub fn insert_message(&self, message: &Message) -> Result<()> {
        self.conn().execute(
            "INSERT INTO messages
                 (message_id, chat_id, sender_id, content, created_at,
                  upload_status, blob_bucket, blob_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                message.message_id.as_str(),
                message.chat_id.as_str(),
                message.sender_id.as_str(),
                message.content,
                message.created_at.timestamp_millis(),
                message.upload_status.map(|s| s.as_str()),
                message.blob_bucket,
                message.blob_key,
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Resolve a message by id alone. The reconciler uses this to
    /// rehydrate a message from the bare `message_id` in a completion
    /// event.
    pub fn get_message(&self, id: &MessageId) -> Result<Message> {
        self.conn()
            .query_row(
                "SELECT message_id, chat_id, sender_id, content, created_at,
                        upload_status, blob_bucket, blob_key
                 FROM messages
                 WHERE message_id = ?1",
                params![id.as_str()],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// A chat's most recent messages, newest first. `message_id` breaks
    /// ties between rows created in the same millisecond.
    pub fn messages_for_chat(&self, chat_id: &ChatId, limit: usize) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(
            "SELECT message_id, chat_id, sender_id, content, created_at,
                    upload_status, blob_bucket, blob_key
             FROM messages
             WHERE chat_id = ?1
             ORDER BY created_at DESC, message_id DESC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![chat_id.as_str(), limit as i64], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Finalize an attachment message's upload status.
    ///
    /// Only a PENDING message can transition, so the first completion
    /// event wins and every replay is a no-op. Returns `true` if this
    /// call performed the transition, `false` if the message was already
    /// finalized (or was a plain text message).
    pub fn complete_upload(&self, id: &MessageId, status: UploadStatus) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages
             SET upload_status = ?2
             WHERE message_id = ?1
               AND upload_status = ?3",
            params![
                id.as_str(),
                status.as_str(),
                UploadStatus::Pending.as_str()
            ],
        )?;
        Ok(affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a `rusqlite::Row` to a [`Message`]. Also used by the mailbox scan,
/// which hydrates items to full message records with the same column order.
pub(crate) fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let message_id: String = row.get(0)?;
    let chat_id: String = row.get(1)?;
    let sender_id: String = row.get(2)?;
    let content: String = row.get(3)?;
    let created_ms: i64 = row.get(4)?;
    let status_str: Option<String> = row.get(5)?;
    let blob_bucket: Option<String> = row.get(6)?;
    let blob_key: Option<String> = row.get(7)?;

    let created_at = chrono::DateTime::from_timestamp_millis(created_ms).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Integer,
            format!("timestamp out of range: {created_ms}").into(),
        )
    })?;

    let upload_status = match status_str {
        Some(s) => Some(UploadStatus::parse(&s).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                format!("unknown upload status: {s}").into(),
            )
        })?),
        None => None,
    };

    Ok(Message {
        message_id: MessageId(message_id),
        chat_id: ChatId(chat_id),
        sender_id: UserId(sender_id),
        content,
        created_at,
        upload_status,
        blob_bucket,
        blob_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Chat;

    fn db_with_chat() -> (Database, ChatId) {
        let db = Database::open_in_memory().unwrap();
        let chat = Chat::new("general".into(), serde_json::Map::new());
        db.create_chat(&chat).unwrap();
        (db, chat.id)
    }

    #[test]
    fn insert_and_get_round_trip() {
        let (db, chat_id) = db_with_chat();
        let message = Message::text(chat_id, UserId("user-alice".into()), "hello".into());

        db.insert_message(&message).unwrap();
        let fetched = db.get_message(&message.message_id).unwrap();

        assert_eq!(fetched, message);
        assert!(fetched.upload_status.is_none());
    }

    #[test]
    fn attachment_fields_survive_the_round_trip() {
        let (db, chat_id) = db_with_chat();
        let message = Message::pending_attachment(
            MessageId::generate(),
            chat_id,
            UserId("user-alice".into()),
            "check this out".into(),
            "chat-media".into(),
            "chats/chat-1/attachments/msg-1/a1b2c3d4_photo.jpg".into(),
        );

        db.insert_message(&message).unwrap();
        let fetched = db.get_message(&message.message_id).unwrap();

        assert_eq!(fetched.upload_status, Some(UploadStatus::Pending));
        assert_eq!(fetched.blob_bucket.as_deref(), Some("chat-media"));
        assert_eq!(
            fetched.blob_key.as_deref(),
            Some("chats/chat-1/attachments/msg-1/a1b2c3d4_photo.jpg")
        );
    }

    #[test]
    fn get_missing_message_is_not_found() {
        let (db, _) = db_with_chat();
        let err = db.get_message(&MessageId("msg-missing".into())).unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[test]
    fn complete_upload_transitions_exactly_once() {
        let (db, chat_id) = db_with_chat();
        let message = Message::pending_attachment(
            MessageId::generate(),
            chat_id,
            UserId("user-alice".into()),
            String::new(),
            "chat-media".into(),
            "key".into(),
        );
        db.insert_message(&message).unwrap();

        assert!(db
            .complete_upload(&message.message_id, UploadStatus::Completed)
            .unwrap());
        // Replayed event: the row is no longer PENDING, nothing changes.
        assert!(!db
            .complete_upload(&message.message_id, UploadStatus::Completed)
            .unwrap());

        let fetched = db.get_message(&message.message_id).unwrap();
        assert_eq!(fetched.upload_status, Some(UploadStatus::Completed));
    }

    #[test]
    fn failed_upload_also_locks_the_status() {
        let (db, chat_id) = db_with_chat();
        let message = Message::pending_attachment(
            MessageId::generate(),
            chat_id,
            UserId("user-alice".into()),
            String::new(),
            "chat-media".into(),
            "key".into(),
        );
        db.insert_message(&message).unwrap();

        assert!(db
            .complete_upload(&message.message_id, UploadStatus::Failed)
            .unwrap());
        // A late completion cannot resurrect a failed upload.
        assert!(!db
            .complete_upload(&message.message_id, UploadStatus::Completed)
            .unwrap());

        let fetched = db.get_message(&message.message_id).unwrap();
        assert_eq!(fetched.upload_status, Some(UploadStatus::Failed));
    }

    #[test]
    fn plain_text_messages_never_transition() {
        let (db, chat_id) = db_with_chat();
        let message = Message::text(chat_id, UserId("user-alice".into()), "hi".into());
        db.insert_message(&message).unwrap();

        assert!(!db
            .complete_upload(&message.message_id, UploadStatus::Completed)
            .unwrap());
        let fetched = db.get_message(&message.message_id).unwrap();
        assert!(fetched.upload_status.is_none());
    }

    #[test]
    fn chat_history_is_newest_first_and_limited() {
        let (db, chat_id) = db_with_chat();
        let alice = UserId("user-alice".into());

        let mut ids = Vec::new();
        for i in 0..5 {
            let mut message = Message::text(chat_id.clone(), alice.clone(), format!("m{i}"));
            // Distinct timestamps so ordering is deterministic.
            message.created_at = chrono::DateTime::from_timestamp_millis(1_000 + i).unwrap();
            db.insert_message(&message).unwrap();
            ids.push(message.message_id);
        }

        let history = db.messages_for_chat(&chat_id, 3).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].message_id, ids[4]);
        assert_eq!(history[1].message_id, ids[3]);
        assert_eq!(history[2].message_id, ids[2]);
    }
}
