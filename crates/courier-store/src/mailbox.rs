//! Mailbox operations: fanout, paginated sync reads, and acknowledgment.
//!
//! A mailbox row is an undelivered pointer keyed by (recipient, message).
//! Fanout inserts with OR IGNORE so the at-least-once contract holds:
//! replaying a fanout (e.g. after a partially failed batch is re-driven)
//! never duplicates rows, and acknowledging a missing row is a no-op.

use rusqlite::params;

use courier_shared::{MessageId, UserId};

use crate::database::Database;
use crate::error::Result;
use crate::messages::row_to_message;
use crate::models::{FanoutOutcome, MailboxCursor, MailboxPage, Message};

impl Database {
    // ------------------------------------------------------------------
    // Fanout
    // ------------------------------------------------------------------

    /// Write one mailbox row per recipient for an already-persisted
    /// message.
    ///
    /// The batch is best-effort, not atomic: a failed row is recorded in
    /// the outcome and logged, and the remaining recipients still get
    /// theirs. Recipients whose row already exists count as written.
    pub fn fanout_to_mailboxes(
        &self,
        message: &Message,
        recipients: &[UserId],
    ) -> Result<FanoutOutcome> {
        let mut stmt = self.conn().prepare(
            "INSERT OR IGNORE INTO mailbox (recipient_id, message_id, chat_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
        )?;

        let mut outcome = FanoutOutcome::default();
        for recipient in recipients {
            let written = stmt.execute(params![
                recipient.as_str(),
                message.message_id.as_str(),
                message.chat_id.as_str(),
                message.created_at.timestamp_millis(),
            ]);

            match written {
                Ok(_) => outcome.written += 1,
                Err(e) => {
                    tracing::warn!(
                        message_id = %message.message_id,
                        recipient_id = %recipient,
                        error = %e,
                        "mailbox write failed"
                    );
                    outcome.failed.push(recipient.clone());
                }
            }
        }

        if !outcome.is_complete() {
            tracing::error!(
                message_id = %message.message_id,
                failed_recipients = ?outcome.failed,
                "mailbox fanout incomplete"
            );
        }

        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // Sync read
    // ------------------------------------------------------------------

    /// One page of a recipient's undelivered messages, newest first,
    /// hydrated to full message records.
    ///
    /// Keyset pagination on (created_at, message_id): pass the previous
    /// page's `next` cursor to continue. `next` is set whenever the page
    /// is full, so the final cursor may point at an empty page.
    pub fn mailbox_page(
        &self,
        recipient_id: &UserId,
        limit: usize,
        cursor: Option<&MailboxCursor>,
    ) -> Result<MailboxPage> {
        let mut items = Vec::new();

        match cursor {
            Some(cursor) => {
                let mut stmt = self.conn().prepare(
                    "SELECT m.message_id, m.chat_id, m.sender_id, m.content, m.created_at,
                            m.upload_status, m.blob_bucket, m.blob_key
                     FROM mailbox mb
                     JOIN messages m ON m.message_id = mb.message_id
                     WHERE mb.recipient_id = ?1
                       AND (mb.created_at < ?2
                            OR (mb.created_at = ?2 AND mb.message_id < ?3))
                     ORDER BY mb.created_at DESC, mb.message_id DESC
                     LIMIT ?4",
                )?;
                let rows = stmt.query_map(
                    params![
                        recipient_id.as_str(),
                        cursor.created_at,
                        cursor.message_id.as_str(),
                        limit as i64,
                    ],
                    row_to_message,
                )?;
                for row in rows {
                    items.push(row?);
                }
            }
            None => {
                let mut stmt = self.conn().prepare(
                    "SELECT m.message_id, m.chat_id, m.sender_id, m.content, m.created_at,
                            m.upload_status, m.blob_bucket, m.blob_key
                     FROM mailbox mb
                     JOIN messages m ON m.message_id = mb.message_id
                     WHERE mb.recipient_id = ?1
                     ORDER BY mb.created_at DESC, mb.message_id DESC
                     LIMIT ?2",
                )?;
                let rows =
                    stmt.query_map(params![recipient_id.as_str(), limit as i64], row_to_message)?;
                for row in rows {
                    items.push(row?);
                }
            }
        }

        let next = if limit > 0 && items.len() == limit {
            items.last().map(|last| MailboxCursor {
                created_at: last.created_at.timestamp_millis(),
                message_id: last.message_id.clone(),
            })
        } else {
            None
        };

        Ok(MailboxPage { items, next })
    }

    // ------------------------------------------------------------------
    // Acknowledgment
    // ------------------------------------------------------------------

    /// Delete one mailbox row. Idempotent: returns `true` if the row
    /// existed, `false` if it was already acknowledged (or never fanned
    /// out to this recipient).
    pub fn ack_mailbox_item(&self, recipient_id: &UserId, message_id: &MessageId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM mailbox WHERE recipient_id = ?1 AND message_id = ?2",
            params![recipient_id.as_str(), message_id.as_str()],
        )?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Chat;
    use courier_shared::{ChatId, UploadStatus};

    fn db_with_chat() -> (Database, ChatId) {
        let db = Database::open_in_memory().unwrap();
        let chat = Chat::new("general".into(), serde_json::Map::new());
        db.create_chat(&chat).unwrap();
        (db, chat.id)
    }

    fn message_at(chat_id: &ChatId, sender: &str, content: &str, ms: i64) -> Message {
        let mut message = Message::text(
            chat_id.clone(),
            UserId(sender.into()),
            content.into(),
        );
        message.created_at = chrono::DateTime::from_timestamp_millis(ms).unwrap();
        message
    }

    #[test]
    fn fanout_reaches_every_recipient() {
        let (db, chat_id) = db_with_chat();
        let message = message_at(&chat_id, "user-alice", "hello", 1_000);
        db.insert_message(&message).unwrap();

        let recipients = vec![UserId("user-bob".into()), UserId("user-carol".into())];
        let outcome = db.fanout_to_mailboxes(&message, &recipients).unwrap();

        assert_eq!(outcome.written, 2);
        assert!(outcome.is_complete());

        for recipient in &recipients {
            let page = db.mailbox_page(recipient, 10, None).unwrap();
            assert_eq!(page.items.len(), 1);
            assert_eq!(page.items[0].message_id, message.message_id);
        }
    }

    #[test]
    fn replayed_fanout_does_not_duplicate_rows() {
        let (db, chat_id) = db_with_chat();
        let message = message_at(&chat_id, "user-alice", "hello", 1_000);
        db.insert_message(&message).unwrap();

        let recipients = vec![UserId("user-bob".into())];
        db.fanout_to_mailboxes(&message, &recipients).unwrap();
        let second = db.fanout_to_mailboxes(&message, &recipients).unwrap();

        // The replay still reports the row present.
        assert_eq!(second.written, 1);
        assert!(second.is_complete());

        let page = db.mailbox_page(&recipients[0], 10, None).unwrap();
        assert_eq!(page.items.len(), 1);
    }

    #[test]
    fn ack_is_idempotent() {
        let (db, chat_id) = db_with_chat();
        let message = message_at(&chat_id, "user-alice", "hello", 1_000);
        db.insert_message(&message).unwrap();

        let bob = UserId("user-bob".into());
        db.fanout_to_mailboxes(&message, std::slice::from_ref(&bob))
            .unwrap();

        assert!(db.ack_mailbox_item(&bob, &message.message_id).unwrap());
        assert!(!db.ack_mailbox_item(&bob, &message.message_id).unwrap());

        let page = db.mailbox_page(&bob, 10, None).unwrap();
        assert!(page.items.is_empty());
    }

    #[test]
    fn pages_are_newest_first_without_duplicates() {
        let (db, chat_id) = db_with_chat();
        let bob = UserId("user-bob".into());

        let mut ids = Vec::new();
        for i in 0..5 {
            let message = message_at(&chat_id, "user-alice", &format!("m{i}"), 1_000 + i);
            db.insert_message(&message).unwrap();
            db.fanout_to_mailboxes(&message, std::slice::from_ref(&bob))
                .unwrap();
            ids.push(message.message_id);
        }

        let first = db.mailbox_page(&bob, 2, None).unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.items[0].message_id, ids[4]);
        assert_eq!(first.items[1].message_id, ids[3]);
        let cursor = first.next.expect("full page carries a cursor");

        let second = db.mailbox_page(&bob, 2, Some(&cursor)).unwrap();
        assert_eq!(second.items.len(), 2);
        assert_eq!(second.items[0].message_id, ids[2]);
        assert_eq!(second.items[1].message_id, ids[1]);
        let cursor = second.next.expect("full page carries a cursor");

        let last = db.mailbox_page(&bob, 2, Some(&cursor)).unwrap();
        assert_eq!(last.items.len(), 1);
        assert_eq!(last.items[0].message_id, ids[0]);
        assert!(last.next.is_none());
    }

    #[test]
    fn same_millisecond_items_page_without_loss() {
        let (db, chat_id) = db_with_chat();
        let bob = UserId("user-bob".into());

        // Three messages sharing one timestamp; the id breaks the tie.
        let mut ids = Vec::new();
        for i in 0..3 {
            let mut message = message_at(&chat_id, "user-alice", &format!("m{i}"), 1_000);
            message.message_id = MessageId(format!("msg-{i:012}"));
            db.insert_message(&message).unwrap();
            db.fanout_to_mailboxes(&message, std::slice::from_ref(&bob))
                .unwrap();
            ids.push(message.message_id);
        }

        let mut seen = Vec::new();
        let mut cursor: Option<MailboxCursor> = None;
        loop {
            let page = db.mailbox_page(&bob, 2, cursor.as_ref()).unwrap();
            seen.extend(page.items.iter().map(|m| m.message_id.clone()));
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        assert_eq!(seen, vec![ids[2].clone(), ids[1].clone(), ids[0].clone()]);
    }

    #[test]
    fn hydrated_items_carry_attachment_fields() {
        let (db, chat_id) = db_with_chat();
        let bob = UserId("user-bob".into());

        let message = Message::pending_attachment(
            MessageId::generate(),
            chat_id,
            UserId("user-alice".into()),
            "photo incoming".into(),
            "chat-media".into(),
            "chats/c/attachments/m/a1b2c3d4_photo.jpg".into(),
        );
        db.insert_message(&message).unwrap();
        db.complete_upload(&message.message_id, UploadStatus::Completed)
            .unwrap();
        db.fanout_to_mailboxes(&message, std::slice::from_ref(&bob))
            .unwrap();

        let page = db.mailbox_page(&bob, 10, None).unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].upload_status, Some(UploadStatus::Completed));
        assert_eq!(page.items[0].blob_bucket.as_deref(), Some("chat-media"));
    }
}
