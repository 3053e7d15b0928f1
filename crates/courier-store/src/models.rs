//! Domain model structs persisted in the SQLite database.
//!
//! Every struct derives `Serialize` and `Deserialize` so REST handlers can
//! return the persisted record directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use courier_shared::{ChatId, MessageId, UploadStatus, UserId};

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

/// A conversation. Immutable after creation except for its metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chat {
    /// Unique chat identifier.
    pub id: ChatId,
    /// Human-readable chat name.
    pub name: String,
    /// Free-form metadata attached at creation.
    pub metadata: Map<String, Value>,
    /// When the chat was created.
    pub created_at: DateTime<Utc>,
}

impl Chat {
    /// A new chat with a generated id, timestamped now.
    pub fn new(name: String, metadata: Map<String, Value>) -> Self {
        Self {
            id: ChatId::generate(),
            name,
            metadata,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Participant
// ---------------------------------------------------------------------------

/// A chat membership edge. Composite identity is (chat_id, user_id).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Participant {
    pub chat_id: ChatId,
    pub user_id: UserId,
    /// When the user was added to the chat.
    pub joined_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single chat message.
///
/// `created_at` has millisecond precision and is the sort key within a
/// chat. The attachment fields are `None` for plain text messages; for
/// attachment messages `upload_status` starts at PENDING and is finalized
/// exactly once by the reconciler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_status: Option<UploadStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_key: Option<String>,
}

impl Message {
    /// A plain text message with a generated id, timestamped now.
    pub fn text(chat_id: ChatId, sender_id: UserId, content: String) -> Self {
        Self {
            message_id: MessageId::generate(),
            chat_id,
            sender_id,
            content,
            created_at: now_millis(),
            upload_status: None,
            blob_bucket: None,
            blob_key: None,
        }
    }

    /// An attachment message awaiting its upload. Excluded from mailbox
    /// fanout until the reconciler marks it COMPLETED.
    ///
    /// The caller supplies the id because the blob key embeds it.
    pub fn pending_attachment(
        message_id: MessageId,
        chat_id: ChatId,
        sender_id: UserId,
        content: String,
        blob_bucket: String,
        blob_key: String,
    ) -> Self {
        Self {
            message_id,
            chat_id,
            sender_id,
            content,
            created_at: now_millis(),
            upload_status: Some(UploadStatus::Pending),
            blob_bucket: Some(blob_bucket),
            blob_key: Some(blob_key),
        }
    }
}

/// Now, truncated to the millisecond precision the store keeps.
fn now_millis() -> DateTime<Utc> {
    let ms = Utc::now().timestamp_millis();
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

// ---------------------------------------------------------------------------
// Mailbox
// ---------------------------------------------------------------------------

/// Keyset cursor for mailbox pagination: "items strictly older than this".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MailboxCursor {
    /// Epoch milliseconds of the last item on the previous page.
    pub created_at: i64,
    pub message_id: MessageId,
}

/// One page of a recipient's mailbox, hydrated to full message records,
/// newest first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MailboxPage {
    pub items: Vec<Message>,
    /// Present when another page may exist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<MailboxCursor>,
}

/// Result of a best-effort mailbox fanout batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FanoutOutcome {
    /// Recipients whose mailbox row is now present.
    pub written: usize,
    /// Recipients whose write failed; logged by the store as an anomaly.
    pub failed: Vec<UserId>,
}

impl FanoutOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}
