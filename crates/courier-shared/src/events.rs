//! Upload-completion events consumed by the mailbox reconciler.
//!
//! The upload pipeline emits one event per finished (or failed) direct
//! blob-store upload. The reconciler only learns `message_id` + `chat_id`
//! from the event and rehydrates the rest of the message from the store.

use serde::{Deserialize, Serialize};

use crate::ids::{ChatId, MessageId};

/// Attachment upload lifecycle. `Pending` is set when the upload slot is
/// issued; the reconciler moves it to `Completed` or `Failed` exactly once.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadStatus {
    Pending,
    Completed,
    Failed,
}

impl UploadStatus {
    /// Stable string form used in the store and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "PENDING",
            UploadStatus::Completed => "COMPLETED",
            UploadStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(UploadStatus::Pending),
            "COMPLETED" => Some(UploadStatus::Completed),
            "FAILED" => Some(UploadStatus::Failed),
            _ => None,
        }
    }
}

/// Discriminator carried in the event's `event_type` field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompletionKind {
    UploadCompleted,
    UploadFailed,
    /// Anything this version does not understand; logged and dropped.
    #[serde(other)]
    Unknown,
}

/// One event from the upload pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionEvent {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub blob_bucket: String,
    pub blob_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub event_type: CompletionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_event_decodes_pipeline_json() {
        let raw = r#"{
            "message_id": "msg-def456abc123",
            "chat_id": "chat-abc123def456",
            "blob_bucket": "chat-media",
            "blob_key": "chats/chat-abc123def456/attachments/msg-def456abc123/a1b2c3d4_photo.jpg",
            "filename": "photo.jpg",
            "size": 12345,
            "event_type": "upload_completed",
            "correlation_id": "corr-1"
        }"#;

        let event: CompletionEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.event_type, CompletionKind::UploadCompleted);
        assert_eq!(event.message_id.as_str(), "msg-def456abc123");
        assert_eq!(event.size, Some(12345));
    }

    #[test]
    fn optional_fields_may_be_absent() {
        let raw = r#"{
            "message_id": "msg-1",
            "chat_id": "chat-1",
            "blob_bucket": "b",
            "blob_key": "k",
            "event_type": "upload_failed"
        }"#;

        let event: CompletionEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.event_type, CompletionKind::UploadFailed);
        assert!(event.filename.is_none());
        assert!(event.correlation_id.is_none());
    }

    #[test]
    fn unknown_event_type_is_preserved_as_unknown() {
        let raw = r#"{
            "message_id": "msg-1",
            "chat_id": "chat-1",
            "blob_bucket": "b",
            "blob_key": "k",
            "event_type": "blob_scanned"
        }"#;

        let event: CompletionEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.event_type, CompletionKind::Unknown);
    }

    #[test]
    fn upload_status_round_trips_through_strings() {
        for status in [
            UploadStatus::Pending,
            UploadStatus::Completed,
            UploadStatus::Failed,
        ] {
            assert_eq!(UploadStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(UploadStatus::parse("DONE"), None);
    }
}
