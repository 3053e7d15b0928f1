//! The JSON socket protocol.
//!
//! Every frame is a JSON object tagged by a `type` field. Clients send
//! [`ClientFrame`]s; the gateway and the fabric deliver [`ServerFrame`]s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FrameError;
use crate::events::UploadStatus;
use crate::ids::{ChatId, MessageId, UserId};

/// Upper bound on message content, in characters.
pub const MAX_CONTENT_LEN: usize = 5000;

/// Frames sent by a client over its socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    /// Publish a text message into a chat.
    Message { chat_id: ChatId, content: String },

    /// Add a chat to this connection's live subscription set.
    Subscribe { chat_id: ChatId },

    /// Remove a chat from this connection's live subscription set.
    Unsubscribe { chat_id: ChatId },

    /// Confirm receipt of a message; clears the caller's mailbox item.
    AckMessageReceived { message_id: MessageId },

    /// Liveness probe; answered with a `pong`.
    Ping,
}

impl ClientFrame {
    /// Parse and validate one inbound frame.
    ///
    /// Validation covers structure only (ids present, content within
    /// bounds). Whether the caller may act on the chat is the gateway's
    /// decision.
    pub fn parse(raw: &str) -> Result<Self, FrameError> {
        let frame: ClientFrame = serde_json::from_str(raw)?;

        match &frame {
            ClientFrame::Message { chat_id, content } => {
                if chat_id.as_str().is_empty() {
                    return Err(FrameError::MissingChatId);
                }
                if content.chars().count() > MAX_CONTENT_LEN {
                    return Err(FrameError::ContentTooLong {
                        max: MAX_CONTENT_LEN,
                    });
                }
            }
            ClientFrame::Subscribe { chat_id } | ClientFrame::Unsubscribe { chat_id } => {
                if chat_id.as_str().is_empty() {
                    return Err(FrameError::MissingChatId);
                }
            }
            ClientFrame::AckMessageReceived { message_id } => {
                if message_id.as_str().is_empty() {
                    return Err(FrameError::MissingMessageId);
                }
            }
            ClientFrame::Ping => {}
        }

        Ok(frame)
    }
}

/// Frames pushed to a client, either directly by its gateway or via the
/// fabric by any process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    /// First frame on a successful connect; enumerates the live
    /// subscriptions so the client can reconcile its local view.
    Connected {
        user_id: UserId,
        subscribed_chats: Vec<ChatId>,
        timestamp: DateTime<Utc>,
    },

    /// A chat message. Attachment messages additionally carry the final
    /// upload status and blob location.
    Message {
        message_id: MessageId,
        chat_id: ChatId,
        content: String,
        sender_id: UserId,
        created_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        upload_status: Option<UploadStatus>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        blob_bucket: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        blob_key: Option<String>,
    },

    /// Reply to `subscribe`.
    Subscribed { chat_id: ChatId, success: bool },

    /// Reply to `unsubscribe`.
    Unsubscribed { chat_id: ChatId, success: bool },

    /// Reply to `ping`.
    Pong { timestamp: DateTime<Utc> },

    /// A per-connection error. Never tears the connection down.
    Error { content: String },

    /// Join/leave notices published on a chat's channel.
    System {
        content: String,
        chat_id: ChatId,
        timestamp: DateTime<Utc>,
    },
}

impl ServerFrame {
    /// Serialize for the wire. Frames are plain data; failure here means a
    /// programming error, surfaced as such to the caller.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frame_tags_match_the_protocol() {
        let frame = ClientFrame::parse(
            r#"{"type":"message","chat_id":"chat-1","content":"hi"}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            ClientFrame::Message {
                chat_id: ChatId("chat-1".into()),
                content: "hi".into(),
            }
        );

        let frame =
            ClientFrame::parse(r#"{"type":"ack-message-received","message_id":"msg-1"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::AckMessageReceived {
                message_id: MessageId("msg-1".into()),
            }
        );

        assert_eq!(ClientFrame::parse(r#"{"type":"ping"}"#).unwrap(), ClientFrame::Ping);
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(matches!(
            ClientFrame::parse("not json"),
            Err(FrameError::Json(_))
        ));
        assert!(matches!(
            ClientFrame::parse(r#"{"type":"teleport"}"#),
            Err(FrameError::Json(_))
        ));
        assert!(matches!(
            ClientFrame::parse(r#"{"type":"subscribe","chat_id":""}"#),
            Err(FrameError::MissingChatId)
        ));
    }

    #[test]
    fn oversized_content_is_rejected() {
        let long = "x".repeat(MAX_CONTENT_LEN + 1);
        let raw = format!(r#"{{"type":"message","chat_id":"chat-1","content":"{long}"}}"#);
        assert!(matches!(
            ClientFrame::parse(&raw),
            Err(FrameError::ContentTooLong { .. })
        ));

        // Exactly at the bound is fine.
        let ok = "x".repeat(MAX_CONTENT_LEN);
        let raw = format!(r#"{{"type":"message","chat_id":"chat-1","content":"{ok}"}}"#);
        assert!(ClientFrame::parse(&raw).is_ok());
    }

    #[test]
    fn message_frame_omits_absent_attachment_fields() {
        let frame = ServerFrame::Message {
            message_id: MessageId("msg-1".into()),
            chat_id: ChatId("chat-1".into()),
            content: "hi".into(),
            sender_id: UserId("user-a".into()),
            created_at: Utc::now(),
            upload_status: None,
            blob_bucket: None,
            blob_key: None,
        };

        let json = frame.to_json().unwrap();
        assert!(json.contains(r#""type":"message""#));
        assert!(!json.contains("upload_status"));
        assert!(!json.contains("blob_bucket"));
    }

    #[test]
    fn attachment_message_carries_blob_fields() {
        let frame = ServerFrame::Message {
            message_id: MessageId("msg-1".into()),
            chat_id: ChatId("chat-1".into()),
            content: "see attached".into(),
            sender_id: UserId("user-a".into()),
            created_at: Utc::now(),
            upload_status: Some(UploadStatus::Completed),
            blob_bucket: Some("chat-media".into()),
            blob_key: Some("chats/chat-1/attachments/msg-1/ab12cd34_f.jpg".into()),
        };

        let json = frame.to_json().unwrap();
        assert!(json.contains(r#""upload_status":"COMPLETED""#));

        let back = ServerFrame::from_json(&json).unwrap();
        assert_eq!(back, frame);
    }
}
