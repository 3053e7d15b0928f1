use thiserror::Error;

/// Why an inbound frame was rejected. The text of these errors is sent back
/// to the offending client verbatim in an `error` frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame is missing a chat_id")]
    MissingChatId,

    #[error("Frame is missing a message_id")]
    MissingMessageId,

    #[error("Message content exceeds {max} characters")]
    ContentTooLong { max: usize },
}
