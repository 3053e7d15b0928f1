use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use courier_fabric::FabricError;
use courier_shared::{ChatId, UserId};
use courier_store::StoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Chat not found: {0}")]
    ChatNotFound(ChatId),

    #[error("User {user_id} is not a participant of chat {chat_id}")]
    NotParticipant { chat_id: ChatId, user_id: UserId },

    #[error("You are not subscribed to chat {0}")]
    NotSubscribed(ChatId),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Fabric error: {0}")]
    Fabric(#[from] FabricError),

    #[error("Frame encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Message safe to echo back over a socket. Client mistakes keep
    /// their text; infrastructure detail stays in the logs.
    pub fn client_message(&self) -> String {
        match self {
            ServerError::ChatNotFound(_)
            | ServerError::NotParticipant { .. }
            | ServerError::NotSubscribed(_)
            | ServerError::BadRequest(_) => self.to_string(),
            ServerError::Store(StoreError::NotFound) => "Record not found".to_string(),
            _ => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::ChatNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::NotParticipant { .. } => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::NotSubscribed(_) => (StatusCode::FORBIDDEN, self.to_string()),
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::Store(StoreError::NotFound) => {
                (StatusCode::NOT_FOUND, "Record not found".to_string())
            }
            ServerError::Store(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Storage error".to_string())
            }
            ServerError::Fabric(_) | ServerError::Encoding(_) | ServerError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
