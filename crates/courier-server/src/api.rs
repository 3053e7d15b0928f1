//! REST surface: chat CRUD, history and mailbox reads, upload slots,
//! completion-event ingest, and operational endpoints.

use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use courier_shared::{ChatId, CompletionEvent, MessageId, UserId, MAX_CONTENT_LEN};
use courier_store::{Chat, MailboxCursor, Message, Participant, StoreError};

use crate::error::ServerError;
use crate::gateway;
use crate::registry::RegistryStats;
use crate::state::AppState;

/// Bounds on the display name of a chat.
const MAX_CHAT_NAME_LEN: usize = 100;
/// Page size applied when a read omits `limit`.
const DEFAULT_PAGE_LIMIT: usize = 50;
/// Hard page-size ceiling for history and mailbox reads.
const MAX_PAGE_LIMIT: usize = 200;
/// Filenames embedded in blob keys are capped at this many characters.
const MAX_FILENAME_LEN: usize = 100;
/// Advertised lifetime of an upload slot, in seconds.
const UPLOAD_EXPIRES_IN_SECS: u64 = 3600;

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/chats", post(create_chat))
        .route("/chats/{chat_id}", get(get_chat).delete(delete_chat))
        .route("/chats/{chat_id}/participants", post(add_participants))
        .route(
            "/chats/{chat_id}/participants/{user_id}",
            delete(remove_participant),
        )
        .route("/chats/participant/{user_id}", get(chats_for_user))
        .route("/chats/{chat_id}/messages", get(chat_messages))
        .route(
            "/chats/{chat_id}/messages/upload-request",
            post(request_upload_slot),
        )
        .route("/mailbox/{user_id}", get(mailbox_sync))
        .route("/events/upload-completed", post(ingest_completion))
        .route("/ws", get(gateway::ws_handler))
        .route("/ws/stats", get(ws_stats))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Deserialize)]
struct CreateChatRequest {
    name: String,
    #[serde(default)]
    metadata: Option<Map<String, Value>>,
    /// Becomes the first participant when given.
    #[serde(default)]
    creator_id: Option<UserId>,
}

#[derive(Serialize)]
struct ChatWithParticipants {
    chat: Chat,
    participants: Vec<Participant>,
}

#[derive(Serialize)]
struct DeletedResponse {
    message: &'static str,
    id: String,
}

#[derive(Deserialize)]
struct AddParticipantsRequest {
    participant_ids: Vec<UserId>,
}

#[derive(Serialize)]
struct ChatMessagesResponse {
    chat_id: ChatId,
    messages: Vec<Message>,
    count: usize,
}

#[derive(Deserialize)]
struct PageQuery {
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct MailboxQuery {
    limit: Option<usize>,
    /// Keyset cursor from the previous page's `next`; both fields travel
    /// together.
    before_ts: Option<i64>,
    before_id: Option<String>,
}

#[derive(Serialize)]
struct MailboxResponse {
    recipient_id: UserId,
    items: Vec<Message>,
    count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    next: Option<MailboxCursor>,
}

#[derive(Deserialize)]
struct UploadSlotRequest {
    sender_id: UserId,
    filename: String,
    content_type: String,
    /// Optional caption stored as the message content.
    #[serde(default)]
    content: String,
}

#[derive(Serialize)]
struct UploadSlotResponse {
    message_id: MessageId,
    upload_url: String,
    blob_key: String,
    expires_in: u64,
}

#[derive(Serialize)]
struct IngestResponse {
    accepted: bool,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn create_chat(
    State(state): State<AppState>,
    Json(req): Json<CreateChatRequest>,
) -> Result<(StatusCode, Json<Chat>), ServerError> {
    let name_len = req.name.chars().count();
    if name_len == 0 || name_len > MAX_CHAT_NAME_LEN {
        return Err(ServerError::BadRequest(format!(
            "chat name must be 1..={MAX_CHAT_NAME_LEN} characters"
        )));
    }

    let chat = Chat::new(req.name, req.metadata.unwrap_or_default());
    state.store.with(|db| db.create_chat(&chat))?;

    if let Some(creator) = req.creator_id {
        state
            .store
            .with(|db| db.add_participant(&chat.id, &creator).map(|_| ()))?;
    }

    info!(chat_id = %chat.id, name = %chat.name, "chat created");
    Ok((StatusCode::CREATED, Json(chat)))
}

async fn get_chat(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> Result<Json<ChatWithParticipants>, ServerError> {
    let chat_id = ChatId(chat_id);
    let chat = chat_or_404(&state, &chat_id)?;
    let participants = state.store.with(|db| db.participants_for_chat(&chat_id))?;
    Ok(Json(ChatWithParticipants { chat, participants }))
}

async fn delete_chat(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> Result<Json<DeletedResponse>, ServerError> {
    let chat_id = ChatId(chat_id);
    // Participants and messages cascade with the chat row.
    let deleted = state.store.with(|db| db.delete_chat(&chat_id))?;
    if !deleted {
        return Err(ServerError::ChatNotFound(chat_id));
    }

    info!(chat_id = %chat_id, "chat deleted");
    Ok(Json(DeletedResponse {
        message: "Chat deleted successfully",
        id: chat_id.0,
    }))
}

async fn add_participants(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Json(req): Json<AddParticipantsRequest>,
) -> Result<(StatusCode, Json<Vec<Participant>>), ServerError> {
    let chat_id = ChatId(chat_id);
    chat_or_404(&state, &chat_id)?;

    // Already-present ids are skipped, not errors.
    let mut added = Vec::new();
    for user_id in req.participant_ids {
        if let Some(participant) = state
            .store
            .with(|db| db.add_participant(&chat_id, &user_id))?
        {
            added.push(participant);
        }
    }

    info!(chat_id = %chat_id, added = added.len(), "participants added");
    Ok((StatusCode::CREATED, Json(added)))
}

async fn remove_participant(
    State(state): State<AppState>,
    Path((chat_id, user_id)): Path<(String, String)>,
) -> Result<Json<DeletedResponse>, ServerError> {
    let chat_id = ChatId(chat_id);
    let user_id = UserId(user_id);

    let removed = state
        .store
        .with(|db| db.remove_participant(&chat_id, &user_id))?;
    if !removed {
        return Err(ServerError::NotParticipant { chat_id, user_id });
    }

    info!(chat_id = %chat_id, user_id = %user_id, "participant removed");
    Ok(Json(DeletedResponse {
        message: "Participant removed successfully",
        id: user_id.0,
    }))
}

async fn chats_for_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<Chat>>, ServerError> {
    let user_id = UserId(user_id);
    let chats = state.store.with(|db| db.list_chats_for_user(&user_id))?;
    Ok(Json(chats))
}

async fn chat_messages(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Json<ChatMessagesResponse>, ServerError> {
    let chat_id = ChatId(chat_id);
    chat_or_404(&state, &chat_id)?;

    let limit = clamp_limit(query.limit);
    let messages = state
        .store
        .with(|db| db.messages_for_chat(&chat_id, limit))?;

    Ok(Json(ChatMessagesResponse {
        chat_id,
        count: messages.len(),
        messages,
    }))
}

async fn mailbox_sync(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<MailboxQuery>,
) -> Result<Json<MailboxResponse>, ServerError> {
    let recipient_id = UserId(user_id);
    let limit = clamp_limit(query.limit);

    let cursor = match (query.before_ts, query.before_id) {
        (Some(created_at), Some(message_id)) => Some(MailboxCursor {
            created_at,
            message_id: MessageId(message_id),
        }),
        (None, None) => None,
        _ => {
            return Err(ServerError::BadRequest(
                "before_ts and before_id must be supplied together".into(),
            ))
        }
    };

    let page = state
        .store
        .with(|db| db.mailbox_page(&recipient_id, limit, cursor.as_ref()))?;

    Ok(Json(MailboxResponse {
        recipient_id,
        count: page.items.len(),
        items: page.items,
        next: page.next,
    }))
}

/// Issue an upload slot: persists the PENDING attachment message and
/// returns where the client should put the blob. No mailbox fanout
/// happens here; the reconciler performs it once the upload completes.
async fn request_upload_slot(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Json(req): Json<UploadSlotRequest>,
) -> Result<(StatusCode, Json<UploadSlotResponse>), ServerError> {
    let chat_id = ChatId(chat_id);

    if req.filename.is_empty() {
        return Err(ServerError::BadRequest("filename must not be empty".into()));
    }
    if req.content.chars().count() > MAX_CONTENT_LEN {
        return Err(ServerError::BadRequest(format!(
            "content exceeds {MAX_CONTENT_LEN} characters"
        )));
    }

    chat_or_404(&state, &chat_id)?;
    let is_member = state
        .store
        .with(|db| db.is_participant(&chat_id, &req.sender_id))?;
    if !is_member {
        return Err(ServerError::NotParticipant {
            chat_id,
            user_id: req.sender_id,
        });
    }

    let message_id = MessageId::generate();
    let key = blob_key(&chat_id, &message_id, &req.filename);
    let message = Message::pending_attachment(
        message_id.clone(),
        chat_id.clone(),
        req.sender_id.clone(),
        req.content,
        state.config.blob_bucket.clone(),
        key.clone(),
    );
    state.store.with(|db| db.insert_message(&message))?;

    let upload_url = format!(
        "{}/{}",
        state.config.upload_base_url.trim_end_matches('/'),
        key
    );

    info!(
        message_id = %message_id,
        chat_id = %chat_id,
        sender_id = %req.sender_id,
        content_type = %req.content_type,
        blob_key = %key,
        "upload slot issued"
    );
    Ok((
        StatusCode::CREATED,
        Json(UploadSlotResponse {
            message_id,
            upload_url,
            blob_key: key,
            expires_in: UPLOAD_EXPIRES_IN_SECS,
        }),
    ))
}

/// Local stand-in for the external completion queue: accepts one event
/// and hands it to the reconciler.
async fn ingest_completion(
    State(state): State<AppState>,
    Json(event): Json<CompletionEvent>,
) -> Result<(StatusCode, Json<IngestResponse>), ServerError> {
    info!(
        message_id = %event.message_id,
        chat_id = %event.chat_id,
        event_type = ?event.event_type,
        "completion event accepted"
    );

    state
        .events
        .send(event)
        .await
        .map_err(|_| ServerError::Internal("completion event queue is closed".into()))?;

    Ok((StatusCode::ACCEPTED, Json(IngestResponse { accepted: true })))
}

async fn ws_stats(State(state): State<AppState>) -> Json<RegistryStats> {
    Json(state.registry.stats().await)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn chat_or_404(state: &AppState, chat_id: &ChatId) -> Result<Chat, ServerError> {
    state.store.with(|db| db.get_chat(chat_id)).map_err(|e| match e {
        StoreError::NotFound => ServerError::ChatNotFound(chat_id.clone()),
        other => other.into(),
    })
}

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_PAGE_LIMIT).min(MAX_PAGE_LIMIT)
}

/// Blob-store object key for one attachment:
/// `chats/{chat_id}/attachments/{message_id}/{8 hex}_{filename}`.
fn blob_key(chat_id: &ChatId, message_id: &MessageId, filename: &str) -> String {
    let mut prefix = Uuid::new_v4().simple().to_string();
    prefix.truncate(8);
    format!(
        "chats/{chat_id}/attachments/{message_id}/{prefix}_{}",
        sanitize_filename(filename)
    )
}

/// Make a client-supplied filename safe to embed in an object key: path
/// separators become underscores and the length is capped while keeping
/// the extension.
fn sanitize_filename(filename: &str) -> String {
    let safe: String = filename
        .chars()
        .map(|c| match c {
            '/' | '\\' => '_',
            c => c,
        })
        .collect();

    if safe.chars().count() <= MAX_FILENAME_LEN {
        return safe;
    }

    match safe.rfind('.') {
        Some(idx) if idx > 0 => {
            let (stem, ext) = safe.split_at(idx);
            let stem: String = stem.chars().take(90).collect();
            format!("{stem}{ext}")
        }
        _ => safe.chars().take(MAX_FILENAME_LEN).collect(),
    }
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
