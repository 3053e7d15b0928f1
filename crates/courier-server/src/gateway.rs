//! WebSocket gateway: upgrades `GET /ws`, validates inbound frames, and
//! drives the store/fabric for each connected user.
//!
//! Each connection runs two tasks: this read loop and a writer draining
//! the outbound queue into the socket. The registry's listener feeds the
//! same queue, so frames from the fabric and direct replies share one
//! ordered path to the client.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use courier_shared::{ChatId, ClientFrame, MessageId, ServerFrame, UserId};
use courier_store::{Message as StoredMessage, StoreError};

use crate::error::ServerError;
use crate::state::AppState;

/// Close code sent when the `chat_id` connect parameter names an unknown
/// chat. The socket is accepted first so the reason reaches the client.
const CLOSE_CHAT_NOT_FOUND: u16 = 4004;
const CLOSE_INTERNAL: u16 = 1011;

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub user_id: String,
    /// Optional chat the client intends to use; verified after the
    /// handshake.
    pub chat_id: Option<String>,
}

pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, params, socket))
}

async fn handle_socket(state: AppState, params: ConnectParams, mut socket: WebSocket) {
    let user_id = UserId(params.user_id);

    // Verify the optional chat_id before registering anything.
    if let Some(raw) = params.chat_id {
        let chat_id = ChatId(raw);
        match state.store.with(|db| db.get_chat(&chat_id)) {
            Ok(_) => {}
            Err(StoreError::NotFound) => {
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_CHAT_NOT_FOUND,
                        reason: format!("Chat {chat_id} not found").into(),
                    })))
                    .await;
                return;
            }
            Err(e) => {
                tracing::error!(user_id = %user_id, error = %e, "chat lookup failed on connect");
                close_internal(&mut socket).await;
                return;
            }
        }
    }

    let chat_ids = match state.store.with(|db| db.chat_ids_for_user(&user_id)) {
        Ok(ids) => ids,
        Err(e) => {
            tracing::error!(user_id = %user_id, error = %e, "membership lookup failed on connect");
            close_internal(&mut socket).await;
            return;
        }
    };

    let (out_tx, mut out_rx) = mpsc::channel::<String>(state.config.outbound_buffer);
    let conn_id = match state
        .registry
        .connect(state.fabric.as_ref(), user_id.clone(), chat_ids, out_tx.clone())
        .await
    {
        Ok(id) => id,
        Err(e) => {
            tracing::error!(user_id = %user_id, error = %e, "fabric subscription failed on connect");
            close_internal(&mut socket).await;
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Writer task: the only place that touches the socket's sink.
    let writer_user = user_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                tracing::debug!(user_id = %writer_user, error = %e, "socket write failed");
                break;
            }
        }
    });

    let connected = ServerFrame::Connected {
        user_id: user_id.clone(),
        subscribed_chats: state.registry.subscriptions_of(&user_id).await,
        timestamp: Utc::now(),
    };
    send_frame(&out_tx, &connected).await;

    while let Some(incoming) = ws_receiver.next().await {
        match incoming {
            Ok(Message::Text(text)) => {
                dispatch_frame(&state, &user_id, text.as_str(), &out_tx).await;
            }
            Ok(Message::Close(_)) => break,
            // Binary frames are not part of the protocol; pings are
            // answered by axum itself.
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(user_id = %user_id, error = %e, "socket read failed");
                break;
            }
        }
    }

    state.registry.disconnect(&user_id, conn_id).await;
    writer.abort();
}

async fn close_internal(socket: &mut WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_INTERNAL,
            reason: "Internal error".into(),
        })))
        .await;
}

/// Handle one inbound frame. Every failure is reported to this client
/// alone; the connection stays open.
pub(crate) async fn dispatch_frame(
    state: &AppState,
    user_id: &UserId,
    raw: &str,
    out: &mpsc::Sender<String>,
) {
    let frame = match ClientFrame::parse(raw) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(user_id = %user_id, error = %e, "rejected inbound frame");
            send_frame(out, &ServerFrame::Error { content: e.to_string() }).await;
            return;
        }
    };

    let result = match frame {
        ClientFrame::Message { chat_id, content } => {
            handle_message(state, user_id, chat_id, content).await
        }
        ClientFrame::Subscribe { chat_id } => handle_subscribe(state, user_id, chat_id, out).await,
        ClientFrame::Unsubscribe { chat_id } => {
            handle_unsubscribe(state, user_id, chat_id, out).await
        }
        ClientFrame::AckMessageReceived { message_id } => handle_ack(state, user_id, message_id),
        ClientFrame::Ping => {
            send_frame(out, &ServerFrame::Pong { timestamp: Utc::now() }).await;
            Ok(())
        }
    };

    if let Err(e) = result {
        tracing::warn!(user_id = %user_id, error = %e, "frame handling failed");
        send_frame(out, &ServerFrame::Error { content: e.client_message() }).await;
    }
}

/// Persist, fan out, and publish one text message.
async fn handle_message(
    state: &AppState,
    sender_id: &UserId,
    chat_id: ChatId,
    content: String,
) -> Result<(), ServerError> {
    // Empty content is a silent no-op, not a protocol error.
    if content.is_empty() {
        return Ok(());
    }

    if !state.registry.is_subscribed(sender_id, &chat_id).await {
        return Err(ServerError::NotSubscribed(chat_id));
    }

    let recipients: Vec<UserId> = state
        .store
        .with(|db| db.participants_for_chat(&chat_id))?
        .into_iter()
        .map(|p| p.user_id)
        .filter(|id| id != sender_id)
        .collect();

    let message = StoredMessage::text(chat_id.clone(), sender_id.clone(), content);
    state.store.with(|db| db.insert_message(&message))?;

    let outcome = state
        .store
        .with(|db| db.fanout_to_mailboxes(&message, &recipients))?;
    if !recipients.is_empty() && outcome.written == 0 {
        // Partial fanout is tolerated (logged by the store); losing every
        // mailbox is a failed send.
        return Err(ServerError::Internal(format!(
            "mailbox fanout wrote no rows for message {}",
            message.message_id
        )));
    }

    let frame = ServerFrame::Message {
        message_id: message.message_id.clone(),
        chat_id: chat_id.clone(),
        content: message.content.clone(),
        sender_id: sender_id.clone(),
        created_at: message.created_at,
        upload_status: None,
        blob_bucket: None,
        blob_key: None,
    };
    state
        .fabric
        .publish(&chat_id.channel(), frame.to_json()?)
        .await?;

    tracing::info!(
        message_id = %message.message_id,
        chat_id = %chat_id,
        sender_id = %sender_id,
        recipients = recipients.len(),
        "message delivered"
    );
    Ok(())
}

/// Add a chat to the caller's live subscriptions. Succeeds only for an
/// existing chat the caller is a member of; the reply carries the outcome
/// either way.
async fn handle_subscribe(
    state: &AppState,
    user_id: &UserId,
    chat_id: ChatId,
    out: &mpsc::Sender<String>,
) -> Result<(), ServerError> {
    let exists = match state.store.with(|db| db.get_chat(&chat_id)) {
        Ok(_) => true,
        Err(StoreError::NotFound) => false,
        Err(e) => return Err(e.into()),
    };
    let member = exists && state.store.with(|db| db.is_participant(&chat_id, user_id))?;

    if !member {
        send_frame(
            out,
            &ServerFrame::Subscribed { chat_id, success: false },
        )
        .await;
        return Ok(());
    }

    let newly_added = state.registry.subscribe(user_id, &chat_id).await;
    send_frame(
        out,
        &ServerFrame::Subscribed { chat_id: chat_id.clone(), success: true },
    )
    .await;

    // Joining an already-subscribed chat changes nothing worth announcing.
    if newly_added {
        publish_system_notice(state, &chat_id, format!("{user_id} joined the chat")).await?;
    }
    Ok(())
}

/// Drop a chat from the caller's live subscriptions. `success` reflects
/// whether the chat was actually subscribed.
async fn handle_unsubscribe(
    state: &AppState,
    user_id: &UserId,
    chat_id: ChatId,
    out: &mpsc::Sender<String>,
) -> Result<(), ServerError> {
    let removed = state.registry.unsubscribe(user_id, &chat_id).await;
    send_frame(
        out,
        &ServerFrame::Unsubscribed { chat_id: chat_id.clone(), success: removed },
    )
    .await;

    if removed {
        publish_system_notice(state, &chat_id, format!("{user_id} left the chat")).await?;
    }
    Ok(())
}

/// Clear the caller's own mailbox item. Idempotent; acking a missing item
/// is not an error and no reply is sent.
fn handle_ack(
    state: &AppState,
    user_id: &UserId,
    message_id: MessageId,
) -> Result<(), ServerError> {
    let existed = state
        .store
        .with(|db| db.ack_mailbox_item(user_id, &message_id))?;
    if existed {
        tracing::debug!(user_id = %user_id, message_id = %message_id, "mailbox item acknowledged");
    }
    Ok(())
}

async fn publish_system_notice(
    state: &AppState,
    chat_id: &ChatId,
    content: String,
) -> Result<(), ServerError> {
    let frame = ServerFrame::System {
        content,
        chat_id: chat_id.clone(),
        timestamp: Utc::now(),
    };
    state
        .fabric
        .publish(&chat_id.channel(), frame.to_json()?)
        .await?;
    Ok(())
}

/// Queue a frame for this connection's writer. A closed queue means the
/// socket is already gone; the frame is dropped with it.
async fn send_frame(out: &mpsc::Sender<String>, frame: &ServerFrame) {
    match frame.to_json() {
        Ok(json) => {
            if out.send(json).await.is_err() {
                tracing::debug!("outbound queue closed, dropping frame");
            }
        }
        Err(e) => tracing::error!(error = %e, "failed to encode outbound frame"),
    }
}
