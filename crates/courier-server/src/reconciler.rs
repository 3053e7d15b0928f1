//! Mailbox reconciler: finalizes attachment messages whose fanout was
//! deferred at write time.
//!
//! A standing consumer drains upload-completion events from a
//! [`CompletionSource`]. For each completed upload it flips the message
//! PENDING -> COMPLETED (exactly once, enforced by the store), performs
//! the mailbox fanout that was skipped when the slot was issued, and
//! publishes the finished message on the chat's channel. Failed uploads
//! only flip the status; nothing is delivered.
//!
//! Malformed, unknown, or stale events are logged and dropped. There is
//! no dead-letter store; the ingest endpoint doubles as the replay path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use courier_fabric::{Fabric, FabricError};
use courier_shared::{CompletionEvent, CompletionKind, ServerFrame, UploadStatus, UserId};
use courier_store::{StoreError, StoreHandle};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Fabric error: {0}")]
    Fabric(#[from] FabricError),

    #[error("Frame encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Where completion events come from. The in-process queue implements
/// this; a broker-backed consumer can replace it without touching the
/// reconcile logic.
#[async_trait]
pub trait CompletionSource: Send + Sync {
    /// Open a fresh consumer. Called again after a stream failure, once
    /// the backoff elapses.
    async fn connect(&self) -> Result<Box<dyn CompletionStream>, ReconcileError>;
}

/// One live consumer over the event stream.
#[async_trait]
pub trait CompletionStream: Send {
    /// Next event, or `None` when this consumer is exhausted.
    async fn next(&mut self) -> Option<CompletionEvent>;
}

/// Completion source fed by the `POST /events/upload-completed` endpoint.
pub struct QueueCompletionSource {
    rx: Arc<Mutex<mpsc::Receiver<CompletionEvent>>>,
}

impl QueueCompletionSource {
    pub fn new(rx: mpsc::Receiver<CompletionEvent>) -> Self {
        Self {
            rx: Arc::new(Mutex::new(rx)),
        }
    }
}

#[async_trait]
impl CompletionSource for QueueCompletionSource {
    async fn connect(&self) -> Result<Box<dyn CompletionStream>, ReconcileError> {
        Ok(Box::new(QueueCompletionStream {
            rx: Arc::clone(&self.rx),
        }))
    }
}

struct QueueCompletionStream {
    rx: Arc<Mutex<mpsc::Receiver<CompletionEvent>>>,
}

#[async_trait]
impl CompletionStream for QueueCompletionStream {
    async fn next(&mut self) -> Option<CompletionEvent> {
        self.rx.lock().await.recv().await
    }
}

/// Handle to the running consumer task.
pub struct ReconcilerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Signal shutdown and wait for the consumer to finish its in-flight
    /// event.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "reconciler task ended abnormally");
        }
    }
}

pub struct Reconciler {
    store: StoreHandle,
    fabric: Arc<dyn Fabric>,
    source: Arc<dyn CompletionSource>,
    backoff: Duration,
}

impl Reconciler {
    pub fn new(
        store: StoreHandle,
        fabric: Arc<dyn Fabric>,
        source: Arc<dyn CompletionSource>,
        backoff: Duration,
    ) -> Self {
        Self {
            store,
            fabric,
            source,
            backoff,
        }
    }

    /// Start the standing consumer.
    pub fn spawn(self) -> ReconcilerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(stop_rx));
        ReconcilerHandle {
            stop: stop_tx,
            task,
        }
    }

    /// Connect, drain, reconnect with backoff. Only the stop signal ends
    /// the loop; a failing source never terminates the process.
    async fn run(self, mut stop: watch::Receiver<bool>) {
        loop {
            let mut stream = tokio::select! {
                _ = stop.changed() => break,
                connected = self.source.connect() => match connected {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::error!(error = %e, "completion source connect failed");
                        if wait_or_stop(&mut stop, self.backoff).await {
                            break;
                        }
                        continue;
                    }
                },
            };
            tracing::info!("completion consumer connected");

            loop {
                tokio::select! {
                    _ = stop.changed() => {
                        tracing::info!("reconciler stopping");
                        return;
                    }
                    event = stream.next() => match event {
                        Some(event) => {
                            if let Err(e) = self.process_event(event).await {
                                tracing::error!(error = %e, "completion event processing failed");
                            }
                        }
                        None => {
                            tracing::warn!("completion stream ended, reconnecting");
                            break;
                        }
                    },
                }
            }

            if wait_or_stop(&mut stop, self.backoff).await {
                break;
            }
        }
        tracing::info!("reconciler stopped");
    }

    /// Apply one completion event end to end.
    ///
    /// Drops (with a log line) are final for this consumer; re-posting
    /// the event to the ingest endpoint is safe because the status
    /// transition and the mailbox rows are both idempotent.
    async fn process_event(&self, event: CompletionEvent) -> Result<(), ReconcileError> {
        let correlation_id = event.correlation_id.as_deref().unwrap_or("-").to_string();

        if event.message_id.as_str().is_empty() || event.chat_id.as_str().is_empty() {
            tracing::warn!(correlation_id = %correlation_id, "completion event missing identifiers, dropped");
            return Ok(());
        }

        let target = match event.event_type {
            CompletionKind::UploadCompleted => UploadStatus::Completed,
            CompletionKind::UploadFailed => UploadStatus::Failed,
            CompletionKind::Unknown => {
                tracing::warn!(
                    message_id = %event.message_id,
                    correlation_id = %correlation_id,
                    "unknown completion event type, dropped"
                );
                return Ok(());
            }
        };

        let message = match self.store.with(|db| db.get_message(&event.message_id)) {
            Ok(message) => message,
            Err(StoreError::NotFound) => {
                tracing::warn!(
                    message_id = %event.message_id,
                    correlation_id = %correlation_id,
                    "completion event for unknown message, dropped"
                );
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let transitioned = self
            .store
            .with(|db| db.complete_upload(&event.message_id, target))?;
        if !transitioned {
            tracing::warn!(
                message_id = %event.message_id,
                correlation_id = %correlation_id,
                "upload status already finalized, event dropped"
            );
            return Ok(());
        }

        if target == UploadStatus::Failed {
            tracing::info!(
                message_id = %event.message_id,
                chat_id = %event.chat_id,
                correlation_id = %correlation_id,
                "upload failed, message will not be delivered"
            );
            return Ok(());
        }

        let recipients: Vec<UserId> = self
            .store
            .with(|db| db.participants_for_chat(&event.chat_id))?
            .into_iter()
            .map(|p| p.user_id)
            .filter(|id| *id != message.sender_id)
            .collect();

        // The deferred fanout. Partial failure is logged by the store;
        // online recipients still get the live frame below.
        self.store
            .with(|db| db.fanout_to_mailboxes(&message, &recipients))?;

        let frame = ServerFrame::Message {
            message_id: message.message_id.clone(),
            chat_id: message.chat_id.clone(),
            content: message.content.clone(),
            sender_id: message.sender_id.clone(),
            created_at: message.created_at,
            upload_status: Some(UploadStatus::Completed),
            // The stored record is authoritative; the event fills any gap.
            blob_bucket: message.blob_bucket.clone().or(Some(event.blob_bucket)),
            blob_key: message.blob_key.clone().or(Some(event.blob_key)),
        };
        self.fabric
            .publish(&message.chat_id.channel(), frame.to_json()?)
            .await?;

        tracing::info!(
            message_id = %message.message_id,
            chat_id = %message.chat_id,
            recipients = recipients.len(),
            correlation_id = %correlation_id,
            "deferred message reconciled and delivered"
        );
        Ok(())
    }
}

/// Sleep for `backoff`, returning early with `true` if stop fires first.
async fn wait_or_stop(stop: &mut watch::Receiver<bool>, backoff: Duration) -> bool {
    tokio::select! {
        _ = stop.changed() => true,
        _ = tokio::time::sleep(backoff) => false,
    }
}
