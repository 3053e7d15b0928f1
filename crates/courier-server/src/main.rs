//! # courier-server
//!
//! Message-delivery server for the courier chat backend.
//!
//! This binary provides:
//! - **WebSocket gateway** (`/ws`) validating client frames, persisting
//!   messages, and fanning them out to recipient mailboxes
//! - **Connection registry** tracking each connected user's socket and
//!   live chat subscriptions, one listener task per user
//! - **Pub/sub fabric** broadcasting frames on per-chat channels so every
//!   process with a live subscriber can push to its local sockets
//! - **Mailbox reconciler** consuming upload-completion events and
//!   releasing messages whose delivery was deferred pending attachment
//!   upload
//! - **REST API** (axum) for chat CRUD, history and mailbox reads, upload
//!   slots, and completion-event ingest

mod api;
mod config;
mod error;
mod gateway;
mod reconciler;
mod registry;
mod state;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use courier_fabric::{Fabric, LocalFabric};
use courier_store::{Database, StoreHandle};

use crate::config::ServerConfig;
use crate::reconciler::{QueueCompletionSource, Reconciler};
use crate::registry::ConnectionRegistry;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,courier_server=debug")),
        )
        .init();

    info!("Starting courier server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------

    // Durable store (creates the database directory if missing)
    let database = Database::open_at(&config.database_path)?;
    let store = StoreHandle::new(database);
    info!(path = %config.database_path.display(), "Store ready");

    // In-process fabric; a broker-backed implementation slots in here for
    // a multi-process fleet.
    let fabric: Arc<dyn Fabric> = Arc::new(LocalFabric::new(config.fabric_capacity));

    // Connection registry
    let registry = Arc::new(ConnectionRegistry::new());

    // -----------------------------------------------------------------------
    // 4. Start the mailbox reconciler
    // -----------------------------------------------------------------------
    let (events_tx, events_rx) = mpsc::channel(config.event_queue_capacity);
    let reconciler = Reconciler::new(
        store.clone(),
        fabric.clone(),
        Arc::new(QueueCompletionSource::new(events_rx)),
        Duration::from_secs(config.reconciler_backoff_secs),
    )
    .spawn();

    let app_state = AppState {
        store,
        fabric,
        registry,
        events: events_tx,
        config: Arc::new(config.clone()),
    };

    // -----------------------------------------------------------------------
    // 5. Run the HTTP/WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                reconciler.stop().await;
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    // Let the reconciler finish its in-flight event before exiting.
    reconciler.stop().await;

    Ok(())
}
