//! Shared application state handed to every handler and background task.

use std::sync::Arc;

use tokio::sync::mpsc;

use courier_fabric::Fabric;
use courier_shared::CompletionEvent;
use courier_store::StoreHandle;

use crate::config::ServerConfig;
use crate::registry::ConnectionRegistry;

/// Cloned into each request/connection. Everything inside is a cheap
/// handle; the underlying resources are process-wide singletons.
#[derive(Clone)]
pub struct AppState {
    pub store: StoreHandle,
    pub fabric: Arc<dyn Fabric>,
    pub registry: Arc<ConnectionRegistry>,
    /// Ingest side of the completion-event queue drained by the
    /// reconciler.
    pub events: mpsc::Sender<CompletionEvent>,
    pub config: Arc<ServerConfig>,
}
