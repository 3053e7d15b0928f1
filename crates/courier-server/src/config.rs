//! Server configuration loaded from environment variables.
//!
//! All settings have defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP/WebSocket (axum) server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Filesystem path of the SQLite database.
    /// Env: `DATABASE_PATH`
    /// Default: `./data/courier.db`
    pub database_path: PathBuf,

    /// Blob-store bucket recorded on attachment messages.
    /// Env: `BLOB_BUCKET`
    /// Default: `chat-media`
    pub blob_bucket: String,

    /// Base URL joined with a blob key to form an upload target. A real
    /// deployment points this at the presigning collaborator.
    /// Env: `UPLOAD_BASE_URL`
    /// Default: `http://localhost:9000/chat-media`
    pub upload_base_url: String,

    /// Buffered messages per fabric channel before slow subscribers lag.
    /// Env: `FABRIC_CAPACITY`
    /// Default: `256`
    pub fabric_capacity: usize,

    /// Outbound frame queue length per connection.
    /// Env: `OUTBOUND_BUFFER`
    /// Default: `64`
    pub outbound_buffer: usize,

    /// Completion events buffered between the ingest endpoint and the
    /// reconciler.
    /// Env: `EVENT_QUEUE_CAPACITY`
    /// Default: `1024`
    pub event_queue_capacity: usize,

    /// Seconds the reconciler waits before reconnecting a failed event
    /// stream.
    /// Env: `RECONCILER_BACKOFF_SECS`
    /// Default: `5`
    pub reconciler_backoff_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            database_path: PathBuf::from("./data/courier.db"),
            blob_bucket: "chat-media".to_string(),
            upload_base_url: "http://localhost:9000/chat-media".to_string(),
            fabric_capacity: 256,
            outbound_buffer: 64,
            event_queue_capacity: 1024,
            reconciler_backoff_secs: 5,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults on missing or invalid values.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Ok(path) = std::env::var("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Ok(bucket) = std::env::var("BLOB_BUCKET") {
            if !bucket.is_empty() {
                config.blob_bucket = bucket;
            }
        }

        if let Ok(url) = std::env::var("UPLOAD_BASE_URL") {
            if !url.is_empty() {
                config.upload_base_url = url;
            }
        }

        if let Ok(val) = std::env::var("FABRIC_CAPACITY") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.fabric_capacity = n,
                _ => tracing::warn!(value = %val, "Invalid FABRIC_CAPACITY, using default"),
            }
        }

        if let Ok(val) = std::env::var("OUTBOUND_BUFFER") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.outbound_buffer = n,
                _ => tracing::warn!(value = %val, "Invalid OUTBOUND_BUFFER, using default"),
            }
        }

        if let Ok(val) = std::env::var("EVENT_QUEUE_CAPACITY") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.event_queue_capacity = n,
                _ => tracing::warn!(value = %val, "Invalid EVENT_QUEUE_CAPACITY, using default"),
            }
        }

        if let Ok(val) = std::env::var("RECONCILER_BACKOFF_SECS") {
            match val.parse::<u64>() {
                Ok(n) => config.reconciler_backoff_secs = n,
                Err(_) => {
                    tracing::warn!(value = %val, "Invalid RECONCILER_BACKOFF_SECS, using default")
                }
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so it is not stored here.

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_usable() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.blob_bucket, "chat-media");
        assert!(config.fabric_capacity > 0);
        assert!(config.outbound_buffer > 0);
    }
}
