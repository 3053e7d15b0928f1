//! # courier-fabric
//!
//! The publish/subscribe fabric connecting gateway processes.
//!
//! Every chat has one named channel (`chat:{chat_id}`). Any process may
//! publish on any channel; every subscriber of that channel receives the
//! payload. Payloads are opaque strings (the server publishes frames it
//! has already serialized), so the fabric never parses message bodies.
//!
//! The fabric is consumed through the [`Fabric`] / [`FabricSubscriber`]
//! trait pair so the in-process [`LocalFabric`] and a broker-backed
//! implementation are interchangeable. A subscriber multiplexes any
//! number of channels into a single `next()` stream: one connected user
//! costs one subscription handle and one listener task no matter how many
//! chats they are in.

pub mod local;

pub use local::{LocalFabric, LocalSubscriber};

use async_trait::async_trait;
use thiserror::Error;

/// Errors produced by a fabric backend.
#[derive(Error, Debug)]
pub enum FabricError {
    /// The backend rejected or lost the operation.
    #[error("Fabric backend error: {0}")]
    Backend(String),

    /// The subscription handle is no longer connected to the fabric.
    #[error("Fabric subscription closed")]
    SubscriptionClosed,
}

/// One payload received from a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FabricMessage {
    /// Channel the payload was published on.
    pub channel: String,
    /// Opaque payload exactly as published.
    pub payload: String,
}

/// Publish side of the fabric. Cheap to clone behind an `Arc`; one handle
/// per process is shared by every gateway task and the reconciler.
#[async_trait]
pub trait Fabric: Send + Sync {
    /// Publish a payload on a channel.
    ///
    /// Publishing to a channel nobody subscribes to succeeds and delivers
    /// nothing; the fabric is a live broadcast, not a queue.
    async fn publish(&self, channel: &str, payload: String) -> Result<(), FabricError>;

    /// Open a new subscription handle with an empty channel set.
    async fn subscriber(&self) -> Result<Box<dyn FabricSubscriber>, FabricError>;
}

/// Receive side of the fabric. Owned by exactly one task; channel
/// membership is mutated between `next()` calls.
#[async_trait]
pub trait FabricSubscriber: Send {
    /// Add a channel to this subscription. Idempotent.
    async fn subscribe(&mut self, channel: &str) -> Result<(), FabricError>;

    /// Remove a channel from this subscription. Unknown channels are a
    /// no-op.
    async fn unsubscribe(&mut self, channel: &str) -> Result<(), FabricError>;

    /// Wait for the next message on any subscribed channel.
    ///
    /// Pends indefinitely while the channel set is empty (the caller's
    /// select! loop stays responsive to control messages), and is safe to
    /// cancel and re-create without losing buffered messages. Returns
    /// `None` only when the fabric itself has shut down.
    async fn next(&mut self) -> Option<FabricMessage>;

    /// Number of channels currently subscribed.
    fn channel_count(&self) -> usize;
}
