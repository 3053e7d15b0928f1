//! In-process fabric backed by tokio broadcast channels.
//!
//! One `broadcast::Sender` per channel name, created lazily on first
//! subscribe and shared through a map guarded by an async mutex. The
//! subscriber side wraps each receiver in a [`BroadcastStream`] and
//! multiplexes them with a [`StreamMap`], so a single `next()` drains all
//! subscribed channels in arrival order.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{StreamExt, StreamMap};

use crate::{Fabric, FabricError, FabricMessage, FabricSubscriber};

/// Buffered messages per channel before slow subscribers start lagging.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

type SharedChannels = Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>;

/// Process-local [`Fabric`] implementation.
///
/// Suitable for a single-process deployment and for tests; a multi-process
/// fleet replaces it with a broker-backed implementation of the same
/// traits.
#[derive(Clone)]
pub struct LocalFabric {
    channels: SharedChannels,
    capacity: usize,
}

impl LocalFabric {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity,
        }
    }
}

impl Default for LocalFabric {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

#[async_trait]
impl Fabric for LocalFabric {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), FabricError> {
        let sender = {
            let channels = self.channels.lock().await;
            channels.get(channel).cloned()
        };

        match sender {
            Some(tx) => {
                // A send error only means every receiver is gone; the
                // broadcast is still a success with nobody listening.
                let _ = tx.send(payload);
            }
            None => {
                tracing::trace!(channel, "publish on channel with no subscribers");
            }
        }
        Ok(())
    }

    async fn subscriber(&self) -> Result<Box<dyn FabricSubscriber>, FabricError> {
        Ok(Box::new(LocalSubscriber {
            channels: Arc::clone(&self.channels),
            capacity: self.capacity,
            streams: StreamMap::new(),
        }))
    }
}

/// Subscription handle over the local fabric.
pub struct LocalSubscriber {
    channels: SharedChannels,
    capacity: usize,
    streams: StreamMap<String, BroadcastStream<String>>,
}

#[async_trait]
impl FabricSubscriber for LocalSubscriber {
    async fn subscribe(&mut self, channel: &str) -> Result<(), FabricError> {
        if self.streams.contains_key(channel) {
            return Ok(());
        }

        let rx = {
            let mut channels = self.channels.lock().await;
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe()
        };

        self.streams
            .insert(channel.to_string(), BroadcastStream::new(rx));
        Ok(())
    }

    async fn unsubscribe(&mut self, channel: &str) -> Result<(), FabricError> {
        // Dropping the receiver detaches it from the broadcast channel.
        self.streams.remove(channel);
        Ok(())
    }

    async fn next(&mut self) -> Option<FabricMessage> {
        loop {
            // An empty StreamMap reports exhaustion immediately; hold the
            // task here instead so the caller's select! loop can deliver
            // the subscribe that makes this stream live again.
            if self.streams.is_empty() {
                std::future::pending::<()>().await;
            }

            match self.streams.next().await {
                Some((channel, Ok(payload))) => {
                    return Some(FabricMessage { channel, payload });
                }
                Some((channel, Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    tracing::warn!(
                        channel = %channel,
                        skipped,
                        "subscriber lagged, missed fabric messages were dropped"
                    );
                }
                // A constituent stream closed; others may still be live.
                None => {}
            }
        }
    }

    fn channel_count(&self) -> usize {
        self.streams.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn recv(sub: &mut Box<dyn FabricSubscriber>) -> FabricMessage {
        timeout(Duration::from_millis(500), sub.next())
            .await
            .expect("timed out waiting for fabric message")
            .expect("fabric closed")
    }

    #[tokio::test]
    async fn per_channel_order_is_preserved() {
        let fabric = LocalFabric::default();
        let mut sub = fabric.subscriber().await.unwrap();
        sub.subscribe("chat:a").await.unwrap();

        for i in 1..=3 {
            fabric.publish("chat:a", format!("m{i}")).await.unwrap();
        }

        assert_eq!(recv(&mut sub).await.payload, "m1");
        assert_eq!(recv(&mut sub).await.payload, "m2");
        assert_eq!(recv(&mut sub).await.payload, "m3");
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let fabric = LocalFabric::default();

        let mut sub_a = fabric.subscriber().await.unwrap();
        sub_a.subscribe("chat:a").await.unwrap();
        let mut sub_b = fabric.subscriber().await.unwrap();
        sub_b.subscribe("chat:b").await.unwrap();

        fabric.publish("chat:b", "for b".into()).await.unwrap();
        fabric.publish("chat:a", "for a".into()).await.unwrap();

        // Each subscriber sees only its own channel's traffic.
        let got_a = recv(&mut sub_a).await;
        assert_eq!(got_a.channel, "chat:a");
        assert_eq!(got_a.payload, "for a");

        let got_b = recv(&mut sub_b).await;
        assert_eq!(got_b.channel, "chat:b");
        assert_eq!(got_b.payload, "for b");
    }

    #[tokio::test]
    async fn one_subscriber_multiplexes_many_channels() {
        let fabric = LocalFabric::default();
        let mut sub = fabric.subscriber().await.unwrap();
        sub.subscribe("chat:a").await.unwrap();
        sub.subscribe("chat:b").await.unwrap();
        assert_eq!(sub.channel_count(), 2);

        fabric.publish("chat:a", "ma".into()).await.unwrap();
        fabric.publish("chat:b", "mb".into()).await.unwrap();

        let mut got = vec![recv(&mut sub).await, recv(&mut sub).await];
        got.sort_by(|x, y| x.channel.cmp(&y.channel));
        assert_eq!(got[0].channel, "chat:a");
        assert_eq!(got[0].payload, "ma");
        assert_eq!(got[1].channel, "chat:b");
        assert_eq!(got[1].payload, "mb");
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery_without_teardown() {
        let fabric = LocalFabric::default();
        let mut sub = fabric.subscriber().await.unwrap();
        sub.subscribe("chat:a").await.unwrap();

        fabric.publish("chat:a", "before".into()).await.unwrap();
        assert_eq!(recv(&mut sub).await.payload, "before");

        sub.unsubscribe("chat:a").await.unwrap();
        assert_eq!(sub.channel_count(), 0);
        fabric.publish("chat:a", "missed".into()).await.unwrap();

        sub.subscribe("chat:b").await.unwrap();
        fabric.publish("chat:b", "after".into()).await.unwrap();

        // The unsubscribed channel's message never surfaces.
        assert_eq!(recv(&mut sub).await.payload, "after");
    }

    #[tokio::test]
    async fn every_subscriber_of_a_channel_receives_the_publish() {
        let fabric = LocalFabric::default();
        let mut first = fabric.subscriber().await.unwrap();
        first.subscribe("chat:a").await.unwrap();
        let mut second = fabric.subscriber().await.unwrap();
        second.subscribe("chat:a").await.unwrap();

        fabric.publish("chat:a", "hello".into()).await.unwrap();

        assert_eq!(recv(&mut first).await.payload, "hello");
        assert_eq!(recv(&mut second).await.payload, "hello");
    }

    #[tokio::test]
    async fn subscriber_with_no_channels_pends() {
        let fabric = LocalFabric::default();
        let mut sub = fabric.subscriber().await.unwrap();

        let waited = timeout(Duration::from_millis(50), sub.next()).await;
        assert!(waited.is_err(), "empty subscriber must not resolve");
    }

    #[tokio::test]
    async fn messages_published_before_subscribing_are_not_delivered() {
        let fabric = LocalFabric::default();
        fabric.publish("chat:a", "too early".into()).await.unwrap();

        let mut sub = fabric.subscriber().await.unwrap();
        sub.subscribe("chat:a").await.unwrap();
        fabric.publish("chat:a", "on time".into()).await.unwrap();

        assert_eq!(recv(&mut sub).await.payload, "on time");
    }

    #[tokio::test]
    async fn lagged_subscriber_skips_to_the_oldest_retained_message() {
        let fabric = LocalFabric::new(2);
        let mut sub = fabric.subscriber().await.unwrap();
        sub.subscribe("chat:a").await.unwrap();

        for i in 1..=5 {
            fabric.publish("chat:a", format!("m{i}")).await.unwrap();
        }

        // m1..m3 were overwritten in the ring; delivery resumes at m4.
        assert_eq!(recv(&mut sub).await.payload, "m4");
        assert_eq!(recv(&mut sub).await.payload, "m5");
    }
}
