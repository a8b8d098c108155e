//! Registry map and relay routing

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

use super::key::StreamKey;
use super::record::{RecordSnapshot, StreamRecord};
use super::relay::{RelayFrame, StreamRelay};
use crate::error::Error;
use crate::hls::LadderProfile;

/// Registry tuning knobs
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Broadcast channel depth per stream; a subscriber further behind
    /// than this lags and skips forward
    pub broadcast_capacity: usize,

    /// Maximum bytes of GOP kept per stream for late joiners
    pub max_gop_bytes: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 512,
            max_gop_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Process-wide map of publishing streams
pub struct StreamRegistry {
    streams: RwLock<HashMap<StreamKey, Arc<StreamRecord>>>,
    config: RegistryConfig,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Reserve the key and create a `Starting` record.
    ///
    /// A record in any active state occupies the key and the new publish
    /// is rejected (the existing publisher wins). A leftover terminal
    /// record (`Stopped`/`Failed`) is replaced; reconnect after a crash
    /// is a fresh publish.
    pub async fn register(
        &self,
        key: &StreamKey,
        remote_addr: SocketAddr,
        ladder: Vec<LadderProfile>,
        retention_hours: u32,
    ) -> Result<Arc<StreamRecord>, Error> {
        let mut streams = self.streams.write().await;

        if let Some(existing) = streams.get(key) {
            if existing.state().is_active() {
                return Err(Error::AlreadyPublishing(key.clone()));
            }
            tracing::debug!(stream = %key, state = %existing.state(), "Replacing terminal record");
        }

        let relay = StreamRelay::new(self.config.broadcast_capacity, self.config.max_gop_bytes);
        let record = Arc::new(StreamRecord::new(
            key.clone(),
            remote_addr,
            ladder,
            retention_hours,
            relay,
        ));
        streams.insert(key.clone(), Arc::clone(&record));

        tracing::info!(stream = %key, publisher = %remote_addr, "Stream registered");
        Ok(record)
    }

    /// Drop the record for a key.
    ///
    /// Only removes the exact record passed in: a supervisor finishing
    /// teardown after a rapid republish must not erase the new session.
    pub async fn remove(&self, key: &StreamKey, record: &Arc<StreamRecord>) {
        let mut streams = self.streams.write().await;
        if let Some(current) = streams.get(key) {
            if Arc::ptr_eq(current, record) {
                streams.remove(key);
                tracing::info!(stream = %key, "Stream removed from registry");
            }
        }
    }

    pub async fn get(&self, key: &StreamKey) -> Option<Arc<StreamRecord>> {
        self.streams.read().await.get(key).cloned()
    }

    pub async fn list(&self) -> Vec<Arc<StreamRecord>> {
        self.streams.read().await.values().cloned().collect()
    }

    pub async fn snapshots(&self) -> Vec<RecordSnapshot> {
        self.streams
            .read()
            .await
            .values()
            .map(|record| record.snapshot())
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.streams.read().await.len()
    }

    /// Fan a publisher frame out to the stream's subscribers
    pub async fn broadcast(&self, key: &StreamKey, frame: RelayFrame) {
        let record = {
            let streams = self.streams.read().await;
            streams.get(key).cloned()
        };

        if let Some(record) = record {
            let mut relay = record.relay.write().await;
            relay.publish(frame);
        }
    }

    /// Subscribe to a stream's relay.
    ///
    /// Returns the live receiver plus catchup frames (headers + GOP).
    /// Fails when the key has no active record.
    pub async fn subscribe(
        &self,
        key: &StreamKey,
    ) -> Result<(broadcast::Receiver<RelayFrame>, Vec<RelayFrame>), Error> {
        let record = self
            .get(key)
            .await
            .filter(|record| record.state().is_active())
            .ok_or_else(|| Error::NotFound(key.clone()))?;

        let relay = record.relay.read().await;
        let (rx, catchup) = relay.subscribe();
        let subscribers = record.add_subscriber();

        tracing::info!(
            stream = %key,
            subscribers,
            catchup_frames = catchup.len(),
            "Relay subscriber attached"
        );

        Ok((rx, catchup))
    }

    /// Detach a subscriber previously attached with [`Self::subscribe`]
    pub async fn unsubscribe(&self, key: &StreamKey) {
        if let Some(record) = self.get(key).await {
            let remaining = record.remove_subscriber();
            tracing::debug!(stream = %key, subscribers = remaining, "Relay subscriber detached");
        }
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hls::default_ladder;
    use crate::media::flv::FlvTag;
    use crate::registry::StreamState;
    use bytes::Bytes;

    fn key(raw: &str) -> StreamKey {
        StreamKey::parse(raw).unwrap()
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    async fn register(registry: &StreamRegistry, raw: &str) -> Arc<StreamRecord> {
        registry
            .register(&key(raw), addr(), default_ladder(), 24)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_rejects_active_duplicate() {
        let registry = StreamRegistry::new();

        let record = register(&registry, "stream1").await;
        assert_eq!(registry.count().await, 1);

        // Same key while Starting: rejected
        let result = registry
            .register(&key("stream1"), addr(), default_ladder(), 24)
            .await;
        assert!(matches!(result, Err(Error::AlreadyPublishing(_))));

        // Running keeps the key occupied too
        record.set_state(StreamState::Running);
        let result = registry
            .register(&key("stream1"), addr(), default_ladder(), 24)
            .await;
        assert!(matches!(result, Err(Error::AlreadyPublishing(_))));
    }

    #[tokio::test]
    async fn test_terminal_record_is_replaced() {
        let registry = StreamRegistry::new();

        let record = register(&registry, "stream1").await;
        record.set_state(StreamState::Failed);

        let replacement = registry
            .register(&key("stream1"), addr(), default_ladder(), 24)
            .await
            .unwrap();
        assert_eq!(replacement.state(), StreamState::Starting);
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_remove_only_drops_matching_record() {
        let registry = StreamRegistry::new();

        let first = register(&registry, "stream1").await;
        first.set_state(StreamState::Stopped);

        // Rapid republish replaces the record
        let second = register(&registry, "stream1").await;

        // Old supervisor finishing teardown must not erase the new session
        registry.remove(&key("stream1"), &first).await;
        assert_eq!(registry.count().await, 1);

        registry.remove(&key("stream1"), &second).await;
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_subscribe_requires_active_stream() {
        let registry = StreamRegistry::new();

        let result = registry.subscribe(&key("absent")).await;
        assert!(matches!(result, Err(Error::NotFound(_))));

        let record = register(&registry, "stream1").await;
        record.set_state(StreamState::Failed);
        let result = registry.subscribe(&key("stream1")).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscriber() {
        let registry = StreamRegistry::new();
        let record = register(&registry, "stream1").await;
        record.set_state(StreamState::Running);

        let (mut rx, catchup) = registry.subscribe(&key("stream1")).await.unwrap();
        assert!(catchup.is_empty());
        assert_eq!(record.subscriber_count(), 1);

        let tag = FlvTag::video(0, Bytes::from_static(&[0x17, 0x01, 0x00]));
        registry
            .broadcast(&key("stream1"), RelayFrame::from_tag(&tag))
            .await;

        let frame = rx.recv().await.unwrap();
        assert!(frame.is_keyframe);

        registry.unsubscribe(&key("stream1")).await;
        assert_eq!(record.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_snapshots() {
        let registry = StreamRegistry::new();
        register(&registry, "a").await;
        register(&registry, "b").await;

        let snaps = registry.snapshots().await;
        assert_eq!(snaps.len(), 2);
    }
}
