//! Publish controller
//!
//! Single entry point for publish/unpublish events from the RTMP front and
//! the administrative surface. Publish and unpublish for the same key are
//! serialized through a per-key mutex, so a fast publish → unpublish →
//! publish sequence resolves deterministically; distinct keys never wait
//! on each other.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;

use crate::config::Config;
use crate::error::Error;
use crate::registry::{StreamKey, StreamRecord, StreamRegistry, StreamState};
use crate::supervisor::{self, SupervisorContext, SupervisorHandle, SupervisorStatus};

/// Publish authorization hook, the engine's sole auth extension point.
///
/// The default allows everything; deployments plug in key databases or
/// token checks behind this.
pub trait PublishAuth: Send + Sync {
    fn allow(&self, key: &StreamKey, addr: SocketAddr) -> bool;
}

/// Default hook: every syntactically valid key may publish
pub struct AllowAll;

impl PublishAuth for AllowAll {
    fn allow(&self, _key: &StreamKey, _addr: SocketAddr) -> bool {
        true
    }
}

/// Publish/unpublish control plane
pub struct PublishController {
    config: Arc<Config>,
    registry: Arc<StreamRegistry>,
    supervisor_ctx: SupervisorContext,
    auth: Arc<dyn PublishAuth>,

    /// Per-key serialization of publish/unpublish
    key_mutexes: Mutex<HashMap<StreamKey, Arc<AsyncMutex<()>>>>,

    /// Handles to running supervisors; an entry for a key is replaced on
    /// the next successful publish of that key
    supervisors: Mutex<HashMap<StreamKey, SupervisorHandle>>,
}

impl PublishController {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<StreamRegistry>,
        supervisor_ctx: SupervisorContext,
        auth: Arc<dyn PublishAuth>,
    ) -> Self {
        Self {
            config,
            registry,
            supervisor_ctx,
            auth,
            key_mutexes: Mutex::new(HashMap::new()),
            supervisors: Mutex::new(HashMap::new()),
        }
    }

    /// Handle a validated publish: reserve the key, run the supervisor
    /// launch sequence, and return the new record.
    ///
    /// The record starts `Starting`; the supervisor flips it to `Running`
    /// once the child is alive and first artifacts exist, or to `Failed`
    /// when the startup grace window expires.
    pub async fn on_publish(
        &self,
        key: &StreamKey,
        addr: SocketAddr,
    ) -> Result<Arc<StreamRecord>, Error> {
        let key_mutex = self.key_mutex(key);
        let _serialized = key_mutex.lock().await;

        if !self.auth.allow(key, addr) {
            tracing::warn!(stream = %key, publisher = %addr, "Publish denied by auth hook");
            return Err(Error::PublishDenied(key.clone()));
        }

        let record = self
            .registry
            .register(
                key,
                addr,
                self.config.ladder.clone(),
                self.config.retention.hours,
            )
            .await?;

        let input_url = self.config.transcoder_input_url(key.as_str());
        match supervisor::launch(&self.supervisor_ctx, Arc::clone(&record), input_url).await {
            Ok(handle) => {
                self.supervisors
                    .lock()
                    .expect("supervisor map poisoned")
                    .insert(key.clone(), handle);
                Ok(record)
            }
            Err(e) => {
                // The reservation is ours; do not leave a Starting record
                // squatting on the key
                record.set_state(StreamState::Failed);
                self.registry.remove(key, &record).await;
                tracing::warn!(stream = %key, error = %e, "Publish failed during launch");
                Err(e)
            }
        }
    }

    /// Handle unpublish: drain, stop the supervisor, wait for teardown.
    ///
    /// Idempotent: a second unpublish for a key that is already gone (or
    /// already terminal) succeeds quietly.
    pub async fn on_unpublish(&self, key: &StreamKey) -> Result<(), Error> {
        let key_mutex = self.key_mutex(key);
        let _serialized = key_mutex.lock().await;

        let Some(record) = self.registry.get(key).await else {
            return Ok(());
        };
        if !record.state().is_active() {
            return Ok(());
        }

        record.set_state(StreamState::Draining);

        let handle = self
            .supervisors
            .lock()
            .expect("supervisor map poisoned")
            .remove(key);

        if let Some(handle) = handle {
            // Teardown budget: graceful stop plus margin for SIGKILL and
            // filesystem cleanup
            let budget = self.config.supervisor.stop_grace + Duration::from_secs(5);
            match tokio::time::timeout(budget, handle.stop()).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(stream = %key, "Supervisor was already gone on unpublish");
                }
                Err(_) => {
                    tracing::warn!(stream = %key, "Supervisor teardown exceeded its budget");
                }
            }
        } else {
            // No handle (launch failed mid-way, or another path cleaned
            // up); make sure the record does not linger
            record.set_state(StreamState::Stopped);
            self.registry.remove(key, &record).await;
        }

        Ok(())
    }

    /// Force a stop from the administrative surface.
    ///
    /// `NotFound` for keys without an active record.
    pub async fn force_stop(&self, key: &StreamKey) -> Result<(), Error> {
        match self.registry.get(key).await {
            Some(record) if record.state().is_active() => self.on_unpublish(key).await,
            _ => Err(Error::NotFound(key.clone())),
        }
    }

    /// Ask a stream's supervisor for its status
    pub async fn query(&self, key: &StreamKey) -> Option<SupervisorStatus> {
        let handle = self
            .supervisors
            .lock()
            .expect("supervisor map poisoned")
            .get(key)
            .cloned()?;
        handle.query().await
    }

    /// Change retention for a running stream
    pub async fn change_retention(&self, key: &StreamKey, hours: u32) -> bool {
        let handle = self
            .supervisors
            .lock()
            .expect("supervisor map poisoned")
            .get(key)
            .cloned();
        match handle {
            Some(handle) => handle.change_retention(hours).await,
            None => false,
        }
    }

    fn key_mutex(&self, key: &StreamKey) -> Arc<AsyncMutex<()>> {
        let mut map = self.key_mutexes.lock().expect("key mutex map poisoned");
        Arc::clone(map.entry(key.clone()).or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hls::{ArtifactStore, HlsHealthMonitor};
    use tokio_util::sync::CancellationToken;

    struct DenyAll;

    impl PublishAuth for DenyAll {
        fn allow(&self, _key: &StreamKey, _addr: SocketAddr) -> bool {
            false
        }
    }

    fn key(raw: &str) -> StreamKey {
        StreamKey::parse(raw).unwrap()
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn make_controller(auth: Arc<dyn PublishAuth>, tmp: &std::path::Path) -> PublishController {
        let config = Arc::new(
            Config::default()
                .hls_root(tmp.join("hls"))
                .retention_hours(0),
        );
        let mut supervisor_config = config.supervisor.clone();
        supervisor_config.lock_dir = tmp.join("locks");
        // A binary that cannot exist, so launch fails at the spawn step
        supervisor_config.ffmpeg_bin = tmp.join("no-such-ffmpeg").to_string_lossy().into_owned();

        let registry = Arc::new(StreamRegistry::new());
        let store = Arc::new(ArtifactStore::new(config.hls.root.clone()));
        let health = Arc::new(HlsHealthMonitor::new(
            config.hls.root.clone(),
            config.hls.freshness,
        ));

        let supervisor_ctx = SupervisorContext {
            config: supervisor_config,
            hls: config.hls.clone(),
            store,
            health,
            registry: Arc::clone(&registry),
            cancel: CancellationToken::new(),
        };

        PublishController::new(config, registry, supervisor_ctx, auth)
    }

    #[tokio::test]
    async fn test_denied_publish() {
        let tmp = tempfile::tempdir().unwrap();
        let controller = make_controller(Arc::new(DenyAll), tmp.path());

        let result = controller.on_publish(&key("stream1"), addr()).await;
        assert!(matches!(result, Err(Error::PublishDenied(_))));
    }

    #[tokio::test]
    async fn test_failed_launch_releases_key_and_lock() {
        let tmp = tempfile::tempdir().unwrap();
        let controller = make_controller(Arc::new(AllowAll), tmp.path());

        // Spawn fails (binary missing): ChildSpawnFailed
        let result = controller.on_publish(&key("stream1"), addr()).await;
        assert!(matches!(result, Err(Error::ChildSpawnFailed { .. })));

        // Key is free again: the same error, not AlreadyPublishing
        let result = controller.on_publish(&key("stream1"), addr()).await;
        assert!(matches!(result, Err(Error::ChildSpawnFailed { .. })));

        // And the lock file is gone
        assert!(!tmp.path().join("locks").join("stream1.lock").exists());
    }

    #[tokio::test]
    async fn test_unpublish_unknown_key_is_quiet() {
        let tmp = tempfile::tempdir().unwrap();
        let controller = make_controller(Arc::new(AllowAll), tmp.path());

        assert!(controller.on_unpublish(&key("absent")).await.is_ok());
    }

    #[tokio::test]
    async fn test_force_stop_unknown_key_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let controller = make_controller(Arc::new(AllowAll), tmp.path());

        let result = controller.force_stop(&key("absent")).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
