//! Per-stream transcoder supervisor
//!
//! One supervisor task owns one stream's transcoder child from launch to
//! reap. The launch sequence runs inline in the publish path so every
//! failure (lock contention, orphan, artifact I/O, spawn) reports straight
//! back to the publisher; the supervise loop then runs in the background,
//! single-threaded over a bounded command channel plus a tick timer.
//!
//! ```text
//! launch:  lock → orphan probe → artifact prep → spawn (own pgroup)
//! loop:    tick → child alive? artifacts fresh? → Running/Stale/Failed
//! stop:    SIGTERM pgroup → grace → SIGKILL → sentinel + ENDLIST →
//!          release lock → erase record
//! ```
//!
//! There is no auto-restart: a dead child marks the stream `Failed` and
//! the supervisor exits. The broadcaster reconnecting is the recovery
//! signal, and that arrives as a fresh publish.

pub mod child;
pub mod lock;
pub mod orphan;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{HlsConfig, SupervisorConfig};
use crate::error::Error;
use crate::hls::{ArtifactStore, HealthReport, HlsHealthMonitor, StreamEnded};
use crate::registry::{StreamKey, StreamRecord, StreamRegistry, StreamState};

pub use child::{build_transcoder_args, HlsOutputOptions, TranscoderChild};
pub use lock::StreamLock;

/// Poll interval while waiting for first artifacts
const STARTUP_POLL: Duration = Duration::from_millis(500);

/// Command channel depth; the controller is the only sender
const COMMAND_BUFFER: usize = 8;

/// Commands a running supervisor accepts
#[derive(Debug)]
pub enum SupervisorCommand {
    /// Stop the child and tear down; `done` fires after teardown completes
    Stop { done: oneshot::Sender<()> },
    /// Report current status
    Query {
        reply: oneshot::Sender<SupervisorStatus>,
    },
    /// Change the retention applied when this stream ends
    RetentionChange(u32),
}

/// Point-in-time supervisor status
#[derive(Debug, Clone)]
pub struct SupervisorStatus {
    pub state: StreamState,
    pub child_pid: Option<u32>,
    pub last_health: Option<HealthReport>,
}

/// Handle to a supervisor task
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<SupervisorCommand>,
}

impl SupervisorHandle {
    /// Request stop and wait for teardown to finish.
    ///
    /// Returns false if the supervisor was already gone.
    pub async fn stop(&self) -> bool {
        let (done, done_rx) = oneshot::channel();
        if self
            .tx
            .send(SupervisorCommand::Stop { done })
            .await
            .is_err()
        {
            return false;
        }
        done_rx.await.is_ok()
    }

    pub async fn query(&self) -> Option<SupervisorStatus> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(SupervisorCommand::Query { reply })
            .await
            .ok()?;
        reply_rx.await.ok()
    }

    pub async fn change_retention(&self, hours: u32) -> bool {
        self.tx
            .send(SupervisorCommand::RetentionChange(hours))
            .await
            .is_ok()
    }
}

/// Shared dependencies every supervisor launch needs
#[derive(Clone)]
pub struct SupervisorContext {
    pub config: SupervisorConfig,
    pub hls: HlsConfig,
    pub store: Arc<ArtifactStore>,
    pub health: Arc<HlsHealthMonitor>,
    pub registry: Arc<StreamRegistry>,
    pub cancel: CancellationToken,
}

/// Run the launch sequence for a freshly registered stream and hand the
/// child to a background supervisor task.
///
/// Steps 1-4 (lock, orphan probe, artifact prep, spawn) happen inline so
/// the caller can reject the publish on failure; the lock is released on
/// every error path.
pub async fn launch(
    ctx: &SupervisorContext,
    record: Arc<StreamRecord>,
    input_url: String,
) -> Result<SupervisorHandle, Error> {
    let key = record.key().clone();

    // 1. Cross-process exclusion
    let stream_lock = StreamLock::acquire(&ctx.config.lock_dir, &key).await?;

    // 2. Orphan probe: a transcoder that outlived a dead supervisor still
    // owns the artifact tree and the ingest slot
    let stream_dir = ctx.store.stream_dir(&key);
    let needles = vec![
        input_url.clone(),
        stream_dir.to_string_lossy().into_owned(),
    ];
    if let Some(pid) = orphan::find_orphan(&ctx.config.ffmpeg_bin, &needles) {
        stream_lock.release();
        return Err(Error::BusyExternal { key, pid });
    }

    // 3. Fresh artifact tree + master playlist
    let prep = async {
        ctx.store.prepare(&key, record.ladder().len()).await?;
        ctx.store.write_master(&key, record.ladder()).await
    };
    if let Err(e) = prep.await {
        stream_lock.release();
        return Err(e);
    }

    // 4. Spawn the transcoder in its own process group
    let args = build_transcoder_args(
        &input_url,
        &stream_dir,
        record.ladder(),
        HlsOutputOptions {
            segment_seconds: ctx.hls.segment_seconds,
            playlist_segments: ctx.hls.playlist_segments,
        },
    );
    let transcoder = match TranscoderChild::spawn(&ctx.config.ffmpeg_bin, &args) {
        Ok(child) => child,
        Err(source) => {
            stream_lock.release();
            return Err(Error::ChildSpawnFailed { key, source });
        }
    };
    record.set_child_pid(Some(transcoder.pid()));

    tracing::info!(
        stream = %key,
        pid = transcoder.pid(),
        input = %input_url,
        rungs = record.ladder().len(),
        "Transcoder launched"
    );

    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
    let supervisor = StreamSupervisor {
        key,
        record,
        child: transcoder,
        stream_lock: Some(stream_lock),
        rx,
        config: ctx.config.clone(),
        store: Arc::clone(&ctx.store),
        health: Arc::clone(&ctx.health),
        registry: Arc::clone(&ctx.registry),
        cancel: ctx.cancel.clone(),
        last_health: None,
    };
    tokio::spawn(supervisor.run());

    Ok(SupervisorHandle { tx })
}

/// Why the supervise loop ended
#[derive(Debug)]
enum Terminal {
    /// Stop command; teardown acknowledged through the sender
    Stopped(Option<oneshot::Sender<()>>),
    /// Root cancellation (process shutdown)
    Shutdown,
    /// Fatal to this stream only
    Failed(String),
}

struct StreamSupervisor {
    key: StreamKey,
    record: Arc<StreamRecord>,
    child: TranscoderChild,
    stream_lock: Option<StreamLock>,
    rx: mpsc::Receiver<SupervisorCommand>,
    config: SupervisorConfig,
    store: Arc<ArtifactStore>,
    health: Arc<HlsHealthMonitor>,
    registry: Arc<StreamRegistry>,
    cancel: CancellationToken,
    last_health: Option<HealthReport>,
}

impl StreamSupervisor {
    async fn run(mut self) {
        let terminal = self.supervise().await;
        if let Some(done) = self.finalize(terminal).await {
            let _ = done.send(());
        }
    }

    async fn supervise(&mut self) -> Terminal {
        let rung_count = self.record.ladder().len();
        let startup_deadline = Instant::now() + self.config.startup_grace;
        let mut ticker = tokio::time::interval(STARTUP_POLL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(SupervisorCommand::Stop { done }) => {
                        return Terminal::Stopped(Some(done));
                    }
                    Some(SupervisorCommand::Query { reply }) => {
                        let _ = reply.send(self.status());
                    }
                    Some(SupervisorCommand::RetentionChange(hours)) => {
                        self.record.set_retention_hours(hours);
                        tracing::info!(stream = %self.key, hours, "Retention changed");
                    }
                    None => {
                        tracing::warn!(stream = %self.key, "Supervisor handle dropped, stopping");
                        return Terminal::Stopped(None);
                    }
                },

                _ = self.cancel.cancelled() => {
                    tracing::info!(stream = %self.key, "Shutdown requested");
                    return Terminal::Shutdown;
                }

                _ = ticker.tick() => {
                    if let Some(status) = self.child.try_wait() {
                        let stderr = self.child.stderr_tail();
                        let detail = if stderr.is_empty() {
                            format!("{status}")
                        } else {
                            format!("{status}; stderr tail: {stderr}")
                        };
                        return Terminal::Failed(detail);
                    }

                    let report = self.health.scan(&self.key, rung_count).await;

                    match self.record.state() {
                        StreamState::Starting => {
                            if report.all_rungs_present(rung_count) {
                                if self.record.transition(StreamState::Starting, StreamState::Running) {
                                    tracing::info!(
                                        stream = %self.key,
                                        rungs = rung_count,
                                        "First artifacts present, stream running"
                                    );
                                }
                                // Startup settled; fall back to the slow tick
                                ticker = tokio::time::interval(self.config.tick);
                                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                            } else if Instant::now() >= startup_deadline {
                                self.child.terminate(Duration::ZERO).await;
                                return Terminal::Failed(format!(
                                    "no artifacts within the {:?} startup grace window",
                                    self.config.startup_grace
                                ));
                            }
                        }
                        StreamState::Running => {
                            if !report.active {
                                self.record.set_state(StreamState::Stale);
                                tracing::warn!(
                                    stream = %self.key,
                                    age_secs = report.last_segment_age.map(|a| a.as_secs()),
                                    "Artifacts stale; child alive, not killing"
                                );
                            }
                        }
                        StreamState::Stale => {
                            if report.active {
                                self.record.set_state(StreamState::Running);
                                tracing::info!(stream = %self.key, "Artifacts fresh again");
                            }
                        }
                        // Draining/terminal arrive via commands, not ticks
                        _ => {}
                    }

                    self.last_health = Some(report);
                }
            }
        }
    }

    fn status(&self) -> SupervisorStatus {
        SupervisorStatus {
            state: self.record.state(),
            child_pid: self.record.child_pid(),
            last_health: self.last_health.clone(),
        }
    }

    /// Teardown: reap the child, release the lock, leave the sentinel and
    /// ended master behind, apply immediate retention, erase the record.
    async fn finalize(&mut self, terminal: Terminal) -> Option<oneshot::Sender<()>> {
        let (graceful, done) = match terminal {
            Terminal::Stopped(done) => (true, done),
            Terminal::Shutdown => (true, None),
            Terminal::Failed(reason) => {
                tracing::error!(stream = %self.key, reason = %reason, "Stream failed");
                (false, None)
            }
        };

        let grace = if graceful {
            self.config.stop_grace
        } else {
            Duration::ZERO
        };
        self.child.terminate(grace).await;
        self.record.set_child_pid(None);

        self.record.set_state(if graceful {
            StreamState::Stopped
        } else {
            StreamState::Failed
        });

        if let Some(stream_lock) = self.stream_lock.take() {
            stream_lock.release();
        }

        let retention_hours = self.record.retention_hours();
        let sentinel = StreamEnded {
            key: self.key.to_string(),
            ended_at: Utc::now(),
            remote_addr: self.record.remote_addr().to_string(),
            retention_hours,
        };
        if let Err(e) = self.store.write_sentinel(&self.key, &sentinel).await {
            tracing::warn!(stream = %self.key, error = %e, "Failed to write sentinel");
        }
        if let Err(e) = self.store.write_ended_master(&self.key).await {
            tracing::warn!(stream = %self.key, error = %e, "Failed to write ended master");
        }

        if retention_hours == 0 {
            if let Err(e) = self.store.remove_stream_dir(&self.key).await {
                tracing::warn!(stream = %self.key, error = %e, "Immediate retention delete failed");
            }
        }

        self.registry.remove(&self.key, &self.record).await;
        tracing::info!(stream = %self.key, graceful, "Supervisor finished");

        done
    }
}
