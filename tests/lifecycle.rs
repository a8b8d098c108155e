//! Stream lifecycle integration tests
//!
//! Exercise the supervisor against real processes (a stand-in transcoder
//! script), real lock files, and a real artifact tree in a tempdir; plus
//! the RTMP ingest over a real TCP socket with an in-process publisher.

#![cfg(unix)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use streamforge::config::Config;
use streamforge::controller::{AllowAll, PublishController};
use streamforge::hls::{default_ladder, ArtifactStore, HlsHealthMonitor, LadderProfile};
use streamforge::ingest::IngestServer;
use streamforge::protocol::chunk::{ChunkDecoder, ChunkEncoder, RawMessage};
use streamforge::protocol::constants::MSG_COMMAND_AMF0;
use streamforge::protocol::handshake::{Handshake, HandshakeRole};
use streamforge::protocol::message::{Command, RtmpMessage};
use streamforge::registry::{StreamKey, StreamRegistry, StreamState};
use streamforge::supervisor::{self, SupervisorContext};
use streamforge::{amf, Error};

/// A stand-in transcoder: a shell script the supervisor spawns instead of
/// ffmpeg
fn write_fake_transcoder(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-transcoder");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

struct TestEngine {
    config: Arc<Config>,
    registry: Arc<StreamRegistry>,
    store: Arc<ArtifactStore>,
    supervisor_ctx: SupervisorContext,
    controller: Arc<PublishController>,
    cancel: CancellationToken,
    _tmp: tempfile::TempDir,
}

fn two_rung_ladder() -> Vec<LadderProfile> {
    default_ladder().into_iter().skip(2).collect()
}

fn make_engine(transcoder_body: &str, retention_hours: u32, startup_grace: Duration) -> TestEngine {
    let tmp = tempfile::tempdir().unwrap();
    let script = write_fake_transcoder(tmp.path(), transcoder_body);

    let mut config = Config::default()
        .hls_root(tmp.path().join("hls"))
        .retention_hours(retention_hours)
        .ladder(two_rung_ladder());
    config.supervisor.lock_dir = tmp.path().join("locks");
    config.supervisor.ffmpeg_bin = script.to_string_lossy().into_owned();
    config.supervisor.startup_grace = startup_grace;
    config.supervisor.stop_grace = Duration::from_secs(1);
    let config = Arc::new(config);

    let registry = Arc::new(StreamRegistry::new());
    let store = Arc::new(ArtifactStore::new(config.hls.root.clone()));
    let health = Arc::new(HlsHealthMonitor::new(
        config.hls.root.clone(),
        config.hls.freshness,
    ));
    let cancel = CancellationToken::new();

    let supervisor_ctx = SupervisorContext {
        config: config.supervisor.clone(),
        hls: config.hls.clone(),
        store: Arc::clone(&store),
        health: Arc::clone(&health),
        registry: Arc::clone(&registry),
        cancel: cancel.clone(),
    };
    let controller = Arc::new(PublishController::new(
        Arc::clone(&config),
        Arc::clone(&registry),
        supervisor_ctx.clone(),
        Arc::new(AllowAll),
    ));

    TestEngine {
        config,
        registry,
        store,
        supervisor_ctx,
        controller,
        cancel,
        _tmp: tmp,
    }
}

fn key(raw: &str) -> StreamKey {
    StreamKey::parse(raw).unwrap()
}

fn publisher_addr() -> SocketAddr {
    "127.0.0.1:54321".parse().unwrap()
}

async fn write_segments(store: &ArtifactStore, k: &StreamKey, rungs: usize) {
    for rung in 0..rungs {
        let dir = store.rung_dir(k, rung);
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("segment_000.ts"), b"ts-data").await.unwrap();
        tokio::fs::write(dir.join("playlist.m3u8"), b"#EXTM3U\n").await.unwrap();
    }
}

/// Poll until the condition holds or the deadline passes
async fn wait_until<F, Fut>(what: &str, deadline: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let end = tokio::time::Instant::now() + deadline;
    loop {
        if condition().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < end,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn test_full_lifecycle_to_running_and_stopped() {
    let engine = make_engine("exec sleep 30", 24, Duration::from_secs(10));
    let k = key("lifecycle1");

    let record = engine
        .registry
        .register(&k, publisher_addr(), engine.config.ladder.clone(), 24)
        .await
        .unwrap();
    let handle = supervisor::launch(
        &engine.supervisor_ctx,
        Arc::clone(&record),
        engine.config.transcoder_input_url(k.as_str()),
    )
    .await
    .unwrap();

    // Launch prepared the tree, wrote the master, took the lock, spawned
    assert_eq!(record.state(), StreamState::Starting);
    assert!(record.child_pid().is_some());
    assert!(engine.config.supervisor.lock_dir.join("lifecycle1.lock").exists());
    let master = tokio::fs::read_to_string(engine.store.master_playlist_path(&k))
        .await
        .unwrap();
    assert!(master.contains("#EXT-X-STREAM-INF"));
    assert!(master.contains("1/playlist.m3u8"));

    // First artifacts appear: the supervisor flips the stream to Running
    write_segments(&engine.store, &k, 2).await;
    let r = Arc::clone(&record);
    wait_until("stream running", Duration::from_secs(5), move || {
        let r = Arc::clone(&r);
        async move { r.state() == StreamState::Running }
    })
    .await;

    // The command channel answers queries and retention changes
    let status = handle.query().await.unwrap();
    assert_eq!(status.state, StreamState::Running);
    assert_eq!(status.child_pid, record.child_pid());
    assert!(handle.change_retention(2).await);
    let r = Arc::clone(&record);
    wait_until("retention changed", Duration::from_secs(2), move || {
        let r = Arc::clone(&r);
        async move { r.retention_hours() == 2 }
    })
    .await;

    // Drain: child terminated, sentinel + ended master written, lock
    // released, record erased
    record.set_state(StreamState::Draining);
    assert!(handle.stop().await);

    assert_eq!(record.state(), StreamState::Stopped);
    assert_eq!(engine.registry.count().await, 0);
    assert!(engine.store.sentinel_path(&k).exists());
    let master = tokio::fs::read_to_string(engine.store.master_playlist_path(&k))
        .await
        .unwrap();
    assert!(master.contains("#EXT-X-ENDLIST"));
    assert!(!engine.config.supervisor.lock_dir.join("lifecycle1.lock").exists());
}

#[tokio::test]
async fn test_child_death_marks_failed_and_cleans_up() {
    let engine = make_engine("exit 3", 24, Duration::from_secs(10));
    let k = key("dies1");

    let record = engine
        .registry
        .register(&k, publisher_addr(), engine.config.ladder.clone(), 24)
        .await
        .unwrap();
    let _handle = supervisor::launch(
        &engine.supervisor_ctx,
        Arc::clone(&record),
        engine.config.transcoder_input_url(k.as_str()),
    )
    .await
    .unwrap();

    // No restart: the supervisor reaps, marks Failed, and bows out
    let registry = Arc::clone(&engine.registry);
    wait_until("record erased", Duration::from_secs(5), move || {
        let registry = Arc::clone(&registry);
        async move { registry.count().await == 0 }
    })
    .await;

    assert_eq!(record.state(), StreamState::Failed);
    assert!(record.child_pid().is_none());
    assert!(engine.store.sentinel_path(&k).exists());
    assert!(!engine.config.supervisor.lock_dir.join("dies1.lock").exists());
}

#[tokio::test]
async fn test_startup_timeout_kills_child() {
    let engine = make_engine("exec sleep 30", 24, Duration::from_secs(1));
    let k = key("slowstart1");

    let record = engine
        .registry
        .register(&k, publisher_addr(), engine.config.ladder.clone(), 24)
        .await
        .unwrap();
    let _handle = supervisor::launch(
        &engine.supervisor_ctx,
        Arc::clone(&record),
        engine.config.transcoder_input_url(k.as_str()),
    )
    .await
    .unwrap();
    let pid = record.child_pid().unwrap();

    // No artifacts ever appear; the grace window expires
    let registry = Arc::clone(&engine.registry);
    wait_until("startup timeout", Duration::from_secs(6), move || {
        let registry = Arc::clone(&registry);
        async move { registry.count().await == 0 }
    })
    .await;

    assert_eq!(record.state(), StreamState::Failed);
    assert!(!streamforge::supervisor::lock::pid_alive(pid));
    assert!(!engine.config.supervisor.lock_dir.join("slowstart1.lock").exists());
}

#[tokio::test]
async fn test_second_supervisor_is_locked_out() {
    let engine = make_engine("exec sleep 30", 24, Duration::from_secs(10));
    let k = key("locked1");

    let record = engine
        .registry
        .register(&k, publisher_addr(), engine.config.ladder.clone(), 24)
        .await
        .unwrap();
    let handle = supervisor::launch(
        &engine.supervisor_ctx,
        Arc::clone(&record),
        engine.config.transcoder_input_url(k.as_str()),
    )
    .await
    .unwrap();

    // A second supervisor instance (its own registry, same lock dir)
    let other_registry = Arc::new(StreamRegistry::new());
    let mut other_ctx = engine.supervisor_ctx.clone();
    other_ctx.registry = Arc::clone(&other_registry);

    let other_record = other_registry
        .register(&k, publisher_addr(), engine.config.ladder.clone(), 24)
        .await
        .unwrap();
    let result = supervisor::launch(
        &other_ctx,
        other_record,
        engine.config.transcoder_input_url(k.as_str()),
    )
    .await;
    assert!(matches!(result, Err(Error::LockContended(_))));

    // The original owner is still recorded in the lock file
    let lock_contents = std::fs::read_to_string(
        engine.config.supervisor.lock_dir.join("locked1.lock"),
    )
    .unwrap();
    assert!(lock_contents.starts_with(&std::process::id().to_string()));

    record.set_state(StreamState::Draining);
    handle.stop().await;
}

#[tokio::test]
async fn test_retention_zero_deletes_everything_on_stop() {
    let engine = make_engine("exec sleep 30", 0, Duration::from_secs(10));
    let k = key("ephemeral1");

    let record = engine
        .registry
        .register(&k, publisher_addr(), engine.config.ladder.clone(), 0)
        .await
        .unwrap();
    let handle = supervisor::launch(
        &engine.supervisor_ctx,
        Arc::clone(&record),
        engine.config.transcoder_input_url(k.as_str()),
    )
    .await
    .unwrap();

    write_segments(&engine.store, &k, 2).await;
    record.set_state(StreamState::Draining);
    assert!(handle.stop().await);

    // retention.hours = 0: nothing is left under the stream directory
    assert!(!engine.store.stream_dir(&k).exists());
    assert_eq!(engine.registry.count().await, 0);
}

// ---------------------------------------------------------------------------
// RTMP wire tests: an in-process publisher against a live ingest socket
// ---------------------------------------------------------------------------

/// Minimal RTMP publisher-side client for driving the ingest
struct TestPublisher {
    socket: TcpStream,
    decoder: ChunkDecoder,
    encoder: ChunkEncoder,
    buf: BytesMut,
}

impl TestPublisher {
    async fn connect(addr: SocketAddr) -> Self {
        let mut socket = TcpStream::connect(addr).await.unwrap();
        let mut handshake = Handshake::new(HandshakeRole::Client);
        let mut buf = BytesMut::new();

        socket
            .write_all(&handshake.initial_bytes().unwrap())
            .await
            .unwrap();
        while !handshake.is_done() {
            if let Some(reply) = handshake.drive(&mut buf).unwrap() {
                socket.write_all(&reply).await.unwrap();
            }
            if handshake.is_done() {
                break;
            }
            let n = socket.read_buf(&mut buf).await.unwrap();
            assert!(n > 0, "server closed during handshake");
        }

        Self {
            socket,
            decoder: ChunkDecoder::new(),
            encoder: ChunkEncoder::new(),
            buf,
        }
    }

    async fn send_command(&mut self, stream_id: u32, command: Command) {
        let raw = RawMessage {
            type_id: MSG_COMMAND_AMF0,
            timestamp: 0,
            stream_id,
            payload: command.encode(),
        };
        let wire = self.encoder.encode(3, &raw);
        self.socket.write_all(&wire).await.unwrap();
    }

    /// Read messages until the next command arrives
    async fn recv_command(&mut self) -> Command {
        loop {
            while let Some(raw) = self.decoder.decode(&mut self.buf).unwrap() {
                if let RtmpMessage::Command { payload, .. } = RtmpMessage::from_raw(raw).unwrap() {
                    return Command::parse(&payload).unwrap();
                }
            }
            let n = tokio::time::timeout(
                Duration::from_secs(5),
                self.socket.read_buf(&mut self.buf),
            )
            .await
            .expect("timed out waiting for a command")
            .unwrap();
            assert!(n > 0, "server closed while waiting for a command");
        }
    }

    async fn connect_app(&mut self, app: &str) {
        let command = Command::new(
            "connect",
            1.0,
            amf::object([
                ("app", amf::AmfValue::from(app)),
                ("flashVer", amf::AmfValue::from("FMLE/3.0")),
                (
                    "tcUrl",
                    amf::AmfValue::from(format!("rtmp://127.0.0.1/{app}")),
                ),
            ]),
        );
        self.send_command(0, command).await;

        let result = self.recv_command().await;
        assert_eq!(result.name, "_result");
        assert_eq!(
            result.args[0].get_str("code"),
            Some("NetConnection.Connect.Success")
        );
    }

    async fn create_stream(&mut self) -> u32 {
        self.send_command(0, Command::new("createStream", 2.0, amf::AmfValue::Null))
            .await;
        let result = self.recv_command().await;
        assert_eq!(result.name, "_result");
        result.args[0].as_number().unwrap() as u32
    }

    async fn publish(&mut self, stream_id: u32, stream_key: &str) -> Command {
        let command = Command::new("publish", 3.0, amf::AmfValue::Null).with_args(vec![
            amf::AmfValue::from(stream_key),
            amf::AmfValue::from("live"),
        ]);
        self.send_command(stream_id, command).await;
        self.recv_command().await
    }
}

async fn start_ingest(engine: &TestEngine) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = IngestServer::new(
        engine.config.rtmp.clone(),
        Arc::clone(&engine.controller),
        Arc::clone(&engine.registry),
    );
    let cancel = engine.cancel.clone();
    tokio::spawn(async move {
        let _ = server.run_on(listener, cancel).await;
    });

    addr
}

#[tokio::test]
async fn test_rtmp_publish_happy_path() {
    let engine = make_engine("exec sleep 30", 24, Duration::from_secs(10));
    let addr = start_ingest(&engine).await;

    let mut publisher = TestPublisher::connect(addr).await;
    publisher.connect_app("live").await;
    let stream_id = publisher.create_stream().await;

    let status = publisher.publish(stream_id, "wire1").await;
    assert_eq!(status.name, "onStatus");
    assert_eq!(
        status.args[0].get_str("code"),
        Some("NetStream.Publish.Start")
    );

    // The publish spawned a supervisor and registered the stream
    let record = engine.registry.get(&key("wire1")).await.unwrap();
    assert!(record.state().is_active());
    assert!(record.child_pid().is_some());

    // Publisher disconnect is an unpublish: the stream drains away
    drop(publisher);
    let registry = Arc::clone(&engine.registry);
    wait_until("stream drained", Duration::from_secs(10), move || {
        let registry = Arc::clone(&registry);
        async move { registry.count().await == 0 }
    })
    .await;

    engine.cancel.cancel();
}

#[tokio::test]
async fn test_rtmp_duplicate_publisher_rejected() {
    let engine = make_engine("exec sleep 30", 24, Duration::from_secs(10));
    let addr = start_ingest(&engine).await;

    let mut first = TestPublisher::connect(addr).await;
    first.connect_app("live").await;
    let stream_id = first.create_stream().await;
    let status = first.publish(stream_id, "dup1").await;
    assert_eq!(
        status.args[0].get_str("code"),
        Some("NetStream.Publish.Start")
    );
    let record = engine.registry.get(&key("dup1")).await.unwrap();
    let first_pid = record.child_pid().unwrap();

    // Second publisher for the same key: rejected, existing wins
    let mut second = TestPublisher::connect(addr).await;
    second.connect_app("live").await;
    let second_sid = second.create_stream().await;
    let status = second.publish(second_sid, "dup1").await;
    assert_eq!(
        status.args[0].get_str("code"),
        Some("NetStream.Publish.BadName")
    );

    // No new child was spawned and the original record is untouched
    let record = engine.registry.get(&key("dup1")).await.unwrap();
    assert_eq!(record.child_pid(), Some(first_pid));

    engine.cancel.cancel();
}

#[tokio::test]
async fn test_rtmp_invalid_stream_key_rejected() {
    let engine = make_engine("exec sleep 30", 24, Duration::from_secs(10));
    let addr = start_ingest(&engine).await;

    let mut publisher = TestPublisher::connect(addr).await;
    publisher.connect_app("live").await;
    let stream_id = publisher.create_stream().await;

    let status = publisher.publish(stream_id, "bad key!").await;
    assert_eq!(status.name, "onStatus");
    assert_eq!(
        status.args[0].get_str("code"),
        Some("NetStream.Publish.BadName")
    );

    // A rejected publish never reaches the registry
    assert_eq!(engine.registry.count().await, 0);

    engine.cancel.cancel();
}

#[tokio::test]
async fn test_rtmp_wrong_app_rejected() {
    let engine = make_engine("exec sleep 30", 24, Duration::from_secs(10));
    let addr = start_ingest(&engine).await;

    let mut publisher = TestPublisher::connect(addr).await;
    let command = Command::new(
        "connect",
        1.0,
        amf::object([("app", amf::AmfValue::from("vod"))]),
    );
    publisher.send_command(0, command).await;

    let result = publisher.recv_command().await;
    assert_eq!(result.name, "_error");
    assert_eq!(
        result.args[0].get_str("code"),
        Some("NetConnection.Connect.Rejected")
    );

    engine.cancel.cancel();
}
