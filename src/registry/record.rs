//! Stream records and lifecycle states

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use super::key::StreamKey;
use super::relay::StreamRelay;
use crate::hls::LadderProfile;

/// Lifecycle state of a publishing stream
///
/// Transitions are owned by the publish controller (`Starting`,
/// `Draining`) and the stream's supervisor (everything else); all other
/// components only read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StreamState {
    /// Record created, transcoder launching, no artifacts yet
    Starting = 0,
    /// Child alive and artifacts fresh
    Running = 1,
    /// Child alive but artifacts exceed the freshness window
    Stale = 2,
    /// Unpublish received, child being stopped
    Draining = 3,
    /// Cleanly stopped
    Stopped = 4,
    /// Child died or never produced artifacts
    Failed = 5,
}

impl StreamState {
    /// States that occupy the key: a new publish must be rejected while a
    /// record is in one of these
    pub fn is_active(self) -> bool {
        matches!(
            self,
            StreamState::Starting | StreamState::Running | StreamState::Stale | StreamState::Draining
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StreamState::Starting => "starting",
            StreamState::Running => "running",
            StreamState::Stale => "stale",
            StreamState::Draining => "draining",
            StreamState::Stopped => "stopped",
            StreamState::Failed => "failed",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => StreamState::Starting,
            1 => StreamState::Running,
            2 => StreamState::Stale,
            3 => StreamState::Draining,
            4 => StreamState::Stopped,
            _ => StreamState::Failed,
        }
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry entry for one actively publishing stream
///
/// Identity and the ladder snapshot are immutable; the lifecycle state and
/// counters are atomics so the media path and HTTP readers never take a
/// lock for them. The relay is behind its own `RwLock` and only the media
/// path touches it.
#[derive(Debug)]
pub struct StreamRecord {
    key: StreamKey,
    remote_addr: SocketAddr,
    started_at: DateTime<Utc>,
    started_instant: Instant,

    state: AtomicU8,
    child_pid: AtomicU32,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    subscribers: AtomicU32,
    retention_hours: AtomicU32,

    /// Ladder snapshot, frozen at publish time
    ladder: Vec<LadderProfile>,

    pub(super) relay: RwLock<StreamRelay>,
}

impl StreamRecord {
    pub(super) fn new(
        key: StreamKey,
        remote_addr: SocketAddr,
        ladder: Vec<LadderProfile>,
        retention_hours: u32,
        relay: StreamRelay,
    ) -> Self {
        Self {
            key,
            remote_addr,
            started_at: Utc::now(),
            started_instant: Instant::now(),
            state: AtomicU8::new(StreamState::Starting as u8),
            child_pid: AtomicU32::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            subscribers: AtomicU32::new(0),
            retention_hours: AtomicU32::new(retention_hours),
            ladder,
            relay: RwLock::new(relay),
        }
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.started_instant.elapsed()
    }

    pub fn ladder(&self) -> &[LadderProfile] {
        &self.ladder
    }

    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: StreamState) {
        let previous = StreamState::from_u8(self.state.swap(state as u8, Ordering::AcqRel));
        if previous != state {
            tracing::info!(
                stream = %self.key,
                from = %previous,
                to = %state,
                "Stream state changed"
            );
        }
    }

    /// Compare-and-set the state; returns whether the transition happened
    pub fn transition(&self, from: StreamState, to: StreamState) -> bool {
        let swapped = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            tracing::info!(stream = %self.key, from = %from, to = %to, "Stream state changed");
        }
        swapped
    }

    pub fn child_pid(&self) -> Option<u32> {
        match self.child_pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub fn set_child_pid(&self, pid: Option<u32>) {
        self.child_pid.store(pid.unwrap_or(0), Ordering::Release);
    }

    pub fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    pub(super) fn add_subscriber(&self) -> u32 {
        self.subscribers.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(super) fn remove_subscriber(&self) -> u32 {
        let previous = self.subscribers.fetch_sub(1, Ordering::Relaxed);
        previous.saturating_sub(1)
    }

    pub fn subscriber_count(&self) -> u32 {
        self.subscribers.load(Ordering::Relaxed)
    }

    pub fn retention_hours(&self) -> u32 {
        self.retention_hours.load(Ordering::Acquire)
    }

    pub fn set_retention_hours(&self, hours: u32) {
        self.retention_hours.store(hours, Ordering::Release);
    }

    /// Immutable view for the HTTP surface
    pub fn snapshot(&self) -> RecordSnapshot {
        RecordSnapshot {
            key: self.key.clone(),
            state: self.state().as_str(),
            remote_addr: self.remote_addr.to_string(),
            started_at: self.started_at,
            uptime_secs: self.uptime().as_secs(),
            child_pid: self.child_pid(),
            bytes_in: self.bytes_in(),
            bytes_out: self.bytes_out(),
            subscribers: self.subscriber_count(),
            ladder: self.ladder.iter().map(|rung| rung.name.clone()).collect(),
        }
    }
}

/// Serializable point-in-time view of a record
#[derive(Debug, Clone, Serialize)]
pub struct RecordSnapshot {
    pub key: StreamKey,
    pub state: &'static str,
    pub remote_addr: String,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub child_pid: Option<u32>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub subscribers: u32,
    pub ladder: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hls::default_ladder;

    fn make_record() -> StreamRecord {
        StreamRecord::new(
            StreamKey::parse("stream1").unwrap(),
            "127.0.0.1:50000".parse().unwrap(),
            default_ladder(),
            24,
            StreamRelay::new(16, 1024),
        )
    }

    #[test]
    fn test_new_record_is_starting() {
        let record = make_record();
        assert_eq!(record.state(), StreamState::Starting);
        assert!(record.state().is_active());
        assert!(record.child_pid().is_none());
    }

    #[test]
    fn test_state_transitions() {
        let record = make_record();

        assert!(record.transition(StreamState::Starting, StreamState::Running));
        assert_eq!(record.state(), StreamState::Running);

        // Stale transition from a state we are no longer in fails
        assert!(!record.transition(StreamState::Starting, StreamState::Failed));
        assert_eq!(record.state(), StreamState::Running);

        record.set_state(StreamState::Draining);
        assert!(record.state().is_active());

        record.set_state(StreamState::Stopped);
        assert!(!record.state().is_active());
    }

    #[test]
    fn test_active_state_classification() {
        assert!(StreamState::Starting.is_active());
        assert!(StreamState::Running.is_active());
        assert!(StreamState::Stale.is_active());
        assert!(StreamState::Draining.is_active());
        assert!(!StreamState::Stopped.is_active());
        assert!(!StreamState::Failed.is_active());
    }

    #[test]
    fn test_counters() {
        let record = make_record();
        record.add_bytes_in(1000);
        record.add_bytes_in(500);
        record.add_bytes_out(200);

        assert_eq!(record.bytes_in(), 1500);
        assert_eq!(record.bytes_out(), 200);

        assert_eq!(record.add_subscriber(), 1);
        assert_eq!(record.remove_subscriber(), 0);
    }

    #[test]
    fn test_snapshot() {
        let record = make_record();
        record.set_child_pid(Some(4242));
        record.set_state(StreamState::Running);

        let snap = record.snapshot();
        assert_eq!(snap.key.as_str(), "stream1");
        assert_eq!(snap.state, "running");
        assert_eq!(snap.child_pid, Some(4242));
        assert_eq!(snap.ladder.len(), 4);
    }

    #[test]
    fn test_retention_change() {
        let record = make_record();
        assert_eq!(record.retention_hours(), 24);
        record.set_retention_hours(0);
        assert_eq!(record.retention_hours(), 0);
    }
}
