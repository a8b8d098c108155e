//! Engine configuration
//!
//! All runtime options are frozen into an immutable [`Config`] at startup.
//! Components receive only the subsections they need; nothing reads the
//! environment after construction.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::hls::{default_ladder, LadderProfile};

/// RTMP ingest options
#[derive(Debug, Clone)]
pub struct RtmpConfig {
    /// Address to bind the ingest listener to
    pub bind_addr: SocketAddr,

    /// Required application path segment (`rtmp://host/<app>/<key>`)
    pub app_name: String,

    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,

    /// Handshake must complete within this time
    pub handshake_timeout: Duration,

    /// Disconnect a session that sends nothing for this long; catches
    /// peers that connect and never get to a publish
    pub idle_timeout: Duration,

    /// Chunk size to negotiate with clients
    pub chunk_size: u32,

    /// Window acknowledgement size
    pub window_ack_size: u32,

    /// Peer bandwidth limit
    pub peer_bandwidth: u32,

    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub tcp_nodelay: bool,
}

impl Default for RtmpConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:1935".parse().expect("static addr"),
            app_name: "live".into(),
            max_connections: 0,
            handshake_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            chunk_size: 4096,
            window_ack_size: 2_500_000,
            peer_bandwidth: 2_500_000,
            tcp_nodelay: true,
        }
    }
}

/// HLS artifact options
#[derive(Debug, Clone)]
pub struct HlsConfig {
    /// Root of the shared artifact directory
    pub root: PathBuf,

    /// Segment duration in seconds
    pub segment_seconds: u32,

    /// Rolling playlist window, in segments
    pub playlist_segments: u32,

    /// Maximum age of the newest segment before a stream is flagged stale
    pub freshness: Duration,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data/hls"),
            segment_seconds: 2,
            playlist_segments: 12,
            freshness: Duration::from_secs(30),
        }
    }
}

/// Per-stream supervisor options
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How long a freshly launched child may run before first artifacts
    /// must exist on disk
    pub startup_grace: Duration,

    /// How long a stopping child gets between SIGTERM and SIGKILL
    pub stop_grace: Duration,

    /// Supervise loop wake interval
    pub tick: Duration,

    /// Directory holding cross-process stream locks
    pub lock_dir: PathBuf,

    /// Transcoder binary to invoke
    pub ffmpeg_bin: String,

    /// Host the transcoder pulls its RTMP input from
    pub ingest_host: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_secs(15),
            stop_grace: Duration::from_secs(5),
            tick: Duration::from_secs(10),
            lock_dir: std::env::temp_dir().join("streamforge_locks"),
            ffmpeg_bin: "ffmpeg".into(),
            ingest_host: "127.0.0.1".into(),
        }
    }
}

/// Artifact retention options
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Hours to keep artifacts after a stream ends; 0 deletes immediately
    /// on unpublish
    pub hours: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { hours: 24 }
    }
}

/// HLS delivery / control surface options
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Address to bind the HTTP listener to
    pub bind_addr: SocketAddr,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().expect("static addr"),
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub rtmp: RtmpConfig,
    pub hls: HlsConfig,
    pub supervisor: SupervisorConfig,
    pub retention: RetentionConfig,
    pub http: HttpConfig,

    /// ABR ladder, highest rung first; immutable for the life of a stream
    /// once a publish snapshots it
    pub ladder: Vec<LadderProfile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rtmp: RtmpConfig::default(),
            hls: HlsConfig::default(),
            supervisor: SupervisorConfig::default(),
            retention: RetentionConfig::default(),
            http: HttpConfig::default(),
            ladder: default_ladder(),
        }
    }
}

impl Config {
    /// Validate cross-field invariants that cannot be enforced per-section.
    ///
    /// The ladder must be non-empty, bitrates strictly decreasing and
    /// resolutions non-increasing from the top rung down.
    pub fn validate(&self) -> Result<(), String> {
        if self.ladder.is_empty() {
            return Err("ladder must contain at least one rung".into());
        }

        for pair in self.ladder.windows(2) {
            let (hi, lo) = (&pair[0], &pair[1]);
            if lo.video_kbps >= hi.video_kbps {
                return Err(format!(
                    "ladder bitrates must strictly decrease: {} ({} kbps) >= {} ({} kbps)",
                    lo.name, lo.video_kbps, hi.name, hi.video_kbps
                ));
            }
            if lo.width > hi.width || lo.height > hi.height {
                return Err(format!(
                    "ladder resolutions must not increase: {} exceeds {}",
                    lo.name, hi.name
                ));
            }
        }

        if self.hls.segment_seconds == 0 || self.hls.playlist_segments == 0 {
            return Err("segment duration and playlist window must be non-zero".into());
        }

        Ok(())
    }

    /// RTMP URL the transcoder child pulls this stream from
    pub fn transcoder_input_url(&self, key: &str) -> String {
        format!(
            "rtmp://{}:{}/{}/{}",
            self.supervisor.ingest_host,
            self.rtmp.bind_addr.port(),
            self.rtmp.app_name,
            key
        )
    }

    /// Set the ingest bind address
    pub fn rtmp_bind(mut self, addr: SocketAddr) -> Self {
        self.rtmp.bind_addr = addr;
        self
    }

    /// Set the HTTP bind address
    pub fn http_bind(mut self, addr: SocketAddr) -> Self {
        self.http.bind_addr = addr;
        self
    }

    /// Set the artifact root
    pub fn hls_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.hls.root = root.into();
        self
    }

    /// Set retention in hours (0 = delete immediately on unpublish)
    pub fn retention_hours(mut self, hours: u32) -> Self {
        self.retention.hours = hours;
        self
    }

    /// Replace the ABR ladder
    pub fn ladder(mut self, ladder: Vec<LadderProfile>) -> Self {
        self.ladder = ladder;
        self
    }
}
