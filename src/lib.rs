//! streamforge: live streaming backend
//!
//! Broadcasters push RTMP, a supervised ffmpeg child transcodes each
//! stream into an adaptive-bitrate HLS ladder, and viewers fetch the
//! playlists and segments over HTTP. The core is the stream lifecycle
//! engine: detect a publishing stream, atomically own it (cross-process
//! lock + orphan probe), launch and supervise its transcoder, watch
//! artifact freshness, and tear everything down when publishing ends.
//!
//! # Architecture
//!
//! ```text
//! RTMP publisher ──► ingest ──► controller ──► registry
//!                      │                          │
//!                      │ relay (loopback only)    ├─► supervisor ──► ffmpeg
//!                      ▼                          │        │
//!                   ffmpeg ◄──────────────────────┘        ▼
//!                      │                             <hls root>/<key>/…
//!                      └── writes ──────────────────►      ▲   ▲
//!                                                          │   │
//!                              health monitor (read-only) ─┘   │
//!                              HTTP delivery (axum) ───────────┘
//! ```
//!
//! Supervisors share nothing but the registry map; a stream's failure
//! never propagates past its own state machine.

pub mod amf;
pub mod config;
pub mod controller;
pub mod error;
pub mod hls;
pub mod http;
pub mod ingest;
pub mod media;
pub mod protocol;
pub mod registry;
pub mod supervisor;

pub use config::Config;
pub use controller::{AllowAll, PublishAuth, PublishController};
pub use error::{Error, Result};
pub use ingest::IngestServer;
pub use registry::{StreamKey, StreamRegistry};
