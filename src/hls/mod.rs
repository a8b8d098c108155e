//! HLS artifact layout, health, and the ABR ladder
//!
//! The transcoder child is the only writer of playlists and segments; this
//! module owns everything around that: the canonical on-disk layout, the
//! pre-written master playlist, the end-of-stream sentinel, retention, and
//! the read-only freshness checks the supervisor consults.

pub mod artifacts;
pub mod health;
pub mod ladder;

pub use artifacts::{ArtifactStore, StreamEnded, SENTINEL_FILE};
pub use health::{HealthReport, HlsHealthMonitor};
pub use ladder::{
    default_ladder, render_ended_playlist, render_master_playlist, H264Profile, LadderProfile,
};
