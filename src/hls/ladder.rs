//! ABR ladder model and master playlist rendering
//!
//! A ladder is a fixed, ordered sequence of rungs (highest first). Once a
//! publish snapshots the ladder it never changes for the life of that
//! stream; the rung index doubles as the on-disk directory name.

use serde::Serialize;

/// H.264 profile requested from the encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum H264Profile {
    Baseline,
    Main,
    High,
}

impl H264Profile {
    /// Name as ffmpeg's `-profile:v` expects it
    pub fn as_str(&self) -> &'static str {
        match self {
            H264Profile::Baseline => "baseline",
            H264Profile::Main => "main",
            H264Profile::High => "high",
        }
    }

    /// `profile_idc` for the RFC 6381 codec string
    fn idc(&self) -> u8 {
        match self {
            H264Profile::Baseline => 66,
            H264Profile::Main => 77,
            H264Profile::High => 100,
        }
    }

    /// Constraint-flag byte for the RFC 6381 codec string
    fn constraint_flags(&self) -> u8 {
        match self {
            H264Profile::Baseline => 0xE0,
            H264Profile::Main => 0x40,
            H264Profile::High => 0x00,
        }
    }
}

/// One rung of the ABR ladder
#[derive(Debug, Clone, Serialize)]
pub struct LadderProfile {
    /// Human-readable rung name, e.g. `720p`
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Target video bitrate in kbps
    pub video_kbps: u32,
    /// Maximum video bitrate in kbps
    pub max_kbps: u32,
    /// Encoder buffer size in kbits
    pub buffer_kbps: u32,
    /// Audio bitrate in kbps
    pub audio_kbps: u32,
    pub profile: H264Profile,
    /// H.264 level in tenths: 31 is level 3.1
    pub level_idc: u8,
}

impl LadderProfile {
    /// Level as ffmpeg's `-level:v` expects it, e.g. `4.1`
    pub fn level_string(&self) -> String {
        format!("{}.{}", self.level_idc / 10, self.level_idc % 10)
    }

    /// RFC 6381 `CODECS` value for this rung (video + AAC-LC audio)
    pub fn codecs_attr(&self) -> String {
        format!(
            "avc1.{:02X}{:02X}{:02X},mp4a.40.2",
            self.profile.idc(),
            self.profile.constraint_flags(),
            self.level_idc
        )
    }

    /// Peak bandwidth in bits per second, as advertised in the master
    /// playlist `BANDWIDTH` attribute
    pub fn bandwidth_bps(&self) -> u64 {
        u64::from(self.max_kbps + self.audio_kbps) * 1000
    }

    /// `RESOLUTION` attribute value
    pub fn resolution_attr(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// The stock four-rung ladder: 1080p / 720p / 480p / 360p
pub fn default_ladder() -> Vec<LadderProfile> {
    vec![
        LadderProfile {
            name: "1080p".into(),
            width: 1920,
            height: 1080,
            video_kbps: 5000,
            max_kbps: 5350,
            buffer_kbps: 7500,
            audio_kbps: 192,
            profile: H264Profile::High,
            level_idc: 41,
        },
        LadderProfile {
            name: "720p".into(),
            width: 1280,
            height: 720,
            video_kbps: 2800,
            max_kbps: 2996,
            buffer_kbps: 4200,
            audio_kbps: 128,
            profile: H264Profile::High,
            level_idc: 31,
        },
        LadderProfile {
            name: "480p".into(),
            width: 854,
            height: 480,
            video_kbps: 1400,
            max_kbps: 1498,
            buffer_kbps: 2100,
            audio_kbps: 128,
            profile: H264Profile::Main,
            level_idc: 31,
        },
        LadderProfile {
            name: "360p".into(),
            width: 640,
            height: 360,
            video_kbps: 800,
            max_kbps: 856,
            buffer_kbps: 1200,
            audio_kbps: 96,
            profile: H264Profile::Baseline,
            level_idc: 30,
        },
    ]
}

/// Render the master playlist for a ladder.
///
/// References rung playlists by index (`0/playlist.m3u8` ...), matching the
/// on-disk layout the transcoder writes into.
pub fn render_master_playlist(ladder: &[LadderProfile]) -> String {
    let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
    for (i, rung) in ladder.iter().enumerate() {
        out.push_str(&format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={},CODECS=\"{}\"\n{}/playlist.m3u8\n",
            rung.bandwidth_bps(),
            rung.resolution_attr(),
            rung.codecs_attr(),
            i
        ));
    }
    out
}

/// Render the marker playlist left behind after a stream ends.
pub fn render_ended_playlist() -> String {
    "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-ENDLIST\n".to_string()
}
