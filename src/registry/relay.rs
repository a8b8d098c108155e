//! Loopback media relay
//!
//! Inbound publisher media fans out over a `tokio::sync::broadcast`
//! channel to the transcoder that pulls the stream back over RTMP. Frames
//! are cheap to clone: the payload is reference-counted `Bytes`.
//!
//! The relay also caches the decoder configuration (sequence headers,
//! `onMetaData`) and keeps a bounded GOP buffer, so a subscriber that
//! attaches mid-stream receives everything needed to start decoding at
//! the most recent keyframe.

use bytes::Bytes;
use tokio::sync::broadcast;

use crate::media::flv::{FlvTag, FlvTagType};
use crate::media::gop::GopBuffer;

/// Type of relayed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Audio,
    Video,
    /// Script data (`onMetaData`)
    Metadata,
}

/// A frame broadcast from publisher to subscribers
#[derive(Debug, Clone)]
pub struct RelayFrame {
    pub kind: FrameKind,
    /// Timestamp in milliseconds
    pub timestamp: u32,
    /// Frame data (zero-copy via reference counting)
    pub data: Bytes,
    pub is_keyframe: bool,
    pub is_header: bool,
}

impl RelayFrame {
    /// Classify and wrap an inbound FLV tag
    pub fn from_tag(tag: &FlvTag) -> Self {
        let (kind, is_keyframe, is_header) = match tag.tag_type {
            FlvTagType::Video => (
                FrameKind::Video,
                tag.is_keyframe(),
                tag.is_avc_sequence_header(),
            ),
            FlvTagType::Audio => (FrameKind::Audio, false, tag.is_aac_sequence_header()),
            FlvTagType::Script => (FrameKind::Metadata, false, false),
        };
        Self {
            kind,
            timestamp: tag.timestamp,
            data: tag.data.clone(),
            is_keyframe,
            is_header,
        }
    }

    fn to_tag(&self) -> FlvTag {
        match self.kind {
            FrameKind::Video => FlvTag::video(self.timestamp, self.data.clone()),
            FrameKind::Audio => FlvTag::audio(self.timestamp, self.data.clone()),
            FrameKind::Metadata => FlvTag::script(self.data.clone()),
        }
    }
}

/// Per-stream relay state: broadcast sender plus late-joiner caches
#[derive(Debug)]
pub struct StreamRelay {
    tx: broadcast::Sender<RelayFrame>,
    gop: GopBuffer,
    video_header: Option<RelayFrame>,
    audio_header: Option<RelayFrame>,
    metadata: Option<RelayFrame>,
}

impl StreamRelay {
    pub fn new(broadcast_capacity: usize, max_gop_bytes: usize) -> Self {
        let (tx, _) = broadcast::channel(broadcast_capacity);
        Self {
            tx,
            gop: GopBuffer::with_max_size(max_gop_bytes),
            video_header: None,
            audio_header: None,
            metadata: None,
        }
    }

    /// Publish a frame: update caches, then fan out.
    ///
    /// Returns the number of subscribers that received it (0 when the
    /// transcoder has not attached yet; frames before that are only
    /// buffered).
    pub fn publish(&mut self, frame: RelayFrame) -> usize {
        match frame.kind {
            FrameKind::Video if frame.is_header => self.video_header = Some(frame.clone()),
            FrameKind::Audio if frame.is_header => self.audio_header = Some(frame.clone()),
            FrameKind::Metadata => self.metadata = Some(frame.clone()),
            FrameKind::Video => {
                self.gop.push(frame.to_tag());
            }
            FrameKind::Audio => {}
        }

        self.tx.send(frame).unwrap_or(0)
    }

    /// Attach a subscriber.
    ///
    /// Returns the live receiver plus the catchup frames to deliver first:
    /// metadata, sequence headers, then the buffered GOP.
    pub fn subscribe(&self) -> (broadcast::Receiver<RelayFrame>, Vec<RelayFrame>) {
        let rx = self.tx.subscribe();

        let mut catchup = Vec::with_capacity(self.gop.len() + 3);
        if let Some(ref meta) = self.metadata {
            catchup.push(meta.clone());
        }
        if let Some(ref video) = self.video_header {
            catchup.push(video.clone());
        }
        if let Some(ref audio) = self.audio_header {
            catchup.push(audio.clone());
        }
        for tag in self.gop.replay() {
            catchup.push(RelayFrame::from_tag(&tag));
        }

        (rx, catchup)
    }

    /// Number of frames currently held for late joiners
    pub fn gop_frame_count(&self) -> usize {
        self.gop.len()
    }
}
