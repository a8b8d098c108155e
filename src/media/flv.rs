//! FLV tag classification
//!
//! Each RTMP audio/video message is an FLV tag body without the tag header.
//! The first byte(s) carry everything the relay needs:
//!
//! ```text
//! Video: | FrameType (4 bits) | CodecID (4 bits) | [AVCPacketType (1 byte)] ...
//! Audio: | SoundFormat (4 bits) | rate/size/type (4 bits) | [AACPacketType] ...
//! ```

use bytes::Bytes;

/// FLV tag type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlvTagType {
    Audio,
    Video,
    /// Script data (`onMetaData`)
    Script,
}

/// A single media tag as received from the publisher
#[derive(Debug, Clone)]
pub struct FlvTag {
    /// Tag type
    pub tag_type: FlvTagType,
    /// Timestamp in milliseconds
    pub timestamp: u32,
    /// Raw tag data, codec headers included (zero-copy via `Bytes`)
    pub data: Bytes,
}

/// AVC (H.264) codec id in the video tag's low nibble
const VIDEO_CODEC_AVC: u8 = 7;
/// AAC sound format in the audio tag's high nibble
const AUDIO_FORMAT_AAC: u8 = 10;
/// Keyframe marker in the video tag's high nibble
const FRAME_TYPE_KEYFRAME: u8 = 1;

impl FlvTag {
    /// Create a video tag
    pub fn video(timestamp: u32, data: Bytes) -> Self {
        Self {
            tag_type: FlvTagType::Video,
            timestamp,
            data,
        }
    }

    /// Create an audio tag
    pub fn audio(timestamp: u32, data: Bytes) -> Self {
        Self {
            tag_type: FlvTagType::Audio,
            timestamp,
            data,
        }
    }

    /// Create a script (metadata) tag
    pub fn script(data: Bytes) -> Self {
        Self {
            tag_type: FlvTagType::Script,
            timestamp: 0,
            data,
        }
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Whether this is a video keyframe
    pub fn is_keyframe(&self) -> bool {
        self.tag_type == FlvTagType::Video
            && self
                .data
                .first()
                .is_some_and(|b| (b >> 4) & 0x0F == FRAME_TYPE_KEYFRAME)
    }

    /// Whether this is an AVC sequence header (SPS/PPS decoder config)
    pub fn is_avc_sequence_header(&self) -> bool {
        self.tag_type == FlvTagType::Video
            && self.data.len() >= 2
            && self.data[0] & 0x0F == VIDEO_CODEC_AVC
            && self.data[1] == 0
    }

    /// Whether this is an AAC sequence header (AudioSpecificConfig)
    pub fn is_aac_sequence_header(&self) -> bool {
        self.tag_type == FlvTagType::Audio
            && self.data.len() >= 2
            && (self.data[0] >> 4) & 0x0F == AUDIO_FORMAT_AAC
            && self.data[1] == 0
    }

    /// Whether this tag is a decoder configuration record of either kind
    pub fn is_sequence_header(&self) -> bool {
        self.is_avc_sequence_header() || self.is_aac_sequence_header()
    }
}
