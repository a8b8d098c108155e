//! Media tag handling for the loopback relay
//!
//! The ingest never decodes video or audio; it only needs to classify
//! inbound FLV tags (keyframe? sequence header?) well enough to keep a GOP
//! buffer, so a transcoder that attaches mid-stream starts decoding at a
//! keyframe instead of waiting out a full GOP.

pub mod flv;
pub mod gop;

pub use flv::{FlvTag, FlvTagType};
pub use gop::GopBuffer;
