//! AMF0 value model and codec
//!
//! RTMP NetConnection/NetStream commands carry their arguments as AMF0
//! values. The ingest only ever needs AMF0: every encoder that matters
//! (OBS, ffmpeg, FMLE descendants) negotiates `objectEncoding: 0`, and the
//! command chain is AMF0 regardless.

pub mod amf0;
pub mod value;

pub use value::{object, AmfValue};
