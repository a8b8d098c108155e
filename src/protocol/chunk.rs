//! RTMP chunk stream codec
//!
//! Messages are carried as sequences of chunks, interleaved across chunk
//! streams. Each chunk has a basic header (format + chunk stream id), a
//! message header whose size depends on the format, and up to the
//! negotiated chunk size of payload:
//!
//! ```text
//! fmt 0 (11 bytes): timestamp(3) length(3) type(1) stream_id(4, LE)
//! fmt 1 ( 7 bytes): ts_delta(3)  length(3) type(1)
//! fmt 2 ( 3 bytes): ts_delta(3)
//! fmt 3 ( 0 bytes): continuation / header reuse
//! ```
//!
//! A timestamp or delta of 0xFFFFFF escapes to a 32-bit extended field
//! after the message header (repeated on format-3 chunks).
//!
//! The decoder is incremental: feed it the read buffer and it consumes
//! input only when a complete chunk is available, so a short TCP read
//! never corrupts state.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ChunkError;
use crate::protocol::constants::{
    DEFAULT_CHUNK_SIZE, EXTENDED_TIMESTAMP, MAX_CHUNK_SIZE, MAX_MESSAGE_SIZE, MSG_SET_CHUNK_SIZE,
};

/// A fully assembled RTMP message, not yet interpreted
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub type_id: u8,
    pub timestamp: u32,
    pub stream_id: u32,
    pub payload: Bytes,
}

/// Per-chunk-stream decode state
#[derive(Debug, Default)]
struct ChunkStreamCtx {
    /// Absolute timestamp of the message being (or last) assembled
    timestamp: u32,
    /// Last timestamp delta, reused by format-3 headers
    ts_delta: u32,
    msg_len: u32,
    msg_type: u8,
    msg_stream_id: u32,
    /// Whether the last header on this stream used an extended timestamp
    extended_ts: bool,
    /// Partially assembled message payload
    partial: BytesMut,
}

/// Incremental chunk stream decoder
pub struct ChunkDecoder {
    chunk_size: u32,
    streams: HashMap<u32, ChunkStreamCtx>,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            streams: HashMap::new(),
        }
    }

    /// Chunk size currently in effect for inbound chunks
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Try to decode one message from the buffer.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A `SetChunkSize`
    /// message is applied to the decoder as soon as it assembles (it
    /// governs the very next chunk) and is also returned to the caller.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RawMessage>, ChunkError> {
        loop {
            let Some(chunk) = self.try_consume_chunk(buf)? else {
                return Ok(None);
            };

            if let Some(message) = chunk {
                if message.type_id == MSG_SET_CHUNK_SIZE {
                    self.apply_chunk_size(&message)?;
                }
                return Ok(Some(message));
            }
            // A chunk was consumed but its message is still incomplete;
            // keep going while bytes remain
        }
    }

    /// Consume one complete chunk if buffered.
    ///
    /// Outer `None`: need more bytes. Inner `None`: chunk consumed but the
    /// message is not finished yet.
    #[allow(clippy::type_complexity)]
    fn try_consume_chunk(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Option<RawMessage>>, ChunkError> {
        let Some((fmt, csid, bh_len)) = parse_basic_header(buf) else {
            return Ok(None);
        };

        let mh_len = match fmt {
            0 => 11,
            1 => 7,
            2 => 3,
            _ => 0,
        };
        if buf.len() < bh_len + mh_len {
            return Ok(None);
        }

        let header = &buf[bh_len..bh_len + mh_len];

        // Continuation formats need prior state on this chunk stream
        if fmt != 0 && !self.streams.contains_key(&csid) {
            return Err(ChunkError::UnknownChunkStream(csid));
        }

        let ts_field = if mh_len >= 3 { be24(&header[0..3]) } else { 0 };
        let extended = match fmt {
            0 | 1 | 2 => ts_field == EXTENDED_TIMESTAMP,
            _ => self
                .streams
                .get(&csid)
                .map(|ctx| ctx.extended_ts)
                .unwrap_or(false),
        };
        let ext_len = if extended { 4 } else { 0 };
        if buf.len() < bh_len + mh_len + ext_len {
            return Ok(None);
        }

        let ext_ts = if extended {
            let b = &buf[bh_len + mh_len..bh_len + mh_len + 4];
            u32::from_be_bytes([b[0], b[1], b[2], b[3]])
        } else {
            0
        };

        // Resolve the message header against prior state without yet
        // consuming anything: the payload may still be short
        let ctx = self.streams.entry(csid).or_default();
        let starts_message = ctx.partial.is_empty();

        let (msg_len, msg_type) = match fmt {
            0 | 1 => (be24(&header[3..6]), header[6]),
            _ => (ctx.msg_len, ctx.msg_type),
        };
        let msg_stream_id = if fmt == 0 {
            u32::from_le_bytes([header[7], header[8], header[9], header[10]])
        } else {
            ctx.msg_stream_id
        };
        if msg_len > MAX_MESSAGE_SIZE {
            return Err(ChunkError::MessageTooLarge(msg_len));
        }

        let already = ctx.partial.len() as u32;
        let payload_len = self.chunk_size.min(msg_len.saturating_sub(already)) as usize;
        if buf.len() < bh_len + mh_len + ext_len + payload_len {
            return Ok(None);
        }

        // Complete chunk buffered: commit
        buf.advance(bh_len + mh_len + ext_len);
        let payload = buf.split_to(payload_len);

        match fmt {
            0 => {
                ctx.timestamp = if extended { ext_ts } else { ts_field };
                ctx.ts_delta = 0;
                ctx.msg_len = msg_len;
                ctx.msg_type = msg_type;
                ctx.msg_stream_id = msg_stream_id;
                ctx.extended_ts = extended;
            }
            1 | 2 => {
                let delta = if extended { ext_ts } else { ts_field };
                ctx.ts_delta = delta;
                ctx.timestamp = ctx.timestamp.wrapping_add(delta);
                if fmt == 1 {
                    ctx.msg_len = msg_len;
                    ctx.msg_type = msg_type;
                }
                ctx.extended_ts = extended;
            }
            _ => {
                // A format-3 header that starts a new message reuses the
                // previous delta; mid-message continuations change nothing
                if starts_message {
                    ctx.timestamp = ctx.timestamp.wrapping_add(ctx.ts_delta);
                }
            }
        }

        ctx.partial.extend_from_slice(&payload);

        if ctx.partial.len() as u32 == ctx.msg_len {
            let message = RawMessage {
                type_id: ctx.msg_type,
                timestamp: ctx.timestamp,
                stream_id: ctx.msg_stream_id,
                payload: ctx.partial.split().freeze(),
            };
            Ok(Some(Some(message)))
        } else {
            Ok(Some(None))
        }
    }

    fn apply_chunk_size(&mut self, message: &RawMessage) -> Result<(), ChunkError> {
        if message.payload.len() < 4 {
            return Err(ChunkError::InvalidChunkSize(0));
        }
        let size = u32::from_be_bytes([
            message.payload[0],
            message.payload[1],
            message.payload[2],
            message.payload[3],
        ]) & 0x7FFF_FFFF;

        if size == 0 || size > EXTENDED_TIMESTAMP {
            return Err(ChunkError::InvalidChunkSize(size));
        }
        self.chunk_size = size;
        Ok(())
    }
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Chunk stream encoder
///
/// Always emits a full format-0 header followed by format-3
/// continuations. That forfeits a few header bytes per message relative
/// to delta compression and in exchange never produces a chunk a decoder
/// can misread.
pub struct ChunkEncoder {
    chunk_size: u32,
}

impl ChunkEncoder {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Set the outbound chunk size (announce it with a `SetChunkSize`
    /// message before using the new size)
    pub fn set_chunk_size(&mut self, size: u32) {
        self.chunk_size = size.clamp(1, MAX_CHUNK_SIZE);
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Encode a message into one or more chunks on the given chunk stream
    pub fn encode(&self, csid: u32, message: &RawMessage) -> Bytes {
        debug_assert!((2..64).contains(&csid), "single-byte csid expected");

        let extended = message.timestamp >= EXTENDED_TIMESTAMP;
        let ts_field = if extended {
            EXTENDED_TIMESTAMP
        } else {
            message.timestamp
        };

        let chunks = message.payload.chunks(self.chunk_size as usize);
        let mut out = BytesMut::with_capacity(message.payload.len() + 16 + chunks.len() * 5);

        // Format-0 header
        out.put_u8(csid as u8);
        put_be24(&mut out, ts_field);
        put_be24(&mut out, message.payload.len() as u32);
        out.put_u8(message.type_id);
        out.put_u32_le(message.stream_id);
        if extended {
            out.put_u32(message.timestamp);
        }

        let mut first = true;
        for chunk in message.payload.chunks(self.chunk_size.max(1) as usize) {
            if !first {
                // Format-3 continuation header
                out.put_u8(0xC0 | csid as u8);
                if extended {
                    out.put_u32(message.timestamp);
                }
            }
            out.put_slice(chunk);
            first = false;
        }

        // Zero-length payload still needs the header emitted above
        out.freeze()
    }
}

impl Default for ChunkEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the 1-3 byte basic header. Returns (fmt, csid, header length).
fn parse_basic_header(buf: &[u8]) -> Option<(u8, u32, usize)> {
    let first = *buf.first()?;
    let fmt = first >> 6;
    match first & 0x3F {
        0 => {
            let b1 = *buf.get(1)?;
            Some((fmt, 64 + u32::from(b1), 2))
        }
        1 => {
            let b1 = *buf.get(1)?;
            let b2 = *buf.get(2)?;
            Some((fmt, 64 + u32::from(b1) + u32::from(b2) * 256, 3))
        }
        csid => Some((fmt, u32::from(csid), 1)),
    }
}

fn be24(b: &[u8]) -> u32 {
    u32::from(b[0]) << 16 | u32::from(b[1]) << 8 | u32::from(b[2])
}

fn put_be24(buf: &mut BytesMut, value: u32) {
    buf.put_u8((value >> 16) as u8);
    buf.put_u8((value >> 8) as u8);
    buf.put_u8(value as u8);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::{CSID_COMMAND, CSID_VIDEO, MSG_COMMAND_AMF0, MSG_VIDEO};

    fn make_message(type_id: u8, timestamp: u32, stream_id: u32, len: usize) -> RawMessage {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        RawMessage {
            type_id,
            timestamp,
            stream_id,
            payload: Bytes::from(payload),
        }
    }

    #[test]
    fn test_single_chunk_roundtrip() {
        let encoder = ChunkEncoder::new();
        let mut decoder = ChunkDecoder::new();

        let message = make_message(MSG_COMMAND_AMF0, 0, 0, 100);
        let wire = encoder.encode(CSID_COMMAND, &message);

        let mut buf = BytesMut::from(&wire[..]);
        let decoded = decoder.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded.type_id, MSG_COMMAND_AMF0);
        assert_eq!(decoded.timestamp, 0);
        assert_eq!(decoded.payload, message.payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_multi_chunk_roundtrip() {
        let encoder = ChunkEncoder::new();
        let mut decoder = ChunkDecoder::new();

        // 500 bytes at the default 128-byte chunk size: four chunks
        let message = make_message(MSG_VIDEO, 1234, 1, 500);
        let wire = encoder.encode(CSID_VIDEO, &message);

        let mut buf = BytesMut::from(&wire[..]);
        let decoded = decoder.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded.timestamp, 1234);
        assert_eq!(decoded.payload.len(), 500);
        assert_eq!(decoded.payload, message.payload);
    }

    #[test]
    fn test_partial_input_returns_none_and_consumes_nothing() {
        let encoder = ChunkEncoder::new();
        let mut decoder = ChunkDecoder::new();

        let message = make_message(MSG_VIDEO, 0, 1, 300);
        let wire = encoder.encode(CSID_VIDEO, &message);

        // Feed one byte at a time; must assemble exactly one message
        let mut buf = BytesMut::new();
        let mut produced = Vec::new();
        for byte in wire.iter() {
            buf.put_u8(*byte);
            if let Some(msg) = decoder.decode(&mut buf).unwrap() {
                produced.push(msg);
            }
        }

        assert_eq!(produced.len(), 1);
        assert_eq!(produced[0].payload, message.payload);
    }

    #[test]
    fn test_back_to_back_messages() {
        let encoder = ChunkEncoder::new();
        let mut decoder = ChunkDecoder::new();

        let first = make_message(MSG_VIDEO, 0, 1, 200);
        let second = make_message(MSG_VIDEO, 33, 1, 200);

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encoder.encode(CSID_VIDEO, &first));
        buf.extend_from_slice(&encoder.encode(CSID_VIDEO, &second));

        let a = decoder.decode(&mut buf).unwrap().unwrap();
        let b = decoder.decode(&mut buf).unwrap().unwrap();

        assert_eq!(a.timestamp, 0);
        assert_eq!(b.timestamp, 33);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_interleaved_chunk_streams() {
        let encoder = ChunkEncoder::new();
        let mut decoder = ChunkDecoder::new();

        // Two multi-chunk messages whose chunks interleave on the wire
        let video = make_message(MSG_VIDEO, 100, 1, 200);
        let command = make_message(MSG_COMMAND_AMF0, 0, 0, 200);

        let video_wire = encoder.encode(CSID_VIDEO, &video);
        let command_wire = encoder.encode(CSID_COMMAND, &command);

        // First chunk of each is header + 128 bytes of payload
        let video_split = video_wire.len() - 72 - 1; // before fmt3 header + tail
        let command_split = command_wire.len() - 72 - 1;

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&video_wire[..video_split]);
        buf.extend_from_slice(&command_wire[..command_split]);
        buf.extend_from_slice(&video_wire[video_split..]);
        buf.extend_from_slice(&command_wire[command_split..]);

        let first = decoder.decode(&mut buf).unwrap().unwrap();
        let second = decoder.decode(&mut buf).unwrap().unwrap();

        assert_eq!(first.type_id, MSG_VIDEO);
        assert_eq!(first.payload, video.payload);
        assert_eq!(second.type_id, MSG_COMMAND_AMF0);
        assert_eq!(second.payload, command.payload);
    }

    #[test]
    fn test_extended_timestamp_roundtrip() {
        let encoder = ChunkEncoder::new();
        let mut decoder = ChunkDecoder::new();

        let message = make_message(MSG_VIDEO, 0x0100_0000, 1, 300);
        let wire = encoder.encode(CSID_VIDEO, &message);

        let mut buf = BytesMut::from(&wire[..]);
        let decoded = decoder.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded.timestamp, 0x0100_0000);
        assert_eq!(decoded.payload, message.payload);
    }

    #[test]
    fn test_set_chunk_size_applies_immediately() {
        let mut encoder = ChunkEncoder::new();
        let mut decoder = ChunkDecoder::new();

        let set = RawMessage {
            type_id: MSG_SET_CHUNK_SIZE,
            timestamp: 0,
            stream_id: 0,
            payload: Bytes::copy_from_slice(&4096u32.to_be_bytes()),
        };

        let mut buf = BytesMut::from(&encoder.encode(2, &set)[..]);
        let msg = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.type_id, MSG_SET_CHUNK_SIZE);
        assert_eq!(decoder.chunk_size(), 4096);

        // A 5000-byte message now arrives in two chunks, not forty
        encoder.set_chunk_size(4096);
        let big = make_message(MSG_VIDEO, 10, 1, 5000);
        let mut buf = BytesMut::from(&encoder.encode(CSID_VIDEO, &big)[..]);
        let decoded = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.payload, big.payload);
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let encoder = ChunkEncoder::new();
        let mut decoder = ChunkDecoder::new();

        let set = RawMessage {
            type_id: MSG_SET_CHUNK_SIZE,
            timestamp: 0,
            stream_id: 0,
            payload: Bytes::copy_from_slice(&0u32.to_be_bytes()),
        };

        let mut buf = BytesMut::from(&encoder.encode(2, &set)[..]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(ChunkError::InvalidChunkSize(0))
        ));
    }

    #[test]
    fn test_continuation_on_unknown_stream_rejected() {
        let mut decoder = ChunkDecoder::new();

        // Format-1 header on a chunk stream we have never seen
        let mut buf = BytesMut::new();
        buf.put_u8(0x40 | 8); // fmt=1, csid=8
        buf.extend_from_slice(&[0, 0, 33, 0, 0, 10, 9]);
        buf.extend_from_slice(&[0u8; 10]);

        assert!(matches!(
            decoder.decode(&mut buf),
            Err(ChunkError::UnknownChunkStream(8))
        ));
    }

    #[test]
    fn test_oversized_message_rejected() {
        let mut decoder = ChunkDecoder::new();

        let mut buf = BytesMut::new();
        buf.put_u8(6); // fmt=0, csid=6
        put_be24(&mut buf, 0); // timestamp
        put_be24(&mut buf, MAX_MESSAGE_SIZE + 1); // length
        buf.put_u8(MSG_VIDEO);
        buf.put_u32_le(1);

        assert!(matches!(
            decoder.decode(&mut buf),
            Err(ChunkError::MessageTooLarge(_))
        ));
    }

    #[test]
    fn test_delta_timestamps_accumulate() {
        let mut decoder = ChunkDecoder::new();

        // fmt-0: ts=1000, 4-byte payload, then fmt-2 delta=33, then fmt-3
        // (reuses the delta for a third message)
        let mut buf = BytesMut::new();

        buf.put_u8(6);
        put_be24(&mut buf, 1000);
        put_be24(&mut buf, 4);
        buf.put_u8(MSG_VIDEO);
        buf.put_u32_le(1);
        buf.extend_from_slice(&[1, 2, 3, 4]);

        buf.put_u8(0x80 | 6); // fmt=2
        put_be24(&mut buf, 33);
        buf.extend_from_slice(&[5, 6, 7, 8]);

        buf.put_u8(0xC0 | 6); // fmt=3, new message
        buf.extend_from_slice(&[9, 10, 11, 12]);

        let a = decoder.decode(&mut buf).unwrap().unwrap();
        let b = decoder.decode(&mut buf).unwrap().unwrap();
        let c = decoder.decode(&mut buf).unwrap().unwrap();

        assert_eq!(a.timestamp, 1000);
        assert_eq!(b.timestamp, 1033);
        assert_eq!(c.timestamp, 1066);
    }

    #[test]
    fn test_two_byte_csid() {
        let mut decoder = ChunkDecoder::new();

        // csid 0 in the basic header: real csid is 64 + next byte
        let mut buf = BytesMut::new();
        buf.put_u8(0); // fmt=0, marker for 2-byte form
        buf.put_u8(10); // csid = 74
        put_be24(&mut buf, 0);
        put_be24(&mut buf, 2);
        buf.put_u8(MSG_VIDEO);
        buf.put_u32_le(1);
        buf.extend_from_slice(&[0xAA, 0xBB]);

        let msg = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.payload, Bytes::from_static(&[0xAA, 0xBB]));
    }

    #[test]
    fn test_empty_payload_message() {
        let encoder = ChunkEncoder::new();
        let mut decoder = ChunkDecoder::new();

        let message = make_message(MSG_VIDEO, 5, 1, 0);
        let mut buf = BytesMut::from(&encoder.encode(CSID_VIDEO, &message)[..]);

        let decoded = decoder.decode(&mut buf).unwrap().unwrap();
        assert!(decoded.payload.is_empty());
        assert_eq!(decoded.timestamp, 5);
    }
}
