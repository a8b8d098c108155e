//! RTMP protocol constants

/// RTMP protocol version sent in C0/S0
pub const RTMP_VERSION: u8 = 3;

/// Size of the C1/C2/S1/S2 handshake packets
pub const HANDSHAKE_SIZE: usize = 1536;

/// Chunk size every connection starts with, per the RTMP specification
pub const DEFAULT_CHUNK_SIZE: u32 = 128;

/// Largest chunk size we will accept or announce
pub const MAX_CHUNK_SIZE: u32 = 65536;

/// Largest assembled message we will accept (sanity cap against a
/// malformed length field allocating unbounded memory)
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Timestamp value signalling an extended (32-bit) timestamp field
pub const EXTENDED_TIMESTAMP: u32 = 0xFF_FFFF;

// Chunk stream ids. 2 is reserved for protocol control; the rest follow
// the conventional layout encoders expect.
pub const CSID_PROTOCOL_CONTROL: u32 = 2;
pub const CSID_COMMAND: u32 = 3;
pub const CSID_AUDIO: u32 = 4;
pub const CSID_DATA: u32 = 5;
pub const CSID_VIDEO: u32 = 6;

// Message type ids
pub const MSG_SET_CHUNK_SIZE: u8 = 1;
pub const MSG_ABORT: u8 = 2;
pub const MSG_ACKNOWLEDGEMENT: u8 = 3;
pub const MSG_USER_CONTROL: u8 = 4;
pub const MSG_WINDOW_ACK_SIZE: u8 = 5;
pub const MSG_SET_PEER_BANDWIDTH: u8 = 6;
pub const MSG_AUDIO: u8 = 8;
pub const MSG_VIDEO: u8 = 9;
pub const MSG_DATA_AMF3: u8 = 15;
pub const MSG_COMMAND_AMF3: u8 = 17;
pub const MSG_DATA_AMF0: u8 = 18;
pub const MSG_COMMAND_AMF0: u8 = 20;

// User control event types
pub const EVENT_STREAM_BEGIN: u16 = 0;
pub const EVENT_STREAM_EOF: u16 = 1;
pub const EVENT_PING_REQUEST: u16 = 6;
pub const EVENT_PING_RESPONSE: u16 = 7;
