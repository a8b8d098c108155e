//! Engine and wire-level error types
//!
//! The engine error maps one-to-one onto the publish/serve failure policy:
//! every variant is either fatal to a single stream's state machine or
//! surfaces as an HTTP status. Wire-level errors (handshake, chunking, AMF)
//! live in their own enums and convert upward; a protocol error never
//! outlives its connection.

use std::path::PathBuf;

use thiserror::Error;

use crate::registry::StreamKey;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level engine error
#[derive(Debug, Error)]
pub enum Error {
    /// Stream key failed validation (`[A-Za-z0-9_-]{1,64}`)
    #[error("invalid stream key {0:?}")]
    InvalidStreamKey(String),

    /// Key already has a record in an active lifecycle state
    #[error("stream '{0}' already has a publisher")]
    AlreadyPublishing(StreamKey),

    /// Cross-process lock could not be acquired within the retry budget
    #[error("lock for stream '{0}' is held by another supervisor")]
    LockContended(StreamKey),

    /// A live transcoder owned by nobody we know already serves this key
    #[error("orphan transcoder (pid {pid}) already references stream '{key}'")]
    BusyExternal { key: StreamKey, pid: u32 },

    /// Transcoder exec failed
    #[error("failed to spawn transcoder for stream '{key}'")]
    ChildSpawnFailed {
        key: StreamKey,
        #[source]
        source: std::io::Error,
    },

    /// Startup grace window elapsed with no artifacts on disk
    #[error("stream '{0}' produced no artifacts within the startup grace window")]
    StartupTimeout(StreamKey),

    /// Transcoder exited while the stream was supposed to be live
    #[error("transcoder for stream '{key}' exited: {detail}")]
    ChildExited { key: StreamKey, detail: String },

    /// Artifact tree could not be prepared or cleaned
    #[error("artifact I/O error at {}", path.display())]
    ArtifactIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Unknown stream on a read path
    #[error("unknown stream '{0}'")]
    NotFound(StreamKey),

    /// Publish rejected by the auth hook
    #[error("publish of stream '{0}' denied")]
    PublishDenied(StreamKey),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// RTMP wire-level error
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    Amf(#[from] AmfError),

    /// A command arrived without its required fields
    #[error("malformed '{0}' command")]
    Command(&'static str),

    /// Peer closed the connection mid-message
    #[error("connection closed unexpectedly")]
    UnexpectedEof,
}

/// Handshake failure
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("unsupported RTMP version {0}")]
    InvalidVersion(u8),

    #[error("handshake did not complete within the timeout")]
    Timeout,
}

/// Chunk stream decode failure
#[derive(Debug, Error)]
pub enum ChunkError {
    /// Declared message length exceeds the sanity cap
    #[error("message of {0} bytes exceeds the maximum")]
    MessageTooLarge(u32),

    /// Format 1-3 chunk arrived for a chunk stream we have no header for
    #[error("continuation chunk on unknown chunk stream {0}")]
    UnknownChunkStream(u32),

    /// Peer announced a chunk size outside the protocol's valid range
    #[error("invalid chunk size {0}")]
    InvalidChunkSize(u32),
}

/// AMF0 decode failure
#[derive(Debug, Error)]
pub enum AmfError {
    #[error("unexpected end of AMF data")]
    UnexpectedEof,

    #[error("unknown AMF0 marker 0x{0:02X}")]
    UnknownMarker(u8),

    #[error("object missing end marker")]
    InvalidObjectEnd,

    #[error("AMF string is not valid UTF-8")]
    InvalidUtf8,

    #[error("AMF nesting exceeds the depth limit")]
    NestingTooDeep,
}

impl Error {
    /// Whether the failed publish should be reported to the encoder as a
    /// duplicate (existing publisher wins) rather than a transient failure.
    pub fn is_duplicate_publish(&self) -> bool {
        matches!(self, Error::AlreadyPublishing(_))
    }
}
