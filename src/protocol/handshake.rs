//! RTMP handshake
//!
//! ```text
//! Client                                   Server
//!   |------- C0 (1 byte: version) --------->|
//!   |------- C1 (1536 bytes: time+random) ->|
//!   |<------ S0 S1 S2 ----------------------|
//!   |------- C2 (1536 bytes: echo S1) ----->|
//! ```
//!
//! This is the "simple" handshake (no HMAC digest); every encoder the
//! ingest cares about accepts it. Version checking is lenient: anything
//! >= 3 is taken as RTMP 3, because several encoders send odd values.

use bytes::{BufMut, Bytes, BytesMut};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::HandshakeError;
use crate::protocol::constants::{HANDSHAKE_SIZE, RTMP_VERSION};

/// Which side of the handshake we are driving
///
/// The ingest always runs the server side; the client side exists so tests
/// can drive a full exchange in-process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for the peer's version + hello packet (C0C1 or S0S1S2)
    AwaitHello,
    /// Server only: hello consumed, waiting for the C2 echo
    AwaitEcho,
    Done,
}

/// Incremental handshake state machine
///
/// Feed inbound bytes with [`Handshake::drive`]; it consumes input only
/// when a complete packet is buffered and returns the bytes to send back,
/// if any. [`Handshake::is_done`] flips once the exchange is complete;
/// any bytes remaining in the buffer belong to the chunk stream.
#[derive(Debug)]
pub struct Handshake {
    role: HandshakeRole,
    phase: Phase,
}

impl Handshake {
    /// Create a handshake state machine for the given role
    pub fn new(role: HandshakeRole) -> Self {
        Self {
            role,
            phase: Phase::AwaitHello,
        }
    }

    /// Check if the handshake is complete
    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Bytes the client must send before anything arrives (C0 + C1).
    ///
    /// Returns `None` for the server role; the server speaks second.
    pub fn initial_bytes(&self) -> Option<Bytes> {
        match self.role {
            HandshakeRole::Client => {
                let mut buf = BytesMut::with_capacity(1 + HANDSHAKE_SIZE);
                buf.put_u8(RTMP_VERSION);
                buf.put_slice(&hello_packet());
                Some(buf.freeze())
            }
            HandshakeRole::Server => None,
        }
    }

    /// Advance the state machine with whatever has been read so far.
    ///
    /// Consumes complete packets from `buf` and returns bytes to write to
    /// the peer (`None` when nothing is owed yet or the input is short).
    pub fn drive(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, HandshakeError> {
        match (self.role, self.phase) {
            (HandshakeRole::Server, Phase::AwaitHello) => {
                if buf.len() < 1 + HANDSHAKE_SIZE {
                    return Ok(None);
                }

                let version = buf[0];
                if version < RTMP_VERSION {
                    return Err(HandshakeError::InvalidVersion(version));
                }
                let _ = buf.split_to(1);
                let c1 = buf.split_to(HANDSHAKE_SIZE);

                // S0 + S1 + S2 in one write
                let mut response = BytesMut::with_capacity(1 + HANDSHAKE_SIZE * 2);
                response.put_u8(RTMP_VERSION);
                response.put_slice(&hello_packet());
                response.put_slice(&echo_packet(&c1));

                self.phase = Phase::AwaitEcho;
                Ok(Some(response.freeze()))
            }
            (HandshakeRole::Server, Phase::AwaitEcho) => {
                if buf.len() < HANDSHAKE_SIZE {
                    return Ok(None);
                }

                // C2 is not strictly verified; some encoders echo badly
                let _ = buf.split_to(HANDSHAKE_SIZE);
                self.phase = Phase::Done;
                Ok(None)
            }
            (HandshakeRole::Client, Phase::AwaitHello) => {
                if buf.len() < 1 + HANDSHAKE_SIZE * 2 {
                    return Ok(None);
                }

                let version = buf[0];
                if version < RTMP_VERSION {
                    return Err(HandshakeError::InvalidVersion(version));
                }
                let _ = buf.split_to(1);
                let s1 = buf.split_to(HANDSHAKE_SIZE);
                let _s2 = buf.split_to(HANDSHAKE_SIZE);

                let c2 = echo_packet(&s1);
                self.phase = Phase::Done;
                Ok(Some(Bytes::copy_from_slice(&c2)))
            }
            (_, Phase::Done) | (HandshakeRole::Client, Phase::AwaitEcho) => Ok(None),
        }
    }
}

/// Build a C1/S1 packet: timestamp, four zero bytes, then filler.
///
/// The filler is a cheap PRNG; the simple handshake attaches no meaning
/// to it and nothing cryptographic depends on it.
fn hello_packet() -> [u8; HANDSHAKE_SIZE] {
    let mut packet = [0u8; HANDSHAKE_SIZE];

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0);

    packet[0..4].copy_from_slice(&timestamp.to_be_bytes());
    // Bytes 4..8 stay zero: simple handshake marker

    let mut seed = u64::from(timestamp) | 1;
    for chunk in packet[8..].chunks_mut(8) {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let bytes = seed.to_le_bytes();
        let len = chunk.len().min(8);
        chunk[..len].copy_from_slice(&bytes[..len]);
    }

    packet
}

/// Build a C2/S2 packet: the peer's packet with our receive time in
/// bytes 4..8 and their random filler preserved.
fn echo_packet(peer: &[u8]) -> [u8; HANDSHAKE_SIZE] {
    let mut echo = [0u8; HANDSHAKE_SIZE];
    echo.copy_from_slice(&peer[..HANDSHAKE_SIZE]);

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0);
    echo[4..8].copy_from_slice(&timestamp.to_be_bytes());

    echo
}
