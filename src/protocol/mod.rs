//! RTMP wire protocol
//!
//! Three layers, each a self-contained state machine over `bytes` buffers
//! so they can be unit-tested without sockets:
//!
//! - [`handshake`]: the C0/C1/C2 exchange that precedes everything
//! - [`chunk`]: the chunk stream that multiplexes messages over the TCP
//!   connection, including chunk-size negotiation
//! - [`message`]: typed RTMP messages and the AMF0 command vocabulary

pub mod chunk;
pub mod constants;
pub mod handshake;
pub mod message;

pub use chunk::{ChunkDecoder, ChunkEncoder};
pub use handshake::{Handshake, HandshakeRole};
pub use message::{Command, ConnectParams, PublishParams, RtmpMessage};
