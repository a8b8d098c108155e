//! Session state machine
//!
//! Tracks one RTMP connection from TCP accept to close: handshake
//! progress, the negotiated window, byte accounting for acknowledgements,
//! and message stream allocation.

use std::net::SocketAddr;
use std::time::Instant;

use crate::protocol::message::ConnectParams;

/// Session lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// TCP connected, handshake not complete
    Handshaking,
    /// Handshake complete, waiting for the connect command
    WaitingConnect,
    /// Connect accepted; commands and media may flow
    Active,
    /// Session is closing
    Closing,
}

/// Per-connection session state
#[derive(Debug)]
pub struct SessionState {
    /// Unique session id (for logs)
    pub id: u64,

    /// Remote peer address
    pub peer_addr: SocketAddr,

    pub phase: SessionPhase,

    /// Connection start time
    pub connected_at: Instant,

    /// Connect parameters, once the connect command is accepted
    pub connect_params: Option<ConnectParams>,

    /// Window acknowledgement size we announced to the peer
    window_ack_size: u64,

    /// Total bytes received on the socket
    bytes_received: u64,

    /// Bytes acknowledged so far
    acked: u64,

    /// Next message stream id to allocate (0 is the NetConnection stream)
    next_stream_id: u32,
}

impl SessionState {
    pub fn new(id: u64, peer_addr: SocketAddr, window_ack_size: u32) -> Self {
        Self {
            id,
            peer_addr,
            phase: SessionPhase::Handshaking,
            connected_at: Instant::now(),
            connect_params: None,
            window_ack_size: u64::from(window_ack_size),
            bytes_received: 0,
            acked: 0,
            next_stream_id: 1,
        }
    }

    /// Handshake finished; the connect command is expected next
    pub fn handshake_done(&mut self) {
        if self.phase == SessionPhase::Handshaking {
            self.phase = SessionPhase::WaitingConnect;
        }
    }

    /// Connect command accepted
    pub fn on_connect(&mut self, params: ConnectParams) {
        self.connect_params = Some(params);
        self.phase = SessionPhase::Active;
    }

    pub fn is_active(&self) -> bool {
        self.phase == SessionPhase::Active
    }

    pub fn close(&mut self) {
        self.phase = SessionPhase::Closing;
    }

    /// Application name from the connect command
    pub fn app(&self) -> Option<&str> {
        self.connect_params.as_ref().map(|p| p.app.as_str())
    }

    /// Allocate a message stream id for createStream
    pub fn allocate_stream_id(&mut self) -> u32 {
        let id = self.next_stream_id;
        self.next_stream_id += 1;
        id
    }

    /// Account received bytes; returns the sequence number to acknowledge
    /// when a full window has arrived since the last acknowledgement.
    pub fn add_bytes_received(&mut self, n: u64) -> Option<u32> {
        self.bytes_received += n;
        if self.bytes_received - self.acked >= self.window_ack_size {
            self.acked = self.bytes_received;
            Some(self.bytes_received as u32)
        } else {
            None
        }
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Session duration
    pub fn duration(&self) -> std::time::Duration {
        self.connected_at.elapsed()
    }
}
