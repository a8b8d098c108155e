//! Per-connection RTMP driver
//!
//! One task per TCP connection: handshake, then a read-driven loop over
//! the chunk stream. The connect/publish command chain classifies the
//! connection: publishers feed the stream relay and drive the publish
//! controller; `play` is honored only for loopback peers (the transcoder
//! pulling its input) and refused for everyone else.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::amf;
use crate::config::RtmpConfig;
use crate::controller::PublishController;
use crate::error::{Error, HandshakeError, ProtocolError};
use crate::media::flv::FlvTag;
use crate::protocol::chunk::{ChunkDecoder, ChunkEncoder, RawMessage};
use crate::protocol::constants::{
    CSID_AUDIO, CSID_COMMAND, CSID_DATA, CSID_PROTOCOL_CONTROL, CSID_VIDEO, EVENT_PING_REQUEST,
    MSG_AUDIO, MSG_COMMAND_AMF0, MSG_DATA_AMF0, MSG_VIDEO,
};
use crate::protocol::handshake::{Handshake, HandshakeRole};
use crate::protocol::message::{
    connect_result, create_stream_result, on_status, Command, ConnectParams, PublishParams,
    RtmpMessage, UserControl,
};
use crate::registry::{FrameKind, RelayFrame, StreamKey, StreamRecord, StreamRegistry};
use crate::ingest::session::SessionState;

/// What the message handler decided about the connection's future
enum Flow {
    Continue,
    /// Switch into the relay-playback loop
    StartPlay { key: StreamKey, stream_id: u32 },
    Closed,
}

/// Publisher-side state once a publish is accepted
struct PublisherCtx {
    key: StreamKey,
    record: Arc<StreamRecord>,
}

/// One accepted RTMP connection
pub struct Connection {
    session: SessionState,
    socket: TcpStream,
    config: RtmpConfig,
    controller: Arc<PublishController>,
    registry: Arc<StreamRegistry>,
    decoder: ChunkDecoder,
    encoder: ChunkEncoder,
    read_buf: BytesMut,
    publisher: Option<PublisherCtx>,
}

impl Connection {
    pub fn new(
        session_id: u64,
        socket: TcpStream,
        peer_addr: SocketAddr,
        config: RtmpConfig,
        controller: Arc<PublishController>,
        registry: Arc<StreamRegistry>,
    ) -> Self {
        let window_ack_size = config.window_ack_size;
        Self {
            session: SessionState::new(session_id, peer_addr, window_ack_size),
            socket,
            config,
            controller,
            registry,
            decoder: ChunkDecoder::new(),
            encoder: ChunkEncoder::new(),
            read_buf: BytesMut::with_capacity(8 * 1024),
            publisher: None,
        }
    }

    /// Drive the connection to completion.
    ///
    /// An abrupt publisher disconnect is an unpublish event; the cleanup
    /// here is what turns a dropped TCP connection into a drained stream.
    pub async fn run(mut self) -> Result<(), Error> {
        let result = self.drive().await;

        if let Some(publisher) = self.publisher.take() {
            tracing::info!(
                session_id = self.session.id,
                stream = %publisher.key,
                bytes_in = publisher.record.bytes_in(),
                duration_secs = self.session.duration().as_secs(),
                "Publisher disconnected"
            );
            if let Err(e) = self.controller.on_unpublish(&publisher.key).await {
                tracing::warn!(stream = %publisher.key, error = %e, "Unpublish on disconnect failed");
            }
        }

        result
    }

    async fn drive(&mut self) -> Result<(), Error> {
        self.handshake().await?;
        self.session.handshake_done();

        loop {
            while let Some(raw) = self
                .decoder
                .decode(&mut self.read_buf)
                .map_err(ProtocolError::Chunk)?
            {
                let message = RtmpMessage::from_raw(raw).map_err(Error::Protocol)?;
                match self.handle_message(message).await? {
                    Flow::Continue => {}
                    Flow::Closed => return Ok(()),
                    Flow::StartPlay { key, stream_id } => {
                        return self.play(key, stream_id).await;
                    }
                }
            }

            let read = tokio::time::timeout(
                self.config.idle_timeout,
                self.socket.read_buf(&mut self.read_buf),
            )
            .await;
            let n = match read {
                Ok(result) => result?,
                Err(_) => {
                    tracing::debug!(session_id = self.session.id, "Idle timeout, dropping");
                    return Ok(());
                }
            };
            if n == 0 {
                return Ok(());
            }
            if let Some(sequence) = self.session.add_bytes_received(n as u64) {
                self.send_control(RtmpMessage::Acknowledgement(sequence))
                    .await?;
            }
        }
    }

    /// Server-side handshake under the configured timeout
    async fn handshake(&mut self) -> Result<(), Error> {
        let mut handshake = Handshake::new(HandshakeRole::Server);
        let timeout = self.config.handshake_timeout;

        let exchange = async {
            loop {
                if let Some(reply) = handshake
                    .drive(&mut self.read_buf)
                    .map_err(ProtocolError::Handshake)?
                {
                    self.socket.write_all(&reply).await?;
                }
                if handshake.is_done() {
                    return Ok::<(), Error>(());
                }

                let n = self.socket.read_buf(&mut self.read_buf).await?;
                if n == 0 {
                    return Err(ProtocolError::UnexpectedEof.into());
                }
            }
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(())) => {
                tracing::debug!(session_id = self.session.id, "Handshake complete");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProtocolError::Handshake(HandshakeError::Timeout).into()),
        }
    }

    async fn handle_message(&mut self, message: RtmpMessage) -> Result<Flow, Error> {
        match message {
            // The decoder already applied the new inbound chunk size
            RtmpMessage::SetChunkSize(size) => {
                tracing::debug!(session_id = self.session.id, size, "Peer chunk size");
                Ok(Flow::Continue)
            }
            RtmpMessage::Acknowledgement(_)
            | RtmpMessage::WindowAckSize(_)
            | RtmpMessage::SetPeerBandwidth { .. } => Ok(Flow::Continue),

            RtmpMessage::UserControl(event) => {
                if event.event_type == EVENT_PING_REQUEST {
                    self.send_control(RtmpMessage::UserControl(UserControl::ping_response(
                        event.data,
                    )))
                    .await?;
                }
                Ok(Flow::Continue)
            }

            RtmpMessage::Command {
                stream_id, payload, ..
            } => self.handle_command(stream_id, payload).await,

            RtmpMessage::Audio { .. } | RtmpMessage::Video { .. } | RtmpMessage::Data { .. } => {
                self.handle_media(message).await?;
                Ok(Flow::Continue)
            }

            RtmpMessage::Unknown { type_id } => {
                tracing::debug!(session_id = self.session.id, type_id, "Skipping unknown message");
                Ok(Flow::Continue)
            }
        }
    }

    async fn handle_command(&mut self, stream_id: u32, payload: Bytes) -> Result<Flow, Error> {
        let command = Command::parse(&payload).map_err(Error::Protocol)?;
        tracing::debug!(
            session_id = self.session.id,
            command = %command.name,
            stream_id,
            "Command received"
        );

        match command.name.as_str() {
            "connect" => self.handle_connect(command).await,
            "createStream" => {
                let allocated = self.session.allocate_stream_id();
                self.send_command(0, create_stream_result(command.transaction_id, allocated))
                    .await?;
                Ok(Flow::Continue)
            }
            "publish" => self.handle_publish(stream_id, command).await,
            "play" => self.handle_play(stream_id, command).await,
            "deleteStream" | "closeStream" | "FCUnpublish" => {
                if let Some(publisher) = self.publisher.take() {
                    tracing::info!(
                        session_id = self.session.id,
                        stream = %publisher.key,
                        "Unpublish requested"
                    );
                    self.controller.on_unpublish(&publisher.key).await?;
                    self.send_status(stream_id, "status", "NetStream.Unpublish.Success", "Stream ended.")
                        .await?;
                    Ok(Flow::Closed)
                } else {
                    Ok(Flow::Continue)
                }
            }
            // Pre-publish chatter various encoders emit; nothing to do
            "releaseStream" | "FCPublish" | "getStreamLength" | "_checkbw" | "_result" | "_error" => {
                Ok(Flow::Continue)
            }
            other => {
                tracing::debug!(session_id = self.session.id, command = other, "Unhandled command");
                Ok(Flow::Continue)
            }
        }
    }

    async fn handle_connect(&mut self, command: Command) -> Result<Flow, Error> {
        let params = ConnectParams::from_command(&command).map_err(Error::Protocol)?;

        if params.app != self.config.app_name {
            tracing::warn!(
                session_id = self.session.id,
                app = %params.app,
                expected = %self.config.app_name,
                "Connect to unknown application rejected"
            );
            let info = amf::object([
                ("level", amf::AmfValue::from("error")),
                ("code", amf::AmfValue::from("NetConnection.Connect.Rejected")),
                ("description", amf::AmfValue::from("Unknown application.")),
            ]);
            let error = Command::new("_error", command.transaction_id, amf::AmfValue::Null)
                .with_args(vec![info]);
            self.send_command(0, error).await?;
            return Ok(Flow::Closed);
        }

        // Control burst, then the connect result
        self.send_control(RtmpMessage::WindowAckSize(self.config.window_ack_size))
            .await?;
        self.send_control(RtmpMessage::SetPeerBandwidth {
            size: self.config.peer_bandwidth,
            limit_type: 2,
        })
        .await?;
        self.send_control(RtmpMessage::SetChunkSize(self.config.chunk_size))
            .await?;
        self.encoder.set_chunk_size(self.config.chunk_size);

        self.send_command(0, connect_result(command.transaction_id))
            .await?;

        tracing::info!(
            session_id = self.session.id,
            app = %params.app,
            encoder = params.flash_ver.as_deref().unwrap_or("unknown"),
            "Session connected"
        );
        self.session.on_connect(params);
        Ok(Flow::Continue)
    }

    async fn handle_publish(&mut self, stream_id: u32, command: Command) -> Result<Flow, Error> {
        if !self.session.is_active() || self.publisher.is_some() {
            return Err(ProtocolError::Command("publish").into());
        }

        let params = PublishParams::from_command(&command).map_err(Error::Protocol)?;
        let key = match StreamKey::parse(&params.stream_key) {
            Ok(key) => key,
            Err(_) => {
                // Rejected-publish event: observable, but never a publish
                tracing::warn!(
                    session_id = self.session.id,
                    peer = %self.session.peer_addr,
                    raw_key = %params.stream_key,
                    "Rejected publish: invalid stream key"
                );
                self.send_status(stream_id, "error", "NetStream.Publish.BadName", "Invalid stream key.")
                    .await?;
                return Ok(Flow::Closed);
            }
        };

        match self.controller.on_publish(&key, self.session.peer_addr).await {
            Ok(record) => {
                self.send_control(RtmpMessage::UserControl(UserControl::stream_begin(stream_id)))
                    .await?;
                self.send_status(
                    stream_id,
                    "status",
                    "NetStream.Publish.Start",
                    &format!("Publishing {}.", key),
                )
                .await?;
                tracing::info!(
                    session_id = self.session.id,
                    stream = %key,
                    publish_type = %params.publish_type,
                    "Publisher accepted"
                );
                self.publisher = Some(PublisherCtx { key, record });
                Ok(Flow::Continue)
            }
            Err(e) if e.is_duplicate_publish() => {
                tracing::warn!(
                    session_id = self.session.id,
                    stream = %key,
                    "Rejected publish: stream already live"
                );
                self.send_status(
                    stream_id,
                    "error",
                    "NetStream.Publish.BadName",
                    "Stream is already being published.",
                )
                .await?;
                Ok(Flow::Closed)
            }
            Err(e) => {
                tracing::warn!(session_id = self.session.id, stream = %key, error = %e, "Publish failed");
                self.send_status(stream_id, "error", "NetStream.Publish.Failed", "Publish failed.")
                    .await?;
                Ok(Flow::Closed)
            }
        }
    }

    /// Classify a play request. Only the transcoder on this host gets a
    /// relay; everyone else is HLS-only.
    async fn handle_play(&mut self, stream_id: u32, command: Command) -> Result<Flow, Error> {
        if !self.session.is_active() {
            return Err(ProtocolError::Command("play").into());
        }

        if !self.session.peer_addr.ip().is_loopback() {
            tracing::info!(
                session_id = self.session.id,
                peer = %self.session.peer_addr,
                "Rejected viewer: playback is HLS-only"
            );
            self.send_status(stream_id, "error", "NetStream.Play.Failed", "Playback is HLS-only.")
                .await?;
            return Ok(Flow::Closed);
        }

        let raw_name = command
            .arg_str(0)
            .ok_or(ProtocolError::Command("play"))?
            .to_string();
        let key = StreamKey::parse(raw_name.split('?').next().unwrap_or(&raw_name))
            .map_err(|_| ProtocolError::Command("play"))?;

        Ok(Flow::StartPlay { key, stream_id })
    }

    /// Relay-playback loop for the loopback transcoder
    async fn play(&mut self, key: StreamKey, stream_id: u32) -> Result<(), Error> {
        let (mut rx, catchup) = match self.registry.subscribe(&key).await {
            Ok(subscription) => subscription,
            Err(_) => {
                self.send_status(stream_id, "error", "NetStream.Play.StreamNotFound", "No such stream.")
                    .await?;
                return Ok(());
            }
        };
        let record = self.registry.get(&key).await;

        self.send_control(RtmpMessage::UserControl(UserControl::stream_begin(stream_id)))
            .await?;
        self.send_status(stream_id, "status", "NetStream.Play.Reset", "Resetting stream.")
            .await?;
        self.send_status(stream_id, "status", "NetStream.Play.Start", "Playing stream.")
            .await?;

        tracing::info!(
            session_id = self.session.id,
            stream = %key,
            catchup_frames = catchup.len(),
            "Relay playback started"
        );

        let result: Result<(), Error> = async {
            for frame in &catchup {
                let sent = write_frame(&mut self.socket, &self.encoder, frame, stream_id).await?;
                if let Some(record) = &record {
                    record.add_bytes_out(sent);
                }
            }

            let (mut reader, mut writer) = self.socket.split();
            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Ok(frame) => {
                            let sent = write_frame(&mut writer, &self.encoder, &frame, stream_id).await?;
                            if let Some(record) = &record {
                                record.add_bytes_out(sent);
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(stream = %key, skipped, "Relay subscriber lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    read = reader.read_buf(&mut self.read_buf) => match read {
                        // Inbound control chatter from the player is not
                        // interesting; a closed or failed read ends playback
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            self.read_buf.clear();
                        }
                    },
                }
            }
            Ok(())
        }
        .await;

        self.registry.unsubscribe(&key).await;
        tracing::info!(session_id = self.session.id, stream = %key, "Relay playback ended");
        result
    }

    /// Publisher media into the relay
    async fn handle_media(&mut self, message: RtmpMessage) -> Result<(), Error> {
        let Some(publisher) = &self.publisher else {
            tracing::trace!(session_id = self.session.id, "Media before publish, ignoring");
            return Ok(());
        };

        let frame = match message {
            RtmpMessage::Audio {
                timestamp, payload, ..
            } => {
                publisher.record.add_bytes_in(payload.len() as u64);
                RelayFrame::from_tag(&FlvTag::audio(timestamp, payload))
            }
            RtmpMessage::Video {
                timestamp, payload, ..
            } => {
                publisher.record.add_bytes_in(payload.len() as u64);
                RelayFrame::from_tag(&FlvTag::video(timestamp, payload))
            }
            RtmpMessage::Data { payload, .. } => {
                publisher.record.add_bytes_in(payload.len() as u64);
                let payload = strip_set_data_frame(payload);
                RelayFrame::from_tag(&FlvTag::script(payload))
            }
            _ => return Ok(()),
        };

        self.registry.broadcast(&publisher.key, frame).await;
        Ok(())
    }

    async fn send_control(&mut self, message: RtmpMessage) -> Result<(), Error> {
        let raw = message.into_raw();
        let wire = self.encoder.encode(CSID_PROTOCOL_CONTROL, &raw);
        self.socket.write_all(&wire).await?;
        Ok(())
    }

    async fn send_command(&mut self, stream_id: u32, command: Command) -> Result<(), Error> {
        let raw = RawMessage {
            type_id: MSG_COMMAND_AMF0,
            timestamp: 0,
            stream_id,
            payload: command.encode(),
        };
        let wire = self.encoder.encode(CSID_COMMAND, &raw);
        self.socket.write_all(&wire).await?;
        Ok(())
    }

    async fn send_status(
        &mut self,
        stream_id: u32,
        level: &str,
        code: &str,
        description: &str,
    ) -> Result<(), Error> {
        self.send_command(stream_id, on_status(level, code, description))
            .await
    }
}

/// Write one relay frame as an RTMP message; returns bytes written
async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    encoder: &ChunkEncoder,
    frame: &RelayFrame,
    stream_id: u32,
) -> Result<u64, Error> {
    let (csid, type_id) = match frame.kind {
        FrameKind::Video => (CSID_VIDEO, MSG_VIDEO),
        FrameKind::Audio => (CSID_AUDIO, MSG_AUDIO),
        FrameKind::Metadata => (CSID_DATA, MSG_DATA_AMF0),
    };
    let raw = RawMessage {
        type_id,
        timestamp: frame.timestamp,
        stream_id,
        payload: frame.data.clone(),
    };
    let wire = encoder.encode(csid, &raw);
    writer.write_all(&wire).await?;
    Ok(wire.len() as u64)
}

/// Unwrap `@setDataFrame` envelopes: encoders send metadata as
/// `@setDataFrame, onMetaData, {..}` but players expect it starting at
/// `onMetaData`.
fn strip_set_data_frame(payload: Bytes) -> Bytes {
    let Ok(values) = amf::amf0::decode_all(&payload) else {
        return payload;
    };
    match values.first() {
        Some(amf::AmfValue::String(name)) if name == "@setDataFrame" => {
            amf::amf0::encode_all(&values[1..])
        }
        _ => payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amf::AmfValue;

    #[test]
    fn test_strip_set_data_frame() {
        let original = amf::amf0::encode_all(&[
            AmfValue::from("@setDataFrame"),
            AmfValue::from("onMetaData"),
            amf::object([("width", AmfValue::from(1920.0))]),
        ]);

        let stripped = strip_set_data_frame(original);
        let values = amf::amf0::decode_all(&stripped).unwrap();

        assert_eq!(values[0].as_str(), Some("onMetaData"));
        assert_eq!(values[1].get_number("width"), Some(1920.0));
    }

    #[test]
    fn test_strip_passes_plain_metadata_through() {
        let original = amf::amf0::encode_all(&[
            AmfValue::from("onMetaData"),
            amf::object([("width", AmfValue::from(1280.0))]),
        ]);

        let untouched = strip_set_data_frame(original.clone());
        assert_eq!(untouched, original);
    }

    #[test]
    fn test_strip_tolerates_non_amf_payload() {
        let garbage = Bytes::from_static(&[0xFF, 0x00, 0x01]);
        assert_eq!(strip_set_data_frame(garbage.clone()), garbage);
    }
}
