//! Typed RTMP messages and the AMF0 command vocabulary
//!
//! [`RtmpMessage`] is the interpreted form of a [`RawMessage`]: protocol
//! control payloads are parsed here, media payloads stay opaque, and
//! command/data payloads are handed to the AMF layer via [`Command`].

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::amf::{self, AmfValue};
use crate::error::ProtocolError;
use crate::protocol::chunk::RawMessage;
use crate::protocol::constants::{
    MSG_ACKNOWLEDGEMENT, MSG_AUDIO, MSG_COMMAND_AMF0, MSG_COMMAND_AMF3, MSG_DATA_AMF0,
    MSG_DATA_AMF3, MSG_SET_CHUNK_SIZE, MSG_SET_PEER_BANDWIDTH, MSG_USER_CONTROL, MSG_VIDEO,
    MSG_WINDOW_ACK_SIZE,
};

/// An interpreted RTMP message
#[derive(Debug, Clone)]
pub enum RtmpMessage {
    SetChunkSize(u32),
    Acknowledgement(u32),
    UserControl(UserControl),
    WindowAckSize(u32),
    SetPeerBandwidth { size: u32, limit_type: u8 },

    Audio {
        timestamp: u32,
        stream_id: u32,
        payload: Bytes,
    },
    Video {
        timestamp: u32,
        stream_id: u32,
        payload: Bytes,
    },

    /// AMF0 data message (`@setDataFrame` / `onMetaData`)
    Data {
        timestamp: u32,
        stream_id: u32,
        payload: Bytes,
    },

    /// AMF0 command message; payload parsed on demand via [`Command::parse`]
    Command {
        timestamp: u32,
        stream_id: u32,
        payload: Bytes,
    },

    /// Anything we do not model; logged and skipped by the connection
    Unknown { type_id: u8 },
}

impl RtmpMessage {
    /// Interpret a raw message
    pub fn from_raw(raw: RawMessage) -> Result<Self, ProtocolError> {
        let message = match raw.type_id {
            MSG_SET_CHUNK_SIZE => RtmpMessage::SetChunkSize(read_u32(&raw.payload)?),
            MSG_ACKNOWLEDGEMENT => RtmpMessage::Acknowledgement(read_u32(&raw.payload)?),
            MSG_USER_CONTROL => RtmpMessage::UserControl(UserControl::parse(&raw.payload)?),
            MSG_WINDOW_ACK_SIZE => RtmpMessage::WindowAckSize(read_u32(&raw.payload)?),
            MSG_SET_PEER_BANDWIDTH => {
                if raw.payload.len() < 5 {
                    return Err(ProtocolError::UnexpectedEof);
                }
                RtmpMessage::SetPeerBandwidth {
                    size: read_u32(&raw.payload)?,
                    limit_type: raw.payload[4],
                }
            }
            MSG_AUDIO => RtmpMessage::Audio {
                timestamp: raw.timestamp,
                stream_id: raw.stream_id,
                payload: raw.payload,
            },
            MSG_VIDEO => RtmpMessage::Video {
                timestamp: raw.timestamp,
                stream_id: raw.stream_id,
                payload: raw.payload,
            },
            MSG_DATA_AMF0 => RtmpMessage::Data {
                timestamp: raw.timestamp,
                stream_id: raw.stream_id,
                payload: raw.payload,
            },
            MSG_COMMAND_AMF0 => RtmpMessage::Command {
                timestamp: raw.timestamp,
                stream_id: raw.stream_id,
                payload: raw.payload,
            },
            // AMF3 command/data messages carry an AMF0 body behind a
            // one-byte format marker; strip it and treat as AMF0
            MSG_COMMAND_AMF3 | MSG_DATA_AMF3 => {
                let payload = if raw.payload.is_empty() {
                    raw.payload
                } else {
                    raw.payload.slice(1..)
                };
                if raw.type_id == MSG_COMMAND_AMF3 {
                    RtmpMessage::Command {
                        timestamp: raw.timestamp,
                        stream_id: raw.stream_id,
                        payload,
                    }
                } else {
                    RtmpMessage::Data {
                        timestamp: raw.timestamp,
                        stream_id: raw.stream_id,
                        payload,
                    }
                }
            }
            other => RtmpMessage::Unknown { type_id: other },
        };
        Ok(message)
    }

    /// Serialize into a raw message ready for chunking
    pub fn into_raw(self) -> RawMessage {
        match self {
            RtmpMessage::SetChunkSize(size) => control(MSG_SET_CHUNK_SIZE, put_u32(size)),
            RtmpMessage::Acknowledgement(seq) => control(MSG_ACKNOWLEDGEMENT, put_u32(seq)),
            RtmpMessage::UserControl(event) => control(MSG_USER_CONTROL, event.encode()),
            RtmpMessage::WindowAckSize(size) => control(MSG_WINDOW_ACK_SIZE, put_u32(size)),
            RtmpMessage::SetPeerBandwidth { size, limit_type } => {
                let mut buf = BytesMut::with_capacity(5);
                buf.put_u32(size);
                buf.put_u8(limit_type);
                control(MSG_SET_PEER_BANDWIDTH, buf.freeze())
            }
            RtmpMessage::Audio {
                timestamp,
                stream_id,
                payload,
            } => RawMessage {
                type_id: MSG_AUDIO,
                timestamp,
                stream_id,
                payload,
            },
            RtmpMessage::Video {
                timestamp,
                stream_id,
                payload,
            } => RawMessage {
                type_id: MSG_VIDEO,
                timestamp,
                stream_id,
                payload,
            },
            RtmpMessage::Data {
                timestamp,
                stream_id,
                payload,
            } => RawMessage {
                type_id: MSG_DATA_AMF0,
                timestamp,
                stream_id,
                payload,
            },
            RtmpMessage::Command {
                timestamp,
                stream_id,
                payload,
            } => RawMessage {
                type_id: MSG_COMMAND_AMF0,
                timestamp,
                stream_id,
                payload,
            },
            RtmpMessage::Unknown { type_id } => RawMessage {
                type_id,
                timestamp: 0,
                stream_id: 0,
                payload: Bytes::new(),
            },
        }
    }
}

fn control(type_id: u8, payload: Bytes) -> RawMessage {
    RawMessage {
        type_id,
        timestamp: 0,
        stream_id: 0,
        payload,
    }
}

fn read_u32(payload: &Bytes) -> Result<u32, ProtocolError> {
    if payload.len() < 4 {
        return Err(ProtocolError::UnexpectedEof);
    }
    Ok(u32::from_be_bytes([
        payload[0], payload[1], payload[2], payload[3],
    ]))
}

fn put_u32(value: u32) -> Bytes {
    Bytes::copy_from_slice(&value.to_be_bytes())
}

/// User control event (message type 4)
#[derive(Debug, Clone)]
pub struct UserControl {
    pub event_type: u16,
    pub data: Bytes,
}

impl UserControl {
    /// Stream Begin for the given message stream
    pub fn stream_begin(stream_id: u32) -> Self {
        Self {
            event_type: super::constants::EVENT_STREAM_BEGIN,
            data: put_u32(stream_id),
        }
    }

    /// Stream EOF for the given message stream
    pub fn stream_eof(stream_id: u32) -> Self {
        Self {
            event_type: super::constants::EVENT_STREAM_EOF,
            data: put_u32(stream_id),
        }
    }

    /// Pong echoing a ping's payload
    pub fn ping_response(data: Bytes) -> Self {
        Self {
            event_type: super::constants::EVENT_PING_RESPONSE,
            data,
        }
    }

    fn parse(payload: &Bytes) -> Result<Self, ProtocolError> {
        if payload.len() < 2 {
            return Err(ProtocolError::UnexpectedEof);
        }
        let mut buf = payload.clone();
        let event_type = buf.get_u16();
        Ok(Self {
            event_type,
            data: buf,
        })
    }

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + self.data.len());
        buf.put_u16(self.event_type);
        buf.put_slice(&self.data);
        buf.freeze()
    }
}

/// A parsed AMF0 command: name, transaction id, command object, then any
/// trailing arguments
#[derive(Debug, Clone)]
pub struct Command {
    pub name: String,
    pub transaction_id: f64,
    pub object: AmfValue,
    pub args: Vec<AmfValue>,
}

impl Command {
    pub fn new(name: impl Into<String>, transaction_id: f64, object: AmfValue) -> Self {
        Self {
            name: name.into(),
            transaction_id,
            object,
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<AmfValue>) -> Self {
        self.args = args;
        self
    }

    /// Parse a command message payload
    pub fn parse(payload: &Bytes) -> Result<Self, ProtocolError> {
        let mut values = amf::amf0::decode_all(payload).map_err(ProtocolError::Amf)?.into_iter();

        let name = match values.next() {
            Some(AmfValue::String(s)) => s,
            _ => return Err(ProtocolError::Command("unnamed")),
        };
        let transaction_id = values.next().and_then(|v| v.as_number()).unwrap_or(0.0);
        let object = values.next().unwrap_or(AmfValue::Null);
        let args = values.collect();

        Ok(Self {
            name,
            transaction_id,
            object,
            args,
        })
    }

    /// Encode into a command message payload
    pub fn encode(&self) -> Bytes {
        let mut values = vec![
            AmfValue::String(self.name.clone()),
            AmfValue::Number(self.transaction_id),
            self.object.clone(),
        ];
        values.extend(self.args.iter().cloned());
        amf::amf0::encode_all(&values)
    }

    /// First trailing argument as a string (where publish/play keep the
    /// stream name)
    pub fn arg_str(&self, index: usize) -> Option<&str> {
        self.args.get(index)?.as_str()
    }
}

/// Parameters extracted from a `connect` command
#[derive(Debug, Clone, Default)]
pub struct ConnectParams {
    /// Application name; must match the configured one
    pub app: String,
    /// Encoder identification string, e.g. `FMLE/3.0` or `obs-studio`
    pub flash_ver: Option<String>,
    pub tc_url: Option<String>,
    pub object_encoding: f64,
}

impl ConnectParams {
    /// Extract from the connect command object.
    ///
    /// The app field may arrive with a trailing slash or instance suffix
    /// (`live/`, `live/instance`); only the first path segment counts.
    pub fn from_command(command: &Command) -> Result<Self, ProtocolError> {
        let object = &command.object;
        let raw_app = object
            .get_str("app")
            .ok_or(ProtocolError::Command("connect"))?;
        let app = raw_app
            .split('/')
            .next()
            .unwrap_or(raw_app)
            .to_string();

        Ok(Self {
            app,
            flash_ver: object.get_str("flashVer").map(str::to_string),
            tc_url: object.get_str("tcUrl").map(str::to_string),
            object_encoding: object.get_number("objectEncoding").unwrap_or(0.0),
        })
    }
}

/// Parameters extracted from a `publish` command
#[derive(Debug, Clone)]
pub struct PublishParams {
    /// Raw stream key as sent (query-string suffix stripped, not yet
    /// validated)
    pub stream_key: String,
    /// Publish type: `live`, `record`, or `append`
    pub publish_type: String,
}

impl PublishParams {
    /// Extract from a publish command.
    ///
    /// There is no default key: a publish without an extractable name is
    /// an error and the connection gets dropped.
    pub fn from_command(command: &Command) -> Result<Self, ProtocolError> {
        let raw = command
            .arg_str(0)
            .ok_or(ProtocolError::Command("publish"))?;
        let stream_key = raw.split('?').next().unwrap_or(raw).to_string();
        if stream_key.is_empty() {
            return Err(ProtocolError::Command("publish"));
        }

        let publish_type = command
            .arg_str(1)
            .unwrap_or("live")
            .to_string();

        Ok(Self {
            stream_key,
            publish_type,
        })
    }
}

/// `_result` for a successful connect
pub fn connect_result(transaction_id: f64) -> Command {
    let properties = amf::object([
        ("fmsVer", AmfValue::from("FMS/3,5,7,7009")),
        ("capabilities", AmfValue::from(31.0)),
    ]);
    let information = amf::object([
        ("level", AmfValue::from("status")),
        ("code", AmfValue::from("NetConnection.Connect.Success")),
        ("description", AmfValue::from("Connection succeeded.")),
        ("objectEncoding", AmfValue::from(0.0)),
    ]);
    Command::new("_result", transaction_id, properties).with_args(vec![information])
}

/// `_result` for createStream, announcing the allocated stream id
pub fn create_stream_result(transaction_id: f64, stream_id: u32) -> Command {
    Command::new("_result", transaction_id, AmfValue::Null)
        .with_args(vec![AmfValue::Number(f64::from(stream_id))])
}

/// `onStatus` event on a NetStream
pub fn on_status(level: &str, code: &str, description: &str) -> Command {
    let info = amf::object([
        ("level", AmfValue::from(level)),
        ("code", AmfValue::from(code)),
        ("description", AmfValue::from(description)),
    ]);
    Command::new("onStatus", 0.0, AmfValue::Null).with_args(vec![info])
}
