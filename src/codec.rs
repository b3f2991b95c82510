//! Control-channel wire format.
//!
//! Every bunch on the control channel starts with a one-byte message type.
//! The harness's own control message rides under [`NUT_CONTROL_TAG`]:
//!
//! ```text
//! [u8 NUT_CONTROL_TAG][u8 command kind][i32 length][string bytes]
//! ```
//!
//! Strings are length-prefixed: a positive length counts UTF-8 bytes
//! including a trailing NUL, a negative length counts UTF-16 code units
//! (little endian) including a trailing NUL, zero is the empty string.
//! ASCII payloads are written in the narrow form, everything else as UTF-16.
//!
//! Any other message type belongs to the generic channel pathway
//! ([`ChannelMessage`]), which carries the minimal handshake, actor offers
//! and RPCs.

use crate::error::CodecError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Message type reserved for the harness control message.
pub const NUT_CONTROL_TAG: u8 = 250;

/// Upper bound for a single bunch on the channel, and so for any string in it.
pub const MAX_BUNCH_SIZE: usize = 64 * 1024;

/// Command kinds carried by a control message. Values are stable on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlCommand {
    NoResultCommand = 0,
    SendResultCommand = 1,
    CommandFailed = 2,
    CommandSucceeded = 3,
    Ping = 4,
    Pong = 5,
    WatchEvent = 6,
    NotifyEvent = 7,
    Summon = 8,
    SuspendProcess = 9,
}

impl TryFrom<u8> for ControlCommand {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => ControlCommand::NoResultCommand,
            1 => ControlCommand::SendResultCommand,
            2 => ControlCommand::CommandFailed,
            3 => ControlCommand::CommandSucceeded,
            4 => ControlCommand::Ping,
            5 => ControlCommand::Pong,
            6 => ControlCommand::WatchEvent,
            7 => ControlCommand::NotifyEvent,
            8 => ControlCommand::Summon,
            9 => ControlCommand::SuspendProcess,
            other => return Err(CodecError::UnknownCommand(other)),
        })
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The harness control message: a command kind and one string parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub kind: ControlCommand,
    pub payload: String,
}

impl ControlMessage {
    pub fn new(kind: ControlCommand, payload: impl Into<String>) -> Self {
        Self { kind, payload: payload.into() }
    }
}

/// Encoder/decoder for [`ControlMessage`] bunches.
pub struct ControlChannelCodec;

impl ControlChannelCodec {
    /// Fails with [`CodecError::FrameTooLarge`] when the bunch would not fit
    /// the channel; anything that encodes also decodes.
    pub fn encode(message: &ControlMessage) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(6 + message.payload.len());
        buf.put_u8(NUT_CONTROL_TAG);
        buf.put_u8(message.kind as u8);
        put_string(&mut buf, &message.payload)?;
        finish(buf)
    }

    /// True when the bunch carries the harness control message.
    pub fn is_control_bunch(bunch: &[u8]) -> bool {
        bunch.first() == Some(&NUT_CONTROL_TAG)
    }

    /// Decodes a control message. Returns `Ok(None)` for bunches of any other
    /// message type, which belong to the generic pathway.
    pub fn decode(bunch: &[u8]) -> Result<Option<ControlMessage>, CodecError> {
        if !Self::is_control_bunch(bunch) {
            return Ok(None);
        }

        let mut buf = &bunch[1..];
        let kind = ControlCommand::try_from(get_u8(&mut buf)?)?;
        let payload = get_string(&mut buf)?;
        Ok(Some(ControlMessage { kind, payload }))
    }
}

/// Messages on the generic channel pathway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    /// Client opens the handshake with its protocol version
    Hello { version: String },
    /// Server accepts the client and names the loaded map
    Welcome { map: String, game: String },
    /// Server rejects the client version
    Upgrade { reason: String },
    /// Server reports a fatal connection failure
    Failure { reason: String },
    /// Client asks to join the game session
    Join,
    /// Client asks for a beacon connection of the given type
    BeaconJoin { beacon_type: String },
    /// Server accepted the beacon
    BeaconWelcome,
    /// Server offers to replicate an actor
    ActorOffer { actor_id: u32, class_name: String },
    /// Client accepts or blocks an offered actor
    ActorReply { actor_id: u32, accepted: bool },
    /// Remote function call from client to server
    Rpc { name: String, params: String },
}

impl ChannelMessage {
    const HELLO: u8 = 0;
    const WELCOME: u8 = 1;
    const UPGRADE: u8 = 2;
    const FAILURE: u8 = 5;
    const JOIN: u8 = 9;
    const BEACON_JOIN: u8 = 11;
    const BEACON_WELCOME: u8 = 12;
    const ACTOR_OFFER: u8 = 20;
    const ACTOR_REPLY: u8 = 21;
    const RPC: u8 = 22;

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        match self {
            ChannelMessage::Hello { version } => {
                buf.put_u8(Self::HELLO);
                put_string(buf, version)?;
            }
            ChannelMessage::Welcome { map, game } => {
                buf.put_u8(Self::WELCOME);
                put_string(buf, map)?;
                put_string(buf, game)?;
            }
            ChannelMessage::Upgrade { reason } => {
                buf.put_u8(Self::UPGRADE);
                put_string(buf, reason)?;
            }
            ChannelMessage::Failure { reason } => {
                buf.put_u8(Self::FAILURE);
                put_string(buf, reason)?;
            }
            ChannelMessage::Join => buf.put_u8(Self::JOIN),
            ChannelMessage::BeaconJoin { beacon_type } => {
                buf.put_u8(Self::BEACON_JOIN);
                put_string(buf, beacon_type)?;
            }
            ChannelMessage::BeaconWelcome => buf.put_u8(Self::BEACON_WELCOME),
            ChannelMessage::ActorOffer { actor_id, class_name } => {
                buf.put_u8(Self::ACTOR_OFFER);
                buf.put_u32_le(*actor_id);
                put_string(buf, class_name)?;
            }
            ChannelMessage::ActorReply { actor_id, accepted } => {
                buf.put_u8(Self::ACTOR_REPLY);
                buf.put_u32_le(*actor_id);
                buf.put_u8(u8::from(*accepted));
            }
            ChannelMessage::Rpc { name, params } => {
                buf.put_u8(Self::RPC);
                put_string(buf, name)?;
                put_string(buf, params)?;
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        finish(buf)
    }

    pub fn decode(bunch: &[u8]) -> Result<Self, CodecError> {
        let mut buf = bunch;
        let message = match get_u8(&mut buf)? {
            Self::HELLO => ChannelMessage::Hello { version: get_string(&mut buf)? },
            Self::WELCOME => ChannelMessage::Welcome {
                map: get_string(&mut buf)?,
                game: get_string(&mut buf)?,
            },
            Self::UPGRADE => ChannelMessage::Upgrade { reason: get_string(&mut buf)? },
            Self::FAILURE => ChannelMessage::Failure { reason: get_string(&mut buf)? },
            Self::JOIN => ChannelMessage::Join,
            Self::BEACON_JOIN => ChannelMessage::BeaconJoin { beacon_type: get_string(&mut buf)? },
            Self::BEACON_WELCOME => ChannelMessage::BeaconWelcome,
            Self::ACTOR_OFFER => ChannelMessage::ActorOffer {
                actor_id: get_u32(&mut buf)?,
                class_name: get_string(&mut buf)?,
            },
            Self::ACTOR_REPLY => ChannelMessage::ActorReply {
                actor_id: get_u32(&mut buf)?,
                accepted: get_u8(&mut buf)? != 0,
            },
            Self::RPC => ChannelMessage::Rpc {
                name: get_string(&mut buf)?,
                params: get_string(&mut buf)?,
            },
            other => return Err(CodecError::UnknownMessageType(other)),
        };
        Ok(message)
    }
}

/// A decoded control-channel bunch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bunch {
    Control(ControlMessage),
    Generic(ChannelMessage),
}

impl Bunch {
    pub fn decode(bunch: &[u8]) -> Result<Self, CodecError> {
        match ControlChannelCodec::decode(bunch)? {
            Some(message) => Ok(Bunch::Control(message)),
            None => Ok(Bunch::Generic(ChannelMessage::decode(bunch)?)),
        }
    }
}

/// Length-delimited framing of [`Bunch`]es over a byte stream.
pub struct BunchCodec {
    frames: LengthDelimitedCodec,
}

impl BunchCodec {
    pub fn new() -> Self {
        Self { frames: frame_codec() }
    }
}

impl Default for BunchCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// The framing shared by both ends of the channel.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .little_endian()
        .max_frame_length(MAX_BUNCH_SIZE)
        .new_codec()
}

impl Decoder for BunchCodec {
    type Item = Bunch;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bunch>, CodecError> {
        match self.frames.decode(src)? {
            Some(frame) => Ok(Some(Bunch::decode(&frame)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<Bunch> for BunchCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Bunch, dst: &mut BytesMut) -> Result<(), CodecError> {
        let bytes = match item {
            Bunch::Control(message) => ControlChannelCodec::encode(&message)?,
            Bunch::Generic(message) => message.to_bytes()?,
        };
        self.frames.encode(bytes, dst)?;
        Ok(())
    }
}

fn finish(buf: BytesMut) -> Result<Bytes, CodecError> {
    if buf.len() > MAX_BUNCH_SIZE {
        return Err(CodecError::FrameTooLarge(buf.len()));
    }
    Ok(buf.freeze())
}

/// Narrow or wide string body size in bytes, terminator included.
fn string_size(value: &str) -> usize {
    if value.is_ascii() {
        value.len() + 1
    } else {
        (value.encode_utf16().count() + 1) * 2
    }
}

fn put_string(buf: &mut BytesMut, value: &str) -> Result<(), CodecError> {
    if value.is_empty() {
        buf.put_i32_le(0);
        return Ok(());
    }

    let size = string_size(value);
    if size > MAX_BUNCH_SIZE {
        return Err(CodecError::FrameTooLarge(size));
    }

    // Bounded by MAX_BUNCH_SIZE, so the length fits an i32
    let len = i32::try_from(if value.is_ascii() { size } else { size / 2 })
        .map_err(|_| CodecError::FrameTooLarge(size))?;
    if value.is_ascii() {
        buf.put_i32_le(len);
        buf.put_slice(value.as_bytes());
        buf.put_u8(0);
    } else {
        buf.put_i32_le(-len);
        for unit in value.encode_utf16() {
            buf.put_u16_le(unit);
        }
        buf.put_u16_le(0);
    }
    Ok(())
}

fn ensure(buf: &[u8], needed: usize) -> Result<(), CodecError> {
    if buf.remaining() < needed {
        return Err(CodecError::Truncated { needed: needed - buf.remaining() });
    }
    Ok(())
}

fn get_u8(buf: &mut &[u8]) -> Result<u8, CodecError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut &[u8]) -> Result<u32, CodecError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32_le())
}

fn get_string(buf: &mut &[u8]) -> Result<String, CodecError> {
    ensure(buf, 4)?;
    let len = buf.get_i32_le();

    if len == 0 {
        return Ok(String::new());
    }

    let size = if len > 0 { len.unsigned_abs() as usize } else { len.unsigned_abs() as usize * 2 };
    if size > MAX_BUNCH_SIZE {
        return Err(CodecError::InvalidString(format!("length {len} out of range")));
    }

    if len > 0 {
        let len = size;
        ensure(buf, len)?;
        let raw = &buf[..len];
        let text = match raw.split_last() {
            Some((&0, body)) => std::str::from_utf8(body),
            _ => return Err(CodecError::InvalidString("missing terminator".to_string())),
        }
        .map_err(|e| CodecError::InvalidString(e.to_string()))?
        .to_string();
        buf.advance(len);
        Ok(text)
    } else {
        let units_len = size / 2;
        ensure(buf, units_len * 2)?;
        let mut units = Vec::with_capacity(units_len);
        for _ in 0..units_len {
            units.push(buf.get_u16_le());
        }
        match units.pop() {
            Some(0) => {}
            _ => return Err(CodecError::InvalidString("missing terminator".to_string())),
        }
        String::from_utf16(&units).map_err(|e| CodecError::InvalidString(e.to_string()))
    }
}
